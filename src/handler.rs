//! The Linked strategy: requests answered by pluggable code.
//!
//! The router only knows the [`Handler`] trait. Which implementation backs it
//! (an in-process type, a subprocess via [`CommandHandler`], ...) is decided
//! when the server is assembled.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use crate::percent;
use crate::request::Request;
use crate::response::{Body, Response, Status};
use crate::sitefile::HandlerCommand;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// What a handler produced for a request.
pub enum Reply {
    /// An owned buffer, released once it has been sent.
    Buffer(Vec<u8>),
    /// A source of exactly `len` bytes.
    Sized {
        reader: Box<dyn Read + Send>,
        len: u64,
    },
    /// A source read until EOF and sent chunked.
    Stream(Box<dyn Read + Send>),
    /// Use the canned page for the status code.
    Default,
}

/// A handler's answer: a status code plus the payload.
pub struct HandlerResponse {
    pub status: u16,
    pub reply: Reply,
}

impl HandlerResponse {
    /// # Arguments
    /// - `status`: Status code for the response line
    /// - `reply`: The payload, or [`Reply::Default`] for the canned page
    pub fn new(status: u16, reply: Reply) -> Self {
        Self { status, reply }
    }

    /// Converts into a wire response carrying `content_type` for non-default
    /// replies.
    pub fn into_response(self, content_type: &str) -> Response {
        let status = Status(self.status);
        let body = match self.reply {
            Reply::Default => return Response::error(status),
            Reply::Buffer(bytes) => Body::Bytes(bytes),
            Reply::Sized { reader, len } => Body::Sized { reader, len },
            Reply::Stream(reader) => Body::Chunked(reader),
        };
        Response::new(status, body).with_content_type(content_type)
    }
}

/// Produces responses for `linked` rules. Called synchronously from the
/// worker's reactor, so implementations must return promptly.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request) -> HandlerResponse;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> HandlerResponse + Send + Sync,
{
    fn handle(&self, request: &Request) -> HandlerResponse {
        self(request)
    }
}

/// Runs an external program once per request.
///
/// The request is described through CGI-style environment variables
/// (`REQUEST_METHOD`, `PATH_INFO`, `QUERY_STRING`, `CONTENT_LENGTH` and one
/// `HTTP_*` variable per header) and its body is written to stdin. The
/// program prints the decimal status code on the first line of stdout,
/// followed by the body. A non-2xx code with an empty body selects the
/// default page.
///
/// The program does not inherit the server's environment; it sees only the
/// variables above plus `PATH`. A `Proxy` header is never exported, and
/// header names that are not plain `[A-Za-z0-9-]` tokens are skipped.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: HandlerCommand,
}

impl CommandHandler {
    /// Runs `command` for every request; nothing is spawned until then.
    pub fn new(command: HandlerCommand) -> Self {
        Self { command }
    }

    fn run(&self, request: &Request) -> std::io::Result<Vec<u8>> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into()))
            .env("REQUEST_METHOD", request.method.as_str())
            .env("PATH_INFO", percent::encode(&request.path))
            .env("QUERY_STRING", query_string(request))
            .env("CONTENT_LENGTH", request.body.len().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (name, value) in request.headers.iter() {
            match header_variable(name) {
                Some(var) => {
                    command.env(var, value);
                }
                None => log::debug!("not exporting header {:?} to handler", name),
            }
        }

        let mut child = command.spawn()?;
        let body = request.body.clone();
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                // The program may exit without reading its input.
                let _ = stdin.write_all(&body);
            })
        });

        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        if !output.status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("handler exited with {}", output.status),
            ));
        }
        Ok(output.stdout)
    }
}

impl Handler for CommandHandler {
    fn handle(&self, request: &Request) -> HandlerResponse {
        match self.run(request).map(|out| parse_output(&out)) {
            Ok(Some(response)) => response,
            Ok(None) => {
                log::warn!("{} printed no status line", self.command.program.display());
                HandlerResponse::new(500, Reply::Default)
            }
            Err(err) => {
                log::warn!("{} failed: {}", self.command.program.display(), err);
                HandlerResponse::new(500, Reply::Default)
            }
        }
    }
}

fn query_string(request: &Request) -> String {
    request
        .query
        .iter()
        .map(|field| {
            format!(
                "{}={}",
                percent::encode_component(&field.key),
                percent::encode_component(&field.value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// `HTTP_<NAME>` for a header, or `None` when it must not reach the handler.
fn header_variable(name: &str) -> Option<String> {
    // httpoxy: HTTP_PROXY is read as a proxy setting by many clients.
    if name.is_empty() || name.eq_ignore_ascii_case("proxy") {
        return None;
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return None;
    }
    let mut var = String::from("HTTP_");
    var.extend(name.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    Some(var)
}

fn parse_output(out: &[u8]) -> Option<HandlerResponse> {
    let newline = out.iter().position(|&b| b == b'\n').unwrap_or(out.len());
    let status = std::str::from_utf8(&out[..newline])
        .ok()?
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|c| (100..=599).contains(c))?;
    let body = out.get(newline + 1..).unwrap_or_default().to_vec();

    if body.is_empty() && !(200..300).contains(&status) {
        return Some(HandlerResponse::new(status, Reply::Default));
    }
    Some(HandlerResponse::new(status, Reply::Buffer(body)))
}
