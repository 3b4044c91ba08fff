//! Response representation and the streaming writer that puts it on the wire.
//!
//! Every response goes out as: status line, `Server` header, optional
//! `Content-Type`, then exactly one of `Content-Length` or
//! `Transfer-Encoding: chunked`, a blank line and the body.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};

/// Value of the `Server` header on every response.
pub const SERVER: &str = concat!("hearth/", env!("CARGO_PKG_VERSION"));

/// Bytes pulled from a body reader per write attempt.
const CHUNK: usize = 16 * 1024;

/// An HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            413 => "Content Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            418 => "I'm a teapot",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

/// A response body.
pub enum Body {
    Bytes(Vec<u8>),
    /// A reader that yields exactly `len` bytes.
    Sized {
        reader: Box<dyn Read + Send>,
        len: u64,
    },
    /// A reader of unknown length, sent with chunked transfer encoding.
    Chunked(Box<dyn Read + Send>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Body::Sized { len, .. } => f.debug_struct("Sized").field("len", len).finish(),
            Body::Chunked(_) => f.write_str("Chunked"),
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: Status,
    pub content_type: Option<String>,
    pub body: Body,
}

impl Response {
    /// A response without a `Content-Type` header.
    pub fn new(status: Status, body: Body) -> Self {
        Self {
            status,
            content_type: None,
            body,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The canned HTML page for `status`.
    pub fn error(status: Status) -> Self {
        let page = format!("<meta charset=utf-8><h1 text-align=center>{}</h1>", status);
        Response::new(status, Body::Bytes(page.into_bytes())).with_content_type("text/html")
    }

    /// Serialises the status line and headers.
    pub fn head(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {}\r\nServer: {}\r\n", self.status, SERVER);
        if let Some(content_type) = &self.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        match &self.body {
            Body::Bytes(bytes) => head.push_str(&format!("Content-Length: {}\r\n", bytes.len())),
            Body::Sized { len, .. } => head.push_str(&format!("Content-Length: {}\r\n", len)),
            Body::Chunked(_) => head.push_str("Transfer-Encoding: chunked\r\n"),
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

enum Framing {
    Raw { remaining: u64 },
    Chunked,
}

enum Segment {
    Bytes { data: Vec<u8>, pos: usize },
    Stream {
        reader: Box<dyn Read + Send>,
        framing: Framing,
        staged: Vec<u8>,
        pos: usize,
        finished: bool,
    },
}

/// Queue of outgoing bytes for one connection.
///
/// Streams pull at most [`CHUNK`] bytes from a reader at a time, so a large
/// file never sits in memory at once and a slow peer applies backpressure.
#[derive(Default)]
pub struct Outbox {
    queue: VecDeque<Segment>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queues `response` behind anything not yet written.
    ///
    /// The header block is rendered immediately; a sized or chunked body is
    /// read lazily by [`flush`](Self::flush). Empty bodies queue nothing.
    ///
    /// # Arguments
    /// - `response`: The response to send, consumed
    pub fn push(&mut self, response: Response) {
        self.queue.push_back(Segment::Bytes {
            data: response.head(),
            pos: 0,
        });
        let stream = |reader, framing| Segment::Stream {
            reader,
            framing,
            staged: Vec::new(),
            pos: 0,
            finished: false,
        };
        match response.body {
            Body::Bytes(data) if data.is_empty() => {}
            Body::Bytes(data) => self.queue.push_back(Segment::Bytes { data, pos: 0 }),
            Body::Sized { len: 0, .. } => {}
            Body::Sized { reader, len } => {
                self.queue.push_back(stream(reader, Framing::Raw { remaining: len }))
            }
            Body::Chunked(reader) => self.queue.push_back(stream(reader, Framing::Chunked)),
        }
    }

    /// Writes as much as the writer accepts.
    ///
    /// # Returns
    /// - `Ok(true)`: Everything queued has been written and flushed
    /// - `Ok(false)`: The writer would block; call again once it is writable
    ///
    /// # Errors
    /// - Returns any other write or body read error, which is fatal for the
    ///   connection
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while let Some(segment) = self.queue.front_mut() {
            let done = match segment {
                Segment::Bytes { data, pos } => match write_pending(writer, data, pos)? {
                    Progress::Blocked => return Ok(false),
                    Progress::Drained => true,
                },
                Segment::Stream {
                    reader,
                    framing,
                    staged,
                    pos,
                    finished,
                } => loop {
                    match write_pending(writer, staged, pos)? {
                        Progress::Blocked => return Ok(false),
                        Progress::Drained if *finished => break true,
                        Progress::Drained => {}
                    }
                    staged.clear();
                    *pos = 0;
                    *finished = stage(reader.as_mut(), framing, staged)?;
                },
            };
            if done {
                self.queue.pop_front();
            }
        }

        match writer.flush() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

enum Progress {
    Drained,
    Blocked,
}

fn write_pending<W: Write>(writer: &mut W, data: &[u8], pos: &mut usize) -> io::Result<Progress> {
    while *pos < data.len() {
        match writer.write(&data[*pos..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Progress::Drained)
}

/// Reads the next piece of a body into `staged`, framed for the wire.
/// Returns true when `staged` holds the final piece.
fn stage(reader: &mut dyn Read, framing: &mut Framing, staged: &mut Vec<u8>) -> io::Result<bool> {
    let mut buf = [0u8; CHUNK];
    match framing {
        Framing::Raw { remaining } => {
            let want = (*remaining).min(CHUNK as u64) as usize;
            let n = read_retrying(reader, &mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "body ended before its declared length",
                ));
            }
            staged.extend_from_slice(&buf[..n]);
            *remaining -= n as u64;
            Ok(*remaining == 0)
        }
        Framing::Chunked => {
            let n = read_retrying(reader, &mut buf)?;
            if n == 0 {
                staged.extend_from_slice(b"0\r\n\r\n");
                return Ok(true);
            }
            staged.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
            staged.extend_from_slice(&buf[..n]);
            staged.extend_from_slice(b"\r\n");
            Ok(false)
        }
    }
}

fn read_retrying(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
