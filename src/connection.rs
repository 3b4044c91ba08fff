//! One client connection: its stream, parser state, and queued output.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::request::{Limits, Progress, RequestParser};
use crate::response::Outbox;
use crate::router::Router;

/// Size of the initial read buffer; grows for clients that send more.
const READ_BUFFER: usize = 4 * 1024;
const MAX_READ_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the worker should do with a connection after driving it.
pub enum State {
    Open,
    Closed,
}

/// One client connection: its byte stream, parser state and queued output.
pub struct Connection<S> {
    stream: S,
    port: usize,
    parser: RequestParser,
    outbox: Outbox,
    /// Received bytes the parser has not consumed yet.
    input: Vec<u8>,
    buffer: Vec<u8>,
    last_activity: Instant,
}

impl<S: Read + Write> Connection<S> {
    /// Creates a connection with an empty parser and outbox.
    ///
    /// # Arguments
    /// - `stream`: The transport, already non-blocking
    /// - `port`: Index of the port the connection was accepted on
    /// - `limits`: Line and body limits for the request parser
    pub fn new(stream: S, port: usize, limits: Limits) -> Self {
        Self {
            stream,
            port,
            parser: RequestParser::new(limits),
            outbox: Outbox::new(),
            input: Vec::new(),
            buffer: vec![0; READ_BUFFER],
            last_activity: Instant::now(),
        }
    }

    /// Index of the port this connection was accepted on.
    pub fn port(&self) -> usize {
        self.port
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Makes all the progress possible without blocking.
    ///
    /// Writes queued output first; requests are only parsed and dispatched
    /// once the previous response has been written completely. Reads until
    /// the stream would block.
    ///
    /// # Returns
    /// - `State::Open`: Waiting for more input or for the peer to drain output
    /// - `State::Closed`: The peer has gone or the byte stream can no longer be framed
    ///
    /// # Errors
    /// - Returns the stream's I/O error for anything other than `WouldBlock`
    ///   or `Interrupted`
    pub fn drive(&mut self, router: &Router) -> io::Result<State> {
        self.last_activity = Instant::now();
        loop {
            if !self.outbox.flush(&mut self.stream)? {
                return Ok(State::Open);
            }
            if self.parser.progress() == Progress::Dispatch {
                self.parser.reset();
            }

            if !self.input.is_empty() {
                match self.parser.feed(&self.input) {
                    Ok((consumed, request)) => {
                        self.input.drain(..consumed);
                        if let Some(request) = request {
                            self.outbox.push(router.dispatch(&request, self.port));
                            continue;
                        }
                    }
                    Err(err) => {
                        log::debug!("dropping connection: {}", err);
                        return Ok(State::Closed);
                    }
                }
            }

            match self.stream.read(&mut self.buffer) {
                Ok(0) => return Ok(State::Closed),
                Ok(n) => {
                    self.input.extend_from_slice(&self.buffer[..n]);
                    if n == self.buffer.len() && self.buffer.len() < MAX_READ_BUFFER {
                        self.buffer.resize(self.buffer.len() * 2, 0);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(State::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether the connection has seen no readiness for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}
