//! Transport-independent framing of a byte stream into CRLF lines and
//! fixed-length bodies.

use crate::error::ParseError;

/// Initial line buffer allocation. The buffer grows by doubling from here and
/// keeps its capacity across lines and requests.
const INITIAL_LINE_CAPACITY: usize = 32;

/// Accumulates bytes until a CRLF-terminated line is complete.
#[derive(Debug)]
pub struct LineFramer {
    line: Vec<u8>,
    max_len: usize,
    complete: bool,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            line: Vec::with_capacity(INITIAL_LINE_CAPACITY),
            max_len,
            complete: false,
        }
    }

    /// Pushes one byte. Returns `Ok(true)` once a full line is available via
    /// [`line`](Self::line); the caller must [`clear`](Self::clear) it before
    /// pushing more.
    pub fn push(&mut self, byte: u8) -> Result<bool, ParseError> {
        debug_assert!(!self.complete, "line consumed without clear()");

        if byte == b'\n' {
            if self.line.pop() != Some(b'\r') {
                return Err(ParseError::BareLineFeed);
            }
            self.complete = true;
            return Ok(true);
        }

        // +1 leaves room for the CR of a line sitting exactly at the limit
        if self.line.len() > self.max_len {
            return Err(ParseError::LineTooLong { limit: self.max_len });
        }
        if self.line.len() == self.line.capacity() {
            self.line.reserve_exact(self.line.capacity().max(INITIAL_LINE_CAPACITY));
        }
        self.line.push(byte);
        Ok(false)
    }

    /// The completed line with CRLF stripped.
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    /// Resets the length to zero, retaining the allocation.
    pub fn clear(&mut self) {
        self.line.clear();
        self.complete = false;
    }

    pub fn capacity(&self) -> usize {
        self.line.capacity()
    }
}

/// Collects exactly `expected` body bytes.
#[derive(Debug, Default)]
pub struct BodyFramer {
    body: Vec<u8>,
    expected: usize,
}

impl BodyFramer {
    pub fn start(&mut self, expected: usize) {
        self.body = Vec::with_capacity(expected);
        self.expected = expected;
    }

    /// Appends as much of `data` as the declared length allows and returns the
    /// number of bytes taken.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let take = self.remaining().min(data.len());
        self.body.extend_from_slice(&data[..take]);
        take
    }

    pub fn remaining(&self) -> usize {
        self.expected - self.body.len()
    }

    pub fn is_complete(&self) -> bool {
        self.body.len() == self.expected
    }

    pub fn take(&mut self) -> Vec<u8> {
        self.expected = 0;
        std::mem::take(&mut self.body)
    }
}
