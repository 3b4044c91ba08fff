//! Incremental HTTP/1.1 request decoding.
//!
//! [`RequestParser`] is fed arbitrary slices of the byte stream and moves
//! through [`Progress::RequestLine`] → [`Progress::Headers`] →
//! [`Progress::Body`] → [`Progress::Dispatch`]. Any framing error is fatal:
//! there is no resynchronisation.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;
use crate::framer::{BodyFramer, LineFramer};
use crate::percent;

/// The only protocol version accepted on the request line.
const PROTOCOL: &[u8] = b"HTTP/1.1";

/// HTTP verbs understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub fn from_token(token: &[u8]) -> Option<Method> {
        match token {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"HEAD" => Some(Method::Head),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl FromStr for Method {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::from_token(s.as_bytes()).ok_or_else(|| ParseError::Method(s.to_owned()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list. Names keep their original case; lookups ignore it.
/// Duplicates are kept as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// The value of the last entry named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One decoded `key=value` pair from the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryField {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A fully received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Percent-decoded path, without the query string.
    pub path: Vec<u8>,
    pub query: Vec<QueryField>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// The decoded path as text, lossily converted for logging and matching.
    pub fn path_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    pub fn query_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.query.iter().find(|f| f.key == key).map(|f| f.value.as_slice())
    }
}

/// Where the parser is within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    RequestLine,
    Headers,
    Body,
    /// A complete request has been handed out and its response is pending.
    Dispatch,
}

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_line_length: usize,
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_line_length: 8 * 1024,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

/// Incremental request decoder for one connection.
#[derive(Debug)]
pub struct RequestParser {
    progress: Progress,
    limits: Limits,
    framer: LineFramer,
    body: BodyFramer,
    method: Option<Method>,
    path: Vec<u8>,
    query: Vec<QueryField>,
    headers: Headers,
}

impl RequestParser {
    /// A parser waiting for a request line.
    ///
    /// # Arguments
    /// - `limits`: Longest accepted line and largest accepted body
    pub fn new(limits: Limits) -> Self {
        Self {
            progress: Progress::RequestLine,
            framer: LineFramer::new(limits.max_line_length),
            limits,
            body: BodyFramer::default(),
            method: None,
            path: Vec::new(),
            query: Vec::new(),
            headers: Headers::new(),
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Feeds bytes from the stream.
    ///
    /// Returns how many bytes of `data` were consumed and, once the final
    /// byte of a request has been consumed, the request itself. Consumption
    /// stops right after a complete request; the remaining bytes belong to the
    /// next request and must be fed again after [`reset`](Self::reset).
    /// While in [`Progress::Dispatch`] nothing is consumed.
    ///
    /// # Errors
    /// - Returns a `ParseError` for any byte stream that cannot be framed,
    ///   such as a bare LF, an overlong line or an unparseable
    ///   `Content-Length`. The connection must be dropped afterwards.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Request>), ParseError> {
        let mut consumed = 0;

        while consumed < data.len() || self.body_ready() {
            match self.progress {
                Progress::Dispatch => break,
                Progress::Body => {
                    consumed += self.body.extend(&data[consumed..]);
                    if self.body.is_complete() {
                        return Ok((consumed, Some(self.finish())));
                    }
                }
                Progress::RequestLine | Progress::Headers => {
                    let byte = data[consumed];
                    consumed += 1;
                    if self.framer.push(byte)? {
                        let result = self.on_line();
                        self.framer.clear();
                        result?;
                    }
                }
            }
        }

        Ok((consumed, None))
    }

    /// Clears per-request state after a response has been sent.
    pub fn reset(&mut self) {
        self.progress = Progress::RequestLine;
        self.method = None;
        self.path.clear();
        self.query.clear();
        self.headers.clear();
        self.body.take();
        self.framer.clear();
    }

    /// A zero-length body completes as soon as the headers end.
    fn body_ready(&self) -> bool {
        self.progress == Progress::Body && self.body.is_complete()
    }

    fn finish(&mut self) -> Request {
        self.progress = Progress::Dispatch;
        Request {
            method: self.method.unwrap_or(Method::Get),
            path: std::mem::take(&mut self.path),
            query: std::mem::take(&mut self.query),
            headers: std::mem::take(&mut self.headers),
            body: self.body.take(),
        }
    }

    fn on_line(&mut self) -> Result<(), ParseError> {
        match self.progress {
            Progress::RequestLine => self.on_request_line(),
            Progress::Headers => self.on_header_line(),
            Progress::Body | Progress::Dispatch => Ok(()),
        }
    }

    fn on_request_line(&mut self) -> Result<(), ParseError> {
        let line = self.framer.line();

        let split = line.iter().position(|&b| b == b' ').ok_or(ParseError::RequestLine)?;
        let (token, rest) = (&line[..split], &line[split + 1..]);
        let method = Method::from_token(token)
            .ok_or_else(|| ParseError::Method(String::from_utf8_lossy(token).into_owned()))?;

        let split = rest.iter().position(|&b| b == b' ').ok_or(ParseError::RequestLine)?;
        let (target, version) = (&rest[..split], &rest[split + 1..]);
        if version != PROTOCOL {
            return Err(ParseError::Version(String::from_utf8_lossy(version).into_owned()));
        }

        let (path, query) = parse_target(target)?;
        self.method = Some(method);
        self.path = path;
        self.query = query;
        self.headers.clear();
        self.progress = Progress::Headers;
        Ok(())
    }

    fn on_header_line(&mut self) -> Result<(), ParseError> {
        let line = self.framer.line();
        if line.is_empty() {
            return self.start_body();
        }

        let split = line
            .windows(2)
            .position(|w| w == b": ")
            .ok_or(ParseError::Header)?;
        let name = std::str::from_utf8(&line[..split]).map_err(|_| ParseError::Header)?;
        let value = std::str::from_utf8(&line[split + 2..]).map_err(|_| ParseError::Header)?;
        self.headers.append(name, value);
        Ok(())
    }

    fn start_body(&mut self) -> Result<(), ParseError> {
        let length = match self.headers.get("Content-Length") {
            None => 0,
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::ContentLength(raw.to_owned()))?,
        };
        if length > self.limits.max_body_size as u64 {
            return Err(ParseError::BodyTooLarge {
                length,
                limit: self.limits.max_body_size,
            });
        }
        self.body.start(length as usize);
        self.progress = Progress::Body;
        Ok(())
    }
}

/// Splits a request target into its decoded path and query fields.
pub fn parse_target(target: &[u8]) -> Result<(Vec<u8>, Vec<QueryField>), ParseError> {
    let (raw_path, raw_query) = match target.iter().position(|&b| b == b'?') {
        Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
        None => (target, None),
    };

    let path = percent::decode(raw_path)?;
    let mut query = Vec::new();
    if let Some(raw_query) = raw_query {
        for segment in raw_query.split(|&b| b == b'&') {
            let eq = segment
                .iter()
                .position(|&b| b == b'=')
                .ok_or(ParseError::QuerySegment)?;
            query.push(QueryField {
                key: percent::decode(&segment[..eq])?,
                value: percent::decode(&segment[eq + 1..])?,
            });
        }
    }

    Ok((path, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new(Limits::default())
    }

    /// Feeds `data` in the given chunk sizes and returns the request (if any)
    /// plus the total number of bytes consumed.
    fn feed_chunks(
        parser: &mut RequestParser,
        data: &[u8],
        chunk: usize,
    ) -> Result<(usize, Option<Request>), ParseError> {
        let mut consumed = 0;
        for piece in data.chunks(chunk) {
            let (used, request) = parser.feed(piece)?;
            consumed += used;
            if request.is_some() {
                return Ok((consumed, request));
            }
            assert_eq!(used, piece.len());
        }
        Ok((consumed, None))
    }

    const POST: &[u8] = b"POST /submit/a%20b?name=Ada&lang=rust%21 HTTP/1.1\r\n\
Host: example.com\r\n\
X-Dup: one\r\n\
x-dup: two\r\n\
Content-Length: 11\r\n\
\r\n\
hello world";

    #[test]
    fn test_parse_simple_get() {
        let mut p = parser();
        let (used, req) = p.feed(b"GET /hello?name=Ada HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let req = req.unwrap();
        assert_eq!(used, 41);
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, b"/hello");
        assert_eq!(req.query_value(b"name"), Some(&b"Ada"[..]));
        assert_eq!(req.headers.get("host"), Some("x"));
        assert!(req.body.is_empty());
        assert_eq!(p.progress(), Progress::Dispatch);
    }

    #[test]
    fn test_parse_post_with_body_and_duplicates() {
        let mut p = parser();
        let (used, req) = p.feed(POST).unwrap();
        let req = req.unwrap();
        assert_eq!(used, POST.len());
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, b"/submit/a b");
        assert_eq!(req.query.len(), 2);
        assert_eq!(req.query_value(b"lang"), Some(&b"rust!"[..]));
        assert_eq!(req.headers.get_all("X-Dup").collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(req.headers.get("X-DUP"), Some("two"));
        assert_eq!(req.body, b"hello world");
    }

    /// Every chunking of the same bytes yields the same request
    #[test]
    fn test_incremental_parsing_equivalence() {
        let mut whole = parser();
        let (_, expected) = whole.feed(POST).unwrap();
        let expected = expected.unwrap();

        for chunk in 1..=POST.len() {
            let mut p = parser();
            let (used, req) = feed_chunks(&mut p, POST, chunk).unwrap();
            assert_eq!(used, POST.len(), "chunk size {}", chunk);
            assert_eq!(req.as_ref(), Some(&expected), "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_uneven_splits_match_single_feed() {
        let splits: &[&[usize]] = &[&[1, 2, 3, 50, 7], &[60, 1, 1, 1], &[5, 90]];
        let mut whole = parser();
        let (_, expected) = whole.feed(POST).unwrap();

        for sizes in splits {
            let mut p = parser();
            let mut rest = POST;
            let mut got = None;
            for &size in sizes.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let take = size.min(rest.len());
                let (used, req) = p.feed(&rest[..take]).unwrap();
                rest = &rest[used..];
                if req.is_some() {
                    got = req;
                    break;
                }
            }
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_short_body_never_dispatches() {
        let mut p = parser();
        let (used, req) = p
            .feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nhello")
            .unwrap();
        assert!(req.is_none());
        assert_eq!(p.progress(), Progress::Body);
        assert!(used > 0);

        let (_, req) = p.feed(b"").unwrap();
        assert!(req.is_none());
        let (_, req) = p.feed(b"worl").unwrap();
        assert!(req.is_none());
        let (used, req) = p.feed(b"dEXTRA").unwrap();
        assert_eq!(used, 1);
        assert_eq!(req.unwrap().body, b"helloworld");
    }

    /// Bytes after a complete request are left for the next cycle
    #[test]
    fn test_pipelined_bytes_wait_for_reset() {
        let mut p = parser();
        let first = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut data = first.to_vec();
        data.extend_from_slice(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n");

        let (used, req) = p.feed(&data).unwrap();
        assert_eq!(used, first.len());
        assert_eq!(req.unwrap().path, b"/a");

        let (used, req) = p.feed(&data[first.len()..]).unwrap();
        assert_eq!((used, req), (0, None));

        p.reset();
        let (_, req) = p.feed(&data[first.len()..]).unwrap();
        assert_eq!(req.unwrap().path, b"/b");
    }

    #[test]
    fn test_rejects_malformed_request_lines() {
        let cases: &[(&[u8], ParseError)] = &[
            (b"GET /\r\n", ParseError::RequestLine),
            (b"GET\r\n", ParseError::RequestLine),
            (b"FETCH / HTTP/1.1\r\n", ParseError::Method("FETCH".into())),
            (b"get / HTTP/1.1\r\n", ParseError::Method("get".into())),
            (b"GET / HTTP/1.0\r\n", ParseError::Version("HTTP/1.0".into())),
            (b"GET / HTTP/1.1 \r\n", ParseError::Version("HTTP/1.1 ".into())),
            (b"GET /%zz HTTP/1.1\r\n", ParseError::PercentEscape),
            (b"GET /?flag HTTP/1.1\r\n", ParseError::QuerySegment),
            (b"GET /? HTTP/1.1\r\n", ParseError::QuerySegment),
            (b"GET / HTTP/1.1\n", ParseError::BareLineFeed),
        ];
        for (input, expected) in cases {
            let mut p = parser();
            assert_eq!(p.feed(input).unwrap_err(), *expected, "{:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let mut p = parser();
        assert_eq!(
            p.feed(b"GET / HTTP/1.1\r\nHost:x\r\n").unwrap_err(),
            ParseError::Header
        );

        let mut p = parser();
        assert_eq!(
            p.feed(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n").unwrap_err(),
            ParseError::ContentLength("ten".into())
        );
    }

    #[test]
    fn test_last_content_length_wins() {
        let mut p = parser();
        let (_, req) = p
            .feed(b"PUT / HTTP/1.1\r\nContent-Length: 100\r\ncontent-length: 2\r\n\r\nok")
            .unwrap();
        assert_eq!(req.unwrap().body, b"ok");
    }

    #[test]
    fn test_body_limit() {
        let mut p = RequestParser::new(Limits {
            max_line_length: 1024,
            max_body_size: 4,
        });
        assert_eq!(
            p.feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap_err(),
            ParseError::BodyTooLarge { length: 5, limit: 4 }
        );
    }

    #[test]
    fn test_query_value_may_contain_equals_and_nul() {
        let (path, query) = parse_target(b"/p?k=a=b&n=%00").unwrap();
        assert_eq!(path, b"/p");
        assert_eq!(query[0].value, b"a=b");
        assert_eq!(query[1].value, vec![0u8]);
    }
}
