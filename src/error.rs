use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Framing errors raised while decoding a request from the byte stream.
///
/// Every variant is fatal for the connection it occurred on: once framing is
/// lost the stream position can no longer be trusted, so the connection is
/// closed without writing a response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A `\n` arrived without the preceding `\r`
    #[error("line not terminated by CRLF")]
    BareLineFeed,

    /// The request line has no method/target separator
    #[error("malformed request line")]
    RequestLine,

    /// The method token is not one of the supported verbs
    #[error("unknown method {0:?}")]
    Method(String),

    /// The protocol token is anything other than `HTTP/1.1`
    #[error("unsupported protocol version {0:?}")]
    Version(String),

    /// A `%` escape was not followed by two hex digits
    #[error("invalid percent escape")]
    PercentEscape,

    /// A query segment without `=`
    #[error("query segment without '='")]
    QuerySegment,

    /// A header line without the `": "` separator, or not valid UTF-8
    #[error("malformed header line")]
    Header,

    /// `Content-Length` was present but not a decimal number
    #[error("invalid content length {0:?}")]
    ContentLength(String),

    /// A request line or header line exceeded the configured limit
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// The advertised body exceeds the configured limit
    #[error("body of {length} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { length: u64, limit: usize },
}

/// Errors produced while loading a sitefile.
#[derive(Debug, Error)]
pub enum SiteFileError {
    /// The sitefile could not be read
    #[error("failed to read sitefile {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A syntax or semantic error on a given line
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// A rule pattern failed to compile
    #[error("line {line}: invalid pattern {pattern:?}: {source}")]
    Pattern {
        line: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A TLS port was declared without both key and certificate
    #[error("port {port} uses tls but is missing its {missing}")]
    MissingCredential { port: u16, missing: &'static str },
}

impl SiteFileError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        SiteFileError::Syntax {
            line,
            message: message.into(),
        }
    }
}

/// Errors on the supervisor-to-worker control channel.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The peer end of the channel is gone
    #[error("control channel closed")]
    Closed,

    /// The worker's socket buffer is full; the connection was not sent
    #[error("control channel full")]
    Busy,

    /// A message arrived without a descriptor or with a truncated payload
    #[error("malformed control message: {0}")]
    Malformed(&'static str),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised inside a worker's reactor.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),
}

/// Setup and supervision errors. Any of these terminates the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    SiteFile(#[from] SiteFileError),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("tls setup for port {port} failed: {message}")]
    Tls { port: u16, message: String },

    #[error("runtime user {0:?} does not exist")]
    UnknownUser(String),

    #[error("failed to switch to user {user:?}: {source}")]
    Privileges {
        user: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using ServerError as the error type
pub type Result<T> = std::result::Result<T, ServerError>;
