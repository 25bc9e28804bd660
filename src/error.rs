use std::error::Error as StdError;
use std::fmt;
use std::io;

use http_types::StatusCode;

/// A specialized `Result` type for connection handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while serving a connection.
///
/// Every variant is resolved inside the connection engine. The variant decides
/// which status the peer sees (see [`Error::status`]) and whether a response is
/// attempted at all.
#[derive(Debug)]
pub enum Error {
    /// The request head or its framing could not be parsed.
    Malformed(String),
    /// The request used an HTTP version other than 1.0 or 1.1.
    UnsupportedVersion(u8),
    /// The request carried an `Expect` header we can't satisfy.
    ExpectationFailed(String),
    /// The request head exceeded the configured maximum.
    HeadersTooLarge,
    /// The request body exceeded the configured maximum.
    PayloadTooLarge,
    /// The request was not fully received in time.
    RequestTimeout,
    /// The handler did not start a response in time, or the response stalled.
    ResponseTimeout,
    /// The request handler returned an error.
    Handler(http_types::Error),
    /// The request handler finished without calling a response sink.
    NoResponse,
    /// The request handler panicked.
    Panicked,
    /// A response could not be written as requested.
    Response(String),
    /// The transport failed or was closed under us.
    Closed(io::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// The status code the peer should receive for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Malformed(_) => StatusCode::BadRequest,
            Error::UnsupportedVersion(_) => StatusCode::HttpVersionNotSupported,
            Error::ExpectationFailed(_) => StatusCode::ExpectationFailed,
            Error::HeadersTooLarge | Error::PayloadTooLarge => StatusCode::PayloadTooLarge,
            Error::RequestTimeout => StatusCode::RequestTimeout,
            Error::ResponseTimeout => StatusCode::ServiceUnavailable,
            Error::Handler(err) => err.status(),
            Error::NoResponse | Error::Panicked | Error::Response(_) | Error::Closed(_) => {
                StatusCode::InternalServerError
            }
        }
    }

    /// Whether the transport is gone, so no response can be written.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    /// Whether a connection deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::RequestTimeout | Error::ResponseTimeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Malformed(msg) => write!(f, "malformed request: {}", msg),
            Error::UnsupportedVersion(v) => write!(f, "unsupported HTTP version 1.{}", v),
            Error::ExpectationFailed(value) => write!(f, "unknown expect: {}", value),
            Error::HeadersTooLarge => write!(f, "request header exceeds the size limit"),
            Error::PayloadTooLarge => write!(f, "request body exceeds the size limit"),
            Error::RequestTimeout => write!(f, "request timeout"),
            Error::ResponseTimeout => write!(f, "response timeout"),
            Error::Handler(err) => write!(f, "handler error: {}", err),
            Error::NoResponse => write!(f, "handler produced no response"),
            Error::Panicked => write!(f, "handler panicked"),
            Error::Response(msg) => write!(f, "invalid response: {}", msg),
            Error::Closed(err) => write!(f, "transport closed: {}", err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Closed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Closed(err)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}
