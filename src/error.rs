//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have `aqueduct` errors.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while handling HTTP streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Malformed wire input that could not be parsed.
    Parse(Parse),
    /// A configured limit was exceeded.
    Limit(Limit),
    /// A stream timeout budget expired.
    Timeout(Timeout),
    /// WebSocket protocol violation.
    Ws(Ws),
    /// An `io::Error` occurred while reading or writing the transport.
    Io,
    /// An operation was attempted in a stream state that forbids it.
    State,
    /// No host or route matched the request.
    Route,
    /// The configuration file was malformed or referenced unknown keys.
    Config,
    /// An application handler failed with an explicit status.
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    Method,
    Uri,
    Version,
    Header,
    Chunk,
    Status,
    #[cfg(feature = "http2")]
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Limit {
    HeaderSize,
    HeaderCount,
    UriSize,
    RxBody,
    Connections,
    Requests,
    WsFrame,
    WsMessage,
    CacheItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timeout {
    Parse,
    Inactivity,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ws {
    Protocol,
    Utf8,
    MessageTooLarge,
    Handshake,
    Version,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_limit(limit: Limit) -> Error {
        Error::new(Kind::Limit(limit))
    }

    pub(crate) fn new_timeout(timeout: Timeout) -> Error {
        Error::new(Kind::Timeout(timeout))
    }

    pub(crate) fn new_ws(ws: Ws) -> Error {
        Error::new(Kind::Ws(ws))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_state(msg: &'static str) -> Error {
        Error::new(Kind::State).with(msg)
    }

    pub(crate) fn new_config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    /// An error carrying the HTTP status an application handler failed with.
    pub fn status(status: StatusCode) -> Error {
        Error::new(Kind::Status(status.as_u16()))
    }

    /// Returns true if this was caused by malformed wire input.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if a configured limit was exceeded.
    pub fn is_limit(&self) -> bool {
        matches!(self.inner.kind, Kind::Limit(_))
    }

    /// Returns true if a timeout budget expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns true if the transport failed.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true for WebSocket protocol violations.
    pub fn is_ws(&self) -> bool {
        matches!(self.inner.kind, Kind::Ws(_))
    }

    /// The status code the engine answers with when a response is still
    /// possible for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.inner.kind {
            Kind::Parse(_) => StatusCode::BAD_REQUEST,
            Kind::Limit(Limit::UriSize) => StatusCode::URI_TOO_LONG,
            Kind::Limit(Limit::Connections) | Kind::Limit(Limit::Requests) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Kind::Limit(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Kind::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Kind::Ws(_) => StatusCode::BAD_REQUEST,
            Kind::Route => StatusCode::NOT_FOUND,
            Kind::Status(code) => {
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Kind::Io | Kind::State | Kind::Config => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error also counts against the peer's `LimitErrors`
    /// monitor counter.
    pub(crate) fn counts_as_limit_error(&self) -> bool {
        self.is_limit() || self.is_timeout()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid method parsed",
            Kind::Parse(Parse::Uri) => "invalid URI parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid header parsed",
            Kind::Parse(Parse::Chunk) => "invalid chunk framing",
            Kind::Parse(Parse::Status) => "invalid status line parsed",
            #[cfg(feature = "http2")]
            Kind::Parse(Parse::Frame) => "invalid frame",
            Kind::Limit(Limit::HeaderSize) => "header block exceeds size limit",
            Kind::Limit(Limit::HeaderCount) => "too many headers",
            Kind::Limit(Limit::UriSize) => "URI too long",
            Kind::Limit(Limit::RxBody) => "request body exceeds size limit",
            Kind::Limit(Limit::Connections) => "too many connections",
            Kind::Limit(Limit::Requests) => "too many concurrent requests",
            Kind::Limit(Limit::WsFrame) => "WebSocket frame exceeds size limit",
            Kind::Limit(Limit::WsMessage) => "WebSocket message exceeds size limit",
            Kind::Limit(Limit::CacheItem) => "response exceeds cache item size limit",
            Kind::Timeout(Timeout::Parse) => "headers not received in time",
            Kind::Timeout(Timeout::Inactivity) => "no I/O progress within inactivity timeout",
            Kind::Timeout(Timeout::Request) => "request exceeded total duration budget",
            Kind::Ws(Ws::Protocol) => "WebSocket protocol violation",
            Kind::Ws(Ws::Utf8) => "invalid UTF-8 in WebSocket text message",
            Kind::Ws(Ws::MessageTooLarge) => "WebSocket message too large",
            Kind::Ws(Ws::Handshake) => "WebSocket handshake verification failed",
            Kind::Ws(Ws::Version) => "unsupported WebSocket version",
            Kind::Io => "transport error",
            Kind::State => "operation not allowed in current stream state",
            Kind::Route => "no matching host or route",
            Kind::Config => "configuration error",
            Kind::Status(_) => "handler failed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("aqueduct::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_is_one_pointer() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn limit_errors_map_to_protocol_statuses() {
        assert_eq!(
            Error::new_limit(Limit::HeaderSize).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            Error::new_limit(Limit::UriSize).status_code(),
            StatusCode::URI_TOO_LONG
        );
        assert_eq!(
            Error::new_limit(Limit::Connections).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::new_timeout(Timeout::Parse).status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[test]
    fn status_error_round_trips() {
        let err = Error::status(StatusCode::NOT_FOUND);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
