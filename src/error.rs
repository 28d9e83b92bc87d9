//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// A boxed error cause, carried behind the categorical [`Error`].
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type often returned from methods that can have `bora` `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while driving an exchange.
///
/// Errors are categorical: callers should branch on the `is_*` predicates
/// (or [`Error::reason`] for stream resets) rather than on the formatted
/// message, which is unspecified and may change.
///
/// A failure *status code* is not an error; the caller receives a
/// [`Response`](crate::Response) and decides for itself.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// TCP/TLS establishment towards the endpoint failed.
    Connect,
    /// The peer closed or reset the underlying transport.
    ConnectionReset,
    /// HTTP/1 -> HTTP/2 or WebSocket upgrade failure.
    Upgrade,
    /// The stream was reset, locally or by the peer.
    ResetStream(Reason),
    /// The per-exchange request timer expired.
    RequestTimeout,
    /// The negotiated (sub)protocol is not supported.
    UnsupportedProtocol,
    /// A write was attempted on a read-only resource.
    NotWritable,
    /// A read was attempted on a write-only resource.
    NotReadable,
    /// An operation was attempted in a state that forbids it, e.g. mutating
    /// a request after send or subscribing to a payload twice.
    IllegalState,
    /// The pending-acquire queue of the pool is full.
    PoolExhausted,
    /// The endpoint was shut down while the exchange was in flight.
    Shutdown,
    /// The server answered `Expect: 100-continue` with 417.
    ExpectationFailed,
    /// A message reached EOF before it was complete.
    IncompleteMessage,
    /// A pending exchange was dropped before ever being processed.
    Canceled,
    /// The connection task is gone.
    ChannelClosed,
    /// Malformed bytes received from the peer.
    Parse(Parse),
    /// An `io::Error` occurred on the underlying transport.
    Io,
    /// The peer violated the HTTP/2 protocol.
    Proto(Reason),
    /// The user-provided request body stream failed.
    UserBody,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Status,
    Version,
    Header,
    ContentLength,
    TransferEncoding,
    Chunk,
    Frame,
    TooLarge,
}

/// An HTTP/2 error code, carried by `RST_STREAM` and `GOAWAY` frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reason(pub(crate) u32);

impl Reason {
    pub const NO_ERROR: Self = Self(0x0);
    pub const PROTOCOL_ERROR: Self = Self(0x1);
    pub const INTERNAL_ERROR: Self = Self(0x2);
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub const SETTINGS_TIMEOUT: Self = Self(0x4);
    pub const STREAM_CLOSED: Self = Self(0x5);
    pub const FRAME_SIZE_ERROR: Self = Self(0x6);
    pub const REFUSED_STREAM: Self = Self(0x7);
    pub const CANCEL: Self = Self(0x8);
    pub const COMPRESSION_ERROR: Self = Self(0x9);
    pub const CONNECT_ERROR: Self = Self(0xa);
    pub const ENHANCE_YOUR_CALM: Self = Self(0xb);
    pub const INADEQUATE_SECURITY: Self = Self(0xc);
    pub const HTTP_1_1_REQUIRED: Self = Self(0xd);

    #[must_use]
    pub fn description(&self) -> &str {
        match self.0 {
            0x0 => "not a result of an error",
            0x1 => "unspecific protocol error detected",
            0x2 => "unexpected internal error encountered",
            0x3 => "flow-control protocol violated",
            0x4 => "settings ACK not received in timely manner",
            0x5 => "received frame when stream half-closed",
            0x6 => "frame with invalid size",
            0x7 => "refused stream before processing any application logic",
            0x8 => "stream no longer needed",
            0x9 => "unable to maintain the header compression context",
            0xa => "connection established in response to a CONNECT request was reset or abnormally closed",
            0xb => "detected excessive load generating behavior",
            0xc => "security properties do not meet minimum requirements",
            0xd => "endpoint requires HTTP/1.1",
            _ => "unknown reason",
        }
    }
}

impl From<u32> for Reason {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl From<Reason> for u32 {
    fn from(reason: Reason) -> Self {
        reason.0
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            other => return f.debug_tuple("Reason").field(&other).finish(),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl Error {
    /// Returns true if TCP/TLS establishment towards the endpoint failed.
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the peer closed or reset the underlying transport.
    #[must_use]
    pub fn is_connection_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionReset)
    }

    /// Returns true if a protocol upgrade (h2 or WebSocket) failed.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        matches!(self.inner.kind, Kind::Upgrade)
    }

    /// Returns true if the stream carrying the exchange was reset.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::ResetStream(_))
    }

    /// Returns true if the per-exchange request timer expired.
    #[must_use]
    pub fn is_request_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::RequestTimeout)
    }

    /// Returns true if a negotiated (sub)protocol is not supported.
    #[must_use]
    pub fn is_unsupported_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::UnsupportedProtocol)
    }

    /// Returns true if a write was attempted on a read-only resource.
    #[must_use]
    pub fn is_not_writable(&self) -> bool {
        matches!(self.inner.kind, Kind::NotWritable)
    }

    /// Returns true if a read was attempted on a write-only resource.
    #[must_use]
    pub fn is_not_readable(&self) -> bool {
        matches!(self.inner.kind, Kind::NotReadable)
    }

    /// Returns true if an operation was attempted in a state that forbids it.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self.inner.kind, Kind::IllegalState)
    }

    /// Returns true if the pool's pending-acquire queue was full.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolExhausted)
    }

    /// Returns true if the endpoint was shut down mid-flight.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::Shutdown)
    }

    /// Returns true if the server rejected `Expect: 100-continue` with 417.
    #[must_use]
    pub fn is_expectation_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::ExpectationFailed)
    }

    /// Returns true if the connection closed before a message completed.
    #[must_use]
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the exchange was canceled before being processed.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the connection task is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if malformed bytes were received from the peer.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// The `RST_STREAM` / `GOAWAY` code, when this error carries one.
    #[must_use]
    pub fn reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::ResetStream(reason) | Kind::Proto(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether the pool may transparently retry the exchange elsewhere.
    ///
    /// Only transport-level resets of idempotent traffic qualify; every
    /// other category is surfaced to the caller untouched.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionReset)
    }

    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<BoxError>>(mut self, cause: C) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_connect<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_connection_reset() -> Self {
        Self::new(Kind::ConnectionReset)
    }

    pub(crate) fn new_upgrade() -> Self {
        Self::new(Kind::Upgrade)
    }

    pub(crate) fn new_reset_stream(reason: Reason) -> Self {
        Self::new(Kind::ResetStream(reason))
    }

    pub(crate) fn new_request_timeout() -> Self {
        Self::new(Kind::RequestTimeout)
    }

    pub(crate) fn new_unsupported_protocol() -> Self {
        Self::new(Kind::UnsupportedProtocol)
    }

    /// A write was attempted on a read-only resource. Public so that
    /// [`Resource`](crate::collab::Resource) implementations outside this
    /// crate can raise the right category.
    #[must_use]
    pub fn new_not_writable() -> Self {
        Self::new(Kind::NotWritable)
    }

    /// A read was attempted on a write-only resource.
    #[must_use]
    pub fn new_not_readable() -> Self {
        Self::new(Kind::NotReadable)
    }

    pub(crate) fn new_illegal_state() -> Self {
        Self::new(Kind::IllegalState)
    }

    pub(crate) fn new_pool_exhausted() -> Self {
        Self::new(Kind::PoolExhausted)
    }

    pub(crate) fn new_shutdown() -> Self {
        Self::new(Kind::Shutdown)
    }

    pub(crate) fn new_expectation_failed() -> Self {
        Self::new(Kind::ExpectationFailed)
    }

    pub(crate) fn new_incomplete() -> Self {
        Self::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_canceled() -> Self {
        Self::new(Kind::Canceled)
    }

    pub(crate) fn new_closed() -> Self {
        Self::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Self {
        if cause.kind() == std::io::ErrorKind::ConnectionReset {
            Self::new_connection_reset().with(cause)
        } else {
            Self::new(Kind::Io).with(cause)
        }
    }

    pub(crate) fn new_proto(reason: Reason) -> Self {
        Self::new(Kind::Proto(reason))
    }

    pub(crate) fn new_user_body<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::UserBody).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Connect => "endpoint connect error",
            Kind::ConnectionReset => "connection reset by peer",
            Kind::Upgrade => "protocol upgrade failed",
            Kind::ResetStream(_) => "stream reset",
            Kind::RequestTimeout => "request timed out",
            Kind::UnsupportedProtocol => "unsupported protocol",
            Kind::NotWritable => "resource is not writable",
            Kind::NotReadable => "resource is not readable",
            Kind::IllegalState => "operation not permitted in current state",
            Kind::PoolExhausted => "connection pool exhausted",
            Kind::Shutdown => "endpoint shut down",
            Kind::ExpectationFailed => "server rejected expectation",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Canceled => "operation was canceled",
            Kind::ChannelClosed => "connection task is gone",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncoding) => "unexpected transfer-encoding parsed",
            Kind::Parse(Parse::Chunk) => "invalid chunk framing parsed",
            Kind::Parse(Parse::Frame) => "invalid http2 frame parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Io => "connection error",
            Kind::Proto(_) => "http2 protocol error",
            Kind::UserBody => "error from user's request body stream",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("bora::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Kind::ResetStream(reason) | Kind::Proto(reason) = self.inner.kind {
            write!(f, ": {reason}")?;
        }
        Ok(())
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

impl From<Parse> for Error {
    fn from(err: Parse) -> Self {
        Self::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        let parse = match err {
            httparse::Error::Status => Parse::Status,
            httparse::Error::Version => Parse::Version,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            _ => Parse::Header,
        };
        Self::new(Kind::Parse(parse)).with(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    fn assert_send_sync<T: Send + Sync + 'static>() {}

    #[test]
    fn error_satisfies_send_sync() {
        assert_send_sync::<Error>()
    }

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn reset_carries_reason() {
        let err = Error::new_reset_stream(Reason::CANCEL);
        assert!(err.is_reset());
        assert_eq!(err.reason(), Some(Reason::CANCEL));
        assert_eq!(u32::from(Reason::CANCEL), 8);
    }

    #[test]
    fn only_transport_reset_is_retryable() {
        assert!(Error::new_connection_reset().is_retryable());
        assert!(!Error::new_request_timeout().is_retryable());
        assert!(!Error::new_upgrade().is_retryable());
        assert!(!Error::new_reset_stream(Reason::CANCEL).is_retryable());
    }
}
