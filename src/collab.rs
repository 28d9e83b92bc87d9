//! Collaborator interfaces consumed by the core.
//!
//! These seams are implemented elsewhere (or by the defaults provided
//! here): the core only ever talks to the traits. Transport creation,
//! including TLS wrapping, lives behind [`NetService`]; the connection
//! state machines merely record what the transport reports.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http::HeaderValue;
use mime::Mime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::payload::Payload;

/// Encode/decode typed headers from their text representation.
pub trait HeaderCodec: Send + Sync {
    fn decode(&self, name: &str, value: &str) -> crate::Result<HeaderValue>;
    fn encode(&self, name: &str, value: &HeaderValue) -> crate::Result<String>;
}

/// Builds and normalizes request targets.
pub trait UriBuilder: Send + Sync {
    /// Replace the path, resetting any cached absolute path and query.
    fn set_path(&mut self, path: &str) -> crate::Result<()>;
    /// Append a query parameter.
    fn add_query_parameter(&mut self, name: &str, value: &str);
    /// The normalized absolute path.
    fn build_path(&self) -> String;
    /// The raw query string, when any parameter was set.
    fn build_raw_query(&self) -> Option<String>;
    /// Path plus `?query` suffix, the request-target form.
    fn build_path_and_query(&self) -> String {
        match self.build_raw_query() {
            Some(query) => format!("{}?{query}", self.build_path()),
            None => self.build_path(),
        }
    }
}

/// Containment relation between two URI patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternRelation {
    /// No input matches both patterns.
    Disjoint,
    /// Every input matching `other` also matches `self`.
    Included,
    /// The relation cannot be decided; tie-break is left to the caller.
    Indeterminate,
}

/// A matcher produced from a pattern string.
pub trait UriPattern: Send + Sync {
    fn pattern(&self) -> &str;
    fn matches(&self, path: &str) -> bool;
    fn relation_to(&self, other: &dyn UriPattern) -> PatternRelation;
}

/// A readable byte channel handed out by a [`Resource`].
pub type ReadableChannel = Pin<Box<dyn AsyncRead + Send + 'static>>;
/// A writable byte channel handed out by a [`Resource`].
pub type WritableChannel = Pin<Box<dyn AsyncWrite + Send + 'static>>;

/// An abstract byte source/sink (file, classpath entry, archive member...).
///
/// Read-oriented accessors fail with a not-readable error on write-only
/// resources and vice versa.
pub trait Resource: Send + Sync {
    fn uri(&self) -> Option<&str> {
        None
    }

    fn filename(&self) -> Option<&str> {
        None
    }

    fn media_type(&self) -> Option<Mime> {
        None
    }

    fn size(&self) -> crate::Result<Option<u64>>;

    fn last_modified(&self) -> crate::Result<Option<SystemTime>> {
        Ok(None)
    }

    /// The resource content as a cold chunk publisher.
    fn read(&self) -> crate::Result<Payload>;

    fn open_readable(&self) -> crate::Result<ReadableChannel>;

    fn open_writable(&self) -> crate::Result<WritableChannel>;

    fn resolve(&self, relative: &str) -> crate::Result<Box<dyn Resource>>;
}

/// Detect a media type from names, paths and URIs.
pub trait MediaTypeService: Send + Sync {
    fn for_extension(&self, extension: &str) -> Option<Mime>;

    fn for_filename(&self, filename: &str) -> Option<Mime> {
        filename.rsplit_once('.').and_then(|(_, ext)| self.for_extension(ext))
    }

    fn for_path(&self, path: &Path) -> Option<Mime> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.for_extension(ext))
    }

    fn for_uri(&self, uri: &str) -> Option<Mime> {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        self.for_filename(path.rsplit('/').next().unwrap_or(path))
    }
}

/// Extension-table media type detection backed by `mime_guess`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuessMediaTypeService;

impl MediaTypeService for GuessMediaTypeService {
    fn for_extension(&self, extension: &str) -> Option<Mime> {
        mime_guess::from_ext(extension).first()
    }
}

/// The process-wide default media type service, lazily initialized.
///
/// Endpoint builders inject their own service; this is only the fallback.
pub(crate) fn default_media_types() -> &'static GuessMediaTypeService {
    static DEFAULT: OnceLock<GuessMediaTypeService> = OnceLock::new();
    DEFAULT.get_or_init(GuessMediaTypeService::default)
}

/// Text <-> value conversion for parametric types.
pub trait ParameterConverter {
    fn encode<T: fmt::Display>(&self, value: &T) -> String;

    fn decode<T: FromStr>(&self, text: &str) -> crate::Result<T>
    where
        T::Err: Into<crate::BoxError>;
}

/// Plain `Display`/`FromStr` passthrough conversion.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextParameterConverter;

impl ParameterConverter for TextParameterConverter {
    fn encode<T: fmt::Display>(&self, value: &T) -> String {
        value.to_string()
    }

    fn decode<T: FromStr>(&self, text: &str) -> crate::Result<T>
    where
        T::Err: Into<crate::BoxError>,
    {
        text.parse()
            .map_err(|err: T::Err| crate::Error::new_illegal_state().with(err))
    }
}

/// Supply trust managers for TLS verification.
pub trait TrustProvider: Send + Sync {
    /// DER-encoded trust anchors.
    fn trust_anchors(&self) -> crate::Result<Vec<Bytes>>;

    /// Trust every presented certificate, skipping verification.
    fn trust_all(&self) -> bool {
        false
    }
}

/// What the core asks of the transport layer for a TLS-wrapped connection.
#[derive(Debug, Clone)]
pub struct TlsIntent {
    pub server_name: Option<String>,
    pub send_sni: bool,
    pub trust_all: bool,
    pub ciphers_includes: Vec<String>,
    pub ciphers_excludes: Vec<String>,
    /// ALPN protocol ids, most preferred first.
    pub alpn: Vec<&'static str>,
}

/// TLS facts reported back by an established transport.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    /// The ALPN protocol the peer selected.
    pub alpn: Option<String>,
    /// DER-encoded certificates this side presented.
    pub local_certificates: Option<Vec<Bytes>>,
    /// DER-encoded certificates the peer presented.
    pub peer_certificates: Option<Vec<Bytes>>,
}

/// Transport io object: any async byte stream.
pub trait TransportIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TransportIo for T {}

/// An established transport handed to a connection state machine.
pub struct Transport {
    pub io: Box<dyn TransportIo>,
    /// `Some` iff the transport is TLS; drives `https` scheme derivation.
    pub tls: Option<TlsState>,
}

impl Transport {
    pub fn plain(io: impl TransportIo) -> Self {
        Self {
            io: Box::new(io),
            tls: None,
        }
    }

    pub fn tls(io: impl TransportIo, state: TlsState) -> Self {
        Self {
            io: Box::new(io),
            tls: Some(state),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Creates transports and resolves host names.
pub trait NetService: Send + Sync + 'static {
    /// Establish a transport to `host:port`, TLS-wrapped per `tls`.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        local: Option<SocketAddr>,
        tls: Option<&'a TlsIntent>,
    ) -> BoxFuture<'a, crate::Result<Transport>>;

    /// Resolve a host name to socket addresses.
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, crate::Result<Vec<SocketAddr>>>;

    /// Allocate a write buffer.
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }
}

/// Default plaintext TCP transport creation.
///
/// TLS wrapping lives in dedicated transport crates; asking this service
/// for a TLS transport is a configuration error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpNetService;

impl NetService for TcpNetService {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        _local: Option<SocketAddr>,
        tls: Option<&'a TlsIntent>,
    ) -> BoxFuture<'a, crate::Result<Transport>> {
        Box::pin(async move {
            if tls.is_some() {
                return Err(crate::Error::new_connect(std::io::Error::other(
                    "plain TCP net service cannot establish TLS transports",
                )));
            }
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(crate::Error::new_connect)?;
            stream.set_nodelay(true).map_err(crate::Error::new_connect)?;
            Ok(Transport::plain(stream))
        })
    }

    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, crate::Result<Vec<SocketAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(crate::Error::new_connect)?;
            Ok(addrs.collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_detection_falls_through_helpers() {
        let svc = GuessMediaTypeService;
        assert_eq!(svc.for_extension("json").unwrap(), mime::APPLICATION_JSON);
        assert_eq!(svc.for_filename("data.json").unwrap(), mime::APPLICATION_JSON);
        assert_eq!(
            svc.for_uri("https://example.org/a/b/image.png?x=1").unwrap(),
            mime::IMAGE_PNG
        );
        assert!(svc.for_extension("definitely-not-an-extension").is_none());
    }

    #[test]
    fn parameter_converter_round_trips() {
        let conv = TextParameterConverter;
        assert_eq!(conv.encode(&42u16), "42");
        let back: u16 = conv.decode("42").unwrap();
        assert_eq!(back, 42);
        assert!(conv.decode::<u16>("forty-two").is_err());
    }
}
