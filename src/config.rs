//! Endpoint configuration surface.
//!
//! Plain data consumed by the exchange pipeline, the connection state
//! machines and the pool. The builder style mirrors the rest of the crate:
//! `set_*` mutates, `with_*` chains.

use std::time::Duration;

/// Acceptable wire versions; controls ALPN and plaintext negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http11,
    Http2,
}

impl HttpVersion {
    pub(crate) fn alpn_id(self) -> &'static str {
        match self {
            Self::Http11 => "http/1.1",
            Self::Http2 => "h2",
        }
    }
}

/// The set of protocol versions an endpoint may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet {
    http11: bool,
    http2: bool,
}

impl ProtocolSet {
    pub const fn http11_only() -> Self {
        Self {
            http11: true,
            http2: false,
        }
    }

    pub const fn http2_only() -> Self {
        Self {
            http11: false,
            http2: true,
        }
    }

    pub const fn all() -> Self {
        Self {
            http11: true,
            http2: true,
        }
    }

    #[must_use]
    pub const fn contains(&self, version: HttpVersion) -> bool {
        match version {
            HttpVersion::Http11 => self.http11,
            HttpVersion::Http2 => self.http2,
        }
    }

    /// ALPN protocol ids, most preferred first.
    pub(crate) fn alpn_ids(&self) -> Vec<&'static str> {
        let mut ids = Vec::new();
        if self.http2 {
            ids.push(HttpVersion::Http2.alpn_id());
        }
        if self.http11 {
            ids.push(HttpVersion::Http11.alpn_id());
        }
        ids
    }
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-codec compression tuning, kept as negotiation input.
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    pub level: i32,
    pub window_bits: i32,
    pub mem_level: i32,
    pub block_size: usize,
    pub max_encode_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            level: 6,
            window_bits: 15,
            mem_level: 8,
            block_size: 16 * 1024,
            max_encode_size: 4 * 1024 * 1024,
        }
    }
}

const DEFAULT_HTTP1_MAX_CONCURRENT_REQUESTS: usize = 10;
const DEFAULT_HTTP2_HEADER_TABLE_SIZE: u32 = 4096;
const DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS: u32 = 100;
const DEFAULT_HTTP2_INITIAL_WINDOW_SIZE: u32 = 65_535;
const DEFAULT_HTTP2_MAX_FRAME_SIZE: u32 = 16_384;
const DEFAULT_POOL_MAX_SIZE: usize = 2;
const DEFAULT_POOL_CLEAN_PERIOD: Duration = Duration::from_millis(1000);
const DEFAULT_POOL_BUFFER_SIZE: usize = 16;
const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration consumed by endpoints, exchanges, connections and the pool.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) http_protocol_versions: ProtocolSet,
    pub(crate) send_user_agent: bool,
    pub(crate) user_agent: String,
    pub(crate) tls_enabled: bool,
    pub(crate) tls_ciphers_includes: Vec<String>,
    pub(crate) tls_ciphers_excludes: Vec<String>,
    pub(crate) tls_trust_all: bool,
    pub(crate) tls_send_sni: bool,
    pub(crate) compression_enabled: bool,
    pub(crate) decompression_enabled: bool,
    pub(crate) compression_deflate: CodecConfig,
    pub(crate) compression_gzip: CodecConfig,
    pub(crate) compression_zstd: CodecConfig,
    pub(crate) http1_max_concurrent_requests: usize,
    pub(crate) http2_header_table_size: u32,
    pub(crate) http2_max_concurrent_streams: u32,
    pub(crate) http2_initial_window_size: u32,
    pub(crate) http2_max_frame_size: u32,
    pub(crate) http2_max_header_list_size: Option<u32>,
    pub(crate) pool_max_size: usize,
    pub(crate) pool_clean_period: Duration,
    pub(crate) pool_buffer_size: usize,
    pub(crate) pool_keep_alive_timeout: Option<Duration>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) graceful_shutdown_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            http_protocol_versions: ProtocolSet::default(),
            send_user_agent: true,
            user_agent: concat!("bora/", env!("CARGO_PKG_VERSION")).to_owned(),
            tls_enabled: false,
            tls_ciphers_includes: Vec::new(),
            tls_ciphers_excludes: Vec::new(),
            tls_trust_all: false,
            tls_send_sni: true,
            compression_enabled: false,
            decompression_enabled: false,
            compression_deflate: CodecConfig::default(),
            compression_gzip: CodecConfig::default(),
            compression_zstd: CodecConfig::default(),
            http1_max_concurrent_requests: DEFAULT_HTTP1_MAX_CONCURRENT_REQUESTS,
            http2_header_table_size: DEFAULT_HTTP2_HEADER_TABLE_SIZE,
            http2_max_concurrent_streams: DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS,
            http2_initial_window_size: DEFAULT_HTTP2_INITIAL_WINDOW_SIZE,
            http2_max_frame_size: DEFAULT_HTTP2_MAX_FRAME_SIZE,
            http2_max_header_list_size: None,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            pool_clean_period: DEFAULT_POOL_CLEAN_PERIOD,
            pool_buffer_size: DEFAULT_POOL_BUFFER_SIZE,
            pool_keep_alive_timeout: None,
            connect_timeout: None,
            request_timeout: None,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

macro_rules! setters {
    ($($(#[$doc:meta])* ($set:ident, $with:ident, $field:ident: $ty:ty)),+ $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $set(&mut self, value: $ty) -> &mut Self {
                self.$field = value;
                self
            }

            $(#[$doc])*
            #[must_use]
            pub fn $with(mut self, value: $ty) -> Self {
                self.$field = value;
                self
            }
        )+
    };
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    setters! {
        /// Acceptable wire versions; drives ALPN on TLS and the
        /// prior-knowledge preface on plaintext h2-only endpoints.
        (set_http_protocol_versions, with_http_protocol_versions, http_protocol_versions: ProtocolSet),
        /// Inject a `User-Agent` header when the request carries none.
        (set_send_user_agent, with_send_user_agent, send_user_agent: bool),
        /// The injected `User-Agent` value.
        (set_user_agent, with_user_agent, user_agent: String),
        /// Wrap the transport in TLS; also flips the derived scheme to `https`.
        (set_tls_enabled, with_tls_enabled, tls_enabled: bool),
        /// Restrict the negotiated cipher list to these names.
        (set_tls_ciphers_includes, with_tls_ciphers_includes, tls_ciphers_includes: Vec<String>),
        /// Remove these names from the negotiated cipher list.
        (set_tls_ciphers_excludes, with_tls_ciphers_excludes, tls_ciphers_excludes: Vec<String>),
        /// Skip certificate verification.
        (set_tls_trust_all, with_tls_trust_all, tls_trust_all: bool),
        /// Send SNI during the handshake.
        (set_tls_send_sni, with_tls_send_sni, tls_send_sni: bool),
        /// Offer request-body compression during negotiation.
        (set_compression_enabled, with_compression_enabled, compression_enabled: bool),
        /// Advertise `Accept-Encoding` for response bodies.
        (set_decompression_enabled, with_decompression_enabled, decompression_enabled: bool),
        /// Deflate codec tuning.
        (set_compression_deflate, with_compression_deflate, compression_deflate: CodecConfig),
        /// Gzip codec tuning.
        (set_compression_gzip, with_compression_gzip, compression_gzip: CodecConfig),
        /// Zstd codec tuning.
        (set_compression_zstd, with_compression_zstd, compression_zstd: CodecConfig),
        /// HTTP/1.1 pipelining ceiling per connection.
        (set_http1_max_concurrent_requests, with_http1_max_concurrent_requests, http1_max_concurrent_requests: usize),
        /// HPACK dynamic table size advertised in SETTINGS.
        (set_http2_header_table_size, with_http2_header_table_size, http2_header_table_size: u32),
        /// Peer concurrency limit advertised in SETTINGS.
        (set_http2_max_concurrent_streams, with_http2_max_concurrent_streams, http2_max_concurrent_streams: u32),
        /// Initial flow-control window advertised in SETTINGS.
        (set_http2_initial_window_size, with_http2_initial_window_size, http2_initial_window_size: u32),
        /// Largest frame payload advertised in SETTINGS.
        (set_http2_max_frame_size, with_http2_max_frame_size, http2_max_frame_size: u32),
        /// Header list cap advertised in SETTINGS.
        (set_http2_max_header_list_size, with_http2_max_header_list_size, http2_max_header_list_size: Option<u32>),
        /// Max connections per endpoint.
        (set_pool_max_size, with_pool_max_size, pool_max_size: usize),
        /// Cleaner tick interval.
        (set_pool_clean_period, with_pool_clean_period, pool_clean_period: Duration),
        /// Pending-acquire queue length; a full queue fails acquires.
        (set_pool_buffer_size, with_pool_buffer_size, pool_buffer_size: usize),
        /// Idle TTL before the cleaner closes a connection.
        (set_pool_keep_alive_timeout, with_pool_keep_alive_timeout, pool_keep_alive_timeout: Option<Duration>),
        /// Deadline for connection establishment and queued acquires.
        (set_connect_timeout, with_connect_timeout, connect_timeout: Option<Duration>),
        /// Per-exchange deadline, armed at send, cancelled on response headers.
        (set_request_timeout, with_request_timeout, request_timeout: Option<Duration>),
        /// Max wait during graceful shutdown before escalating to hard.
        (set_graceful_shutdown_timeout, with_graceful_shutdown_timeout, graceful_shutdown_timeout: Duration),
    }

    /// The `Accept-Encoding` value advertised when decompression is on.
    pub(crate) fn accept_encodings(&self) -> &'static str {
        "gzip, deflate, zstd"
    }
}
