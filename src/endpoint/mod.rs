//! Endpoints: a logical client bound to one remote authority, owning a
//! connection pool.

pub(crate) mod pool;

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::Method;
use tracing::debug;

use crate::collab::{MediaTypeService, NetService, TcpNetService, TlsIntent, default_media_types};
use crate::config::{EndpointConfig, HttpVersion};
use crate::exchange::Exchange;
use crate::proto::{ConnHandle, ConnShared, PoolEvents};
use crate::request::effective_authority;
use pool::{Connector, Pool};

/// Build an endpoint bound to `remote` (`host`, `host:port` or
/// `[v6]:port`).
pub fn endpoint(remote: impl Into<String>) -> EndpointBuilder {
    EndpointBuilder {
        remote: remote.into(),
        local: None,
        config: EndpointConfig::default(),
        net: None,
        media_types: None,
        single_connection: false,
    }
}

/// Builder for [`Endpoint`].
pub struct EndpointBuilder {
    remote: String,
    local: Option<SocketAddr>,
    config: EndpointConfig,
    net: Option<Arc<dyn NetService>>,
    media_types: Option<Arc<dyn MediaTypeService>>,
    single_connection: bool,
}

impl EndpointBuilder {
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind outgoing connections to this local address.
    #[must_use]
    pub fn local_address(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// Replace the transport layer (TLS lives behind this seam).
    #[must_use]
    pub fn net_service(mut self, net: impl NetService) -> Self {
        self.net = Some(Arc::new(net));
        self
    }

    /// Replace the media type detection service.
    #[must_use]
    pub fn media_types(mut self, media_types: impl MediaTypeService + 'static) -> Self {
        self.media_types = Some(Arc::new(media_types));
        self
    }

    /// Eagerly open a single cached connection and reuse it for every
    /// exchange; forces the pool to one connection.
    #[must_use]
    pub fn single_connection(mut self) -> Self {
        self.single_connection = true;
        self
    }

    /// Create the endpoint. Must run inside a tokio runtime; the pool
    /// spawns its cleaner task here.
    pub fn build<Ctx: Send + 'static>(mut self) -> crate::Result<Endpoint<Ctx>> {
        if self.single_connection {
            self.config.set_pool_max_size(1);
        }
        let default_port = if self.config.tls_enabled { 443 } else { 80 };
        let (host, port) = parse_remote(&self.remote, default_port)?;
        let config = Arc::new(self.config);
        let net = self.net.unwrap_or_else(|| Arc::new(TcpNetService));
        let media_types = self
            .media_types
            .unwrap_or_else(|| Arc::new(*default_media_types()));
        let connector = Arc::new(EndpointConnector {
            host: host.clone(),
            port,
            local: self.local,
            config: config.clone(),
            net,
        });
        let pool = Pool::new(config.clone(), connector);
        if self.single_connection {
            pool.warm();
        }
        Ok(Endpoint {
            inner: Arc::new(EndpointInner {
                host,
                port,
                config,
                media_types,
                pool,
            }),
            _ctx: PhantomData,
        })
    }
}

fn parse_remote(remote: &str, default_port: u16) -> crate::Result<(String, u16)> {
    if remote.is_empty() {
        return Err(crate::Error::new_illegal_state());
    }
    if let Some(rest) = remote.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(crate::Error::new_illegal_state());
        };
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|err| crate::Error::new_illegal_state().with(err))?,
            None => default_port,
        };
        return Ok((host.to_owned(), port));
    }
    match remote.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|err| crate::Error::new_illegal_state().with(err))?;
            Ok((host.to_owned(), port))
        }
        // No colon, or a bare IPv6 literal.
        _ => Ok((remote.to_owned(), default_port)),
    }
}

/// Internal shared state behind an [`Endpoint`] and its exchanges.
pub(crate) struct EndpointInner {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) config: Arc<EndpointConfig>,
    pub(crate) media_types: Arc<dyn MediaTypeService>,
    pub(crate) pool: Pool,
}

/// A logical client bound to one remote address.
///
/// `Ctx` is the user context type carried by every exchange.
pub struct Endpoint<Ctx = ()> {
    inner: Arc<EndpointInner>,
    _ctx: PhantomData<fn(Ctx) -> Ctx>,
}

impl<Ctx: Send + 'static> Endpoint<Ctx> {
    /// Create an exchange in the building state.
    pub fn exchange(&self, method: Method, target: &str, ctx: Ctx) -> crate::Result<Exchange<Ctx>> {
        Exchange::new(self.inner.clone(), method, target, ctx)
    }

    /// The remote host this endpoint is bound to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Close every pooled connection immediately. In-flight exchanges fail
    /// with a shutdown cause; detached (upgraded) connections are spared.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    /// Refuse new acquires, let in-flight exchanges finish, and close once
    /// load reaches zero or the graceful deadline elapses (then hard).
    pub async fn shutdown_gracefully(&self) {
        self.inner.pool.shutdown_gracefully().await;
    }
}

impl<Ctx> Clone for Endpoint<Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _ctx: PhantomData,
        }
    }
}

impl<Ctx> std::fmt::Debug for Endpoint<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .finish_non_exhaustive()
    }
}

/// Opens connections for the pool: transport via the net service, protocol
/// selection via ALPN (TLS) or the configured version set (plaintext, h2c
/// prior knowledge when HTTP/2 is the only acceptable version).
struct EndpointConnector {
    host: String,
    port: u16,
    local: Option<SocketAddr>,
    config: Arc<EndpointConfig>,
    net: Arc<dyn NetService>,
}

impl Connector for EndpointConnector {
    fn connect(&self, events: PoolEvents, conn_id: u64) -> BoxFuture<'static, crate::Result<ConnHandle>> {
        let host = self.host.clone();
        let port = self.port;
        let local = self.local;
        let config = self.config.clone();
        let net = self.net.clone();
        Box::pin(async move {
            let tls_intent = config.tls_enabled.then(|| TlsIntent {
                server_name: Some(host.clone()),
                send_sni: config.tls_send_sni,
                trust_all: config.tls_trust_all,
                ciphers_includes: config.tls_ciphers_includes.clone(),
                ciphers_excludes: config.tls_ciphers_excludes.clone(),
                alpn: config.http_protocol_versions.alpn_ids(),
            });
            let transport = net
                .connect(&host, port, local, tls_intent.as_ref())
                .await?;
            let tls = transport.tls.clone();
            let versions = config.http_protocol_versions;
            let protocol = match tls.as_ref().and_then(|state| state.alpn.as_deref()) {
                Some("h2") if versions.contains(HttpVersion::Http2) => HttpVersion::Http2,
                Some("http/1.1") if versions.contains(HttpVersion::Http11) => HttpVersion::Http11,
                Some(_) => return Err(crate::Error::new_unsupported_protocol()),
                None => {
                    if versions.contains(HttpVersion::Http11) {
                        HttpVersion::Http11
                    } else if versions.contains(HttpVersion::Http2) {
                        // h2c prior knowledge.
                        HttpVersion::Http2
                    } else {
                        return Err(crate::Error::new_unsupported_protocol());
                    }
                }
            };
            let authority = effective_authority(None, &host, port, tls.is_some());
            let capacity = match protocol {
                HttpVersion::Http11 => config.http1_max_concurrent_requests,
                HttpVersion::Http2 => config.http2_max_concurrent_streams as usize,
            };
            let shared = Arc::new(ConnShared::new(conn_id, protocol, tls, capacity, events));
            debug!(conn_id, ?protocol, host = %authority, "connection established");
            let handle = match protocol {
                HttpVersion::Http11 => {
                    crate::proto::h1::spawn(transport.io, shared, config, authority)
                }
                HttpVersion::Http2 => {
                    crate::proto::h2::spawn(transport.io, shared, config, authority)
                }
            };
            Ok(handle)
        })
    }
}
