//! WebSocket handshake over HTTP/1.1.
//!
//! The handshake rides a regular exchange: a GET with the upgrade headers
//! and a random nonce key. On `101 Switching Protocols` with a matching
//! `Sec-WebSocket-Accept` the connection detaches from the pool and its
//! transport is handed to the caller; any other status fails the upgrade.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::HttpVersion;
use crate::endpoint::EndpointInner;
use crate::proto::{Dispatch, Upgraded};
use crate::request::Request;

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A completed WebSocket handshake: the negotiated subprotocol and the
/// detached transport. Closing it is the caller's responsibility; the pool
/// no longer knows this connection.
pub struct WebSocketExchange {
    subprotocol: Option<String>,
    headers: HeaderMap,
    io: Upgraded,
}

impl WebSocketExchange {
    /// The subprotocol the server selected, if any.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The 101 response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Take the raw detached transport.
    #[must_use]
    pub fn into_io(self) -> Upgraded {
        self.io
    }
}

impl AsyncRead for WebSocketExchange {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for WebSocketExchange {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for WebSocketExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketExchange")
            .field("subprotocol", &self.subprotocol)
            .finish_non_exhaustive()
    }
}

/// The `Sec-WebSocket-Accept` signature for a nonce key, RFC 6455 §1.3.
fn accept_for(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID);
    BASE64.encode(sha1.finalize())
}

pub(crate) async fn handshake(
    endpoint: &Arc<EndpointInner>,
    request: &mut Request,
    subprotocols: Option<&str>,
) -> crate::Result<WebSocketExchange> {
    let key = BASE64.encode(rand::random::<[u8; 16]>());
    request.method(Method::GET)?;
    {
        let protocols = subprotocols
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|err| crate::Error::new_illegal_state().with(err))?;
        let key_value = HeaderValue::from_str(&key)
            .map_err(|err| crate::Error::new_illegal_state().with(err))?;
        request.headers(move |headers| {
            headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::SEC_WEBSOCKET_KEY, key_value);
            headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
            if let Some(protocols) = protocols {
                headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocols);
            }
        })?;
    }
    let (sent, payload) = request.freeze()?;

    let conn = endpoint.pool.acquire().await?;
    if conn.shared.protocol != HttpVersion::Http11 {
        // The handshake is an HTTP/1.1 upgrade; h2 connections can't host it.
        debug!("websocket handshake refused on non-h1 connection");
        return Err(crate::Error::new_unsupported_protocol());
    }
    let guard = conn.shared.acquire();
    let (respond_tx, respond_rx) = oneshot::channel();
    let (upgrade_tx, upgrade_rx) = oneshot::channel();
    conn.dispatch(Dispatch {
        req: sent,
        payload,
        respond: respond_tx,
        upgrade: Some(upgrade_tx),
        timeout: endpoint.config.request_timeout,
        guard,
    })
    .await?;

    let response = match respond_rx.await {
        Ok(result) => result?,
        Err(_) => return Err(crate::Error::new_closed()),
    };
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %response.status(), "websocket upgrade refused");
        return Err(crate::Error::new_upgrade());
    }

    let accept = response
        .headers()
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok());
    if accept != Some(accept_for(&key).as_str()) {
        debug!("websocket accept signature mismatch");
        return Err(crate::Error::new_upgrade());
    }

    let subprotocol = match response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
    {
        Some(selected) => {
            let offered = subprotocols
                .map(|list| {
                    list.split(',')
                        .any(|candidate| candidate.trim().eq_ignore_ascii_case(selected))
                })
                .unwrap_or(false);
            if !offered {
                debug!(selected, "server selected a subprotocol that was not offered");
                return Err(crate::Error::new_unsupported_protocol());
            }
            Some(selected.to_owned())
        }
        None => None,
    };

    let io = match upgrade_rx.await {
        Ok(io) => io,
        Err(_) => return Err(crate::Error::new_upgrade()),
    };
    trace!(?subprotocol, "websocket handshake complete");
    Ok(WebSocketExchange {
        subprotocol,
        headers: response.headers().clone(),
        io,
    })
}
