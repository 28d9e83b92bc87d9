//! The exchange pipeline: request construction, interception, send,
//! response reception.

pub(crate) mod intercept;

use std::sync::Arc;

use http::Method;
use tokio::sync::oneshot;
use tracing::trace;

use crate::endpoint::EndpointInner;
use crate::error::Reason;
use crate::proto::Dispatch;
use crate::request::Request;
use crate::response::Response;
use crate::ws::WebSocketExchange;

pub use intercept::{InterceptFlow, InterceptedExchange, InterceptedResponse, Interceptor, InterceptorExt};

use intercept::{AndThen, ArcInterceptor};

/// One request/response pair with a user context and an interceptor chain.
///
/// Created by [`Endpoint::exchange`](crate::Endpoint::exchange). The request
/// is mutable until [`response`](Exchange::response) is called; from then on
/// every mutation fails with an illegal-state error.
pub struct Exchange<Ctx = ()> {
    endpoint: Arc<EndpointInner>,
    /// `None` while the exchange is travelling through the interceptor
    /// chain or the send path.
    parts: Option<(Ctx, Request)>,
    chain: Option<ArcInterceptor<Ctx>>,
    reset: Option<Reason>,
    responded: bool,
}

impl<Ctx: Send + 'static> Exchange<Ctx> {
    pub(crate) fn new(endpoint: Arc<EndpointInner>, method: Method, target: &str, ctx: Ctx) -> crate::Result<Self> {
        let request = Request::new(method, target, endpoint.media_types.clone())?;
        Ok(Self {
            endpoint,
            parts: Some((ctx, request)),
            chain: None,
            reset: None,
            responded: false,
        })
    }

    /// The user context value.
    pub fn context(&self) -> Option<&Ctx> {
        self.parts.as_ref().map(|(ctx, _)| ctx)
    }

    pub fn context_mut(&mut self) -> Option<&mut Ctx> {
        self.parts.as_mut().map(|(ctx, _)| ctx)
    }

    /// The request; mutable while the exchange is building.
    pub fn request(&mut self) -> crate::Result<&mut Request> {
        match self.parts {
            Some((_, ref mut request)) => Ok(request),
            None => Err(crate::Error::new_illegal_state()),
        }
    }

    /// Push an interceptor onto the chain, after any already installed.
    pub fn intercept<I>(&mut self, interceptor: I) -> &mut Self
    where
        I: Interceptor<Ctx>,
    {
        self.chain = Some(match self.chain.take() {
            None => Arc::new(interceptor),
            Some(chain) => Arc::new(AndThen::new(chain, Arc::new(interceptor))),
        });
        self
    }

    /// Reset the exchange before it was sent.
    ///
    /// The response subscription then completes empty and nothing touches
    /// the wire. Resetting after the one-shot subscription is an illegal
    /// state; cancel a sent exchange by dropping its response (body), which
    /// resets the stream (HTTP/2) or closes the connection (HTTP/1.1).
    pub fn reset(&mut self, reason: Reason) -> crate::Result<()> {
        if self.responded || self.parts.is_none() {
            return Err(crate::Error::new_illegal_state());
        }
        self.reset = Some(reason);
        Ok(())
    }

    /// Send the exchange and await the response. One-shot.
    ///
    /// `Ok(None)` is the empty completion of an exchange that was
    /// [`reset`](Exchange::reset) before being sent.
    pub async fn response(&mut self) -> crate::Result<Option<Response>> {
        if self.responded {
            return Err(crate::Error::new_illegal_state());
        }
        self.responded = true;
        let (ctx, request) = self.parts.take().ok_or_else(crate::Error::new_illegal_state)?;
        if let Some(reason) = self.reset {
            trace!(?reason, "exchange reset before send, completing empty");
            self.parts = Some((ctx, request));
            return Ok(None);
        }

        let (ctx, mut request, transform) = match self.chain.clone() {
            None => (ctx, request, None),
            Some(chain) => {
                let intercepted = InterceptedExchange::new(ctx, request);
                match chain.intercept(intercepted).await? {
                    InterceptFlow::Respond(intercepted) => {
                        let (ctx, request, response) = intercepted.into_parts();
                        self.parts = Some((ctx, request));
                        trace!("interceptor short-circuited the exchange");
                        return response.into_response().map(Some);
                    }
                    InterceptFlow::Forward(intercepted) => {
                        let (ctx, request, mut response) = intercepted.into_parts();
                        (ctx, request, response.take_transform())
                    }
                }
            }
        };

        let (sent, payload) = request.freeze()?;
        self.parts = Some((ctx, request));

        let conn = self.endpoint.pool.acquire().await?;
        let guard = conn.shared.acquire();
        let (respond_tx, respond_rx) = oneshot::channel();
        conn.dispatch(Dispatch {
            req: sent,
            payload,
            respond: respond_tx,
            upgrade: None,
            timeout: self.endpoint.config.request_timeout,
            guard,
        })
        .await?;

        let mut response = match respond_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(crate::Error::new_closed()),
        };
        if let Some(transform) = transform {
            response.payload_mut().transform(transform)?;
        }
        Ok(Some(response))
    }

    /// Upgrade this exchange to a WebSocket. One-shot, HTTP/1.1 only.
    pub async fn web_socket(&mut self, subprotocols: Option<&str>) -> crate::Result<WebSocketExchange> {
        if self.responded {
            return Err(crate::Error::new_illegal_state());
        }
        self.responded = true;
        let (ctx, mut request) = self.parts.take().ok_or_else(crate::Error::new_illegal_state)?;
        if self.reset.is_some() {
            self.parts = Some((ctx, request));
            return Err(crate::Error::new_canceled());
        }
        let result = crate::ws::handshake(&self.endpoint, &mut request, subprotocols).await;
        self.parts = Some((ctx, request));
        result
    }
}

impl<Ctx> std::fmt::Debug for Exchange<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("sent", &self.parts.as_ref().map(|(_, r)| r.is_sent()))
            .field("reset", &self.reset)
            .finish_non_exhaustive()
    }
}
