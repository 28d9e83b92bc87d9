//! Exchange interception.
//!
//! Interceptors see the exchange before it is sent, as a fully mutable
//! proxy. Each one decides to forward (possibly mutated) or to respond
//! directly, in which case nothing goes on the wire and the intercepted
//! response becomes the final response. The source model's
//! `Intercepted -> Maybe<Intercepted>` maps onto ownership threading here:
//! the exchange travels through the chain by value and comes back inside
//! the [`InterceptFlow`] verdict.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};

use crate::payload::{Payload, PayloadStream};
use crate::request::Request;
use crate::response::Response;

type BodyTransform = Box<dyn FnOnce(PayloadStream) -> PayloadStream + Send + 'static>;

/// Verdict of an interceptor: keep going or answer right here.
pub enum InterceptFlow<Ctx> {
    /// Proceed towards the wire with the (possibly mutated) exchange.
    Forward(InterceptedExchange<Ctx>),
    /// Short-circuit: the intercepted response is the final response.
    Respond(InterceptedExchange<Ctx>),
}

/// The mutable proxy an interceptor works on.
///
/// Before the request is sent every part is mutable. Once the exchange was
/// forwarded and sent, the request freezes itself (mutators fail), while
/// the response body transform still applies to the received body as long
/// as that body has not been subscribed.
pub struct InterceptedExchange<Ctx> {
    ctx: Ctx,
    request: Request,
    response: InterceptedResponse,
}

impl<Ctx> InterceptedExchange<Ctx> {
    pub(crate) fn new(ctx: Ctx, request: Request) -> Self {
        Self {
            ctx,
            request,
            response: InterceptedResponse::new(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Ctx {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Ctx {
        &mut self.ctx
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    #[must_use]
    pub fn response(&self) -> &InterceptedResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut InterceptedResponse {
        &mut self.response
    }

    /// Finish the chain by forwarding to the wire.
    pub fn forward(self) -> crate::Result<InterceptFlow<Ctx>> {
        Ok(InterceptFlow::Forward(self))
    }

    /// Finish the chain by answering with the intercepted response.
    pub fn respond(self) -> crate::Result<InterceptFlow<Ctx>> {
        Ok(InterceptFlow::Respond(self))
    }

    pub(crate) fn into_parts(self) -> (Ctx, Request, InterceptedResponse) {
        (self.ctx, self.request, self.response)
    }
}

/// The fully mutable response an interceptor may shape.
pub struct InterceptedResponse {
    status: StatusCode,
    headers: HeaderMap,
    payload: Option<Payload>,
    transform: Option<BodyTransform>,
}

impl InterceptedResponse {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            payload: None,
            transform: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Install the body used when the chain short-circuits.
    pub fn set_body(&mut self, chunk: impl Into<Bytes>) -> &mut Self {
        self.payload = Some(Payload::full(chunk));
        self
    }

    pub fn set_payload(&mut self, payload: Payload) -> &mut Self {
        self.payload = Some(payload);
        self
    }

    /// Compose a transform over the response body. On forward it applies
    /// to the received body; on short-circuit, to the intercepted one.
    pub fn transform_body<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(PayloadStream) -> PayloadStream + Send + 'static,
    {
        self.transform = Some(match self.transform.take() {
            None => Box::new(f),
            Some(prev) => Box::new(move |stream| f(prev(stream))),
        });
        self
    }

    /// The short-circuit final response.
    pub(crate) fn into_response(self) -> crate::Result<Response> {
        let mut payload = self.payload.unwrap_or_default();
        if let Some(transform) = self.transform {
            payload.transform(transform)?;
        }
        Ok(Response::new(self.status, self.headers, payload, None))
    }

    pub(crate) fn take_transform(&mut self) -> Option<BodyTransform> {
        self.transform.take()
    }
}

/// An exchange interceptor; composes with [`and_then`](InterceptorExt::and_then).
pub trait Interceptor<Ctx>: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        exchange: InterceptedExchange<Ctx>,
    ) -> BoxFuture<'a, crate::Result<InterceptFlow<Ctx>>>;
}

impl<Ctx, F, Fut> Interceptor<Ctx> for F
where
    F: Fn(InterceptedExchange<Ctx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<InterceptFlow<Ctx>>> + Send + 'static,
    Ctx: 'static,
{
    fn intercept<'a>(
        &'a self,
        exchange: InterceptedExchange<Ctx>,
    ) -> BoxFuture<'a, crate::Result<InterceptFlow<Ctx>>> {
        Box::pin((self)(exchange))
    }
}

pub(crate) type ArcInterceptor<Ctx> = Arc<dyn Interceptor<Ctx>>;

/// Runs `first`, then `second` on its forwarded output; a short-circuit in
/// `first` skips `second` entirely.
pub(crate) struct AndThen<Ctx> {
    first: ArcInterceptor<Ctx>,
    second: ArcInterceptor<Ctx>,
}

impl<Ctx> AndThen<Ctx> {
    pub(crate) fn new(first: ArcInterceptor<Ctx>, second: ArcInterceptor<Ctx>) -> Self {
        Self { first, second }
    }
}

impl<Ctx: Send + 'static> Interceptor<Ctx> for AndThen<Ctx> {
    fn intercept<'a>(
        &'a self,
        exchange: InterceptedExchange<Ctx>,
    ) -> BoxFuture<'a, crate::Result<InterceptFlow<Ctx>>> {
        Box::pin(async move {
            match self.first.intercept(exchange).await? {
                InterceptFlow::Forward(exchange) => self.second.intercept(exchange).await,
                respond @ InterceptFlow::Respond(_) => Ok(respond),
            }
        })
    }
}

/// Extension combinators mirroring `andThen` / `compose` ordering.
pub trait InterceptorExt<Ctx>: Interceptor<Ctx> + Sized {
    /// `a.and_then(b)`: run `a` first, then `b` on `a`'s output.
    fn and_then<B>(self, second: B) -> impl Interceptor<Ctx>
    where
        B: Interceptor<Ctx>,
        Ctx: Send + 'static,
    {
        AndThen::new(Arc::new(self), Arc::new(second))
    }

    /// `a.compose(b)`: run `b` first, then `a` on `b`'s output.
    fn compose<B>(self, first: B) -> impl Interceptor<Ctx>
    where
        B: Interceptor<Ctx>,
        Ctx: Send + 'static,
    {
        AndThen::new(Arc::new(first), Arc::new(self))
    }
}

impl<Ctx, I: Interceptor<Ctx> + Sized> InterceptorExt<Ctx> for I {}
