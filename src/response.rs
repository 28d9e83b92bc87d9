//! Response facade.

use std::fmt;

use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;

use crate::payload::{Payload, PayloadStream};

/// A received (or intercepted) response: status, headers, a cold body
/// payload and optional trailers.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    payload: Payload,
    trailers: Option<oneshot::Receiver<HeaderMap>>,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        payload: Payload,
        trailers: Option<oneshot::Receiver<HeaderMap>>,
    ) -> Self {
        Self {
            status,
            headers,
            payload,
            trailers,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body payload, e.g. to install transforms before subscribing.
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Subscribe to the body. One-shot, like every payload.
    pub fn body(&mut self) -> crate::Result<PayloadStream> {
        self.payload.subscribe()
    }

    /// Convenience: subscribe and collect the whole body.
    pub async fn aggregate(&mut self) -> crate::Result<bytes::Bytes> {
        self.body()?.aggregate().await
    }

    /// Trailers, if the peer sent any. Resolves after the body completed.
    pub async fn trailers(&mut self) -> Option<HeaderMap> {
        match self.trailers.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Payload, Option<oneshot::Receiver<HeaderMap>>) {
        (self.status, self.headers, self.payload, self.trailers)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
