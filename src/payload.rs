//! Cold payload streams.
//!
//! A [`Payload`] is a cold publisher of owned byte chunks with a terminal
//! completion or error. It is subscribed at most once: the connection
//! subscribes to a request payload when sending, the caller subscribes to a
//! response payload when streaming the body. Chunks follow ownership
//! transfer semantics, so discarding an unsubscribed payload (or cancelling
//! a subscription) releases every buffered chunk by dropping it.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_channel::mpsc;
use futures_core::Stream;
use futures_util::StreamExt;

type BoxChunkStream = Pin<Box<dyn Stream<Item = crate::Result<Bytes>> + Send + 'static>>;
type Transform = Box<dyn FnOnce(PayloadStream) -> PayloadStream + Send + 'static>;

/// A cold stream of byte chunks, subscribed at most once.
#[must_use = "payloads do nothing unless subscribed"]
pub struct Payload {
    kind: Option<Kind>,
    transform: Option<Transform>,
}

enum Kind {
    Empty,
    Full(Bytes),
    Chan(mpsc::Receiver<crate::Result<Bytes>>),
    Stream(BoxChunkStream),
}

impl Payload {
    /// A payload that completes without emitting any chunk.
    pub fn empty() -> Self {
        Self::new(Kind::Empty)
    }

    /// A single-shot payload with a known full size at completion.
    pub fn full(chunk: impl Into<Bytes>) -> Self {
        Self::new(Kind::Full(chunk.into()))
    }

    /// A payload backed by an arbitrary chunk stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = crate::Result<Bytes>> + Send + 'static,
    {
        Self::new(Kind::Stream(Box::pin(stream)))
    }

    /// A payload fed chunk by chunk through a [`PayloadSender`].
    ///
    /// The channel buffers a single chunk: the sender is ready for the next
    /// one only after the subscriber took the previous, which is what gives
    /// the connection tasks their per-chunk backpressure.
    pub(crate) fn channel() -> (PayloadSender, Self) {
        let (data_tx, data_rx) = mpsc::channel(0);
        (PayloadSender { data_tx }, Self::new(Kind::Chan(data_rx)))
    }

    fn new(kind: Kind) -> Self {
        Self {
            kind: Some(kind),
            transform: None,
        }
    }

    /// The exact byte size, when the payload is single-shot.
    ///
    /// `Some` only for [`Payload::empty`] and [`Payload::full`]; used to
    /// compute `Content-Length` when the caller did not provide one.
    #[must_use]
    pub fn exact_size(&self) -> Option<u64> {
        match self.kind {
            Some(Kind::Empty) => Some(0),
            Some(Kind::Full(ref chunk)) => Some(chunk.len() as u64),
            _ => None,
        }
    }

    /// Whether the payload is known to emit no chunk at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Some(Kind::Empty)) || matches!(self.kind, Some(Kind::Full(ref c)) if c.is_empty())
    }

    /// Whether the payload has already been subscribed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.kind.is_none()
    }

    /// Compose a transformation over the chunk stream.
    ///
    /// Applying `transform(g)` after `transform(f)` yields `g ∘ f`. Legal
    /// only before subscription.
    pub fn transform<F>(&mut self, f: F) -> crate::Result<&mut Self>
    where
        F: FnOnce(PayloadStream) -> PayloadStream + Send + 'static,
    {
        if self.kind.is_none() {
            return Err(crate::Error::new_illegal_state());
        }
        self.transform = Some(match self.transform.take() {
            None => Box::new(f),
            Some(prev) => Box::new(move |stream| f(prev(stream))),
        });
        Ok(self)
    }

    /// Subscribe, turning the payload into its chunk stream.
    ///
    /// Fails with an illegal-state error on any subscription after the
    /// first.
    pub fn subscribe(&mut self) -> crate::Result<PayloadStream> {
        let kind = self.kind.take().ok_or_else(crate::Error::new_illegal_state)?;
        let stream = PayloadStream { kind };
        Ok(match self.transform.take() {
            None => stream,
            Some(f) => f(stream),
        })
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.kind {
            None => "subscribed",
            Some(Kind::Empty) => "empty",
            Some(Kind::Full(_)) => "full",
            Some(Kind::Chan(_)) => "channel",
            Some(Kind::Stream(_)) => "stream",
        };
        f.debug_tuple("Payload").field(&state).finish()
    }
}

/// The subscribed half of a [`Payload`].
#[must_use = "streams do nothing unless polled"]
pub struct PayloadStream {
    kind: Kind,
}

impl PayloadStream {
    /// Wrap an arbitrary chunk stream, e.g. inside a transform.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = crate::Result<Bytes>> + Send + 'static,
    {
        Self {
            kind: Kind::Stream(Box::pin(stream)),
        }
    }

    /// Collect all remaining chunks into one contiguous buffer.
    pub async fn aggregate(mut self) -> crate::Result<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.into())
    }
}

impl Stream for PayloadStream {
    type Item = crate::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(ref mut chunk) => {
                if chunk.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(std::mem::take(chunk))))
                }
            }
            Kind::Chan(ref mut rx) => Poll::Ready(ready!(rx.poll_next_unpin(cx))),
            Kind::Stream(ref mut stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadStream").finish_non_exhaustive()
    }
}

/// Producer half of [`Payload::channel`], held by connection tasks to feed
/// response bodies.
pub(crate) struct PayloadSender {
    data_tx: mpsc::Sender<crate::Result<Bytes>>,
}

impl PayloadSender {
    /// Ready once the subscriber wants the next chunk.
    ///
    /// Errors when the subscription was cancelled, which a connection task
    /// treats as a reset request.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        self.data_tx
            .poll_ready(cx)
            .map_err(|_| crate::Error::new_closed())
    }

    pub(crate) fn try_send_chunk(&mut self, chunk: Bytes) -> crate::Result<()> {
        self.data_tx
            .try_send(Ok(chunk))
            .map_err(|_| crate::Error::new_closed())
    }

    /// Terminate the subscriber with an error, even when the buffer is full.
    pub(crate) fn send_error(&mut self, err: crate::Error) {
        let _ = self.data_tx.clone().try_send(Err(err));
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.data_tx.is_closed()
    }
}

impl fmt::Debug for PayloadSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn empty_completes_without_chunks() {
        let mut payload = Payload::empty();
        assert_eq!(payload.exact_size(), Some(0));
        let mut stream = payload.subscribe().unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn full_emits_single_chunk() {
        let mut payload = Payload::full("hello");
        assert_eq!(payload.exact_size(), Some(5));
        let body = payload.subscribe().unwrap().aggregate().await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[test]
    fn second_subscribe_is_illegal() {
        let mut payload = Payload::full("x");
        let _ = payload.subscribe().unwrap();
        let err = payload.subscribe().unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn transform_after_subscribe_is_illegal() {
        let mut payload = Payload::empty();
        let _ = payload.subscribe().unwrap();
        let err = payload.transform(|s| s).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[tokio::test]
    async fn transforms_compose_in_order() {
        let mut payload = Payload::full("a");
        payload
            .transform(|s| {
                PayloadStream::from_stream(s.map(|c| c.map(|c| {
                    let mut v = c.to_vec();
                    v.push(b'f');
                    Bytes::from(v)
                })))
            })
            .unwrap();
        payload
            .transform(|s| {
                PayloadStream::from_stream(s.map(|c| c.map(|c| {
                    let mut v = c.to_vec();
                    v.push(b'g');
                    Bytes::from(v)
                })))
            })
            .unwrap();
        let body = payload.subscribe().unwrap().aggregate().await.unwrap();
        // g ∘ f: f appends first, then g.
        assert_eq!(&body[..], b"afg");
    }

    #[tokio::test]
    async fn channel_buffers_one_chunk() {
        let (mut tx, mut payload) = Payload::channel();
        let mut stream = payload.subscribe().unwrap();

        // One chunk may always be parked.
        assert!(
            std::future::poll_fn(|cx| tx.poll_ready(cx)).await.is_ok(),
            "first slot available"
        );
        tx.try_send_chunk(Bytes::from_static(b"one")).unwrap();

        // The second needs the subscriber to take the first.
        let mut ready = tokio_test::task::spawn(std::future::poll_fn(|cx| tx.poll_ready(cx)));
        assert!(ready.poll().is_pending(), "no slot before the subscriber drains");

        let mut next = tokio_test::task::spawn(stream.next());
        match next.poll() {
            std::task::Poll::Ready(Some(Ok(chunk))) => assert_eq!(&chunk[..], b"one"),
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert!(ready.is_woken(), "subscriber demand wakes producer");
        assert!(ready.poll().is_ready());
    }

    #[tokio::test]
    async fn dropped_subscriber_cancels_sender() {
        let (mut tx, mut payload) = Payload::channel();
        let stream = payload.subscribe().unwrap();
        drop(stream);
        assert!(tx.is_canceled());
        let err = std::future::poll_fn(|cx| tx.poll_ready(cx)).await.unwrap_err();
        assert!(err.is_closed());
    }
}
