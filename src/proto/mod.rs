//! Connection plumbing shared by the protocol state machines.
//!
//! A connection is one spawned task owning the transport; exchanges talk to
//! it through a bounded dispatch channel and receive their response through
//! a oneshot promise. The pool observes the connection through the shared
//! [`ConnShared`] record (state, capacity, load, idle time) and an event
//! channel fed by per-exchange guards.

pub(crate) mod h1;
pub(crate) mod h2;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::collab::{TlsState, TransportIo};
use crate::config::HttpVersion;
use crate::payload::Payload;
use crate::request::SentRequest;
use crate::response::Response;

/// One exchange handed to a connection task.
pub(crate) struct Dispatch {
    pub(crate) req: Arc<SentRequest>,
    pub(crate) payload: Payload,
    pub(crate) respond: oneshot::Sender<crate::Result<Response>>,
    /// Present when the exchange expects a 101 upgrade; on success the
    /// detached transport is handed back here instead of a body.
    pub(crate) upgrade: Option<oneshot::Sender<Upgraded>>,
    /// Per-exchange deadline, armed at send, disarmed at response headers.
    pub(crate) timeout: Option<Duration>,
    /// Load unit taken at acquire time, held until the exchange completes.
    pub(crate) guard: ExchangeGuard,
}

/// Pool-to-connection lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnControl {
    /// Stop admitting exchanges, finish what is in flight, then close.
    Drain,
    /// Close now; in-flight exchanges fail with a shutdown cause.
    Close,
}

/// Connection lifecycle, as observed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnState {
    Opening = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

/// Events a connection reports to its pool.
pub(crate) enum PoolEvent {
    /// An exchange finished; load dropped by one.
    Released(u64),
    /// The connection reached `Closed`.
    Closed(u64),
}

pub(crate) type PoolEvents = mpsc::UnboundedSender<PoolEvent>;

/// State shared between a connection task, its handles and the pool.
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) protocol: HttpVersion,
    pub(crate) tls: Option<TlsState>,
    state: AtomicU8,
    /// Max concurrent streams; h2 updates this from peer SETTINGS.
    capacity: AtomicUsize,
    load: AtomicUsize,
    /// Cleared when the connection must not be handed out again.
    reusable: AtomicBool,
    /// Set when a WebSocket upgrade removed the connection from the pool.
    detached: AtomicBool,
    /// Millis since pool epoch of the moment load last reached zero.
    idle_since_ms: AtomicU64,
    events: PoolEvents,
}

impl ConnShared {
    pub(crate) fn new(
        id: u64,
        protocol: HttpVersion,
        tls: Option<TlsState>,
        capacity: usize,
        events: PoolEvents,
    ) -> Self {
        Self {
            id,
            protocol,
            tls,
            state: AtomicU8::new(ConnState::Opening as u8),
            capacity: AtomicUsize::new(capacity),
            load: AtomicUsize::new(0),
            reusable: AtomicBool::new(true),
            detached: AtomicBool::new(false),
            idle_since_ms: AtomicU64::new(crate::endpoint::pool::now_ms()),
            events,
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Opening,
            1 => ConnState::Active,
            2 => ConnState::Draining,
            _ => ConnState::Closed,
        }
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
        if state == ConnState::Closed {
            let _ = self.events.send(PoolEvent::Closed(self.id));
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    pub(crate) fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub(crate) fn has_slot(&self) -> bool {
        self.state() == ConnState::Active && self.load() < self.capacity()
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_not_reusable(&self) {
        self.reusable.store(false, Ordering::Release);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn idle_since_ms(&self) -> u64 {
        self.idle_since_ms.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> ExchangeGuard {
        self.load.fetch_add(1, Ordering::AcqRel);
        ExchangeGuard {
            shared: self.clone(),
        }
    }

    fn release(&self, now_ms: u64) {
        if self.load.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_since_ms.store(now_ms, Ordering::Release);
        }
        let _ = self.events.send(PoolEvent::Released(self.id));
    }
}

/// Holds one unit of connection load; releasing happens on drop so every
/// completion path (response, error, cancel) gives the slot back.
pub(crate) struct ExchangeGuard {
    shared: Arc<ConnShared>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.shared.release(crate::endpoint::pool::now_ms());
    }
}

/// Handle to a live connection: the dispatch channel, the lifecycle signal
/// channel and the shared record.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    pub(crate) tx: mpsc::Sender<Dispatch>,
    pub(crate) control: mpsc::UnboundedSender<ConnControl>,
    pub(crate) shared: Arc<ConnShared>,
}

impl ConnHandle {
    /// Queue an exchange on this connection.
    pub(crate) async fn dispatch(&self, dispatch: Dispatch) -> crate::Result<()> {
        self.tx
            .send(dispatch)
            .await
            .map_err(|_| crate::Error::new_closed())
    }

    pub(crate) fn drain(&self) {
        let _ = self.control.send(ConnControl::Drain);
    }

    pub(crate) fn close(&self) {
        let _ = self.control.send(ConnControl::Close);
    }
}

/// A transport detached from its connection after a 101 upgrade, with any
/// bytes the decoder had already buffered stitched back in front.
pub struct Upgraded {
    io: Box<dyn TransportIo>,
    read_buf: Bytes,
}

impl Upgraded {
    pub(crate) fn new(io: Box<dyn TransportIo>, read_buf: Bytes) -> Self {
        Self { io, read_buf }
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = std::cmp::min(self.read_buf.len(), buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded").finish_non_exhaustive()
    }
}
