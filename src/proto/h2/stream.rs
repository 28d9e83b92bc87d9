//! Per-stream state for the HTTP/2 connection.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use super::flow::FlowControl;
use crate::payload::{PayloadSender, PayloadStream};
use crate::proto::ExchangeGuard;
use crate::response::Response;

/// Request-direction progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendState {
    /// HEADERS written; DATA frames may still follow.
    Streaming,
    /// END_STREAM sent; half-closed (local).
    Done,
}

/// Response-direction progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    AwaitingHeaders,
    Body,
    Done,
}

/// One client-initiated stream, created lazily at the HEADERS write site.
pub(crate) struct H2Stream {
    pub(crate) send: SendState,
    pub(crate) recv: RecvState,
    pub(crate) send_flow: FlowControl,
    /// Chunk currently being carved into DATA frames.
    pub(crate) pending: Option<Bytes>,
    /// The request body; `None` once the end of stream was decided.
    pub(crate) body: Option<PayloadStream>,
    pub(crate) respond: Option<oneshot::Sender<crate::Result<Response>>>,
    /// Producer half of the response payload once headers were emitted.
    pub(crate) sender: Option<PayloadSender>,
    /// DATA received but not yet wanted by the subscriber. Bounded by the
    /// stream window this client advertised.
    pub(crate) recv_buf: VecDeque<Bytes>,
    /// END_STREAM received; the buffer may still hold chunks.
    pub(crate) recv_eos: bool,
    pub(crate) trailers: Option<oneshot::Sender<HeaderMap>>,
    pub(crate) pending_trailers: Option<HeaderMap>,
    pub(crate) deadline: Option<Pin<Box<Sleep>>>,
    pub(crate) _guard: ExchangeGuard,
}

impl H2Stream {
    pub(crate) fn is_closed(&self) -> bool {
        self.send == SendState::Done && self.recv == RecvState::Done
    }

    /// Route a terminal error to whoever is still listening.
    pub(crate) fn fail(&mut self, err: crate::Error) {
        if let Some(respond) = self.respond.take() {
            let _ = respond.send(Err(err));
        } else if let Some(mut sender) = self.sender.take() {
            sender.send_error(err);
        }
        self.recv_buf.clear();
        self.body = None;
        self.pending = None;
        self.send = SendState::Done;
        self.recv = RecvState::Done;
    }

    /// Whether the write side has (or may produce) something to send.
    pub(crate) fn wants_send(&self) -> bool {
        self.send == SendState::Streaming && (self.pending.is_some() || self.body.is_some())
    }
}
