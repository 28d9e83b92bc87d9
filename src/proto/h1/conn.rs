//! HTTP/1.1 connection state machine.
//!
//! One task owns the transport. Requests are admitted from the dispatch
//! channel up to the pipelining ceiling, written strictly in order, and
//! responses are matched back to the in-flight queue in FIFO order. The
//! task is a hand-written poll loop: timers, read progress, write progress
//! (which includes intake), flush, until nothing moves.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_core::Stream;
use http::{HeaderMap, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, trace, warn};

use super::decode::{BodyDecoder, Decoded, HeadOutcome, ParsedHead, parse_head};
use super::encode::{BodyFraming, decide_framing, encode_chunk, encode_head, encode_terminal};
use crate::collab::TransportIo;
use crate::config::EndpointConfig;
use crate::payload::{Payload, PayloadSender, PayloadStream};
use crate::proto::{
    ConnControl, ConnHandle, ConnShared, ConnState, Dispatch, ExchangeGuard, Upgraded,
};
use crate::response::Response;

const READ_CHUNK: usize = 8 * 1024;

/// Spawn the connection task; the returned handle is what the pool stores.
pub(crate) fn spawn(
    io: Box<dyn TransportIo>,
    shared: Arc<ConnShared>,
    config: Arc<EndpointConfig>,
    authority: String,
) -> ConnHandle {
    let capacity = config.http1_max_concurrent_requests.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    shared.set_state(ConnState::Active);
    let conn = H1Conn {
        io: Some(io),
        shared: shared.clone(),
        config,
        authority,
        rx,
        control: control_rx,
        read_buf: BytesMut::with_capacity(READ_CHUNK),
        write_buf: BytesMut::new(),
        reading: Reading::Head,
        writing: Writing::Idle,
        in_flight: VecDeque::new(),
        max_in_flight: capacity,
        next_seq: 0,
        read_eof: false,
    };
    tokio::spawn(conn);
    ConnHandle {
        tx,
        control: control_tx,
        shared,
    }
}

struct InFlight {
    seq: u64,
    method: Method,
    respond: Option<oneshot::Sender<crate::Result<Response>>>,
    upgrade: Option<oneshot::Sender<Upgraded>>,
    deadline: Option<Pin<Box<Sleep>>>,
    expect: bool,
    guard: ExchangeGuard,
}

enum Reading {
    Head,
    Body {
        decoder: BodyDecoder,
        sender: PayloadSender,
        trailers: Option<oneshot::Sender<HeaderMap>>,
        keep_alive: bool,
        _guard: ExchangeGuard,
    },
}

enum Writing {
    Idle,
    Body {
        seq: u64,
        stream: PayloadStream,
        framing: BodyFraming,
        remaining: Option<u64>,
    },
    /// Head written with `Expect: 100-continue`; body held until the
    /// interim response arrives.
    WaitContinue {
        seq: u64,
        stream: PayloadStream,
        framing: BodyFraming,
    },
}

struct H1Conn {
    io: Option<Box<dyn TransportIo>>,
    shared: Arc<ConnShared>,
    config: Arc<EndpointConfig>,
    authority: String,
    rx: mpsc::Receiver<Dispatch>,
    control: mpsc::UnboundedReceiver<ConnControl>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    reading: Reading,
    writing: Writing,
    in_flight: VecDeque<InFlight>,
    max_in_flight: usize,
    next_seq: u64,
    read_eof: bool,
}

enum Step {
    Progress,
    Blocked,
    Done,
}

impl Future for H1Conn {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.control.poll_recv(cx) {
                Poll::Ready(Some(ConnControl::Drain)) => {
                    trace!("h1 connection draining");
                    this.shared.set_state(ConnState::Draining);
                }
                Poll::Ready(Some(ConnControl::Close)) | Poll::Ready(None) => {
                    this.teardown(crate::Error::new_shutdown(), crate::Error::new_shutdown);
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            let mut progress = false;
            let steps: [fn(&mut Self, &mut Context<'_>) -> crate::Result<Step>; 4] = [
                Self::step_timers,
                Self::step_read,
                Self::step_write,
                Self::step_flush,
            ];
            for step_fn in steps {
                match step_fn(this, cx) {
                    Ok(Step::Progress) => progress = true,
                    Ok(Step::Blocked) => {}
                    Ok(Step::Done) => return Poll::Ready(()),
                    Err(err) => {
                        this.teardown(err, crate::Error::new_connection_reset);
                        return Poll::Ready(());
                    }
                }
            }

            if this.is_drained() {
                trace!("h1 connection drained, closing");
                this.close_gracefully();
                return Poll::Ready(());
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}

impl H1Conn {
    fn is_drained(&self) -> bool {
        let quiet = self.in_flight.is_empty()
            && matches!(self.reading, Reading::Head)
            && matches!(self.writing, Writing::Idle)
            && self.write_buf.is_empty();
        if !quiet {
            return false;
        }
        self.shared.state() == ConnState::Draining || self.read_eof || !self.shared.is_reusable()
    }

    /// Per-exchange deadlines and caller-side cancellation.
    fn step_timers(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        for entry in &mut self.in_flight {
            if let Some(ref mut deadline) = entry.deadline
                && deadline.as_mut().poll(cx).is_ready()
            {
                warn!(seq = entry.seq, "h1 exchange timed out");
                if let Some(respond) = entry.respond.take() {
                    let _ = respond.send(Err(crate::Error::new_request_timeout()));
                }
                // HTTP/1.1 has no per-stream reset: the connection goes.
                return Err(crate::Error::new_canceled());
            }
            if let Some(ref mut respond) = entry.respond
                && respond.poll_closed(cx).is_ready()
            {
                trace!(seq = entry.seq, "h1 exchange canceled by caller");
                entry.respond = None;
                return Err(crate::Error::new_canceled());
            }
        }
        if let Reading::Body { ref mut sender, .. } = self.reading
            && sender.is_canceled()
        {
            trace!("h1 response body subscription canceled");
            return Err(crate::Error::new_canceled());
        }
        Ok(Step::Blocked)
    }

    fn step_read(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let mut progress = false;
        loop {
            let filled = match self.poll_fill_read_buf(cx)? {
                Poll::Ready(n) => n > 0,
                Poll::Pending => false,
            };
            let step = match self.reading {
                Reading::Head => self.step_read_head()?,
                Reading::Body { .. } => self.step_read_body(cx)?,
            };
            match step {
                Step::Progress => progress = true,
                Step::Done => return Ok(Step::Done),
                Step::Blocked => {
                    if filled {
                        // Bytes arrived but not enough yet; try to read more.
                        continue;
                    }
                    if self.read_eof && matches!(self.reading, Reading::Head) {
                        return self.on_read_eof();
                    }
                    return Ok(if progress { Step::Progress } else { Step::Blocked });
                }
            }
        }
    }

    fn on_read_eof(&mut self) -> crate::Result<Step> {
        if self.in_flight.is_empty()
            && matches!(self.writing, Writing::Idle)
            && self.read_buf.is_empty()
        {
            // Peer closed an idle connection; nothing was lost.
            trace!("h1 peer closed idle connection");
            self.close_gracefully();
            return Ok(Step::Done);
        }
        Err(crate::Error::new_incomplete())
    }

    fn step_read_head(&mut self) -> crate::Result<Step> {
        if self.read_buf.is_empty() {
            return Ok(Step::Blocked);
        }
        let Some(front) = self.in_flight.front() else {
            // Bytes without an outstanding request.
            debug!("h1 received unexpected bytes while idle");
            return Err(crate::Error::new_connection_reset());
        };
        let method = front.method.clone();
        match parse_head(&mut self.read_buf, &method)? {
            HeadOutcome::Partial => Ok(Step::Blocked),
            HeadOutcome::Informational(status) => {
                if status.as_u16() == 100 {
                    self.on_continue();
                } else {
                    trace!("h1 discarding {status}");
                }
                Ok(Step::Progress)
            }
            HeadOutcome::Head(head) => self.on_head(head),
        }
    }

    fn on_continue(&mut self) {
        let expecting = self
            .in_flight
            .front()
            .is_some_and(|front| front.expect)
            && matches!(self.writing, Writing::WaitContinue { .. });
        if !expecting {
            trace!("h1 discarding unexpected 100 continue");
            return;
        }
        if let Some(front) = self.in_flight.front_mut() {
            front.expect = false;
        }
        if let Writing::WaitContinue { seq, stream, framing } =
            std::mem::replace(&mut self.writing, Writing::Idle)
        {
            trace!(seq, "h1 100 continue, streaming body");
            let remaining = match framing {
                BodyFraming::Length(len) => Some(len),
                _ => None,
            };
            self.writing = Writing::Body {
                seq,
                stream,
                framing,
                remaining,
            };
        }
    }

    fn on_head(&mut self, head: ParsedHead) -> crate::Result<Step> {
        let Some(mut entry) = self.in_flight.pop_front() else {
            return Err(crate::Error::new_connection_reset());
        };
        trace!(seq = entry.seq, status = %head.status, version = ?head.version, "h1 response head");
        // Response headers received: disarm the request timer.
        entry.deadline = None;

        if entry.expect {
            // Final status while the body is still held back. The promised
            // body will never be sent, so the connection cannot be reused.
            self.shared.mark_not_reusable();
            self.writing = Writing::Idle;
            if head.status == StatusCode::EXPECTATION_FAILED {
                debug!("h1 expectation rejected");
                if let Some(respond) = entry.respond.take() {
                    let _ = respond.send(Err(crate::Error::new_expectation_failed()));
                }
                return Err(crate::Error::new_canceled());
            }
            trace!("h1 final status before body, abandoning request body");
        }

        if head.wants_upgrade {
            return self.on_upgrade(entry, head);
        }

        if !head.keep_alive {
            self.shared.mark_not_reusable();
        }

        let decoder = BodyDecoder::new(head.decode);
        if decoder.is_close_delimited() {
            self.shared.mark_not_reusable();
        }

        if matches!(decoder, BodyDecoder::Done) {
            let response = Response::new(head.status, head.headers, Payload::empty(), None);
            if let Some(respond) = entry.respond.take() {
                let _ = respond.send(Ok(response));
            }
            if !self.shared.is_reusable() && !self.in_flight.is_empty() {
                // Pipelined exchanges behind a closing response cannot be
                // answered on this connection anymore.
                return Err(crate::Error::new_connection_reset());
            }
            return Ok(Step::Progress);
        }

        let (sender, payload) = Payload::channel();
        let (trailers_tx, trailers_rx) = oneshot::channel();
        let response = Response::new(head.status, head.headers, payload, Some(trailers_rx));
        if let Some(respond) = entry.respond.take()
            && respond.send(Ok(response)).is_err()
        {
            // Caller went away between send and response: reset.
            return Err(crate::Error::new_canceled());
        }
        self.reading = Reading::Body {
            decoder,
            sender,
            trailers: Some(trailers_tx),
            keep_alive: head.keep_alive,
            _guard: entry.guard,
        };
        Ok(Step::Progress)
    }

    fn on_upgrade(&mut self, mut entry: InFlight, head: ParsedHead) -> crate::Result<Step> {
        let Some(upgrade) = entry.upgrade.take() else {
            debug!("h1 peer switched protocols without an upgrade listener");
            return Err(crate::Error::new_upgrade());
        };
        trace!("h1 connection detaching after 101");
        self.shared.mark_not_reusable();
        self.shared.mark_detached();

        let response = Response::new(head.status, head.headers, Payload::empty(), None);
        if let Some(respond) = entry.respond.take() {
            let _ = respond.send(Ok(response));
        }
        if let Some(io) = self.io.take() {
            let leftover = self.read_buf.split().freeze();
            let _ = upgrade.send(Upgraded::new(io, leftover));
        }
        self.fail_pending(crate::Error::new_connection_reset);
        self.shared.set_state(ConnState::Closed);
        Ok(Step::Done)
    }

    fn step_read_body(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let Reading::Body {
            ref mut decoder,
            ref mut sender,
            ref mut trailers,
            keep_alive,
            ..
        } = self.reading
        else {
            return Ok(Step::Blocked);
        };

        // Respect subscriber demand before decoding more.
        match sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Err(crate::Error::new_canceled()),
            Poll::Pending => return Ok(Step::Blocked),
        }

        let read_buf = &mut self.read_buf;
        match decoder.decode(read_buf, self.read_eof)? {
            Decoded::Chunk(chunk) => {
                trace!(len = chunk.len(), "h1 response body chunk");
                sender.try_send_chunk(chunk)?;
                Ok(Step::Progress)
            }
            Decoded::Trailers(map) => {
                if let Some(tx) = trailers.take() {
                    let _ = tx.send(map);
                }
                Ok(Step::Progress)
            }
            Decoded::Complete => {
                trace!("h1 response complete");
                let closing = !keep_alive || !self.shared.is_reusable();
                self.reading = Reading::Head;
                if closing {
                    self.shared.mark_not_reusable();
                    if self.in_flight.is_empty() && matches!(self.writing, Writing::Idle) {
                        self.close_gracefully();
                        return Ok(Step::Done);
                    }
                    return Err(crate::Error::new_connection_reset());
                }
                Ok(Step::Progress)
            }
            Decoded::NeedMore => Ok(Step::Blocked),
        }
    }

    fn step_write(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        if !self.write_buf.is_empty() {
            return self.poll_write_buf(cx);
        }
        match std::mem::replace(&mut self.writing, Writing::Idle) {
            Writing::Idle => self.step_intake(cx),
            waiting @ Writing::WaitContinue { .. } => {
                self.writing = waiting;
                Ok(Step::Blocked)
            }
            Writing::Body {
                seq,
                mut stream,
                framing,
                mut remaining,
            } => {
                // The previous chunk's write fully completed (the buffer is
                // empty), so ask the payload for the next one.
                match Pin::new(&mut stream).poll_next(cx) {
                    Poll::Pending => {
                        self.writing = Writing::Body {
                            seq,
                            stream,
                            framing,
                            remaining,
                        };
                        Ok(Step::Blocked)
                    }
                    Poll::Ready(Some(Ok(chunk))) => {
                        if let Some(ref mut left) = remaining {
                            if (chunk.len() as u64) > *left {
                                return Err(crate::Error::new_user_body(std::io::Error::other(
                                    "request body exceeds content-length",
                                )));
                            }
                            *left -= chunk.len() as u64;
                        }
                        trace!(seq, len = chunk.len(), "h1 request body chunk");
                        encode_chunk(&mut self.write_buf, framing, &chunk);
                        self.writing = Writing::Body {
                            seq,
                            stream,
                            framing,
                            remaining,
                        };
                        self.poll_write_buf(cx)?;
                        Ok(Step::Progress)
                    }
                    Poll::Ready(Some(Err(err))) => Err(crate::Error::new_user_body(err)),
                    Poll::Ready(None) => {
                        if remaining.is_some_and(|left| left > 0) {
                            return Err(crate::Error::new_user_body(std::io::Error::other(
                                "request body ended before content-length",
                            )));
                        }
                        trace!(seq, "h1 request body complete");
                        encode_terminal(&mut self.write_buf, framing);
                        Ok(Step::Progress)
                    }
                }
            }
        }
    }

    fn step_intake(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        if self.shared.state() != ConnState::Active
            || !self.shared.is_reusable()
            || self.in_flight.len() >= self.max_in_flight
        {
            return Ok(Step::Blocked);
        }
        let dispatch = match self.rx.poll_recv(cx) {
            Poll::Ready(Some(dispatch)) => dispatch,
            Poll::Ready(None) | Poll::Pending => return Ok(Step::Blocked),
        };
        let Dispatch {
            req,
            mut payload,
            respond,
            upgrade,
            timeout,
            guard,
        } = dispatch;

        if respond.is_closed() {
            // Canceled while queued; nothing was sent yet.
            trace!("h1 dropping canceled dispatch");
            drop(guard);
            return Ok(Step::Progress);
        }

        let framing = match decide_framing(&req.headers, &payload) {
            Ok(framing) => framing,
            Err(err) => {
                let _ = respond.send(Err(err));
                return Ok(Step::Progress);
            }
        };
        let authority = req
            .authority
            .clone()
            .unwrap_or_else(|| self.authority.clone());
        encode_head(&mut self.write_buf, &req, &authority, framing, &self.config);

        let expect = req
            .headers
            .get(header::EXPECT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

        let seq = self.next_seq;
        self.next_seq += 1;

        // The connection is the payload's one subscriber.
        let stream = match payload.subscribe() {
            Ok(stream) => stream,
            Err(err) => {
                // The head is already buffered; the connection would desync.
                let _ = respond.send(Err(err));
                return Err(crate::Error::new_canceled());
            }
        };

        self.writing = if expect {
            Writing::WaitContinue { seq, stream, framing }
        } else if framing == BodyFraming::Empty {
            Writing::Idle
        } else {
            let remaining = match framing {
                BodyFraming::Length(len) => Some(len),
                _ => None,
            };
            Writing::Body {
                seq,
                stream,
                framing,
                remaining,
            }
        };

        trace!(seq, method = %req.method, target = %req.target, "h1 request head queued");
        self.in_flight.push_back(InFlight {
            seq,
            method: req.method.clone(),
            respond: Some(respond),
            upgrade,
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            expect,
            guard,
        });
        Ok(Step::Progress)
    }

    fn poll_write_buf(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let Some(io) = self.io.as_mut() else {
            return Ok(Step::Blocked);
        };
        let mut wrote = false;
        while !self.write_buf.is_empty() {
            match Pin::new(&mut *io).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Err(crate::Error::new_io(std::io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                    wrote = true;
                }
                Poll::Ready(Err(err)) => return Err(crate::Error::new_io(err)),
                Poll::Pending => break,
            }
        }
        Ok(if wrote { Step::Progress } else { Step::Blocked })
    }

    fn step_flush(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let Some(io) = self.io.as_mut() else {
            return Ok(Step::Blocked);
        };
        match Pin::new(&mut *io).poll_flush(cx) {
            Poll::Ready(Ok(())) => Ok(Step::Blocked),
            Poll::Ready(Err(err)) => Err(crate::Error::new_io(err)),
            Poll::Pending => Ok(Step::Blocked),
        }
    }

    fn poll_fill_read_buf(&mut self, cx: &mut Context<'_>) -> crate::Result<Poll<usize>> {
        if self.read_eof {
            return Ok(Poll::Ready(0));
        }
        let Some(io) = self.io.as_mut() else {
            return Ok(Poll::Ready(0));
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut *io).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                if filled.is_empty() {
                    trace!("h1 read eof");
                    self.read_eof = true;
                    Ok(Poll::Ready(0))
                } else {
                    self.read_buf.extend_from_slice(filled);
                    Ok(Poll::Ready(filled.len()))
                }
            }
            Poll::Ready(Err(err)) => Err(crate::Error::new_io(err)),
            Poll::Pending => Ok(Poll::Pending),
        }
    }

    fn close_gracefully(&mut self) {
        self.fail_pending(crate::Error::new_connection_reset);
        self.shared.set_state(ConnState::Closed);
    }

    /// Terminal error: route `err` to the party it belongs to, everyone
    /// else still waiting hears `mk_rest`.
    fn teardown(&mut self, err: crate::Error, mk_rest: fn() -> crate::Error) {
        debug!("h1 connection closing: {err}");
        let mut err = Some(err);
        if let Reading::Body {
            ref mut sender, ..
        } = self.reading
        {
            let body_err = match err.take() {
                Some(err) if !err.is_canceled() => err,
                _ => crate::Error::new_connection_reset(),
            };
            sender.send_error(body_err);
        }
        self.reading = Reading::Head;
        if let Some(err) = err.take_if(|e| !e.is_canceled())
            && let Some(front) = self.in_flight.front_mut()
            && let Some(respond) = front.respond.take()
        {
            let _ = respond.send(Err(err));
        }
        for mut entry in self.in_flight.drain(..) {
            if let Some(respond) = entry.respond.take() {
                let _ = respond.send(Err(mk_rest()));
            }
        }
        self.fail_pending(mk_rest);
        self.shared.mark_not_reusable();
        self.shared.set_state(ConnState::Closed);
    }

    /// Fail exchanges still queued in the dispatch channel.
    fn fail_pending(&mut self, mk: fn() -> crate::Error) {
        for mut entry in self.in_flight.drain(..) {
            if let Some(respond) = entry.respond.take() {
                let _ = respond.send(Err(mk()));
            }
        }
        self.rx.close();
        while let Ok(dispatch) = self.rx.try_recv() {
            let _ = dispatch.respond.send(Err(mk()));
        }
    }
}
