//! HTTP/2 connection state machine.
//!
//! One task owns the transport and multiplexes client streams over it.
//! Stream objects are created lazily at the moment their HEADERS frame is
//! written, which is what guarantees strictly increasing stream ids across
//! concurrent exchanges. DATA writes are serialized per chunk and capped by
//! the connection and stream send windows; the next chunk is only requested
//! from the request payload after the previous write completed.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use futures_core::Stream;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::flow::FlowControl;
use super::frame::{self, Frame, StreamId};
use super::stream::{H2Stream, RecvState, SendState};
use crate::collab::TransportIo;
use crate::config::EndpointConfig;
use crate::error::Reason;
use crate::payload::Payload;
use crate::proto::{ConnControl, ConnHandle, ConnShared, ConnState, Dispatch};
use crate::response::Response;

const READ_CHUNK: usize = 16 * 1024;

/// Concurrency assumed before the peer's SETTINGS frame arrives.
const DEFAULT_PEER_MAX_CONCURRENT_STREAMS: u32 = 100;
const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Spawn the connection task; the returned handle is what the pool stores.
pub(crate) fn spawn(
    io: Box<dyn TransportIo>,
    shared: Arc<ConnShared>,
    config: Arc<EndpointConfig>,
    authority: String,
) -> ConnHandle {
    let (tx, rx) = mpsc::channel(64);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    shared.set_capacity(DEFAULT_PEER_MAX_CONCURRENT_STREAMS as usize);
    shared.set_state(ConnState::Active);

    let mut write_buf = BytesMut::with_capacity(READ_CHUNK);
    write_buf.extend_from_slice(frame::PREFACE);
    let mut settings = vec![
        (frame::SETTINGS_HEADER_TABLE_SIZE, config.http2_header_table_size),
        (frame::SETTINGS_ENABLE_PUSH, 0),
        (
            frame::SETTINGS_MAX_CONCURRENT_STREAMS,
            config.http2_max_concurrent_streams,
        ),
        (
            frame::SETTINGS_INITIAL_WINDOW_SIZE,
            config.http2_initial_window_size,
        ),
        (frame::SETTINGS_MAX_FRAME_SIZE, config.http2_max_frame_size),
    ];
    if let Some(max) = config.http2_max_header_list_size {
        settings.push((frame::SETTINGS_MAX_HEADER_LIST_SIZE, max));
    }
    frame::encode_settings(&mut write_buf, &settings);

    let scheme = if shared.tls.is_some() { "https" } else { "http" };
    let conn = H2Conn {
        io: Some(io),
        shared: shared.clone(),
        config,
        authority,
        scheme,
        rx,
        control: control_rx,
        read_buf: BytesMut::with_capacity(READ_CHUNK),
        write_buf,
        hpack_enc: hpack::Encoder::new(),
        hpack_dec: hpack::Decoder::new(),
        next_stream_id: 1,
        streams: FnvHashMap::default(),
        conn_send_flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
        peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
        peer_max_frame: DEFAULT_MAX_FRAME_SIZE,
        peer_max_concurrent: DEFAULT_PEER_MAX_CONCURRENT_STREAMS,
        goaway_last_id: None,
        continuation: None,
        read_eof: false,
    };
    tokio::spawn(conn);
    ConnHandle {
        tx,
        control: control_tx,
        shared,
    }
}

struct PartialHeaders {
    stream_id: StreamId,
    fragments: BytesMut,
    end_stream: bool,
}

struct H2Conn {
    io: Option<Box<dyn TransportIo>>,
    shared: Arc<ConnShared>,
    config: Arc<EndpointConfig>,
    authority: String,
    scheme: &'static str,
    rx: mpsc::Receiver<Dispatch>,
    control: mpsc::UnboundedReceiver<ConnControl>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    hpack_enc: hpack::Encoder<'static>,
    hpack_dec: hpack::Decoder<'static>,
    next_stream_id: u32,
    streams: FnvHashMap<u32, H2Stream>,
    conn_send_flow: FlowControl,
    peer_initial_window: u32,
    peer_max_frame: u32,
    peer_max_concurrent: u32,
    /// `Some` once GOAWAY was received; streams above it are dead.
    goaway_last_id: Option<StreamId>,
    continuation: Option<PartialHeaders>,
    read_eof: bool,
}

enum Step {
    Progress,
    Blocked,
    Done,
}

impl Future for H2Conn {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.control.poll_recv(cx) {
                Poll::Ready(Some(ConnControl::Drain)) => {
                    trace!("h2 connection draining");
                    this.shared.set_state(ConnState::Draining);
                }
                Poll::Ready(Some(ConnControl::Close)) | Poll::Ready(None) => {
                    this.teardown(crate::Error::new_shutdown);
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            let mut progress = false;
            let steps: [fn(&mut Self, &mut Context<'_>) -> crate::Result<Step>; 5] = [
                Self::step_timers,
                Self::step_read,
                Self::step_deliver,
                Self::step_send,
                Self::step_flush,
            ];
            for step_fn in steps {
                match step_fn(this, cx) {
                    Ok(Step::Progress) => progress = true,
                    Ok(Step::Blocked) => {}
                    Ok(Step::Done) => return Poll::Ready(()),
                    Err(err) => {
                        this.teardown_with(err);
                        return Poll::Ready(());
                    }
                }
            }

            this.reap_closed();

            if this.is_drained() {
                trace!("h2 connection drained, closing");
                this.say_goodbye(cx);
                return Poll::Ready(());
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}

impl H2Conn {
    fn is_drained(&self) -> bool {
        self.streams.is_empty()
            && (self.shared.state() == ConnState::Draining
                || self.goaway_last_id.is_some()
                || self.read_eof)
    }

    /// Best-effort GOAWAY + flush before a graceful close.
    fn say_goodbye(&mut self, cx: &mut Context<'_>) {
        frame::encode_goaway(
            &mut self.write_buf,
            StreamId::CONNECTION,
            Reason::NO_ERROR,
        );
        let _ = self.poll_write_buf(cx);
        self.fail_pending(crate::Error::new_connection_reset);
        self.shared.mark_not_reusable();
        self.shared.set_state(ConnState::Closed);
    }

    fn next_id(&mut self) -> StreamId {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 2;
        id
    }

    /// Deadlines and caller-side cancellation, per stream.
    fn step_timers(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let mut actions: Vec<(u32, crate::Error)> = Vec::new();
        for (&id, stream) in &mut self.streams {
            if let Some(ref mut deadline) = stream.deadline
                && deadline.as_mut().poll(cx).is_ready()
            {
                warn!(stream = id, "h2 exchange timed out");
                actions.push((id, crate::Error::new_request_timeout()));
                continue;
            }
            if let Some(ref mut respond) = stream.respond
                && respond.poll_closed(cx).is_ready()
            {
                trace!(stream = id, "h2 exchange canceled before headers");
                stream.respond = None;
                actions.push((id, crate::Error::new_reset_stream(Reason::CANCEL)));
                continue;
            }
            if stream.sender.as_ref().is_some_and(|s| s.is_canceled()) {
                trace!(stream = id, "h2 response body subscription canceled");
                actions.push((id, crate::Error::new_reset_stream(Reason::CANCEL)));
            }
        }
        let progressed = !actions.is_empty();
        for (id, err) in actions {
            self.reset_stream(StreamId(id), Reason::CANCEL, err);
        }
        Ok(if progressed { Step::Progress } else { Step::Blocked })
    }

    /// Locally reset a stream: RST_STREAM(code) on the wire, terminal error
    /// towards the exchange, buffered chunks released.
    fn reset_stream(&mut self, id: StreamId, code: Reason, err: crate::Error) {
        frame::encode_reset(&mut self.write_buf, id, code);
        if let Some(mut stream) = self.streams.remove(&id.0) {
            stream.fail(err);
        }
    }

    fn step_read(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let mut progress = false;
        loop {
            let filled = match self.poll_fill_read_buf(cx)? {
                Poll::Ready(n) => n > 0,
                Poll::Pending => false,
            };
            let mut parsed = false;
            while let Some(frame) = frame::parse(&mut self.read_buf, self.config.http2_max_frame_size)? {
                parsed = true;
                progress = true;
                self.on_frame(frame)?;
            }
            if parsed || filled {
                continue;
            }
            if self.read_eof {
                return self.on_read_eof();
            }
            return Ok(if progress { Step::Progress } else { Step::Blocked });
        }
    }

    fn on_read_eof(&mut self) -> crate::Result<Step> {
        if self.streams.is_empty() {
            trace!("h2 peer closed idle connection");
            self.fail_pending(crate::Error::new_connection_reset);
            self.shared.mark_not_reusable();
            self.shared.set_state(ConnState::Closed);
            return Ok(Step::Done);
        }
        Err(crate::Error::new_connection_reset())
    }

    fn on_frame(&mut self, frame: Frame) -> crate::Result<()> {
        // A header block in flight only tolerates its own CONTINUATIONs.
        if self.continuation.is_some()
            && !matches!(frame, Frame::Continuation { .. })
        {
            return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
        }
        match frame {
            Frame::Settings { ack, values } => {
                if !ack {
                    self.apply_settings(&values)?;
                    frame::encode_settings_ack(&mut self.write_buf);
                }
            }
            Frame::Ping { ack, payload } => {
                if !ack {
                    frame::encode_ping_ack(&mut self.write_buf, payload);
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if stream_id.is_connection() {
                    self.conn_send_flow.expand(increment)?;
                } else if let Some(stream) = self.streams.get_mut(&stream_id.0) {
                    stream.send_flow.expand(increment)?;
                }
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.on_header_block(stream_id, &fragment, end_stream)?;
                } else {
                    let mut fragments = BytesMut::with_capacity(fragment.len() * 2);
                    fragments.extend_from_slice(&fragment);
                    self.continuation = Some(PartialHeaders {
                        stream_id,
                        fragments,
                        end_stream,
                    });
                }
            }
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => {
                let Some(mut partial) = self.continuation.take() else {
                    return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
                };
                if partial.stream_id != stream_id {
                    return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
                }
                partial.fragments.extend_from_slice(&fragment);
                if end_headers {
                    let block = partial.fragments.freeze();
                    self.on_header_block(stream_id, &block, partial.end_stream)?;
                } else {
                    self.continuation = Some(partial);
                }
            }
            Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id.0) {
                    if !data.is_empty() {
                        stream.recv_buf.push_back(data);
                    }
                    if end_stream {
                        stream.recv_eos = true;
                    }
                } else {
                    trace!(stream = %stream_id, "h2 data for unknown stream dropped");
                }
            }
            Frame::Reset {
                stream_id,
                error_code,
            } => {
                debug!(stream = %stream_id, code = ?error_code, "h2 peer reset stream");
                if let Some(mut stream) = self.streams.remove(&stream_id.0) {
                    stream.fail(crate::Error::new_reset_stream(error_code));
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
            } => {
                debug!(last = %last_stream_id, code = ?error_code, "h2 goaway received");
                self.goaway_last_id = Some(last_stream_id);
                self.shared.set_state(ConnState::Draining);
                // Streams the server never processed can be retried on
                // another connection.
                let orphaned: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|&id| id > last_stream_id.0)
                    .collect();
                for id in orphaned {
                    if let Some(mut stream) = self.streams.remove(&id) {
                        stream.fail(crate::Error::new_connection_reset());
                    }
                }
            }
            Frame::PushPromise { .. } => {
                // Push is disabled in our SETTINGS.
                return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
            }
            Frame::Priority { .. } | Frame::Unknown => {}
        }
        Ok(())
    }

    fn apply_settings(&mut self, values: &[(u16, u32)]) -> crate::Result<()> {
        for &(id, value) in values {
            match id {
                frame::SETTINGS_MAX_CONCURRENT_STREAMS => {
                    trace!(value, "h2 peer max concurrent streams");
                    self.peer_max_concurrent = value;
                    self.shared.set_capacity(value as usize);
                }
                frame::SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > (1 << 31) - 1 {
                        return Err(crate::Error::new_proto(Reason::FLOW_CONTROL_ERROR));
                    }
                    let delta = i64::from(value) - i64::from(self.peer_initial_window);
                    self.peer_initial_window = value;
                    for stream in self.streams.values_mut() {
                        stream.send_flow.adjust(delta);
                    }
                }
                frame::SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=(1 << 24) - 1).contains(&value) {
                        return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
                    }
                    self.peer_max_frame = value;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn on_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
    ) -> crate::Result<()> {
        let fields = self
            .hpack_dec
            .decode(block)
            .map_err(|_| crate::Error::new_proto(Reason::COMPRESSION_ERROR))?;

        let mut status = None;
        let mut headers = HeaderMap::with_capacity(fields.len());
        for (name, value) in &fields {
            if name.first() == Some(&b':') {
                if name.as_slice() == b":status" {
                    status = std::str::from_utf8(value)
                        .ok()
                        .and_then(|v| v.parse::<u16>().ok())
                        .and_then(|v| StatusCode::from_u16(v).ok());
                }
                continue;
            }
            let name = HeaderName::from_bytes(name)
                .map_err(|_| crate::Error::new_proto(Reason::PROTOCOL_ERROR))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|_| crate::Error::new_proto(Reason::PROTOCOL_ERROR))?;
            headers.append(name, value);
        }

        let Some(stream) = self.streams.get_mut(&stream_id.0) else {
            trace!(stream = %stream_id, "h2 headers for unknown stream dropped");
            return Ok(());
        };

        match stream.recv {
            RecvState::AwaitingHeaders => {
                let Some(status) = status else {
                    return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
                };
                if status.is_informational() {
                    // Consumed and discarded; the real headers follow.
                    trace!(stream = %stream_id, "h2 discarding {status}");
                    return Ok(());
                }
                // Response headers received: disarm the request timer.
                stream.deadline = None;
                let Some(respond) = stream.respond.take() else {
                    return Ok(());
                };
                if end_stream {
                    let response = Response::new(status, headers, Payload::empty(), None);
                    stream.recv = RecvState::Done;
                    stream.recv_eos = true;
                    if respond.send(Ok(response)).is_err() {
                        self.reset_stream(
                            stream_id,
                            Reason::CANCEL,
                            crate::Error::new_reset_stream(Reason::CANCEL),
                        );
                    }
                } else {
                    let (sender, payload) = Payload::channel();
                    let (trailers_tx, trailers_rx) = oneshot::channel();
                    let response = Response::new(status, headers, payload, Some(trailers_rx));
                    stream.sender = Some(sender);
                    stream.trailers = Some(trailers_tx);
                    stream.recv = RecvState::Body;
                    if respond.send(Ok(response)).is_err() {
                        self.reset_stream(
                            stream_id,
                            Reason::CANCEL,
                            crate::Error::new_reset_stream(Reason::CANCEL),
                        );
                    }
                }
            }
            RecvState::Body => {
                // HEADERS after DATA are the trailers.
                trace!(stream = %stream_id, "h2 trailers received");
                stream.pending_trailers = Some(headers);
                stream.recv_eos = true;
            }
            RecvState::Done => {}
        }
        Ok(())
    }

    /// Move buffered response chunks into their subscribers, releasing
    /// flow-control windows as they are consumed.
    fn step_deliver(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let mut progress = false;
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            if stream.recv != RecvState::Body {
                continue;
            }
            while let Some(chunk) = stream.recv_buf.front() {
                let Some(sender) = stream.sender.as_mut() else {
                    stream.recv_buf.clear();
                    break;
                };
                match sender.poll_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        let chunk_len = chunk.len();
                        let chunk = stream
                            .recv_buf
                            .pop_front()
                            .unwrap_or_else(Bytes::new);
                        if sender.try_send_chunk(chunk).is_err() {
                            break;
                        }
                        // Consumed: hand the window back on both levels.
                        frame::encode_window_update(
                            &mut self.write_buf,
                            StreamId::CONNECTION,
                            chunk_len as u32,
                        );
                        frame::encode_window_update(
                            &mut self.write_buf,
                            StreamId(id),
                            chunk_len as u32,
                        );
                        progress = true;
                    }
                    Poll::Ready(Err(_)) | Poll::Pending => break,
                }
            }
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            if stream.recv_eos && stream.recv_buf.is_empty() && stream.recv == RecvState::Body {
                if let Some(trailers) = stream.pending_trailers.take()
                    && let Some(tx) = stream.trailers.take()
                {
                    let _ = tx.send(trailers);
                }
                // Dropping the sender completes the subscriber.
                stream.sender = None;
                stream.trailers = None;
                stream.recv = RecvState::Done;
                trace!(stream = id, "h2 response complete");
                progress = true;
                continue;
            }
            // Stay parked on the channel while the body is mid-flight so a
            // dropped subscriber wakes this task and the stream gets reset.
            let mut canceled = false;
            if stream.recv == RecvState::Body
                && let Some(sender) = stream.sender.as_mut()
                && let Poll::Ready(Err(_)) = sender.poll_ready(cx)
            {
                canceled = true;
            }
            if canceled {
                trace!(stream = id, "h2 response body subscription canceled");
                self.reset_stream(
                    StreamId(id),
                    Reason::CANCEL,
                    crate::Error::new_reset_stream(Reason::CANCEL),
                );
                progress = true;
            }
        }
        Ok(if progress { Step::Progress } else { Step::Blocked })
    }

    fn step_send(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        if !self.write_buf.is_empty() {
            return self.poll_write_buf(cx);
        }
        if let Step::Progress = self.step_intake(cx)? {
            return Ok(Step::Progress);
        }
        self.step_send_bodies(cx)
    }

    fn step_intake(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        if self.shared.state() != ConnState::Active
            || self.goaway_last_id.is_some()
            || self.streams.len() >= self.peer_max_concurrent as usize
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
            trace!("h2 dropping canceled dispatch");
            drop(guard);
            return Ok(Step::Progress);
        }
        if upgrade.is_some() {
            // WebSocket handshakes ride HTTP/1.1 only.
            let _ = respond.send(Err(crate::Error::new_unsupported_protocol()));
            return Ok(Step::Progress);
        }

        let exact_size = payload.exact_size();
        let end_stream = payload.is_empty();
        let body = match payload.subscribe() {
            Ok(stream) => stream,
            Err(err) => {
                let _ = respond.send(Err(err));
                return Ok(Step::Progress);
            }
        };

        // Lazy stream creation at the HEADERS write site keeps ids strictly
        // increasing in transmission order.
        let id = self.next_id();
        let authority = req
            .authority
            .clone()
            .unwrap_or_else(|| self.authority.clone());
        let block = self.encode_request_block(&req.method, &req.target, &authority, &req.headers, exact_size);
        frame::encode_headers(&mut self.write_buf, id, &block, end_stream, self.peer_max_frame);
        trace!(stream = %id, method = %req.method, target = %req.target, "h2 request headers written");

        self.streams.insert(
            id.0,
            H2Stream {
                send: if end_stream {
                    SendState::Done
                } else {
                    SendState::Streaming
                },
                recv: RecvState::AwaitingHeaders,
                send_flow: FlowControl::new(self.peer_initial_window),
                pending: None,
                body: if end_stream { None } else { Some(body) },
                respond: Some(respond),
                sender: None,
                recv_buf: VecDeque::new(),
                recv_eos: false,
                trailers: None,
                pending_trailers: None,
                deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
                _guard: guard,
            },
        );
        Ok(Step::Progress)
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_request_block(
        &mut self,
        method: &Method,
        target: &str,
        authority: &str,
        headers: &HeaderMap,
        exact_size: Option<u64>,
    ) -> Vec<u8> {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 6);
        fields.push((b":method".to_vec(), method.as_str().as_bytes().to_vec()));
        if *method != Method::CONNECT {
            fields.push((b":scheme".to_vec(), self.scheme.as_bytes().to_vec()));
        }
        fields.push((b":authority".to_vec(), authority.as_bytes().to_vec()));
        if *method != Method::CONNECT {
            fields.push((b":path".to_vec(), target.as_bytes().to_vec()));
        }
        if self.config.send_user_agent && !headers.contains_key(header::USER_AGENT) {
            fields.push((
                b"user-agent".to_vec(),
                self.config.user_agent.as_bytes().to_vec(),
            ));
        }
        if self.config.decompression_enabled && !headers.contains_key(header::ACCEPT_ENCODING) {
            fields.push((
                b"accept-encoding".to_vec(),
                self.config.accept_encodings().as_bytes().to_vec(),
            ));
        }
        if let Some(size) = exact_size
            && size > 0
            && !headers.contains_key(header::CONTENT_LENGTH)
        {
            let mut buf = itoa::Buffer::new();
            fields.push((b"content-length".to_vec(), buf.format(size).as_bytes().to_vec()));
        }
        for (name, value) in headers {
            // Connection-specific headers do not travel on h2.
            if matches!(
                *name,
                header::CONNECTION
                    | header::TRANSFER_ENCODING
                    | header::UPGRADE
                    | header::HOST
            ) || name.as_str() == "keep-alive"
                || name.as_str() == "proxy-connection"
            {
                continue;
            }
            fields.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        self.hpack_enc
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())))
    }

    /// Drive request bodies: for each sendable stream, carve DATA frames
    /// out of the pending chunk within the window budget, and only ask the
    /// payload for the next chunk once the previous is fully written.
    fn step_send_bodies(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        let ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.wants_send())
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let stream_id = StreamId(id);
            let conn_available = self.conn_send_flow.available();
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };

            if let Some(mut chunk) = stream.pending.take() {
                let budget = chunk
                    .len()
                    .min(conn_available)
                    .min(stream.send_flow.available())
                    .min(self.peer_max_frame as usize);
                if budget == 0 {
                    // Flow blocked; WINDOW_UPDATE will resume us.
                    stream.pending = Some(chunk);
                    continue;
                }
                let piece = chunk.split_to(budget);
                stream.send_flow.consume(piece.len());
                self.conn_send_flow.consume(piece.len());

                if !chunk.is_empty() {
                    stream.pending = Some(chunk);
                    frame::encode_data(&mut self.write_buf, stream_id, &piece, false);
                } else {
                    // Look ahead so the last chunk carries END_STREAM.
                    match stream.body.as_mut().map(|b| Pin::new(b).poll_next(cx)) {
                        Some(Poll::Ready(None)) | None => {
                            frame::encode_data(&mut self.write_buf, stream_id, &piece, true);
                            stream.send = SendState::Done;
                            stream.body = None;
                            trace!(stream = %stream_id, "h2 request body complete");
                        }
                        Some(Poll::Ready(Some(Ok(next)))) => {
                            stream.pending = Some(next);
                            frame::encode_data(&mut self.write_buf, stream_id, &piece, false);
                        }
                        Some(Poll::Ready(Some(Err(err)))) => {
                            frame::encode_data(&mut self.write_buf, stream_id, &piece, false);
                            self.reset_stream(
                                stream_id,
                                Reason::INTERNAL_ERROR,
                                crate::Error::new_user_body(err),
                            );
                            return Ok(Step::Progress);
                        }
                        Some(Poll::Pending) => {
                            frame::encode_data(&mut self.write_buf, stream_id, &piece, false);
                        }
                    }
                }
                self.poll_write_buf(cx)?;
                return Ok(Step::Progress);
            }

            // No pending chunk: ask the payload, now that the previous
            // write has completed.
            match stream.body.as_mut().map(|b| Pin::new(b).poll_next(cx)) {
                Some(Poll::Ready(Some(Ok(chunk)))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    stream.pending = Some(chunk);
                    return Ok(Step::Progress);
                }
                Some(Poll::Ready(Some(Err(err)))) => {
                    self.reset_stream(
                        stream_id,
                        Reason::INTERNAL_ERROR,
                        crate::Error::new_user_body(err),
                    );
                    return Ok(Step::Progress);
                }
                Some(Poll::Ready(None)) => {
                    frame::encode_data(&mut self.write_buf, stream_id, &[], true);
                    stream.send = SendState::Done;
                    stream.body = None;
                    trace!(stream = %stream_id, "h2 request body complete");
                    self.poll_write_buf(cx)?;
                    return Ok(Step::Progress);
                }
                Some(Poll::Pending) | None => continue,
            }
        }
        Ok(Step::Blocked)
    }

    fn reap_closed(&mut self) {
        self.streams.retain(|_, stream| !stream.is_closed());
    }

    fn poll_write_buf(&mut self, cx: &mut Context<'_>) -> crate::Result<Step> {
        use bytes::Buf;
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
        if !self.write_buf.is_empty() {
            self.poll_write_buf(cx)?;
        }
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
                    trace!("h2 read eof");
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

    /// Connection-fatal error: the specific cause goes to the first stream
    /// still waiting, everything else sees a transport reset.
    fn teardown_with(&mut self, err: crate::Error) {
        debug!("h2 connection failed: {err}");
        let mut first = Some(err);
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            if let Some(mut stream) = self.streams.remove(&id) {
                stream.fail(match first.take() {
                    Some(err) => err,
                    None => crate::Error::new_connection_reset(),
                });
            }
        }
        self.fail_pending(crate::Error::new_connection_reset);
        self.shared.mark_not_reusable();
        self.shared.set_state(ConnState::Closed);
    }

    fn teardown(&mut self, mk: fn() -> crate::Error) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            if let Some(mut stream) = self.streams.remove(&id) {
                stream.fail(mk());
            }
        }
        self.fail_pending(mk);
        self.shared.mark_not_reusable();
        self.shared.set_state(ConnState::Closed);
    }

    /// Fail exchanges still queued in the dispatch channel.
    fn fail_pending(&mut self, mk: fn() -> crate::Error) {
        self.rx.close();
        while let Ok(dispatch) = self.rx.try_recv() {
            let _ = dispatch.respond.send(Err(mk()));
        }
    }
}
