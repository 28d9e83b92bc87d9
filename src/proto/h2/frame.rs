//! HTTP/2 frame codec.
//!
//! Only what a client core needs: parse and serialize the nine RFC 9113
//! frame types over the connection's byte buffers. Header blocks stay
//! opaque fragments here; HPACK is applied by the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Parse, Reason};

/// The client connection preface.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FRAME_HEADER_LEN: usize = 9;

/// Settings identifiers, RFC 9113 §6.5.2.
pub(crate) const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub(crate) const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub(crate) const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub(crate) const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub(crate) const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub(crate) const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

const KIND_DATA: u8 = 0x0;
const KIND_HEADERS: u8 = 0x1;
const KIND_PRIORITY: u8 = 0x2;
const KIND_RST_STREAM: u8 = 0x3;
const KIND_SETTINGS: u8 = 0x4;
const KIND_PUSH_PROMISE: u8 = 0x5;
const KIND_PING: u8 = 0x6;
const KIND_GOAWAY: u8 = 0x7;
const KIND_WINDOW_UPDATE: u8 = 0x8;
const KIND_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// A stream identifier. Client-initiated streams are odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct StreamId(pub(crate) u32);

impl StreamId {
    pub(crate) const CONNECTION: Self = Self(0);

    pub(crate) fn is_connection(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
pub(crate) enum Frame {
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    Headers {
        stream_id: StreamId,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Continuation {
        stream_id: StreamId,
        fragment: Bytes,
        end_headers: bool,
    },
    Priority {
        stream_id: StreamId,
    },
    Reset {
        stream_id: StreamId,
        error_code: Reason,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: StreamId,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: Reason,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    /// A frame type this client does not know; ignored per RFC 9113 §4.1.
    Unknown,
}

/// Parse one frame out of `buf`, consuming it when complete.
pub(crate) fn parse(buf: &mut BytesMut, max_frame_size: u32) -> crate::Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
    if len > max_frame_size as usize {
        return Err(crate::Error::new_proto(Reason::FRAME_SIZE_ERROR));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    let kind = buf[3];
    let flags = buf[4];
    let stream_id = StreamId(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff);
    buf.advance(FRAME_HEADER_LEN);
    let mut payload = buf.split_to(len);

    let frame = match kind {
        KIND_DATA => {
            let data = strip_padding(&mut payload, flags)?;
            Frame::Data {
                stream_id,
                data,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        KIND_HEADERS => {
            let mut fragment = strip_padding(&mut payload, flags)?;
            if flags & FLAG_PRIORITY != 0 {
                if fragment.len() < 5 {
                    return Err(Parse::Frame.into());
                }
                // Stream dependency + weight are ignored.
                fragment.advance(5);
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        KIND_CONTINUATION => Frame::Continuation {
            stream_id,
            fragment: payload.freeze(),
            end_headers: flags & FLAG_END_HEADERS != 0,
        },
        KIND_PRIORITY => Frame::Priority { stream_id },
        KIND_RST_STREAM => {
            if payload.len() != 4 {
                return Err(crate::Error::new_proto(Reason::FRAME_SIZE_ERROR));
            }
            Frame::Reset {
                stream_id,
                error_code: Reason(payload.get_u32()),
            }
        }
        KIND_SETTINGS => {
            if payload.len() % 6 != 0 {
                return Err(crate::Error::new_proto(Reason::FRAME_SIZE_ERROR));
            }
            let mut values = Vec::with_capacity(payload.len() / 6);
            while payload.has_remaining() {
                values.push((payload.get_u16(), payload.get_u32()));
            }
            Frame::Settings {
                ack: flags & FLAG_ACK != 0,
                values,
            }
        }
        KIND_PUSH_PROMISE => Frame::PushPromise { stream_id },
        KIND_PING => {
            if payload.len() != 8 {
                return Err(crate::Error::new_proto(Reason::FRAME_SIZE_ERROR));
            }
            let mut data = [0u8; 8];
            payload.copy_to_slice(&mut data);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload: data,
            }
        }
        KIND_GOAWAY => {
            if payload.len() < 8 {
                return Err(crate::Error::new_proto(Reason::FRAME_SIZE_ERROR));
            }
            let last_stream_id = StreamId(payload.get_u32() & 0x7fff_ffff);
            let error_code = Reason(payload.get_u32());
            Frame::GoAway {
                last_stream_id,
                error_code,
            }
        }
        KIND_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(crate::Error::new_proto(Reason::FRAME_SIZE_ERROR));
            }
            let increment = payload.get_u32() & 0x7fff_ffff;
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        _ => Frame::Unknown,
    };
    Ok(Some(frame))
}

fn strip_padding(payload: &mut BytesMut, flags: u8) -> crate::Result<Bytes> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload.split().freeze());
    }
    if payload.is_empty() {
        return Err(Parse::Frame.into());
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(crate::Error::new_proto(Reason::PROTOCOL_ERROR));
    }
    let data_len = payload.len() - pad_len;
    Ok(payload.split_to(data_len).freeze())
}

fn put_frame_head(dst: &mut BytesMut, len: usize, kind: u8, flags: u8, stream_id: StreamId) {
    dst.reserve(FRAME_HEADER_LEN + len);
    let len = len as u32;
    dst.put_u8((len >> 16) as u8);
    dst.put_u8((len >> 8) as u8);
    dst.put_u8(len as u8);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream_id.0 & 0x7fff_ffff);
}

pub(crate) fn encode_settings(dst: &mut BytesMut, values: &[(u16, u32)]) {
    put_frame_head(dst, values.len() * 6, KIND_SETTINGS, 0, StreamId::CONNECTION);
    for &(id, value) in values {
        dst.put_u16(id);
        dst.put_u32(value);
    }
}

pub(crate) fn encode_settings_ack(dst: &mut BytesMut) {
    put_frame_head(dst, 0, KIND_SETTINGS, FLAG_ACK, StreamId::CONNECTION);
}

/// Write a header block, splitting into HEADERS + CONTINUATION frames when
/// it exceeds the peer's frame size.
pub(crate) fn encode_headers(
    dst: &mut BytesMut,
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };
    let (first, mut rest) = block.split_at(block.len().min(max));
    if rest.is_empty() {
        flags |= FLAG_END_HEADERS;
    }
    put_frame_head(dst, first.len(), KIND_HEADERS, flags, stream_id);
    dst.put_slice(first);
    while !rest.is_empty() {
        let (piece, tail) = rest.split_at(rest.len().min(max));
        let flags = if tail.is_empty() { FLAG_END_HEADERS } else { 0 };
        put_frame_head(dst, piece.len(), KIND_CONTINUATION, flags, stream_id);
        dst.put_slice(piece);
        rest = tail;
    }
}

pub(crate) fn encode_data(dst: &mut BytesMut, stream_id: StreamId, data: &[u8], end_stream: bool) {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    put_frame_head(dst, data.len(), KIND_DATA, flags, stream_id);
    dst.put_slice(data);
}

pub(crate) fn encode_reset(dst: &mut BytesMut, stream_id: StreamId, reason: Reason) {
    put_frame_head(dst, 4, KIND_RST_STREAM, 0, stream_id);
    dst.put_u32(reason.0);
}

pub(crate) fn encode_ping_ack(dst: &mut BytesMut, payload: [u8; 8]) {
    put_frame_head(dst, 8, KIND_PING, FLAG_ACK, StreamId::CONNECTION);
    dst.put_slice(&payload);
}

pub(crate) fn encode_goaway(dst: &mut BytesMut, last_stream_id: StreamId, reason: Reason) {
    put_frame_head(dst, 8, KIND_GOAWAY, 0, StreamId::CONNECTION);
    dst.put_u32(last_stream_id.0 & 0x7fff_ffff);
    dst.put_u32(reason.0);
}

pub(crate) fn encode_window_update(dst: &mut BytesMut, stream_id: StreamId, increment: u32) {
    put_frame_head(dst, 4, KIND_WINDOW_UPDATE, 0, stream_id);
    dst.put_u32(increment & 0x7fff_ffff);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let mut buf = BytesMut::new();
        encode_settings(&mut buf, &[(SETTINGS_INITIAL_WINDOW_SIZE, 65_535), (SETTINGS_ENABLE_PUSH, 0)]);
        match parse(&mut buf, 16_384).unwrap().unwrap() {
            Frame::Settings { ack, values } => {
                assert!(!ack);
                assert_eq!(values, vec![(SETTINGS_INITIAL_WINDOW_SIZE, 65_535), (SETTINGS_ENABLE_PUSH, 0)]);
            }
            other => panic!("{other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn data_round_trip_with_end_stream() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, StreamId(1), b"cc", true);
        match parse(&mut buf, 16_384).unwrap().unwrap() {
            Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                assert_eq!(stream_id, StreamId(1));
                assert_eq!(&data[..], b"cc");
                assert!(end_stream);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, StreamId(1), b"hello", false);
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(parse(&mut partial, 16_384).unwrap().is_none());
        assert_eq!(partial.len(), FRAME_HEADER_LEN + 4, "partial parse must not consume");
    }

    #[test]
    fn headers_split_into_continuations() {
        let block = vec![0xaau8; 40];
        let mut buf = BytesMut::new();
        encode_headers(&mut buf, StreamId(3), &block, false, 16);
        let mut fragments = Vec::new();
        let mut saw_end = false;
        while let Some(frame) = parse(&mut buf, 16_384).unwrap() {
            match frame {
                Frame::Headers {
                    stream_id,
                    fragment,
                    end_headers,
                    end_stream,
                } => {
                    assert_eq!(stream_id, StreamId(3));
                    assert!(!end_stream);
                    assert!(!end_headers);
                    fragments.extend_from_slice(&fragment);
                }
                Frame::Continuation {
                    fragment,
                    end_headers,
                    ..
                } => {
                    fragments.extend_from_slice(&fragment);
                    if end_headers {
                        saw_end = true;
                    }
                }
                other => panic!("{other:?}"),
            }
        }
        assert!(saw_end);
        assert_eq!(fragments, block);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, StreamId(1), &vec![0u8; 32], false);
        let err = parse(&mut buf, 16).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::FRAME_SIZE_ERROR));
    }

    #[test]
    fn rst_and_goaway_round_trip() {
        let mut buf = BytesMut::new();
        encode_reset(&mut buf, StreamId(5), Reason::CANCEL);
        encode_goaway(&mut buf, StreamId(7), Reason::NO_ERROR);
        match parse(&mut buf, 16_384).unwrap().unwrap() {
            Frame::Reset {
                stream_id,
                error_code,
            } => {
                assert_eq!(stream_id, StreamId(5));
                assert_eq!(error_code, Reason::CANCEL);
            }
            other => panic!("{other:?}"),
        }
        match parse(&mut buf, 16_384).unwrap().unwrap() {
            Frame::GoAway {
                last_stream_id,
                error_code,
            } => {
                assert_eq!(last_stream_id, StreamId(7));
                assert_eq!(error_code, Reason::NO_ERROR);
            }
            other => panic!("{other:?}"),
        }
    }
}
