//! HTTP/1.1 request encoding.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, header};

use crate::config::EndpointConfig;
use crate::payload::Payload;
use crate::request::SentRequest;

/// How the request body goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body, no framing headers.
    Empty,
    /// `Content-Length: n`, exactly n bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// Decide the framing for a request body.
///
/// A caller-provided `Content-Length` always wins. Otherwise a single-shot
/// payload determines the length by itself, and anything streaming falls
/// back to chunked transfer.
pub(crate) fn decide_framing(headers: &HeaderMap, payload: &Payload) -> crate::Result<BodyFraming> {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let len = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(crate::error::Parse::ContentLength)?;
        return Ok(BodyFraming::Length(len));
    }
    Ok(match payload.exact_size() {
        Some(0) => BodyFraming::Empty,
        Some(len) => BodyFraming::Length(len),
        None => BodyFraming::Chunked,
    })
}

/// Serialize the request line and headers, including the synthesized
/// `Host`, automatic `User-Agent` / `Accept-Encoding` injection and the
/// framing headers decided by [`decide_framing`].
pub(crate) fn encode_head(
    dst: &mut BytesMut,
    req: &SentRequest,
    authority: &str,
    framing: BodyFraming,
    config: &EndpointConfig,
) {
    dst.reserve(64 + req.headers.len() * 48);
    dst.put_slice(req.method.as_str().as_bytes());
    dst.put_u8(b' ');
    if req.method == Method::OPTIONS && req.target == "/" {
        dst.put_u8(b'*');
    } else {
        dst.put_slice(req.target.as_bytes());
    }
    dst.put_slice(b" HTTP/1.1\r\n");

    if !req.headers.contains_key(header::HOST) {
        dst.put_slice(b"host: ");
        dst.put_slice(authority.as_bytes());
        dst.put_slice(b"\r\n");
    }
    if config.send_user_agent && !req.headers.contains_key(header::USER_AGENT) {
        dst.put_slice(b"user-agent: ");
        dst.put_slice(config.user_agent.as_bytes());
        dst.put_slice(b"\r\n");
    }
    if config.decompression_enabled && !req.headers.contains_key(header::ACCEPT_ENCODING) {
        dst.put_slice(b"accept-encoding: ");
        dst.put_slice(config.accept_encodings().as_bytes());
        dst.put_slice(b"\r\n");
    }

    for (name, value) in &req.headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }

    match framing {
        BodyFraming::Empty => {}
        BodyFraming::Length(len) => {
            if !req.headers.contains_key(header::CONTENT_LENGTH) {
                let mut buf = itoa::Buffer::new();
                dst.put_slice(b"content-length: ");
                dst.put_slice(buf.format(len).as_bytes());
                dst.put_slice(b"\r\n");
            }
        }
        BodyFraming::Chunked => {
            if !req.headers.contains_key(header::TRANSFER_ENCODING) {
                dst.put_slice(b"transfer-encoding: chunked\r\n");
            }
        }
    }

    dst.put_slice(b"\r\n");
}

/// Append one body chunk under the given framing.
pub(crate) fn encode_chunk(dst: &mut BytesMut, framing: BodyFraming, chunk: &Bytes) {
    match framing {
        BodyFraming::Chunked => {
            // A zero-size data chunk would read as the terminal.
            if chunk.is_empty() {
                return;
            }
            put_hex(dst, chunk.len());
            dst.put_slice(b"\r\n");
            dst.put_slice(chunk);
            dst.put_slice(b"\r\n");
        }
        _ => dst.put_slice(chunk),
    }
}

/// Append the body terminal, when the framing has one.
pub(crate) fn encode_terminal(dst: &mut BytesMut, framing: BodyFraming) {
    if framing == BodyFraming::Chunked {
        dst.put_slice(b"0\r\n\r\n");
    }
}

fn put_hex(dst: &mut BytesMut, mut value: usize) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut tmp = [0u8; 16];
    let mut at = tmp.len();
    loop {
        at -= 1;
        tmp[at] = DIGITS[value & 0xf];
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    dst.put_slice(&tmp[at..]);
}
