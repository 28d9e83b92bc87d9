//! HTTP/1.1 response decoding.

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};
use smallvec::{SmallVec, smallvec};
use tracing::trace;

use crate::error::Parse;

const DEFAULT_MAX_HEADERS: usize = 100;

/// Body length rules decided from a response head, RFC 7230 §3.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodedLength {
    Zero,
    Exact(u64),
    Chunked,
    /// Read until FIN; the connection cannot be reused.
    CloseDelimited,
}

pub(crate) struct ParsedHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) keep_alive: bool,
    pub(crate) decode: DecodedLength,
    pub(crate) wants_upgrade: bool,
}

pub(crate) enum HeadOutcome {
    Head(ParsedHead),
    /// A 1xx other than 101: consumed and discarded by the caller.
    Informational(StatusCode),
    /// Not enough buffered bytes yet.
    Partial,
}

/// Parse one response head out of `buf`, consuming it when complete.
pub(crate) fn parse_head(buf: &mut BytesMut, req_method: &Method) -> crate::Result<HeadOutcome> {
    if buf.is_empty() {
        return Ok(HeadOutcome::Partial);
    }
    let (len, status, version, headers) = {
        let mut parsed_headers: SmallVec<[httparse::Header<'_>; DEFAULT_MAX_HEADERS]> =
            smallvec![httparse::EMPTY_HEADER; DEFAULT_MAX_HEADERS];
        let mut res = httparse::Response::new(&mut parsed_headers);
        trace!("Response.parse: bytes len = {}", buf.len());
        match res.parse(&buf[..]) {
            Ok(httparse::Status::Complete(len)) => {
                let status = res
                    .code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or(Parse::Status)?;
                let version = match res.version {
                    Some(1) => Version::HTTP_11,
                    Some(0) => Version::HTTP_10,
                    _ => return Err(Parse::Version.into()),
                };
                let mut headers = HeaderMap::with_capacity(res.headers.len());
                for h in res.headers.iter() {
                    let name =
                        HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| Parse::Header)?;
                    let value = HeaderValue::from_bytes(h.value).map_err(|_| Parse::Header)?;
                    headers.append(name, value);
                }
                (len, status, version, headers)
            }
            Ok(httparse::Status::Partial) => return Ok(HeadOutcome::Partial),
            Err(err) => return Err(err.into()),
        }
    };
    buf.advance(len);

    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        trace!("consuming informational response: {}", status.as_u16());
        return Ok(HeadOutcome::Informational(status));
    }

    let mut keep_alive = version == Version::HTTP_11;
    if let Some(conn) = headers.get(header::CONNECTION) {
        if keep_alive {
            keep_alive = !connection_has(conn, "close");
        } else {
            keep_alive = connection_has(conn, "keep-alive");
        }
    }

    let (decode, wants_upgrade) = decoder(status, version, &headers, req_method)?;
    Ok(HeadOutcome::Head(ParsedHead {
        status,
        version,
        headers,
        // a client upgrade means the connection can't be used again
        keep_alive: keep_alive && !wants_upgrade,
        decode,
        wants_upgrade,
    }))
}

fn connection_has(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

fn decoder(
    status: StatusCode,
    version: Version,
    headers: &HeaderMap,
    req_method: &Method,
) -> crate::Result<(DecodedLength, bool)> {
    // 1. 101, HEAD responses, 204 and 304 cannot have a body.
    // 2. 2xx to a CONNECT cannot have a body.
    // 3. Transfer-Encoding: chunked has a chunked body.
    // 4. Content-Length has a sized body.
    // 5. Otherwise read till EOF.
    match status.as_u16() {
        101 => return Ok((DecodedLength::Zero, true)),
        204 | 304 => return Ok((DecodedLength::Zero, false)),
        _ => {}
    }
    match *req_method {
        Method::HEAD => return Ok((DecodedLength::Zero, false)),
        Method::CONNECT if status.is_success() => return Ok((DecodedLength::Zero, true)),
        _ => {}
    }

    if headers.contains_key(header::TRANSFER_ENCODING) {
        if version == Version::HTTP_10 {
            return Err(Parse::TransferEncoding.into());
        }
        let chunked = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .next_back()
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .next_back()
                    .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false);
        return Ok(if chunked {
            (DecodedLength::Chunked, false)
        } else {
            (DecodedLength::CloseDelimited, false)
        });
    }

    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let len = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(Parse::ContentLength)?;
        return Ok(if len == 0 {
            (DecodedLength::Zero, false)
        } else {
            (DecodedLength::Exact(len), false)
        });
    }

    trace!("neither Transfer-Encoding nor Content-Length");
    Ok((DecodedLength::CloseDelimited, false))
}

/// One step of body decoding.
#[derive(Debug)]
pub(crate) enum Decoded {
    Chunk(Bytes),
    Trailers(HeaderMap),
    Complete,
    NeedMore,
}

#[derive(Debug)]
pub(crate) enum ChunkedState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
}

/// Incremental response body decoder over the connection's read buffer.
#[derive(Debug)]
pub(crate) enum BodyDecoder {
    Exact(u64),
    Chunked(ChunkedState),
    CloseDelimited,
    Done,
}

impl BodyDecoder {
    pub(crate) fn new(len: DecodedLength) -> Self {
        match len {
            DecodedLength::Zero => Self::Done,
            DecodedLength::Exact(len) => Self::Exact(len),
            DecodedLength::Chunked => Self::Chunked(ChunkedState::Size),
            DecodedLength::CloseDelimited => Self::CloseDelimited,
        }
    }

    /// Decode the next step out of `buf`. `eof` reports transport FIN.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut, eof: bool) -> crate::Result<Decoded> {
        match self {
            Self::Done => Ok(Decoded::Complete),
            Self::Exact(remaining) => {
                if *remaining == 0 {
                    *self = Self::Done;
                    return Ok(Decoded::Complete);
                }
                if buf.is_empty() {
                    return if eof {
                        Err(crate::Error::new_incomplete())
                    } else {
                        Ok(Decoded::NeedMore)
                    };
                }
                let take = std::cmp::min(buf.len() as u64, *remaining) as usize;
                *remaining -= take as u64;
                let chunk = buf.split_to(take).freeze();
                if *remaining == 0 {
                    *self = Self::Done;
                }
                Ok(Decoded::Chunk(chunk))
            }
            Self::CloseDelimited => {
                if !buf.is_empty() {
                    let chunk = buf.split().freeze();
                    return Ok(Decoded::Chunk(chunk));
                }
                if eof {
                    *self = Self::Done;
                    Ok(Decoded::Complete)
                } else {
                    Ok(Decoded::NeedMore)
                }
            }
            Self::Chunked(state) => {
                let step = decode_chunked(state, buf, eof)?;
                if matches!(step, Decoded::Complete | Decoded::Trailers(_)) {
                    *self = Self::Done;
                }
                Ok(step)
            }
        }
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self, Self::CloseDelimited)
    }
}

fn decode_chunked(
    state: &mut ChunkedState,
    buf: &mut BytesMut,
    eof: bool,
) -> crate::Result<Decoded> {
    loop {
        match state {
            ChunkedState::Size => {
                let Some(line_end) = find_crlf(buf) else {
                    return need_more(buf, eof);
                };
                let line = buf.split_to(line_end + 2);
                let digits = &line[..line_end];
                let digits = match digits.iter().position(|&b| b == b';') {
                    Some(ext) => &digits[..ext],
                    None => digits,
                };
                let size = parse_hex(digits).ok_or(Parse::Chunk)?;
                if size == 0 {
                    *state = ChunkedState::Trailer;
                } else {
                    *state = ChunkedState::Data { remaining: size };
                }
            }
            ChunkedState::Data { remaining } => {
                if buf.is_empty() {
                    return need_more(buf, eof);
                }
                let take = std::cmp::min(buf.len() as u64, *remaining) as usize;
                *remaining -= take as u64;
                let chunk = buf.split_to(take).freeze();
                if *remaining == 0 {
                    *state = ChunkedState::DataEnd;
                }
                return Ok(Decoded::Chunk(chunk));
            }
            ChunkedState::DataEnd => {
                if buf.len() < 2 {
                    return need_more(buf, eof);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(Parse::Chunk.into());
                }
                buf.advance(2);
                *state = ChunkedState::Size;
            }
            ChunkedState::Trailer => {
                // An immediately-empty section is just the final CRLF;
                // check it first so pipelined bytes behind it cannot be
                // mistaken for the section terminator.
                if buf.len() >= 2 && &buf[..2] == b"\r\n" {
                    buf.advance(2);
                    return Ok(Decoded::Complete);
                }
                // Everything between the last-chunk and the blank line is
                // the trailer section.
                let Some(section_end) = find_section_end(buf) else {
                    return need_more(buf, eof);
                };
                let section = buf.split_to(section_end + 4);
                let trailers = parse_trailers(&section[..section_end])?;
                return Ok(if trailers.is_empty() {
                    Decoded::Complete
                } else {
                    Decoded::Trailers(trailers)
                });
            }
        }
    }
}

fn need_more(buf: &BytesMut, eof: bool) -> crate::Result<Decoded> {
    let _ = buf;
    if eof {
        Err(crate::Error::new_incomplete())
    } else {
        Ok(Decoded::NeedMore)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_section_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    let mut value: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = value.checked_mul(16)?.checked_add(u64::from(digit))?;
    }
    Some(value)
}

fn parse_trailers(section: &[u8]) -> crate::Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    for line in section.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line.iter().position(|&b| b == b':').ok_or(Parse::Header)?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| Parse::Header)?;
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| Parse::Header)?;
        trailers.append(name, value);
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ParsedHead {
        let mut buf = BytesMut::from(s);
        match parse_head(&mut buf, &Method::GET).unwrap() {
            HeadOutcome::Head(head) => head,
            other => panic!("expected a head, got {}", match other {
                HeadOutcome::Informational(s) => format!("informational {s}"),
                _ => "partial".to_owned(),
            }),
        }
    }

    #[test]
    fn parses_simple_head() {
        let head = parse("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.decode, DecodedLength::Exact(5));
        assert!(head.keep_alive);
        assert!(!head.wants_upgrade);
    }

    #[test]
    fn partial_head_asks_for_more() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\ncontent-le");
        assert!(matches!(
            parse_head(&mut buf, &Method::GET).unwrap(),
            HeadOutcome::Partial
        ));
        assert_eq!(buf.len(), 28, "partial parse must not consume");
    }

    #[test]
    fn informational_is_consumed() {
        let mut buf = BytesMut::from("HTTP/1.1 103 Early Hints\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
        assert!(matches!(
            parse_head(&mut buf, &Method::GET).unwrap(),
            HeadOutcome::Informational(status) if status.as_u16() == 103
        ));
        let head = match parse_head(&mut buf, &Method::GET).unwrap() {
            HeadOutcome::Head(head) => head,
            _ => panic!("second head expected"),
        };
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.decode, DecodedLength::Zero);
    }

    #[test]
    fn connection_close_clears_keep_alive() {
        let head = parse("HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n");
        assert!(!head.keep_alive);
    }

    #[test]
    fn no_framing_reads_till_eof() {
        let head = parse("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(head.decode, DecodedLength::CloseDelimited);
    }

    #[test]
    fn head_method_suppresses_body() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");
        let head = match parse_head(&mut buf, &Method::HEAD).unwrap() {
            HeadOutcome::Head(head) => head,
            _ => panic!(),
        };
        assert_eq!(head.decode, DecodedLength::Zero);
    }

    #[test]
    fn switching_protocols_wants_upgrade() {
        let head = parse("HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\n");
        assert!(head.wants_upgrade);
        assert!(!head.keep_alive);
    }

    #[test]
    fn exact_decoder_completes_at_length() {
        let mut decoder = BodyDecoder::new(DecodedLength::Exact(5));
        let mut buf = BytesMut::from(&b"helloEXTRA"[..]);
        match decoder.decode(&mut buf, false).unwrap() {
            Decoded::Chunk(chunk) => assert_eq!(&chunk[..], b"hello"),
            other => panic!("{other:?}"),
        }
        assert!(matches!(decoder.decode(&mut buf, false).unwrap(), Decoded::Complete));
        assert_eq!(&buf[..], b"EXTRA", "pipelined bytes stay buffered");
    }

    #[test]
    fn exact_decoder_flags_truncation() {
        let mut decoder = BodyDecoder::new(DecodedLength::Exact(5));
        let mut buf = BytesMut::from(&b"he"[..]);
        let _ = decoder.decode(&mut buf, false).unwrap();
        let err = decoder.decode(&mut buf, true).unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[test]
    fn chunked_decoder_round_trip() {
        let mut decoder = BodyDecoder::new(DecodedLength::Chunked);
        let mut buf = BytesMut::from(&b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"[..]);
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut buf, false).unwrap() {
                Decoded::Chunk(chunk) => out.extend_from_slice(&chunk),
                Decoded::Complete => break,
                other => panic!("{other:?}"),
            }
        }
        assert_eq!(&out[..], b"abcde");
    }

    #[test]
    fn chunked_decoder_surfaces_trailers() {
        let mut decoder = BodyDecoder::new(DecodedLength::Chunked);
        let mut buf = BytesMut::from(&b"1\r\nx\r\n0\r\nx-checksum: abc\r\n\r\n"[..]);
        let mut saw_trailers = false;
        loop {
            match decoder.decode(&mut buf, false).unwrap() {
                Decoded::Chunk(_) => {}
                Decoded::Trailers(trailers) => {
                    assert_eq!(trailers.get("x-checksum").unwrap(), "abc");
                    saw_trailers = true;
                    break;
                }
                Decoded::Complete => break,
                Decoded::NeedMore => panic!("incomplete fixture"),
            }
        }
        assert!(saw_trailers);
    }

    #[test]
    fn chunked_extension_is_ignored() {
        let mut decoder = BodyDecoder::new(DecodedLength::Chunked);
        let mut buf = BytesMut::from(&b"3;name=val\r\nabc\r\n0\r\n\r\n"[..]);
        match decoder.decode(&mut buf, false).unwrap() {
            Decoded::Chunk(chunk) => assert_eq!(&chunk[..], b"abc"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn close_delimited_completes_on_eof() {
        let mut decoder = BodyDecoder::new(DecodedLength::CloseDelimited);
        let mut buf = BytesMut::from(&b"all of it"[..]);
        match decoder.decode(&mut buf, false).unwrap() {
            Decoded::Chunk(chunk) => assert_eq!(&chunk[..], b"all of it"),
            other => panic!("{other:?}"),
        }
        assert!(matches!(decoder.decode(&mut buf, false).unwrap(), Decoded::NeedMore));
        assert!(matches!(decoder.decode(&mut buf, true).unwrap(), Decoded::Complete));
    }
}
