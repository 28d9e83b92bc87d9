//! In-process scripted servers for the integration tests.

#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub async fn listen() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Scripted HTTP/1.1 server side of one connection.
pub struct H1Server {
    pub stream: TcpStream,
    buf: BytesMut,
}

impl H1Server {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await.expect("server read");
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    /// Read one request head, including the final blank line.
    pub async fn read_head(&mut self) -> String {
        loop {
            if let Some(end) = self
                .buf
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
            {
                let head = self.buf.split_to(end + 4);
                return String::from_utf8(head.to_vec()).expect("ascii head");
            }
            assert!(self.fill().await > 0, "eof before request head");
        }
    }

    /// Read exactly `n` body bytes.
    pub async fn read_body(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            assert!(self.fill().await > 0, "eof before request body");
        }
        self.buf.split_to(n).to_vec()
    }

    /// Read a chunked request body to completion, returning the data.
    pub async fn read_chunked_body(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16).expect("chunk size");
            if size == 0 {
                let trailer = self.read_line().await;
                assert!(trailer.is_empty(), "unexpected trailers in test body");
                return body;
            }
            body.extend_from_slice(&self.read_body(size).await);
            let crlf = self.read_body(2).await;
            assert_eq!(crlf, b"\r\n");
        }
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(end + 2);
                return String::from_utf8(line[..end].to_vec()).expect("ascii line");
            }
            assert!(self.fill().await > 0, "eof before line");
        }
    }

    /// True when the peer closed and no buffered bytes remain.
    pub async fn at_eof(&mut self) -> bool {
        self.buf.is_empty() && self.fill().await == 0
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("server write");
    }
}

/// One raw HTTP/2 frame as the test server sees it.
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;

/// Scripted HTTP/2 server side of one connection (h2c prior knowledge).
pub struct H2Server {
    pub stream: TcpStream,
    buf: BytesMut,
    enc: hpack::Encoder<'static>,
    dec: hpack::Decoder<'static>,
}

impl H2Server {
    /// Consume the client preface and its SETTINGS, answer with our own
    /// (empty) SETTINGS plus the ack.
    pub async fn accept(stream: TcpStream) -> Self {
        let mut server = Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
            enc: hpack::Encoder::new(),
            dec: hpack::Decoder::new(),
        };
        let preface = server.read_exact(24).await;
        assert_eq!(&preface[..], b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");
        let settings = server.read_frame().await;
        assert_eq!(settings.kind, FRAME_SETTINGS);
        assert_eq!(settings.flags & 0x1, 0, "first SETTINGS must not be an ack");
        // Our settings, then ack theirs.
        server.write_frame(FRAME_SETTINGS, 0, 0, &[]).await;
        server.write_frame(FRAME_SETTINGS, 0x1, 0, &[]).await;
        server
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await.expect("server read");
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    async fn read_exact(&mut self, n: usize) -> Bytes {
        while self.buf.len() < n {
            assert!(self.fill().await > 0, "eof while reading {n} bytes");
        }
        self.buf.split_to(n).freeze()
    }

    pub async fn read_frame(&mut self) -> RawFrame {
        let head = self.read_exact(9).await;
        let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
        let kind = head[3];
        let flags = head[4];
        let stream_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;
        let payload = self.read_exact(len).await;
        RawFrame {
            kind,
            flags,
            stream_id,
            payload,
        }
    }

    /// Next HEADERS frame, skipping control frames; returns the decoded
    /// field list.
    pub async fn next_headers(&mut self) -> (u32, bool, Vec<(String, String)>) {
        loop {
            let frame = self.read_frame().await;
            match frame.kind {
                FRAME_HEADERS => {
                    assert!(
                        frame.flags & FLAG_END_HEADERS != 0,
                        "test server expects unfragmented header blocks"
                    );
                    let fields = self
                        .dec
                        .decode(&frame.payload)
                        .expect("hpack decode")
                        .into_iter()
                        .map(|(n, v)| {
                            (
                                String::from_utf8(n).expect("header name utf8"),
                                String::from_utf8(v).expect("header value utf8"),
                            )
                        })
                        .collect();
                    return (frame.stream_id, frame.flags & FLAG_END_STREAM != 0, fields);
                }
                FRAME_SETTINGS | FRAME_WINDOW_UPDATE | FRAME_PING => continue,
                other => panic!("unexpected frame kind {other} while waiting for HEADERS"),
            }
        }
    }

    /// Next DATA frame, skipping control frames.
    pub async fn next_data(&mut self) -> (u32, bool, Bytes) {
        loop {
            let frame = self.read_frame().await;
            match frame.kind {
                FRAME_DATA => {
                    return (frame.stream_id, frame.flags & FLAG_END_STREAM != 0, frame.payload)
                }
                FRAME_SETTINGS | FRAME_WINDOW_UPDATE | FRAME_PING => continue,
                other => panic!("unexpected frame kind {other} while waiting for DATA"),
            }
        }
    }

    /// Next RST_STREAM, skipping control frames.
    pub async fn next_rst(&mut self) -> (u32, u32) {
        loop {
            let frame = self.read_frame().await;
            match frame.kind {
                FRAME_RST_STREAM => {
                    let mut payload = frame.payload;
                    return (frame.stream_id, payload.get_u32());
                }
                FRAME_SETTINGS | FRAME_WINDOW_UPDATE | FRAME_PING => continue,
                other => panic!("unexpected frame kind {other} while waiting for RST_STREAM"),
            }
        }
    }

    pub async fn write_frame(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        let mut head = BytesMut::with_capacity(9 + payload.len());
        let len = payload.len() as u32;
        head.put_u8((len >> 16) as u8);
        head.put_u8((len >> 8) as u8);
        head.put_u8(len as u8);
        head.put_u8(kind);
        head.put_u8(flags);
        head.put_u32(stream_id);
        head.put_slice(payload);
        self.stream.write_all(&head).await.expect("server write");
    }

    pub async fn send_response_headers(
        &mut self,
        stream_id: u32,
        status: &str,
        extra: &[(&str, &str)],
        end_stream: bool,
    ) {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = vec![(b":status".to_vec(), status.as_bytes().to_vec())];
        for (name, value) in extra {
            fields.push((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        let block = self
            .enc
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        self.write_frame(FRAME_HEADERS, flags, stream_id, &block).await;
    }

    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.write_frame(FRAME_DATA, flags, stream_id, data).await;
    }

    /// Trailers: a HEADERS frame with END_STREAM after the data.
    pub async fn send_trailers(&mut self, stream_id: u32, fields: &[(&str, &str)]) {
        let fields: Vec<(Vec<u8>, Vec<u8>)> = fields
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        let block = self
            .enc
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        self.write_frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            stream_id,
            &block,
        )
        .await;
    }

    pub async fn send_goaway(&mut self, last_stream_id: u32) {
        let mut payload = BytesMut::new();
        payload.put_u32(last_stream_id);
        payload.put_u32(0);
        self.write_frame(FRAME_GOAWAY, 0, 0, &payload).await;
    }
}

/// Find a header value in a raw h1 request head (case-insensitive name).
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}
