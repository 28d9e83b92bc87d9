//! HTTP/2 end-to-end behavior against a raw-frame scripted server.

mod support;

use bora::{EndpointConfig, Method, ProtocolSet, endpoint};
use support::{H2Server, listen};

fn h2_config() -> EndpointConfig {
    EndpointConfig::default().with_http_protocol_versions(ProtocolSet::http2_only())
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn simple_get_over_prior_knowledge() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, end_stream, fields) = server.next_headers().await;
        assert_eq!(stream_id, 1);
        assert!(end_stream, "GET carries no body");
        assert_eq!(field(&fields, ":method"), Some("GET"));
        assert_eq!(field(&fields, ":path"), Some("/"));
        assert_eq!(field(&fields, ":scheme"), Some("http"));
        server
            .send_response_headers(stream_id, "200", &[("content-length", "5")], false)
            .await;
        server.send_data(stream_id, b"hello", true).await;
    });

    let ep = endpoint(format!("{addr}"))
        .config(h2_config())
        .build::<()>()
        .expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let mut response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.aggregate().await.expect("body");
    assert_eq!(&body[..], b"hello");
    server.await.expect("server");
}

#[tokio::test]
async fn streamed_post_ends_on_last_data_frame() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, end_stream, fields) = server.next_headers().await;
        assert!(!end_stream);
        assert_eq!(field(&fields, ":method"), Some("POST"));
        assert_eq!(field(&fields, "content-type"), Some("application/octet-stream"));
        assert_eq!(field(&fields, "content-length"), None);

        let mut frames = Vec::new();
        loop {
            let (id, es, data) = server.next_data().await;
            assert_eq!(id, stream_id);
            frames.push(data);
            if es {
                break;
            }
        }
        // HEADERS + 3 DATA frames, END_STREAM on the last one.
        assert_eq!(frames.len(), 3, "frames: {frames:?}");
        let all: Vec<u8> = frames.concat();
        assert_eq!(&all[..], b"aabbcc");
        server.send_response_headers(stream_id, "204", &[], true).await;
    });

    let ep = endpoint(format!("{addr}"))
        .config(h2_config())
        .build::<()>()
        .expect("endpoint");
    let mut ex = ep.exchange(Method::POST, "/upload", ()).expect("exchange");
    let chunks = futures_util::stream::iter(
        ["aa", "bb", "cc"]
            .into_iter()
            .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes()))),
    );
    ex.request()
        .unwrap()
        .header(
            bora::header::CONTENT_TYPE,
            bora::HeaderValue::from_static("application/octet-stream"),
        )
        .unwrap()
        .body(move |b| {
            b.stream(chunks);
            Ok(())
        })
        .unwrap();
    let response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 204);
    server.await.expect("server");
}

#[tokio::test]
async fn concurrent_streams_get_increasing_ids() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (first_id, _, first) = server.next_headers().await;
        let (second_id, _, second) = server.next_headers().await;
        assert_eq!(first_id, 1);
        assert_eq!(second_id, 3);
        // Both requests answered out of order; streams are independent.
        let first_path = field(&first, ":path").unwrap().to_owned();
        let second_path = field(&second, ":path").unwrap().to_owned();
        server
            .send_response_headers(second_id, "200", &[("content-length", second_path.len().to_string().as_str())], false)
            .await;
        server.send_data(second_id, second_path.as_bytes(), true).await;
        server
            .send_response_headers(first_id, "200", &[("content-length", first_path.len().to_string().as_str())], false)
            .await;
        server.send_data(first_id, first_path.as_bytes(), true).await;
    });

    let ep = endpoint(format!("{addr}"))
        .config(h2_config())
        .build::<()>()
        .expect("endpoint");

    let mut first = ep.exchange(Method::GET, "/one", ()).expect("exchange");
    let mut second = ep.exchange(Method::GET, "/two", ()).expect("exchange");
    // Dispatch in order, await together.
    let first = tokio::spawn(async move {
        first
            .response()
            .await
            .expect("response")
            .expect("not reset")
            .aggregate()
            .await
            .expect("body")
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let second = tokio::spawn(async move {
        second
            .response()
            .await
            .expect("response")
            .expect("not reset")
            .aggregate()
            .await
            .expect("body")
    });

    assert_eq!(&first.await.expect("join")[..], b"/one");
    assert_eq!(&second.await.expect("join")[..], b"/two");
    server.await.expect("server");
}

#[tokio::test]
async fn timeout_resets_the_stream_with_cancel() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, _, _) = server.next_headers().await;
        // Stall; the client must reset.
        let (rst_id, code) = server.next_rst().await;
        assert_eq!(rst_id, stream_id);
        assert_eq!(code, 8, "expected CANCEL");
    });

    let config = h2_config().with_request_timeout(Some(std::time::Duration::from_millis(50)));
    let ep = endpoint(format!("{addr}"))
        .config(config)
        .build::<()>()
        .expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let err = ex.response().await.expect_err("must time out");
    assert!(err.is_request_timeout(), "{err:?}");
    server.await.expect("server");
}

#[tokio::test]
async fn dropped_response_body_resets_the_stream() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, _, _) = server.next_headers().await;
        server
            .send_response_headers(stream_id, "200", &[("content-length", "100")], false)
            .await;
        server.send_data(stream_id, b"partial", false).await;
        let (rst_id, code) = server.next_rst().await;
        assert_eq!(rst_id, stream_id);
        assert_eq!(code, 8, "expected CANCEL");
    });

    let ep = endpoint(format!("{addr}"))
        .config(h2_config())
        .build::<()>()
        .expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let response = ex.response().await.expect("response").expect("not reset");
    // Cancel: discard the response without subscribing to the body.
    drop(response);
    server.await.expect("server");
}

#[tokio::test]
async fn goaway_drains_and_retries_on_a_fresh_connection() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, _, _) = server.next_headers().await;
        server.send_response_headers(stream_id, "200", &[], true).await;
        server.send_goaway(stream_id).await;

        // The next exchange must arrive on a fresh connection.
        let (stream, _) = listener.accept().await.expect("second accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, _, _) = server.next_headers().await;
        assert_eq!(stream_id, 1, "fresh connection restarts stream ids");
        server.send_response_headers(stream_id, "200", &[], true).await;
    });

    let ep = endpoint(format!("{addr}"))
        .config(h2_config())
        .build::<()>()
        .expect("endpoint");

    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 200);

    // Give the GOAWAY a moment to drain the pooled connection.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 200);
    server.await.expect("server");
}

#[tokio::test]
async fn response_trailers_are_surfaced() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H2Server::accept(stream).await;
        let (stream_id, _, _) = server.next_headers().await;
        server
            .send_response_headers(stream_id, "200", &[], false)
            .await;
        server.send_data(stream_id, b"payload", false).await;
        // Trailers: HEADERS with END_STREAM after DATA.
        server
            .send_trailers(stream_id, &[("x-digest", "abc")])
            .await;
    });

    let ep = endpoint(format!("{addr}"))
        .config(h2_config())
        .build::<()>()
        .expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let mut response = ex.response().await.expect("response").expect("not reset");
    let body = response.aggregate().await.expect("body");
    assert_eq!(&body[..], b"payload");
    let trailers = response.trailers().await.expect("trailers");
    assert_eq!(trailers.get("x-digest").unwrap(), "abc");
}
