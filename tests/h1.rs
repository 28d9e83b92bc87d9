//! HTTP/1.1 end-to-end behavior against scripted servers.

mod support;

use bora::{EndpointConfig, Method, endpoint};
use support::{H1Server, header_value, listen};

#[tokio::test]
async fn simple_get_and_reuse() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        for body in ["hello", "again"] {
            let head = server.read_head().await;
            assert!(head.starts_with("GET / HTTP/1.1\r\n"), "head: {head}");
            assert_eq!(header_value(&head, "host"), Some("example.test"));
            server
                .write(
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    )
                    .as_bytes(),
                )
                .await;
        }
    });

    let ep = endpoint(format!("{addr}"))
        .build::<()>()
        .expect("endpoint");

    for expected in ["hello", "again"] {
        let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
        ex.request()
            .unwrap()
            .authority("example.test")
            .unwrap();
        let mut response = ex.response().await.expect("response").expect("not reset");
        assert_eq!(response.status().as_u16(), 200);
        let body = response.aggregate().await.expect("body");
        assert_eq!(&body[..], expected.as_bytes());
    }

    // Both exchanges rode the single scripted connection.
    server.await.expect("server");
    ep.shutdown();
}

#[tokio::test]
async fn pipelining_respects_the_ceiling() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        // With a ceiling of 2, both heads arrive before any response.
        let first = server.read_head().await;
        let second = server.read_head().await;
        assert!(first.contains("GET /a "), "first: {first}");
        assert!(second.contains("GET /b "), "second: {second}");
        // The third must wait for the first response to complete.
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            server.read_head(),
        )
        .await;
        assert!(waited.is_err(), "third request pipelined past the ceiling");
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\na")
            .await;
        let third = server.read_head().await;
        assert!(third.contains("GET /c "), "third: {third}");
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nb")
            .await;
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nc")
            .await;
    });

    let config = EndpointConfig::default()
        .with_http1_max_concurrent_requests(2)
        .with_pool_max_size(1);
    let ep = endpoint(format!("{addr}"))
        .config(config)
        .build::<()>()
        .expect("endpoint");

    let mut handles = Vec::new();
    for target in ["/a", "/b", "/c"] {
        let ep = ep.clone();
        handles.push(tokio::spawn(async move {
            let mut ex = ep.exchange(Method::GET, target, ()).expect("exchange");
            let mut response = ex.response().await.expect("response").expect("not reset");
            response.aggregate().await.expect("body")
        }));
        // Deterministic dispatch order.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let bodies: Vec<_> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("join"))
        .collect();
    // FIFO: responses match request order.
    assert_eq!(&bodies[0][..], b"a");
    assert_eq!(&bodies[1][..], b"b");
    assert_eq!(&bodies[2][..], b"c");
    server.await.expect("server");
}

#[tokio::test]
async fn chunked_response_with_trailers() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let _ = server.read_head().await;
        server
            .write(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\nx-digest: abc\r\n\r\n",
            )
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let mut response = ex.response().await.expect("response").expect("not reset");
    let body = response.aggregate().await.expect("body");
    assert_eq!(&body[..], b"hello world");
    let trailers = response.trailers().await.expect("trailers");
    assert_eq!(trailers.get("x-digest").unwrap(), "abc");
}

#[tokio::test]
async fn close_delimited_response_is_not_reused() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        // First connection: close-delimited framing.
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let _ = server.read_head().await;
        server
            .write(b"HTTP/1.1 200 OK\r\n\r\nuntil the end")
            .await;
        drop(server);
        // The client must come back on a fresh connection.
        let (stream, _) = listener.accept().await.expect("second accept");
        let mut server = H1Server::new(stream);
        let _ = server.read_head().await;
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let mut response = ex.response().await.expect("response").expect("not reset");
    let body = response.aggregate().await.expect("body");
    assert_eq!(&body[..], b"until the end");

    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let mut response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(&response.aggregate().await.expect("body")[..], b"ok");
    server.await.expect("server");
}

#[tokio::test]
async fn single_shot_body_carries_content_length() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let head = server.read_head().await;
        assert_eq!(header_value(&head, "content-length"), Some("5"));
        let body = server.read_body(5).await;
        assert_eq!(&body[..], b"inner");
        server
            .write(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::POST, "/upload", ()).expect("exchange");
    ex.request()
        .unwrap()
        .body(|b| {
            b.bytes("inner");
            Ok(())
        })
        .unwrap();
    let response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 204);
    server.await.expect("server");
}

#[tokio::test]
async fn streaming_body_uses_chunked_encoding() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let head = server.read_head().await;
        assert_eq!(header_value(&head, "transfer-encoding"), Some("chunked"));
        assert_eq!(header_value(&head, "content-length"), None);
        let body = server.read_chunked_body().await;
        assert_eq!(&body[..], b"aabbcc");
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::POST, "/upload", ()).expect("exchange");
    let chunks = futures_util::stream::iter(
        ["aa", "bb", "cc"]
            .into_iter()
            .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes()))),
    );
    ex.request()
        .unwrap()
        .body(move |b| {
            b.stream(chunks);
            Ok(())
        })
        .unwrap();
    let response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 200);
    server.await.expect("server");
}

#[tokio::test]
async fn expect_continue_streams_after_interim() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let head = server.read_head().await;
        assert_eq!(header_value(&head, "expect"), Some("100-continue"));
        // No body may arrive before the interim response.
        let early = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            server.read_body(1),
        )
        .await;
        assert!(early.is_err(), "body sent before 100 Continue");
        server.write(b"HTTP/1.1 100 Continue\r\n\r\n").await;
        let body = server.read_body(4).await;
        assert_eq!(&body[..], b"late");
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::POST, "/", ()).expect("exchange");
    ex.request()
        .unwrap()
        .header(
            bora::header::EXPECT,
            bora::HeaderValue::from_static("100-continue"),
        )
        .unwrap()
        .body(|b| {
            b.bytes("late");
            Ok(())
        })
        .unwrap();
    let response = ex.response().await.expect("response").expect("not reset");
    assert_eq!(response.status().as_u16(), 200);
    server.await.expect("server");
}

#[tokio::test]
async fn expectation_failed_fails_the_exchange() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let _ = server.read_head().await;
        server
            .write(b"HTTP/1.1 417 Expectation Failed\r\ncontent-length: 0\r\n\r\n")
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::POST, "/", ()).expect("exchange");
    ex.request()
        .unwrap()
        .header(
            bora::header::EXPECT,
            bora::HeaderValue::from_static("100-continue"),
        )
        .unwrap()
        .body(|b| {
            b.bytes("never sent");
            Ok(())
        })
        .unwrap();
    let err = ex.response().await.expect_err("must fail");
    assert!(err.is_expectation_failed(), "{err:?}");
}

#[tokio::test]
async fn request_timeout_fails_and_closes() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let _ = server.read_head().await;
        // Stall: never respond.
        assert!(server.at_eof().await, "client should close after timeout");
    });

    let config = EndpointConfig::default()
        .with_request_timeout(Some(std::time::Duration::from_millis(50)));
    let ep = endpoint(format!("{addr}"))
        .config(config)
        .build::<()>()
        .expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let err = ex.response().await.expect_err("must time out");
    assert!(err.is_request_timeout(), "{err:?}");
}

#[tokio::test]
async fn user_agent_is_injected_once() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let head = server.read_head().await;
        let agent = header_value(&head, "user-agent").expect("user-agent").to_owned();
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
        agent
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let _ = ex.response().await.expect("response");
    let agent = server.await.expect("server");
    assert!(agent.starts_with("bora/"), "agent: {agent}");
}

#[tokio::test]
async fn mutation_after_send_is_illegal() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut server = H1Server::new(stream);
        let _ = server.read_head().await;
        server
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
    });

    let ep = endpoint(format!("{addr}")).build::<()>().expect("endpoint");
    let mut ex = ep.exchange(Method::GET, "/", ()).expect("exchange");
    let _ = ex.response().await.expect("response");

    let err = ex.request().unwrap().method(Method::POST).unwrap_err();
    assert!(err.is_illegal_state());
    let err = ex.response().await.expect_err("one-shot");
    assert!(err.is_illegal_state());
}
