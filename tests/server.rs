
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_h1_conn::server::{
    ConnectionStatus, RequestHead, Responder, ServerOptions, Stage, Streaming,
};
use async_h1_conn::{Clock, ConnInfo, Error};
use async_std::task;
use futures_lite::future;
use http_types::{Request, Response, StatusCode};
use pretty_assertions::assert_eq;
use test_utils::{responses, serve, status_line, TestServer, SHORT};

async fn hello(_req: Request, res: Responder) -> http_types::Result<()> {
    let mut response = Response::new(StatusCode::Ok);
    response.set_body("hello world");
    res.respond(response).await
}

const GET: &str = "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

/// A chunked POST carrying `n` pieces of `hello`.
fn chunked_hellos(n: usize) -> String {
    let mut input = String::from("POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
    for _ in 0..n {
        input.push_str("5\r\nhello\r\n");
    }
    input.push_str("0\r\n\r\n");
    input
}

#[async_std::test]
async fn content_length_matches_the_body() {
    let output = serve(hello, ServerOptions::default(), GET).await;
    let responses = responses(&output);
    assert_eq!(responses.len(), 1);
    let (head, body) = &responses[0];
    assert_eq!(status_line(head), "HTTP/1.1 200 OK");
    assert!(head.contains("content-length: 11\r\n"));
    assert!(head.contains("connection: keep-alive\r\n"));
    assert_eq!(body, "hello world");
    assert!(output.ends_with("\r\n\r\nhello world"));
}

#[async_std::test]
async fn keep_alive_requests_start_fresh() {
    let echo = |mut req: Request, res: Responder| async move {
        let info = *req.ext().get::<ConnInfo>().unwrap();
        let body = req.body_string().await?;
        let marker = req.header("x-marker").map(|v| v.as_str().to_owned());
        let mut response = Response::new(StatusCode::Ok);
        response.set_body(format!(
            "#{} marker={:?} body={:?}",
            info.request_count(),
            marker,
            body
        ));
        res.respond(response).await
    };

    let mut server = TestServer::new(echo);
    server
        .write("POST /a HTTP/1.1\r\nHost: x\r\nX-Marker: first\r\nContent-Length: 3\r\n\r\nabc")
        .await;
    assert_eq!(server.accept_one().await, ConnectionStatus::KeepAlive);
    assert_eq!(server.server().stage(), Stage::Idle);

    server.write("GET /b HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(server.accept_one().await, ConnectionStatus::KeepAlive);

    let output = server.output();
    let bodies: Vec<_> = responses(&output).into_iter().map(|(_, b)| b).collect();
    assert_eq!(
        bodies,
        vec![
            r#"#1 marker=Some("first") body="abc""#.to_owned(),
            r#"#2 marker=None body="""#.to_owned(),
        ]
    );
}

#[async_std::test]
async fn pipelined_responses_keep_request_order() {
    let active = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));

    let handler = {
        let active = active.clone();
        let most = most.clone();
        move |req: Request, res: Responder| {
            let active = active.clone();
            let most = most.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                most.fetch_max(now, Ordering::SeqCst);
                let delay = if req.url().path() == "/slow" { 100 } else { 10 };
                task::sleep(Duration::from_millis(delay)).await;
                active.fetch_sub(1, Ordering::SeqCst);

                let mut response = Response::new(StatusCode::Ok);
                response.set_body(req.url().path().to_owned());
                res.respond(response).await
            }
        }
    };

    let input = "GET /slow HTTP/1.1\r\nHost: x\r\n\r\nGET /fast HTTP/1.1\r\nHost: x\r\n\r\n";
    let output = serve(handler, ServerOptions::default(), input).await;
    let bodies: Vec<_> = responses(&output).into_iter().map(|(_, b)| b).collect();
    assert_eq!(bodies, vec!["/slow".to_owned(), "/fast".to_owned()]);
    assert_eq!(most.load(Ordering::SeqCst), 1);
}

#[async_std::test]
async fn slow_handler_gets_503() {
    let slow = |_req: Request, res: Responder| async move {
        task::sleep(Duration::from_secs(2)).await;
        res.respond(Response::new(StatusCode::Ok)).await
    };
    let opts = ServerOptions::new().with_response_timeout(Some(Duration::from_secs(1)));

    let mut server = TestServer::with_options(slow, opts);
    server.write(GET).await;
    let start = Instant::now();
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_millis(1900), "took {:?}", elapsed);
    let output = server.output();
    assert!(output.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert!(output.contains("connection: close\r\n"));
    assert!(server.server_closed());
    assert_eq!(server.server().stage(), Stage::Closed);
}

#[async_std::test]
async fn idle_connection_closes_without_a_word() {
    let opts = ServerOptions::new().with_keep_alive_timeout(Some(SHORT));
    let mut server = TestServer::with_options(hello, opts);

    let start = Instant::now();
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    assert!(start.elapsed() >= SHORT - Duration::from_millis(50));
    assert_eq!(server.output(), "");
    assert!(server.server_closed());
}

#[async_std::test]
async fn stalled_body_gets_408() {
    let opts = ServerOptions::new().with_request_timeout(Some(SHORT));
    let mut server = TestServer::with_options(hello, opts);
    server
        .write("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n12345")
        .await;

    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    let output = server.output();
    assert!(output.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    assert!(server.server_closed());
}

#[async_std::test]
async fn manual_clock_drives_the_request_timeout() {
    let clock = Clock::manual();
    let opts = ServerOptions::new()
        .with_request_timeout(Some(Duration::from_secs(60)))
        .with_check_interval(Duration::from_millis(10));
    let mut server = TestServer::with_options(hello, opts).with_clock(clock.clone());
    server.write("GET / HTTP/1.1\r\nHost: x\r\n").await;

    let advance = async {
        task::sleep(Duration::from_millis(50)).await;
        clock.advance(Duration::from_secs(61));
        future::pending::<ConnectionStatus>().await
    };
    let start = Instant::now();
    let status = future::or(server.accept_one(), advance).await;
    assert_eq!(status, ConnectionStatus::Close);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(server.output().starts_with("HTTP/1.1 408 "));
}

#[async_std::test]
async fn streaming_body_applies_backpressure() {
    let reader = Streaming(|mut req: Request, res: Responder| async move {
        // Let the body pile up first.
        task::sleep(Duration::from_millis(50)).await;
        let body = req.body_bytes().await?;

        let mut response = Response::new(StatusCode::Ok);
        response.set_body(body.len().to_string());
        res.respond(response).await
    });
    let opts = ServerOptions::new().with_stream_capacity(2);
    let mut server = TestServer::with_options(reader, opts);
    server.write(&chunked_hellos(10)).await;
    server.close();
    server.accept().await;

    let output = server.output();
    let responses = responses(&output);
    assert_eq!(responses[0].1, "50");
    let flow = &server.server_io().flow;
    assert!(flow.pauses() >= 1);
    assert_eq!(flow.pauses(), flow.resumes());
}

#[async_std::test]
async fn streamed_response_is_chunked_and_ended() {
    let streamer = |_req: Request, res: Responder| async move {
        let mut stream = res.stream(Response::new(StatusCode::Ok)).await?;
        stream.write("hello").await?;
        stream.write(" world").await?;
        // no end(): the server finishes the body once the handler returns
        Ok::<(), http_types::Error>(())
    };
    let output = serve(streamer, ServerOptions::default(), GET).await;
    assert!(output.contains("transfer-encoding: chunked\r\n"));
    assert!(output.ends_with("\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"));
}

#[async_std::test]
async fn length_delimited_stream() {
    let streamer = |_req: Request, res: Responder| async move {
        let mut response = Response::new(StatusCode::Ok);
        response.insert_header("content-length", "6");
        let mut stream = res.stream(response).await?;
        stream.write("abc").await?;
        stream.write("def").await?;
        stream.end().await
    };
    let output = serve(streamer, ServerOptions::default(), GET).await;
    let responses = responses(&output);
    assert!(responses[0].0.contains("content-length: 6\r\n"));
    assert!(!responses[0].0.contains("transfer-encoding"));
    assert_eq!(responses[0].1, "abcdef");
}

#[async_std::test]
async fn handler_errors_go_through_the_error_handler() {
    let failing = |req: Request, res: Responder| async move {
        if req.url().path() == "/fail" {
            return Err(http_types::Error::from_str(StatusCode::ImATeapot, "short and stout"));
        }
        res.respond(Response::new(StatusCode::Ok)).await
    };
    let on_error = |_head: Option<RequestHead>, err: Error| async move {
        let mut res = Response::new(err.status());
        res.set_body(format!("handled: {}", err));
        Ok::<_, http_types::Error>(res)
    };

    let mut server = TestServer::new(failing).map_server(|s| s.with_error_handler(on_error));
    server.write("GET /fail HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(server.accept_one().await, ConnectionStatus::KeepAlive);
    server.write(GET).await;
    assert_eq!(server.accept_one().await, ConnectionStatus::KeepAlive);

    let output = server.output();
    let responses = responses(&output);
    assert_eq!(status_line(&responses[0].0), "HTTP/1.1 418 I'm a teapot");
    assert_eq!(responses[0].1, "handled: handler error: short and stout");
    assert_eq!(status_line(&responses[1].0), "HTTP/1.1 200 OK");
}

#[async_std::test]
async fn panicking_handler_gets_500() {
    let panicking = |_req: Request, _res: Responder| async move {
        if true {
            panic!("boom");
        }
        Ok::<(), http_types::Error>(())
    };
    let output = serve(panicking, ServerOptions::default(), GET).await;
    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
}

#[async_std::test]
async fn handler_without_a_response_gets_500() {
    let silent = |_req: Request, _res: Responder| async move { Ok::<(), http_types::Error>(()) };
    let output = serve(silent, ServerOptions::default(), GET).await;
    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
}

#[async_std::test]
async fn failing_error_handler_falls_back() {
    let failing = |_req: Request, _res: Responder| async move {
        Err::<(), _>(http_types::Error::from_str(StatusCode::BadGateway, "upstream"))
    };
    let broken = |_head: Option<RequestHead>, _err: Error| async move {
        Err::<Response, _>(http_types::Error::from_str(StatusCode::InternalServerError, "broken"))
    };
    let mut server = TestServer::new(failing).map_server(|s| s.with_error_handler(broken));
    server.write(GET).await;
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);

    let output = server.output();
    let responses = responses(&output);
    assert_eq!(status_line(&responses[0].0), "HTTP/1.1 500 Internal Server Error");
    assert_eq!(responses[0].1, "An error occurred while handling an error");
}

#[async_std::test]
async fn malformed_request_gets_400_and_closes() {
    let output = serve(hello, ServerOptions::default(), "GET / HTTP/1.1\r\nBad Header\r\n\r\n").await;
    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(output.contains("connection: close\r\n"));
}

#[async_std::test]
async fn bad_chunked_body_gets_400() {
    let input = "POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
    let output = serve(hello, ServerOptions::default(), input).await;
    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[async_std::test]
async fn oversized_body_gets_413_before_it_arrives() {
    let opts = ServerOptions::new().with_request_max_size(4);
    let mut server = TestServer::with_options(hello, opts);
    server
        .write("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n")
        .await;
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    assert!(server.output().starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
}

#[async_std::test]
async fn oversized_chunked_body_gets_413() {
    let opts = ServerOptions::new().with_request_max_size(4);
    let input = "POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    let output = serve(hello, opts, input).await;
    assert!(output.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
}

#[async_std::test]
async fn oversized_head_gets_413() {
    let opts = ServerOptions::new().with_max_head_length(64);
    let input = format!("GET / HTTP/1.1\r\nHost: x\r\nX-Big: {}\r\n\r\n", "a".repeat(100));
    let output = serve(hello, opts, &input).await;
    assert!(output.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
}

#[async_std::test]
async fn http_1_0_closes_by_default() {
    let output = serve(hello, ServerOptions::default(), "GET / HTTP/1.0\r\n\r\n").await;
    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(output.contains("connection: close\r\n"));
}

#[async_std::test]
async fn keep_alive_can_be_disabled() {
    let opts = ServerOptions::new().with_keep_alive(false);
    let mut server = TestServer::with_options(hello, opts);
    server.write(GET).await;
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    assert!(server.output().contains("connection: close\r\n"));
}

#[async_std::test]
async fn head_request_gets_no_body() {
    let output = serve(
        hello,
        ServerOptions::default(),
        "HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(output.contains("content-length: 11\r\n"));
    assert!(output.ends_with("\r\n\r\n"));
}

#[async_std::test]
async fn connections_leave_the_registry_when_closed() {
    let mut server = TestServer::new(hello);
    server.write(GET).await;
    assert_eq!(server.accept_one().await, ConnectionStatus::KeepAlive);
    assert_eq!(server.registry().len(), 1);
    assert_eq!(server.server().info().request_count(), 1);

    server.close();
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    assert!(server.registry().is_empty());
}

#[async_std::test]
async fn shutdown_closes_idle_connections() {
    let opts = ServerOptions::new()
        .with_keep_alive_timeout(Some(Duration::from_secs(60)))
        .with_check_interval(Duration::from_millis(10));
    let mut server = TestServer::with_options(hello, opts);
    server.write(GET).await;
    assert_eq!(server.accept_one().await, ConnectionStatus::KeepAlive);

    server.registry().shutdown();
    let start = Instant::now();
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(server.server_closed());
}

#[async_std::test]
async fn shutdown_negotiates_close() {
    let mut server = TestServer::new(hello);
    server.registry().shutdown();
    server.write(GET).await;
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    assert!(server.output().contains("connection: close\r\n"));
}

#[async_std::test]
async fn peer_eof_closes_an_idle_connection_at_once() {
    let mut server = TestServer::new(hello);
    server.write(GET).await;
    server.close();

    let start = Instant::now();
    server.accept().await;
    // well before the keep-alive timeout
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(responses(&server.output()).len(), 1);
    assert!(server.server_closed());
    assert!(server.registry().is_empty());
}

#[async_std::test]
async fn response_can_echo_a_streaming_body() {
    let echo = Streaming(|mut req: Request, res: Responder| async move {
        let mut response = Response::new(StatusCode::Ok);
        response.set_body(req.take_body());
        res.respond(response).await
    });
    let opts = ServerOptions::new()
        .with_stream_capacity(1)
        .with_request_timeout(Some(SHORT))
        .with_response_timeout(Some(SHORT));

    let start = Instant::now();
    let output = serve(echo, opts, &chunked_hellos(10)).await;
    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());

    let responses = responses(&output);
    assert_eq!(responses.len(), 1);
    assert_eq!(status_line(&responses[0].0), "HTTP/1.1 200 OK");
    assert!(responses[0].0.contains("content-length: 50\r\n"));
    assert_eq!(responses[0].1, "hello".repeat(10));
}

#[async_std::test]
async fn stalled_stream_is_cut_off() {
    let stalling = |_req: Request, res: Responder| async move {
        let mut stream = res.stream(Response::new(StatusCode::Ok)).await?;
        stream.write("partial").await?;
        future::pending::<()>().await;
        stream.end().await
    };
    let opts = ServerOptions::new().with_response_timeout(Some(SHORT));
    let mut server = TestServer::with_options(stalling, opts);
    server.write(GET).await;

    let start = Instant::now();
    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    let elapsed = start.elapsed();
    assert!(elapsed >= SHORT - Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

    let output = server.output();
    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(output.ends_with("7\r\npartial\r\n"));
    assert!(!output.contains(" 503 "));
    assert!(server.server_closed());
    assert_eq!(server.server().stage(), Stage::Closed);
}

#[async_std::test]
async fn vanished_peer_gets_no_response() {
    let slow = |_req: Request, res: Responder| async move {
        task::sleep(Duration::from_millis(100)).await;
        res.respond(Response::new(StatusCode::Ok)).await
    };
    let mut server = TestServer::new(slow);
    let client = server.client();
    server.write(GET).await;

    let hang_up = async {
        task::sleep(Duration::from_millis(20)).await;
        client.hang_up();
    };
    let (status, ()) = future::zip(server.accept_one(), hang_up).await;
    assert_eq!(status, ConnectionStatus::Close);
    assert_eq!(server.output(), "");
    assert_eq!(server.server().stage(), Stage::Closed);
    assert!(server.registry().is_empty());
}

#[async_std::test]
async fn response_timeout_releases_a_paused_body() {
    let hoarding = Streaming(|req: Request, res: Responder| async move {
        let _held = (req, res);
        future::pending::<()>().await;
        Ok::<(), http_types::Error>(())
    });
    let opts = ServerOptions::new()
        .with_stream_capacity(1)
        .with_response_timeout(Some(SHORT));
    let mut server = TestServer::with_options(hoarding, opts);
    server.write(&chunked_hellos(10)).await;

    assert_eq!(server.accept_one().await, ConnectionStatus::Close);
    let output = server.output();
    assert!(output.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert_eq!(output.matches("HTTP/1.1 ").count(), 1);

    let flow = &server.server_io().flow;
    assert!(flow.pauses() >= 1);
    assert_eq!(flow.pauses(), flow.resumes());
    assert!(server.server_closed());
}
