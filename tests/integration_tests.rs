//! End-to-end tests over real sockets.

mod common;

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use common::*;

#[test]
fn serves_static_files() {
    let server = TestServer::start();
    let reply = parse_reply(&server.get("/hello.txt"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.header("Content-Type"), Some("text/plain; charset=utf-8"));
    assert_eq!(reply.header("Content-Length"), Some("11"));
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_eq!(reply.text(), "hello world");

    let reply = parse_reply(&server.get("/"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.text(), "<h1>site a</h1>");
}

#[test]
fn missing_file_uses_configured_error_page() {
    let server = TestServer::start();
    let reply = parse_reply(&server.get("/nope.html"));
    assert_eq!(reply.status(), 404);
    assert_eq!(reply.text(), "custom not found");
}

#[test]
fn head_omits_body() {
    let server = TestServer::start();
    let raw = server.exchange("HEAD /hello.txt HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n");
    let reply = parse_reply(&raw);
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.header("Content-Length"), Some("11"));
    assert!(reply.body.is_empty());
}

#[test]
fn host_header_selects_virtual_host() {
    let server = TestServer::start();
    let raw = server.exchange("GET / HTTP/1.1\r\nHost: b.example:8080\r\nConnection: close\r\n\r\n");
    assert_eq!(parse_reply(&raw).text(), "<h1>site b</h1>");

    let raw = server.exchange("GET / HTTP/1.1\r\nHost: unknown.example\r\nConnection: close\r\n\r\n");
    assert_eq!(parse_reply(&raw).text(), "<h1>site a</h1>");
}

#[test]
fn keep_alive_responses_follow_request_order() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream.write_all(b"GET /hello.txt HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
    let first = read_reply(&mut stream);
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(first.text(), "hello world");

    stream.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut stream).text(), "<h1>site a</h1>");

    // Pipelined: both requests in one write.
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\nGET /hello.txt HTTP/1.1\r\nHost: a.example\r\n\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut stream).text(), "<h1>site a</h1>");
    assert_eq!(read_reply(&mut stream).text(), "hello world");
}

#[test]
fn cgi_script_output_becomes_response() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /cgi-bin/hello.sh HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.header("Content-Type"), Some("text/plain"));
    assert_eq!(reply.text(), "hello\n");

    // The connection survives a buffered CGI response.
    stream.write_all(b"GET /hello.txt HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut stream).text(), "hello world");
}

#[test]
fn cgi_environment_carries_request_details() {
    let server = TestServer::start();
    let raw = server.exchange(
        "GET /cgi-bin/env.sh/extra/bits?x=1&y=2 HTTP/1.1\r\nHost: a.example\r\nX-Test: yes\r\nConnection: close\r\n\r\n",
    );
    let body = parse_reply(&raw).text();
    assert!(body.contains("method=GET\n"), "{body}");
    assert!(body.contains("query=x=1&y=2\n"), "{body}");
    assert!(body.contains("script=/cgi-bin/env.sh\n"), "{body}");
    assert!(body.contains("path_info=/extra/bits\n"), "{body}");
    assert!(body.contains("header=yes\n"), "{body}");
}

#[test]
fn cgi_status_and_length_are_forwarded() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /cgi-bin/status.sh HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status(), 201);
    assert_eq!(reply.header("Content-Length"), Some("4"));
    assert_eq!(reply.text(), "done");
}

#[test]
fn chunked_body_reaches_cgi_stdin() {
    let server = TestServer::start();
    let raw = server.exchange(
        "POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: a.example\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
         4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    let reply = parse_reply(&raw);
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.text(), "Wikipedia");
}

#[test]
fn slow_reader_pauses_script_without_losing_output() {
    const LEN: usize = 4 * 1024 * 1024;
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /cgi-bin/big.sh HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n")
        .unwrap();

    // Nothing is read yet, so the script must be held back on its pipe.
    std::thread::sleep(Duration::from_millis(100));
    assert!(!server.root().join("cgi-bin/big.done").exists());

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let reply = parse_reply(&String::from_utf8_lossy(&raw[..split]));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.header("Connection"), Some("close"));
    let body = &raw[split..];
    assert_eq!(body.len(), LEN);
    assert!(body.iter().all(|&b| b == b'x'));
}

#[test]
fn many_small_chunks_within_limit_are_accepted() {
    let server = TestServer::start();
    let mut request = b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: a.example\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
    // 64 body bytes, the host limit, carried in well over 100 KiB of framing.
    let chunk = format!("1;pad={}\r\nx\r\n", "p".repeat(2000));
    for _ in 0..64 {
        request.extend_from_slice(chunk.as_bytes());
    }
    request.extend_from_slice(b"0\r\n\r\n");

    let mut stream = server.connect();
    stream.write_all(&request).unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let reply = parse_reply(&String::from_utf8_lossy(&raw));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.text(), "x".repeat(64));
}

#[test]
fn failing_script_is_bad_gateway() {
    let server = TestServer::start();
    let reply = parse_reply(&server.get("/cgi-bin/fail.sh"));
    assert_eq!(reply.status(), 502);
}

#[test]
fn slow_script_times_out_and_is_reaped() {
    let server = TestServer::start();
    let started = Instant::now();
    let reply = parse_reply(&server.get("/cgi-bin/slow.sh"));
    assert_eq!(reply.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(5));

    let pid_file = server.root().join("cgi-bin/slow.pid");
    let pid: libc::pid_t = std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        if !alive {
            break;
        }
        assert!(Instant::now() < deadline, "script {pid} still running");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn idle_connections_are_closed() {
    let server = TestServer::start();
    let mut stream = server.connect();
    let started = Instant::now();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[test]
fn traversal_is_forbidden() {
    let server = TestServer::start();
    assert_eq!(parse_reply(&server.get("/../../etc/passwd")).status(), 403);
    assert_eq!(parse_reply(&server.get("/%2e%2e/etc/passwd")).status(), 403);
}

#[test]
fn disallowed_method_lists_allowed_ones() {
    let server = TestServer::start();
    let raw = server.exchange("POST /hello.txt HTTP/1.1\r\nHost: a.example\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    let reply = parse_reply(&raw);
    assert_eq!(reply.status(), 405);
    assert_eq!(reply.header("Allow"), Some("GET, HEAD, DELETE"));
}

#[test]
fn exact_redirect() {
    let server = TestServer::start();
    let reply = parse_reply(&server.get("/old"));
    assert_eq!(reply.status(), 301);
    assert_eq!(reply.header("Location"), Some("/hello.txt"));
}

#[test]
fn oversized_body_is_rejected() {
    let server = TestServer::start();
    let raw = server.exchange("POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: a.example\r\nContent-Length: 1000\r\n\r\n");
    let reply = parse_reply(&raw);
    assert_eq!(reply.status(), 413);
    assert_eq!(reply.header("Connection"), Some("close"));
}

#[test]
fn malformed_request_is_bad_request() {
    let server = TestServer::start();
    let raw = server.exchange("GET /hello.txt HTTP/1.1\r\nHost a.example\r\n\r\n");
    assert_eq!(parse_reply(&raw).status(), 400);
}

#[test]
fn delete_removes_file() {
    let server = TestServer::start();
    let target = server.root().join("delete-me.txt");
    assert!(target.exists());
    let raw = server.exchange("DELETE /delete-me.txt HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n");
    assert_eq!(parse_reply(&raw).status(), 204);
    assert!(!target.exists());
}

#[test]
fn shutdown_drains_and_stops() {
    let server = TestServer::start();
    let mut idle = server.connect();
    idle.write_all(b"GET /hello.txt HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut idle).status(), 200);
    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
    let mut buf = [0u8; 8];
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
}
