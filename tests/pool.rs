mod support;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use preq::{dns, Body, Jar, Method, Pool, RedirectMode, RequestSettings, TlsContext};
use support::server::{self, ok_with, Reply};

fn settings() -> RequestSettings {
    RequestSettings::new()
}

async fn wait_for_requests(server: &server::Server, n: usize) {
    while server.requests() < n {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn single_get_fresh_pool() {
    let server = server::scripted(|_req| ok_with("hello", &[]));

    let pool = Pool::builder().limit(4).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let stream = pool
        .ropen(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    let conn = stream.connection().clone();
    assert_eq!(stream.status(), 200);
    assert_eq!(conn.working_requests(), 1);

    let body = stream.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello");

    assert_eq!(pool.active(), 1);
    assert_eq!(conn.working_requests(), 0);
    assert!(conn.is_open());

    // A second request reuses the pooled connection.
    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(pool.active(), 1);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn concurrent_requests_share_connection_under_limit() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let server = server::scripted(move |req| {
        seen_in_handler.lock().unwrap().push(req.target.clone());
        std::thread::sleep(Duration::from_millis(30));
        ok_with(&req.target, &[])
    });

    let pool = Pool::builder().limit(1).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let settings_a = settings();
    let settings_b = settings();
    let (a, b) = tokio::join!(
        pool.request(Method::GET, "/a", Body::empty(), &settings_a),
        pool.request(Method::GET, "/b", Body::empty(), &settings_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.text(), "/a");
    assert_eq!(b.text(), "/b");

    assert_eq!(pool.active(), 1);
    assert_eq!(server.connections(), 1);

    // Both heads arrived intact over the one pipelined connection.
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, ["/a", "/b"]);
}

#[tokio::test]
async fn pool_growth_under_contention_respects_limit() {
    let server = server::scripted(|_req| {
        std::thread::sleep(Duration::from_millis(60));
        ok_with("ok", &[])
    });

    let pool = Pool::builder().limit(3).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let settings_1 = settings();
    let settings_2 = settings();
    let settings_3 = settings();
    let settings_4 = settings();
    let settings_5 = settings();
    let results = tokio::join!(
        pool.request(Method::GET, "/1", Body::empty(), &settings_1),
        pool.request(Method::GET, "/2", Body::empty(), &settings_2),
        pool.request(Method::GET, "/3", Body::empty(), &settings_3),
        pool.request(Method::GET, "/4", Body::empty(), &settings_4),
        pool.request(Method::GET, "/5", Body::empty(), &settings_5),
    );

    for res in [results.0, results.1, results.2, results.3, results.4] {
        assert_eq!(res.unwrap().status(), 200);
    }

    // The strict `< limit` growth rule: never a fourth connection.
    assert_eq!(pool.active(), 3);
    assert_eq!(server.connections(), 3);
}

#[tokio::test]
async fn at_limit_all_busy_shares_min_cost_connection() {
    let server = server::scripted(|_req| {
        std::thread::sleep(Duration::from_millis(150));
        ok_with("slow", &[])
    });

    let pool = Pool::builder().limit(1).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let background = {
        let pool = pool.clone();
        tokio::spawn(
            async move { pool.request(Method::GET, "/slow", Body::empty(), &settings()).await },
        )
    };
    wait_for_requests(&server, 1).await;

    // At the limit with the only connection busy: it is shared, never
    // duplicated.
    let first = pool.get_connection().await.unwrap();
    let second = pool.get_connection().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.working_requests(), 1);
    assert_eq!(pool.active(), 1);

    background.await.unwrap().unwrap();
}

#[tokio::test]
async fn keep_alive_expiry_retires_connection() {
    let server =
        server::scripted(|_req| ok_with("ok", &["Keep-Alive: timeout=1, max=5"]));

    let pool = Pool::builder().limit(2).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(pool.active(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // The expired connection is evicted on the next inspection and a
    // fresh one is created in its place.
    let conn = pool.get_connection().await.unwrap();
    assert!(conn.is_open());
    assert_eq!(pool.active(), 1);
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn keep_alive_max_retires_after_budget() {
    let server =
        server::scripted(|_req| ok_with("ok", &["Keep-Alive: timeout=60, max=1"]));

    let pool = Pool::builder().limit(2).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();

    // max=1 means one exchange per connection.
    assert_eq!(server.connections(), 2);
    assert_eq!(pool.active(), 1);
}

#[tokio::test]
async fn connection_close_retires_connection() {
    let server = server::scripted(|_req| {
        Reply::then_close(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
        )
    });

    let pool = Pool::builder().limit(2).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();

    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn transport_failure_isolates_exchange() {
    let server = server::scripted(|req| {
        if req.target == "/kill" {
            // Claim more body than is ever sent, then drop the socket.
            Reply::then_close("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nnope")
        } else {
            std::thread::sleep(Duration::from_millis(80));
            ok_with("fine", &[])
        }
    });

    let pool = Pool::builder().limit(2).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let settings_slow = settings();
    let settings_kill = settings();
    let (ok, killed) = tokio::join!(
        pool.request(Method::GET, "/slow", Body::empty(), &settings_slow),
        pool.request(Method::GET, "/kill", Body::empty(), &settings_kill),
    );

    assert_eq!(ok.unwrap().text(), "fine");
    let err = killed.unwrap_err();
    assert!(err.is_protocol() || err.is_transport(), "got {err:?}");

    // The surviving connection keeps serving; the broken one is evicted.
    let res = pool
        .request(Method::GET, "/again", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(pool.active(), 1);
}

#[tokio::test]
async fn get_connection_without_lookup_is_not_found() {
    let pool = Pool::new();
    let err = pool.get_connection().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn lookup_is_idempotent() {
    let server = server::scripted(|_req| ok_with("ok", &[]));
    let authority = format!("127.0.0.1:{}", server.addr().port());

    let pool = Pool::builder().limit(2).build();
    pool.lookup(&authority).await.unwrap();
    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();

    pool.lookup(&authority).await.unwrap();
    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();

    // Re-resolving must not duplicate pooled connections.
    assert_eq!(pool.active(), 1);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn lookup_rejects_bad_authority() {
    let pool = Pool::new();
    assert!(pool.lookup("bad/authority").await.unwrap_err().is_builder());
}

#[tokio::test]
async fn chunked_response_is_reassembled() {
    let server = server::scripted(|_req| {
        Reply::new(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.text(), "hello world");

    // Chunked framing delimits the message; the connection stays usable.
    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn streaming_request_body_goes_chunked() {
    let server = server::scripted(|req| {
        assert_eq!(req.header("transfer-encoding"), Some("chunked"));
        let mut reply = Vec::from(
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", req.body.len()).into_bytes(),
        );
        reply.extend_from_slice(&req.body);
        Reply::new(reply)
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let body = Body::from_reader(std::io::Cursor::new(b"streamed".to_vec()));
    let res = pool
        .request(Method::POST, "/echo", body, &settings())
        .await
        .unwrap();
    // The server echoes the raw chunked frames it received.
    assert_eq!(res.text(), "8\r\nstreamed\r\n0\r\n\r\n");
}

#[tokio::test]
async fn eof_delimited_body_consumes_connection() {
    let server = server::scripted(|_req| {
        Reply::then_close("HTTP/1.1 200 OK\r\n\r\nall the bytes until eof")
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.text(), "all the bytes until eof");

    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn in_pool_redirect_is_followed() {
    let server = server::scripted(|req| match req.target.as_str() {
        "/old" => Reply::new(
            "HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n",
        ),
        "/new" => ok_with("moved", &[]),
        other => panic!("unexpected target {other}"),
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let res = pool
        .request(Method::GET, "/old", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text(), "moved");
    assert_eq!(server.requests(), 2);
    // Both hops are served from the same pooled connection.
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn cross_authority_redirect_surfaces_unfollowed() {
    let server = server::scripted(|_req| {
        Reply::new(
            "HTTP/1.1 302 Found\r\nLocation: http://other.invalid/\r\nContent-Length: 0\r\n\r\n",
        )
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(res.status(), 302);
    assert_eq!(server.requests(), 1);
}

#[tokio::test]
async fn redirect_mode_none_returns_redirects() {
    let server = server::scripted(|_req| {
        Reply::new("HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n")
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let res = pool
        .request(
            Method::GET,
            "/old",
            Body::empty(),
            &settings().redirect(RedirectMode::None),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), 302);
    assert_eq!(server.requests(), 1);
}

#[tokio::test]
async fn cookies_round_trip_through_jar() {
    let server = server::scripted(|req| match req.target.as_str() {
        "/login" => ok_with("welcome", &["Set-Cookie: sid=abc123; HttpOnly"]),
        "/me" => {
            let cookie = req.header("cookie").unwrap_or("").to_owned();
            ok_with(&cookie, &[])
        }
        other => panic!("unexpected target {other}"),
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let settings = settings().cookie_store(Jar::new());
    pool.request(Method::GET, "/login", Body::empty(), &settings)
        .await
        .unwrap();
    let res = pool
        .request(Method::GET, "/me", Body::empty(), &settings)
        .await
        .unwrap();
    assert_eq!(res.text(), "sid=abc123");
}

#[tokio::test]
async fn canonical_host_feeds_host_header() {
    let server = server::scripted(|req| ok_with(req.header("host").unwrap_or(""), &[]));
    let addr = server.addr();

    // The resolver maps the application hostname onto the test server.
    struct Static(std::net::SocketAddr);
    impl dns::Resolve for Static {
        fn resolve(&self, _name: dns::Name, _port: u16) -> dns::Resolving {
            let addr = self.0;
            Box::pin(async move {
                Ok(Box::new(std::iter::once(addr)) as dns::Addrs)
            })
        }
    }

    let pool = Pool::builder().resolver(Static(addr)).build();
    pool.lookup("app.internal").await.unwrap();
    assert_eq!(pool.host(), "app.internal");

    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    // The Host header carries the canonical host, not the endpoint's IP.
    assert_eq!(res.text(), "app.internal");
}

#[tokio::test]
async fn tls_pool_refuses_plain_server() {
    let server = server::scripted(|_req| ok_with("never", &[]));

    let pool = Pool::builder()
        .tls(TlsContext::new())
        .connect_timeout(Duration::from_millis(300))
        .build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let err = pool.get_connection().await.unwrap_err();
    assert!(err.is_transport() || err.is_timeout(), "got {err:?}");
    // The failed connection was never inserted.
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn enforce_tls_rejects_plain_pool() {
    let pool = Pool::new();
    let err = pool
        .ropen(
            Method::GET,
            "/",
            Body::empty(),
            &settings().enforce_tls(),
        )
        .await
        .unwrap_err();
    assert!(err.is_builder());
}

#[tokio::test]
async fn release_restores_working_requests() {
    let server = server::scripted(|_req| ok_with("hello", &[]));

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let mut stream = pool
        .ropen(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    let conn = stream.connection().clone();
    assert_eq!(conn.working_requests(), 1);

    stream.drain().await.unwrap();
    assert!(stream.is_complete());
    assert_eq!(conn.working_requests(), 1);

    stream.release();
    assert_eq!(conn.working_requests(), 0);
    assert!(conn.is_open());
}

#[tokio::test]
async fn dropping_unfinished_stream_condemns_connection() {
    let server = server::scripted(|_req| ok_with("a body that will not be read", &[]));

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let stream = pool
        .ropen(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    let conn = stream.connection().clone();
    drop(stream);

    // The wire state is indeterminate: the connection must not be
    // offered again.
    assert!(!conn.is_open());
    pool.request(Method::GET, "/", Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(server.connections(), 2);
    assert_eq!(pool.active(), 1);
}

#[tokio::test]
async fn prebuilt_request_shape() {
    let server = server::scripted(|req| {
        assert_eq!(req.method, "POST");
        assert_eq!(req.header("content-length"), Some("2"));
        ok_with(&String::from_utf8_lossy(&req.body), &[])
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let conn = pool.get_connection().await.unwrap();
    let request = http::Request::builder()
        .method(Method::POST)
        .uri("/submit")
        .body(Body::from(b"hi".to_vec()))
        .unwrap();
    let stream = conn
        .ropen_request(request, &preq::RequestOptions::default(), None)
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    assert_eq!(stream.bytes().await.unwrap().as_ref(), b"hi");
}

#[tokio::test]
async fn connection_ropen_accepts_url_strings() {
    let server = server::scripted(|req| {
        // An empty body still gets its framing header.
        assert_eq!(req.header("content-length"), Some("0"));
        ok_with(&req.target, &[])
    });

    let pool = Pool::new();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let conn = pool.get_connection().await.unwrap();
    let url = format!("http://127.0.0.1:{}/by-string", server.addr().port());
    let stream = conn
        .ropen(Method::GET, url.as_str(), Body::empty(), &settings())
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    assert_eq!(stream.text().await.unwrap(), "/by-string");
}

#[tokio::test]
async fn explicit_close_is_observed_by_pool() {
    let server = server::scripted(|_req| ok_with("ok", &[]));

    let pool = Pool::builder().limit(2).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .await
        .unwrap();

    let conn = pool.get_connection().await.unwrap();
    assert!(conn.is_open());
    assert!(conn.endpoint().is_some());
    conn.close().await.unwrap();
    assert!(!conn.is_open());

    // The closed connection is evicted and replaced on the next query.
    let replacement = pool.get_connection().await.unwrap();
    assert!(replacement.is_open());
    assert!(!Arc::ptr_eq(&conn, &replacement));
    assert_eq!(pool.active(), 1);
}

#[test]
fn blocking_pool_round_trip() {
    let server = server::scripted(|req| match req.target.as_str() {
        "/" => ok_with("blocking hello", &[]),
        "/chunks" => Reply::new(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n",
        ),
        other => panic!("unexpected target {other}"),
    });

    let pool = preq::blocking::Pool::builder().limit(2).build();
    pool.lookup(&format!("127.0.0.1:{}", server.addr().port()))
        .unwrap();

    let res = pool
        .request(Method::GET, "/", Body::empty(), &settings())
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text(), "blocking hello");

    let mut stream = pool
        .ropen(Method::GET, "/chunks", Body::empty(), &settings())
        .unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.chunk().unwrap() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(&collected[..], b"abcdef");

    let conn = pool.get_connection().unwrap();
    assert!(conn.is_open());
    assert_eq!(conn.working_requests(), 0);

    assert_eq!(pool.active(), 1);
    assert_eq!(server.connections(), 1);
}
