//! A scripted HTTP/1.1 test server over raw sockets.
//!
//! The client crate under test *is* the HTTP implementation, so the
//! server side is kept dependency-free: std sockets, one thread per
//! connection, handler-provided response bytes.

#![allow(unused)]

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

pub struct Server {
    addr: SocketAddr,
    state: Arc<State>,
}

struct State {
    connections: AtomicUsize,
    requests: AtomicUsize,
    shutdown: AtomicBool,
}

/// One parsed request as the server saw it on the wire.
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What the handler wants written back.
pub struct Reply {
    pub bytes: Vec<u8>,
    pub close: bool,
}

impl Reply {
    /// Write `bytes`, keep the connection for the next request.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Reply {
        Reply {
            bytes: bytes.into(),
            close: false,
        }
    }

    /// Write `bytes`, then drop the connection.
    pub fn then_close(bytes: impl Into<Vec<u8>>) -> Reply {
        Reply {
            bytes: bytes.into(),
            close: true,
        }
    }
}

/// A plain 200 with a `Content-Length` body and the given extra header
/// lines (each already `\r\n`-free).
pub fn ok_with(body: &str, extra_headers: &[&str]) -> Reply {
    let mut head = String::from("HTTP/1.1 200 OK\r\n");
    for line in extra_headers {
        head.push_str(line);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    Reply::new(format!("{head}{body}"))
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn authority(&self) -> String {
        format!("localhost:{}", self.addr.port())
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Requests served so far.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop.
        let _ = TcpStream::connect(self.addr);
    }
}

/// Spawns a server that answers every request through `handler`.
pub fn scripted<F>(handler: F) -> Server
where
    F: Fn(&Request) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    let state = Arc::new(State {
        connections: AtomicUsize::new(0),
        requests: AtomicUsize::new(0),
        shutdown: AtomicBool::new(false),
    });
    let handler = Arc::new(handler);

    let accept_state = state.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            if accept_state.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let Ok(stream) = stream else { continue };
            accept_state.connections.fetch_add(1, Ordering::SeqCst);
            let state = accept_state.clone();
            let handler = handler.clone();
            thread::spawn(move || serve_connection(stream, state, handler));
        }
    });

    Server { addr, state }
}

fn serve_connection<F>(mut stream: TcpStream, state: Arc<State>, handler: Arc<F>)
where
    F: Fn(&Request) -> Reply + Send + Sync + 'static,
{
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let Some(request) = read_request(&mut stream, &mut buf) else {
            return;
        };
        state.requests.fetch_add(1, Ordering::SeqCst);

        let reply = handler(&request);
        if stream.write_all(&reply.bytes).is_err() {
            return;
        }
        let _ = stream.flush();
        if reply.close {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}

/// Reads one request (head + body) from the stream, keeping pipelined
/// leftovers in `buf` for the next call.
fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Request> {
    let head_end = loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if !read_more(stream, buf) {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_owned();
    let target = parts.next()?.to_owned();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.contains("chunked"));

    let body_end = if let Some(len) = content_length {
        while buf.len() < head_end + len {
            if !read_more(stream, buf) {
                return None;
            }
        }
        head_end + len
    } else if chunked {
        loop {
            if let Some(pos) = find(&buf[head_end..], b"0\r\n\r\n") {
                break head_end + pos + 5;
            }
            if !read_more(stream, buf) {
                return None;
            }
        }
    } else {
        head_end
    };

    let body = buf[head_end..body_end].to_vec();
    buf.drain(..body_end);

    Some(Request {
        method,
        target,
        headers,
        body,
    })
}

fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match stream.read(&mut chunk) {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
