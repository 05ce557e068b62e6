//! A pooled HTTP/1.1 connection and the per-exchange request engine.
//!
//! One [`Connection`] owns one transport, split into a read half and a
//! write half behind independent cooperative mutexes. An exchange takes
//! the write lock, serializes its request, then takes the read lock
//! *before* releasing the write lock, so a pipelined successor can start
//! writing while this response is still being read and responses are
//! always claimed in write order. The read lock travels into the
//! returned [`ResponseStream`] together with the parser scratch, and
//! comes back when the stream is released.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, SET_COOKIE, TRANSFER_ENCODING},
    HeaderMap, HeaderValue, Method, StatusCode, Version,
};
use log::{debug, trace};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, OwnedMutexGuard},
};
use url::Url;

use crate::{
    keep_alive::KeepAlive,
    proto::{self, Decoded, Decoder, ProtocolViolation, ResponseHead},
    request::{RequestOptions, RequestSettings},
    sync,
    transport::{self, Endpoint, MaybeTls, TlsContext},
    Body, CookieStore, Error, IntoUrl,
};

/// A single reusable transport connection to one endpoint.
///
/// Shared between the pool and any outstanding [`ResponseStream`]s via
/// `Arc`; dropping the pool does not invalidate in-flight streams.
pub struct Connection {
    host: sync::RwLock<String>,
    endpoint: sync::Mutex<Option<Endpoint>>,
    open: AtomicBool,
    ongoing_requests: AtomicUsize,
    keep_alive: sync::Mutex<KeepAlive>,
    read: Arc<Mutex<ReadState>>,
    write: Mutex<Option<WriteHalf<MaybeTls>>>,
    tls: Option<TlsContext>,
    connect_timeout: Option<Duration>,
}

/// Read half plus the buffered parser scratch, guarded as one unit.
struct ReadState {
    io: Option<ReadHalf<MaybeTls>>,
    buf: BytesMut,
}

impl Connection {
    pub(crate) fn new(tls: Option<TlsContext>, connect_timeout: Option<Duration>) -> Connection {
        Connection {
            host: sync::RwLock::new(String::new()),
            endpoint: sync::Mutex::new(None),
            open: AtomicBool::new(false),
            ongoing_requests: AtomicUsize::new(0),
            keep_alive: sync::Mutex::new(KeepAlive::default()),
            read: Arc::new(Mutex::new(ReadState {
                io: None,
                buf: BytesMut::new(),
            })),
            write: Mutex::new(None),
            tls,
            connect_timeout,
        }
    }

    /// Sets the canonical host used for SNI and the `Host` header.
    /// Immutable once the connection is open.
    pub fn set_host(&self, host: &str) -> crate::Result<()> {
        if host.is_empty()
            || host
                .bytes()
                .any(|b| b.is_ascii_whitespace() || b.is_ascii_control() || b == b'/')
        {
            return Err(Error::builder(ProtocolViolation("invalid host name")));
        }
        if self.is_open() {
            return Err(Error::builder(ProtocolViolation(
                "host is immutable while connected",
            )));
        }
        *self.host.write() = host.to_owned();
        Ok(())
    }

    /// The canonical host this connection speaks for.
    pub fn host(&self) -> String {
        self.host.read().clone()
    }

    /// Opens the transport to `endpoint`, performing the TLS handshake
    /// when this connection belongs to a TLS pool.
    pub async fn connect(&self, endpoint: Endpoint) -> crate::Result<()> {
        let mut write = self.write.lock().await;
        let mut read = self.read.lock().await;

        if self.open.load(Ordering::SeqCst) {
            return Err(Error::builder(ProtocolViolation("already connected")));
        }

        let host = self.host();
        let io = MaybeTls::connect(endpoint, &host, self.tls.as_ref(), self.connect_timeout).await?;
        let (r, w) = tokio::io::split(io);

        read.io = Some(r);
        read.buf.clear();
        *write = Some(w);
        *self.endpoint.lock() = Some(endpoint);
        *self.keep_alive.lock() = KeepAlive::default();
        self.open.store(true, Ordering::SeqCst);
        debug!("connected to {endpoint} ({host})");
        Ok(())
    }

    /// Gracefully shuts the connection down.
    pub async fn close(&self) -> crate::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let mut write = self.write.lock().await;
        let result = match write.take() {
            Some(mut w) => transport::shutdown(&mut w).await,
            None => Ok(()),
        };
        // The read half may be pinned under an outstanding stream; it is
        // torn down when that stream releases.
        if let Ok(mut read) = self.read.try_lock() {
            read.io = None;
            read.buf = BytesMut::new();
        }
        result
    }

    /// Marks the connection unusable without waiting for the transport.
    /// The pool tears it down on its next inspection.
    pub(crate) fn mark_broken(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Whether the underlying transport is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The endpoint this connection is bound to, once connected.
    pub fn endpoint(&self) -> Option<Endpoint> {
        *self.endpoint.lock()
    }

    /// The keep-alive deadline after which the connection is retired.
    pub fn timeout(&self) -> Option<Instant> {
        self.keep_alive.lock().expiry
    }

    /// The number of exchanges currently in flight on this connection.
    pub fn working_requests(&self) -> usize {
        self.ongoing_requests.load(Ordering::SeqCst)
    }

    /// Grows the parser scratch buffer.
    pub async fn reserve(&self, additional: usize) {
        self.read.lock().await.buf.reserve(additional);
    }

    /// Load-balancing cost: in-flight exchanges, plus a penalty for a
    /// closed transport.
    pub(crate) fn cost(&self) -> usize {
        self.working_requests() + usize::from(!self.is_open())
    }

    /// Whether the pool may hand out new exchanges on this connection.
    pub(crate) fn usable(&self, now: Instant) -> bool {
        if !self.is_open() {
            return false;
        }
        let keep_alive = self.keep_alive.lock();
        !keep_alive.expired(now) && !keep_alive.exhausted()
    }

    /// Opens one request exchange and returns the response with its head
    /// read and its body pending.
    pub async fn ropen(
        self: &Arc<Self>,
        method: Method,
        url: impl IntoUrl,
        body: Body,
        settings: &RequestSettings,
    ) -> crate::Result<ResponseStream> {
        let url = url.into_url()?;
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        self.exchange(
            method,
            &target,
            settings.headers.clone(),
            body,
            &settings.options,
            settings.jar.as_deref(),
            Some(&url),
        )
        .await
    }

    /// Opens an exchange from a prebuilt request head.
    pub async fn ropen_request(
        self: &Arc<Self>,
        request: http::Request<Body>,
        options: &RequestOptions,
        jar: Option<&dyn CookieStore>,
    ) -> crate::Result<ResponseStream> {
        let (parts, body) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        self.exchange(parts.method, &target, parts.headers, body, options, jar, None)
            .await
    }

    async fn exchange(
        self: &Arc<Self>,
        method: Method,
        target: &str,
        mut headers: HeaderMap,
        body: Body,
        options: &RequestOptions,
        jar: Option<&dyn CookieStore>,
        url: Option<&Url>,
    ) -> crate::Result<ResponseStream> {
        // Cookie matching needs a full URL; reconstruct one for the
        // prebuilt-request shape from the canonical host.
        let url = match url {
            Some(url) => url.clone(),
            None => self.origin_url(target)?,
        };

        self.prepare_headers(&mut headers, &body, jar, &url)?;

        // Write phase: the write lock serializes whole request heads.
        let mut write = self.write.lock().await;
        let mut exchange = Exchange::begin(self.clone());

        let io_w = write.as_mut().ok_or_else(not_connected)?;

        let mut head = BytesMut::new();
        proto::encode_request_head(&mut head, &method, target, &headers);
        trace!("writing request head: {} {}", method, target);

        exchange.dirty = true;
        with_timeout(options.timeout, io_w.write_all(&head)).await?;
        match options.timeout {
            Some(dur) => tokio::time::timeout(dur, body.write(io_w))
                .await
                .map_err(|_| Error::timeout())??,
            None => body.write(io_w).await?,
        }
        with_timeout(options.timeout, io_w.flush()).await?;

        // Read phase: claim the response slot before letting the next
        // request start writing, so responses map to requests in order.
        let mut read = self.read.clone().lock_owned().await;
        drop(write);

        let head = {
            let ReadState { io, buf } = &mut *read;
            let io = io.as_mut().ok_or_else(not_connected)?;
            loop {
                if let Some(head) = proto::parse_response_head(buf)? {
                    break head;
                }
                let n = with_timeout(options.timeout, io.read_buf(buf)).await?;
                if n == 0 {
                    return Err(Error::protocol(ProtocolViolation(
                        "connection closed before response head",
                    )));
                }
            }
        };
        trace!("response head: {} {:?}", head.status, head.version);

        self.keep_alive
            .lock()
            .update(head.version, &head.headers, Instant::now());

        if let Some(jar) = jar {
            let mut set_cookies = head.headers.get_all(SET_COOKIE).iter();
            jar.set_cookies(&mut set_cookies, &url);
        }

        let decoder = Decoder::detect(&method, &head)?;
        let close_delimited = decoder.forces_close();

        let mut stream = ResponseStream {
            head,
            decoder,
            read: Some(read),
            exchange,
            timeout: options.timeout,
            close_delimited,
            complete: false,
        };
        if stream.decoder.is_complete() {
            stream.finish();
        }
        Ok(stream)
    }

    /// Fills in `Host`, cookies, and the body's framing headers.
    fn prepare_headers(
        &self,
        headers: &mut HeaderMap,
        body: &Body,
        jar: Option<&dyn CookieStore>,
        url: &Url,
    ) -> crate::Result<()> {
        if !headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&self.host()).map_err(Error::builder)?;
            headers.insert(HOST, value);
        }

        if let Some(jar) = jar {
            let cookies = jar.cookies(url);
            if !cookies.is_empty() && !headers.contains_key(COOKIE) {
                let joined = cookies
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect::<Vec<_>>()
                    .join("; ");
                if let Ok(value) = HeaderValue::from_str(&joined) {
                    headers.insert(COOKIE, value);
                }
            }
        }

        if !headers.contains_key(CONTENT_LENGTH) && !headers.contains_key(TRANSFER_ENCODING) {
            match body.content_length() {
                Some(len) => {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
                None => {
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                }
            }
        }

        if let Some(content_type) = body.content_type() {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, content_type.clone());
            }
        }

        Ok(())
    }

    fn origin_url(&self, target: &str) -> crate::Result<Url> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let url = format!("{}://{}{}", scheme, self.host(), target);
        Url::parse(&url).map_err(Error::builder)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host())
            .field("endpoint", &self.endpoint())
            .field("open", &self.is_open())
            .field("working_requests", &self.working_requests())
            .finish()
    }
}

/// Counter and teardown guard for one exchange.
///
/// Once `dirty`, the request head may already be on the wire; dropping
/// the guard before the response was fully consumed leaves the stream in
/// an indeterminate state, so the connection is condemned.
struct Exchange {
    conn: Arc<Connection>,
    dirty: bool,
}

impl Exchange {
    fn begin(conn: Arc<Connection>) -> Exchange {
        conn.ongoing_requests.fetch_add(1, Ordering::SeqCst);
        Exchange { conn, dirty: false }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.conn.ongoing_requests.fetch_sub(1, Ordering::SeqCst);
        if self.dirty {
            trace!("exchange abandoned mid-stream, condemning connection");
            self.conn.mark_broken();
        }
    }
}

/// A response whose head has been read and whose body is streamed on
/// demand.
///
/// Holds the connection's read lock and parser state until released;
/// releasing (or dropping) it decrements the connection's in-flight
/// counter. Dropping the stream before the body is complete closes the
/// connection.
pub struct ResponseStream {
    head: ResponseHead,
    decoder: Decoder,
    read: Option<OwnedMutexGuard<ReadState>>,
    exchange: Exchange,
    timeout: Option<Duration>,
    close_delimited: bool,
    complete: bool,
}

impl ResponseStream {
    /// The response status code. 4xx/5xx are normal responses, not
    /// errors.
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// The response HTTP version.
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The connection serving this response.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.exchange.conn
    }

    /// Whether the body has been fully consumed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Reads the next run of body bytes; `None` once the body is
    /// complete.
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        if self.complete {
            return Ok(None);
        }
        // The connection was condemned underneath us (a cancelled or
        // failed sibling exchange, or an explicit close).
        if !self.exchange.conn.is_open() {
            return Err(Error::canceled());
        }

        loop {
            let Some(read) = self.read.as_mut() else {
                return Ok(None);
            };
            let ReadState { io, buf } = &mut **read;

            match self.decoder.decode(buf).inspect_err(|_| {
                self.exchange.conn.mark_broken();
            })? {
                Decoded::Data(data) => return Ok(Some(data)),
                Decoded::Complete => {
                    self.finish();
                    return Ok(None);
                }
                Decoded::NeedMore => {
                    let io = io.as_mut().ok_or_else(not_connected)?;
                    let n = match with_timeout(self.timeout, io.read_buf(buf)).await {
                        Ok(n) => n,
                        Err(e) => {
                            self.exchange.conn.mark_broken();
                            return Err(e);
                        }
                    };
                    if n == 0 {
                        self.decoder.on_eof().inspect_err(|_| {
                            self.exchange.conn.mark_broken();
                        })?;
                        self.finish();
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Collects the remaining body into one buffer.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Collects the remaining body as text (lossy UTF-8).
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads and discards the rest of the body, leaving the connection
    /// reusable.
    pub async fn drain(&mut self) -> crate::Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }

    /// Releases the stream: returns the read lock and decrements the
    /// connection's in-flight counter. Equivalent to dropping.
    pub fn release(self) {}

    /// Marks the exchange complete: keep-alive bookkeeping, then hand
    /// the read lock back early so a pipelined successor can proceed.
    fn finish(&mut self) {
        if self.complete {
            return;
        }
        self.complete = true;
        self.exchange.dirty = false;

        let conn = &self.exchange.conn;
        {
            let mut keep_alive = conn.keep_alive.lock();
            keep_alive.complete_exchange();
            if self.close_delimited {
                keep_alive.retire(Instant::now());
            }
        }
        if self.close_delimited {
            conn.mark_broken();
        }
        self.read = None;
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("status", &self.head.status)
            .field("version", &self.head.version)
            .field("complete", &self.complete)
            .finish()
    }
}

fn not_connected() -> Error {
    Error::transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection is closed",
    ))
}

async fn with_timeout<T>(
    dur: Option<Duration>,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> crate::Result<T> {
    match dur {
        Some(dur) => match tokio::time::timeout(dur, fut).await {
            Ok(result) => result.map_err(Error::transport),
            Err(_) => Err(Error::timeout()),
        },
        None => fut.await.map_err(Error::transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_host_validates() {
        let conn = Connection::new(None, None);
        assert!(conn.set_host("example.com").is_ok());
        assert_eq!(conn.host(), "example.com");

        assert!(conn.set_host("").unwrap_err().is_builder());
        assert!(conn.set_host("bad host").unwrap_err().is_builder());
        assert!(conn.set_host("bad/host").unwrap_err().is_builder());
    }

    #[test]
    fn cost_penalizes_closed() {
        let conn = Connection::new(None, None);
        // Fresh connection: no requests, not open.
        assert_eq!(conn.working_requests(), 0);
        assert_eq!(conn.cost(), 1);
    }

    #[test]
    fn fresh_connection_is_not_usable() {
        let conn = Connection::new(None, None);
        assert!(!conn.usable(Instant::now()));
    }
}
