//! The connection pool: resolved endpoints, a bounded multimap of
//! reusable connections, and the request driver callers go through.
//!
//! All mutating pool state lives under one cooperative mutex. The mutex
//! is intentionally held across the connect of a newly created
//! connection, so the configured limit can never be oversubscribed;
//! callers wanting parallel connects should issue concurrent
//! `get_connection` calls before the limit is reached.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use log::{debug, trace};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    conn::{Connection, ResponseStream},
    dns::{GaiResolver, IntoResolve, Name, Resolve},
    redirect,
    request::RequestSettings,
    sync,
    transport::{Endpoint, TlsContext},
    Body, Error,
};

/// Default connection-count limit of a pool.
pub const DEFAULT_POOL_SIZE: usize = 6;

/// A pool of keep-alive connections to one authority.
///
/// Cheap to clone; clones share the same pool. Connections are created
/// lazily, reused while their keep-alive allows, and evicted on the next
/// inspection once broken or expired. Dropping the pool leaves in-flight
/// [`ResponseStream`]s working: they share ownership of their
/// connection.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    host: sync::RwLock<String>,
    active: AtomicUsize,
    limit: usize,
    tls: Option<TlsContext>,
    connect_timeout: Option<Duration>,
    resolver: Arc<dyn Resolve>,
}

struct State {
    endpoints: Vec<Endpoint>,
    conns: HashMap<Endpoint, Vec<Arc<Connection>>>,
}

/// Configures and builds a [`Pool`].
pub struct PoolBuilder {
    limit: usize,
    tls: Option<TlsContext>,
    connect_timeout: Option<Duration>,
    resolver: Option<Arc<dyn Resolve>>,
}

impl PoolBuilder {
    /// Caps the number of pooled connections.
    pub fn limit(mut self, limit: usize) -> PoolBuilder {
        self.limit = limit;
        self
    }

    /// Makes this a TLS pool; every connection handshakes with the
    /// shared context, SNI keyed on the canonical host.
    pub fn tls(mut self, ctx: TlsContext) -> PoolBuilder {
        self.tls = Some(ctx);
        self
    }

    /// Deadline for each transport connect (TLS handshake included).
    pub fn connect_timeout(mut self, dur: Duration) -> PoolBuilder {
        self.connect_timeout = Some(dur);
        self
    }

    /// Swaps in a custom DNS resolver.
    pub fn resolver(mut self, resolver: impl IntoResolve) -> PoolBuilder {
        self.resolver = Some(resolver.into_resolve());
        self
    }

    /// Builds the pool.
    pub fn build(self) -> Pool {
        Pool {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    endpoints: Vec::new(),
                    conns: HashMap::new(),
                }),
                host: sync::RwLock::new(String::new()),
                active: AtomicUsize::new(0),
                limit: self.limit,
                tls: self.tls,
                connect_timeout: self.connect_timeout,
                resolver: self
                    .resolver
                    .unwrap_or_else(|| Arc::new(GaiResolver::new())),
            }),
        }
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        PoolBuilder {
            limit: DEFAULT_POOL_SIZE,
            tls: None,
            connect_timeout: Some(Duration::from_secs(30)),
            resolver: None,
        }
    }
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("limit", &self.limit)
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Pool {
    /// A plain-HTTP pool with default configuration.
    pub fn new() -> Pool {
        Pool::builder().build()
    }

    /// Starts configuring a pool.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// The connection-count limit.
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// The number of connections currently owned by the pool.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// The canonical host, once [`lookup`](Pool::lookup) has run.
    pub fn host(&self) -> String {
        self.inner.host.read().clone()
    }

    /// Whether this pool speaks TLS.
    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_some()
    }

    /// Resolves `authority` (`host[:port]`) and stores the endpoint list
    /// and canonical host. Must be called before the first
    /// [`get_connection`](Pool::get_connection); calling it again
    /// re-resolves without disturbing pooled connections.
    pub async fn lookup(&self, authority: &str) -> crate::Result<()> {
        let (host, lookup_host, port) = self.parse_authority(authority)?;

        let mut state = self.inner.state.lock().await;

        let addrs = self
            .inner
            .resolver
            .resolve(Name::from(lookup_host.as_str()), port)
            .await
            .map_err(Error::resolve)?;
        let endpoints: Vec<Endpoint> = addrs.collect();
        if endpoints.is_empty() {
            return Err(Error::resolve("lookup yielded no endpoints"));
        }

        debug!("resolved {authority} to {} endpoint(s)", endpoints.len());
        *self.inner.host.write() = host;
        state.endpoints = endpoints;
        Ok(())
    }

    /// Returns a usable connection: an idle pooled one, a freshly
    /// connected one while under the limit, or the least-loaded existing
    /// one once the limit is reached.
    pub async fn get_connection(&self) -> crate::Result<Arc<Connection>> {
        let mut state = self.inner.state.lock().await;
        self.get_connection_locked(&mut state).await
    }

    async fn get_connection_locked(
        &self,
        state: &mut State,
    ) -> crate::Result<Arc<Connection>> {
        let now = Instant::now();
        self.evict(state, now);

        // An idle connection is reused as-is.
        for conns in state.conns.values() {
            for conn in conns {
                if conn.working_requests() == 0 {
                    trace!("reusing idle connection to {:?}", conn.endpoint());
                    return Ok(conn.clone());
                }
            }
        }

        // Below the limit: connect to the least-used endpoint. The pool
        // mutex stays held across the connect.
        if self.active() < self.inner.limit {
            if state.endpoints.is_empty() {
                return Err(Error::not_found());
            }

            let conns = &state.conns;
            state
                .endpoints
                .sort_by_key(|ep| conns.get(ep).map_or(0, Vec::len));
            let endpoint = state.endpoints[0];

            let conn = Arc::new(Connection::new(
                self.inner.tls.clone(),
                self.inner.connect_timeout,
            ));
            conn.set_host(&self.host())?;
            conn.connect(endpoint).await?;

            state.conns.entry(endpoint).or_default().push(conn.clone());
            self.inner.active.fetch_add(1, Ordering::SeqCst);
            debug!("pool grew to {} connection(s)", self.active());
            return Ok(conn);
        }

        // At the limit: share the connection with the lowest cost.
        let mut best: Option<&Arc<Connection>> = None;
        let mut best_cost = usize::MAX;
        for conns in state.conns.values() {
            for conn in conns {
                let cost = conn.cost();
                if cost < best_cost {
                    best_cost = cost;
                    best = Some(conn);
                }
            }
        }
        best.cloned().ok_or_else(Error::not_found)
    }

    /// Drops broken, expired, and exhausted connections. Their sockets
    /// shut down once the last shared owner releases them.
    fn evict(&self, state: &mut State, now: Instant) {
        let mut evicted = 0usize;
        for conns in state.conns.values_mut() {
            conns.retain(|conn| {
                let keep = conn.usable(now) || (conn.working_requests() > 0 && conn.is_open());
                if !keep {
                    conn.mark_broken();
                    evicted += 1;
                }
                keep
            });
        }
        if evicted > 0 {
            state.conns.retain(|_, conns| !conns.is_empty());
            let total = state.conns.values().map(Vec::len).sum();
            self.inner.active.store(total, Ordering::SeqCst);
            debug!("evicted {evicted} connection(s), {total} remain");
        }
    }

    /// Opens a request exchange on a pooled connection and returns the
    /// streaming response.
    ///
    /// `target` is a path (plus optional query) under this pool's
    /// authority. Redirects that stay within the pool are followed up to
    /// the configured hop limit; anything else is returned unfollowed.
    pub async fn ropen(
        &self,
        method: Method,
        target: &str,
        body: Body,
        settings: &RequestSettings,
    ) -> crate::Result<ResponseStream> {
        if settings.options.enforce_tls && self.inner.tls.is_none() {
            return Err(Error::builder(crate::proto::ProtocolViolation(
                "tls required but this is a plain pool",
            )));
        }

        let mut url = self.target_url(target)?;
        let mut method = method;
        let mut body = Some(body);
        let mut hops = 0usize;

        loop {
            let conn = self.get_connection().await?;

            // Keep the original body around when it can be replayed on
            // a redirect; otherwise send it and give up replaying.
            let send = match body.as_ref().and_then(Body::try_clone) {
                Some(clone) => clone,
                None => body.take().unwrap_or_default(),
            };

            let mut stream = conn.ropen(method.clone(), &url, send, settings).await?;

            if !settings.options.redirect.follows() || hops >= settings.options.max_redirects {
                return Ok(stream);
            }
            let Some(next) = redirect::target(stream.status(), stream.headers(), &url) else {
                return Ok(stream);
            };
            if !redirect::same_pool(&url, &next) {
                // Cross-authority: a higher-level session's problem.
                return Ok(stream);
            }

            if redirect::strips_body(stream.status()) {
                method = Method::GET;
                body = Some(Body::empty());
            } else if body.is_none() {
                // 307/308 with a non-replayable body.
                return Ok(stream);
            }

            stream.drain().await?;
            drop(stream);
            debug!("following redirect to {next}");
            url = next;
            hops += 1;
        }
    }

    /// Convenience driver: opens the exchange and buffers the whole
    /// response body.
    pub async fn request(
        &self,
        method: Method,
        target: &str,
        body: Body,
        settings: &RequestSettings,
    ) -> crate::Result<Response> {
        let stream = self.ropen(method, target, body, settings).await?;
        let status = stream.status();
        let version = stream.version();
        let headers = stream.headers().clone();
        let body = stream.bytes().await?;
        Ok(Response {
            status,
            version,
            headers,
            body,
        })
    }

    fn parse_authority(&self, authority: &str) -> crate::Result<(String, String, u16)> {
        let scheme = if self.inner.tls.is_some() {
            "https"
        } else {
            "http"
        };
        let url = Url::parse(&format!("{scheme}://{authority}")).map_err(Error::builder)?;
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::builder(crate::proto::ProtocolViolation(
                "authority must be host[:port]",
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| {
                Error::builder(crate::proto::ProtocolViolation("authority has no host"))
            })?
            .to_owned();
        // IPv6 literals carry brackets in the URL form; the resolver
        // wants them bare.
        let lookup_host = host.trim_start_matches('[').trim_end_matches(']').to_owned();
        let port = url
            .port()
            .unwrap_or(if self.inner.tls.is_some() { 443 } else { 80 });
        Ok((host, lookup_host, port))
    }

    fn target_url(&self, target: &str) -> crate::Result<Url> {
        let host = self.host();
        if host.is_empty() {
            return Err(Error::not_found());
        }
        let scheme = if self.inner.tls.is_some() {
            "https"
        } else {
            "http"
        };
        let base = Url::parse(&format!("{scheme}://{host}")).map_err(Error::builder)?;
        base.join(target).map_err(Error::builder)
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("host", &self.host())
            .field("active", &self.active())
            .field("limit", &self.limit())
            .field("tls", &self.is_tls())
            .finish()
    }
}

/// A buffered response: head plus fully collected body.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The response body as text (lossy UTF-8).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_parsing() {
        let pool = Pool::new();
        let (host, lookup, port) = pool.parse_authority("example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(lookup, "example.com");
        assert_eq!(port, 80);

        let (_, _, port) = pool.parse_authority("example.com:8080").unwrap();
        assert_eq!(port, 8080);

        let (host, lookup, port) = pool.parse_authority("[::1]:9000").unwrap();
        assert_eq!(host, "[::1]");
        assert_eq!(lookup, "::1");
        assert_eq!(port, 9000);

        assert!(pool.parse_authority("example.com/path").is_err());
        assert!(pool.parse_authority("").is_err());
    }

    #[test]
    fn tls_pool_defaults_to_443() {
        let pool = Pool::builder().tls(TlsContext::new()).build();
        let (_, _, port) = pool.parse_authority("example.com").unwrap();
        assert_eq!(port, 443);
    }

    #[test]
    fn target_url_requires_lookup() {
        let pool = Pool::new();
        assert!(pool.target_url("/a").unwrap_err().is_not_found());
    }
}
