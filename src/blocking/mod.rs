//! A blocking surface with the same semantics as the async one.
//!
//! Every type here wraps its async counterpart and drives it on a
//! crate-owned single-threaded runtime. Conversely, this module must
//! not be used from within an async runtime: building a
//! [`blocking::Pool`](Pool) there panics, since blocking the executor
//! thread would starve the very reactor the pool runs on.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};

use crate::{
    dns::IntoResolve, pool, transport::Endpoint, Body, IntoUrl, RequestSettings, TlsContext,
};

/// A blocking pool of keep-alive connections to one authority.
///
/// See [`crate::Pool`] for the semantics; this wrapper only changes how
/// the futures are driven.
#[derive(Clone, Debug)]
pub struct Pool {
    inner: crate::Pool,
    rt: Arc<Runtime>,
}

/// Configures and builds a blocking [`Pool`].
pub struct PoolBuilder {
    inner: pool::PoolBuilder,
}

impl PoolBuilder {
    /// Caps the number of pooled connections.
    pub fn limit(mut self, limit: usize) -> PoolBuilder {
        self.inner = self.inner.limit(limit);
        self
    }

    /// Makes this a TLS pool.
    pub fn tls(mut self, ctx: TlsContext) -> PoolBuilder {
        self.inner = self.inner.tls(ctx);
        self
    }

    /// Deadline for each transport connect.
    pub fn connect_timeout(mut self, dur: Duration) -> PoolBuilder {
        self.inner = self.inner.connect_timeout(dur);
        self
    }

    /// Swaps in a custom DNS resolver.
    pub fn resolver(mut self, resolver: impl IntoResolve) -> PoolBuilder {
        self.inner = self.inner.resolver(resolver);
        self
    }

    /// Builds the pool and its runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime. See the module
    /// docs.
    pub fn build(self) -> Pool {
        if Handle::try_current().is_ok() {
            panic!("blocking::Pool must not be built inside an async runtime");
        }
        let rt = RuntimeBuilder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build pool runtime");
        Pool {
            inner: self.inner.build(),
            rt: Arc::new(rt),
        }
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        PoolBuilder {
            inner: crate::Pool::builder(),
        }
    }
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder").field("inner", &self.inner).finish()
    }
}

impl Pool {
    /// A plain-HTTP blocking pool with default configuration.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime.
    pub fn new() -> Pool {
        Pool::builder().build()
    }

    /// Starts configuring a blocking pool.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// See [`crate::Pool::limit`].
    pub fn limit(&self) -> usize {
        self.inner.limit()
    }

    /// See [`crate::Pool::active`].
    pub fn active(&self) -> usize {
        self.inner.active()
    }

    /// See [`crate::Pool::host`].
    pub fn host(&self) -> String {
        self.inner.host()
    }

    /// See [`crate::Pool::lookup`].
    pub fn lookup(&self, authority: &str) -> crate::Result<()> {
        self.rt.block_on(self.inner.lookup(authority))
    }

    /// See [`crate::Pool::get_connection`].
    pub fn get_connection(&self) -> crate::Result<Connection> {
        let conn = self.rt.block_on(self.inner.get_connection())?;
        Ok(Connection {
            inner: conn,
            rt: self.rt.clone(),
        })
    }

    /// See [`crate::Pool::ropen`].
    pub fn ropen(
        &self,
        method: Method,
        target: &str,
        body: Body,
        settings: &RequestSettings,
    ) -> crate::Result<ResponseStream> {
        let stream = self
            .rt
            .block_on(self.inner.ropen(method, target, body, settings))?;
        Ok(ResponseStream {
            inner: stream,
            rt: self.rt.clone(),
        })
    }

    /// See [`crate::Pool::request`].
    pub fn request(
        &self,
        method: Method,
        target: &str,
        body: Body,
        settings: &RequestSettings,
    ) -> crate::Result<pool::Response> {
        self.rt
            .block_on(self.inner.request(method, target, body, settings))
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

/// A blocking handle to a pooled connection.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<crate::Connection>,
    rt: Arc<Runtime>,
}

impl Connection {
    /// See [`crate::Connection::connect`].
    pub fn connect(&self, endpoint: Endpoint) -> crate::Result<()> {
        self.rt.block_on(self.inner.connect(endpoint))
    }

    /// See [`crate::Connection::close`].
    pub fn close(&self) -> crate::Result<()> {
        self.rt.block_on(self.inner.close())
    }

    /// See [`crate::Connection::is_open`].
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// See [`crate::Connection::endpoint`].
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint()
    }

    /// See [`crate::Connection::timeout`].
    pub fn timeout(&self) -> Option<std::time::Instant> {
        self.inner.timeout()
    }

    /// See [`crate::Connection::working_requests`].
    pub fn working_requests(&self) -> usize {
        self.inner.working_requests()
    }

    /// See [`crate::Connection::ropen`].
    pub fn ropen(
        &self,
        method: Method,
        url: impl IntoUrl,
        body: Body,
        settings: &RequestSettings,
    ) -> crate::Result<ResponseStream> {
        let stream = self
            .rt
            .block_on(self.inner.ropen(method, url, body, settings))?;
        Ok(ResponseStream {
            inner: stream,
            rt: self.rt.clone(),
        })
    }
}

/// A blocking response whose body is read on demand.
#[derive(Debug)]
pub struct ResponseStream {
    inner: crate::ResponseStream,
    rt: Arc<Runtime>,
}

impl ResponseStream {
    /// See [`crate::ResponseStream::status`].
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    /// See [`crate::ResponseStream::version`].
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// See [`crate::ResponseStream::headers`].
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// See [`crate::ResponseStream::is_complete`].
    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    /// Reads the next run of body bytes; `None` once the body is
    /// complete.
    pub fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        self.rt.block_on(self.inner.chunk())
    }

    /// Collects the remaining body into one buffer.
    pub fn bytes(self) -> crate::Result<Bytes> {
        let Self { inner, rt } = self;
        rt.block_on(inner.bytes())
    }

    /// Collects the remaining body as text (lossy UTF-8).
    pub fn text(self) -> crate::Result<String> {
        let Self { inner, rt } = self;
        rt.block_on(inner.text())
    }

    /// Releases the stream; equivalent to dropping it.
    pub fn release(self) {}
}
