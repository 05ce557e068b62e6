//! The duplex byte stream underneath a [`Connection`](crate::Connection).
//!
//! Two variants share one capability set: plain TCP, and TLS over TCP
//! where `connect` additionally performs the handshake (SNI taken from
//! the canonical host) and `shutdown` sends the TLS close-notify.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use log::{debug, trace};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::{error::BoxError, Error};

/// A transport-level address a connection can be bound to.
pub type Endpoint = SocketAddr;

/// A TLS client context shared by every TLS connection of a pool.
///
/// Cheap to clone; the underlying [`rustls::ClientConfig`] is reference
/// counted and treated as read-only once the first connection is made.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Builds a context trusting the bundled webpki roots.
    pub fn new() -> TlsContext {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsContext {
            config: Arc::new(config),
        }
    }

    /// Wraps a preconfigured [`rustls::ClientConfig`].
    pub fn from_config(config: Arc<ClientConfig>) -> TlsContext {
        TlsContext { config }
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        TlsContext::new()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish()
    }
}

/// A connected stream, plain or TLS.
pub(crate) enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl MaybeTls {
    /// Opens a transport to `endpoint`, wrapping it in TLS when a context
    /// is given. The handshake uses `host` for SNI, never the endpoint's
    /// IP literal.
    pub(crate) async fn connect(
        endpoint: Endpoint,
        host: &str,
        tls: Option<&TlsContext>,
        timeout: Option<Duration>,
    ) -> crate::Result<MaybeTls> {
        let fut = Self::connect_inner(endpoint, host, tls);
        match timeout {
            Some(dur) => tokio::time::timeout(dur, fut)
                .await
                .map_err(|_| Error::timeout())?,
            None => fut.await,
        }
    }

    async fn connect_inner(
        endpoint: Endpoint,
        host: &str,
        tls: Option<&TlsContext>,
    ) -> crate::Result<MaybeTls> {
        trace!("connecting to {endpoint}");
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(Error::transport)?;
        stream.set_nodelay(true).map_err(Error::transport)?;

        match tls {
            None => Ok(MaybeTls::Plain(stream)),
            Some(ctx) => {
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|e| Error::builder(Box::new(e) as BoxError))?;
                debug!("tls handshake with {endpoint}, sni {host}");
                let connector = TlsConnector::from(ctx.config.clone());
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(Error::transport)?;
                Ok(MaybeTls::Tls(Box::new(stream)))
            }
        }
    }
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Gracefully shuts down the write side (TLS close-notify included).
pub(crate) async fn shutdown(io: &mut (impl AsyncWrite + Unpin)) -> crate::Result<()> {
    io.shutdown().await.map_err(Error::transport)
}
