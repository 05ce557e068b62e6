use std::{error::Error as StdError, fmt, io};

use url::Url;

/// A `Result` alias where the `Err` case is `preq::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while resolving, connecting, or exchanging
/// an HTTP request.
///
/// Note: errors may include the full URL used to make the request. If the
/// URL contains sensitive information (e.g. an API key as a query
/// parameter), be sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn resolve<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Resolve, Some(e))
    }

    pub(crate) fn not_found() -> Error {
        Error::new(Kind::NotFound, None::<Error>)
    }

    pub(crate) fn transport<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Transport, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout, Some(TimedOut))
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, None::<Error>)
    }

    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Returns a mutable reference to the URL related to this error.
    ///
    /// This is useful if you need to remove sensitive information from the
    /// URL (e.g. an API key in the query), but do not want to remove the
    /// URL entirely.
    pub fn url_mut(&mut self) -> Option<&mut Url> {
        self.inner.url.as_mut()
    }

    /// Add a URL related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related URL from this error.
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns true if the error came from malformed caller input.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if DNS resolution produced no usable endpoints.
    pub fn is_resolve(&self) -> bool {
        matches!(self.inner.kind, Kind::Resolve)
    }

    /// Returns true if the pool had no endpoints or no connection to offer.
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner.kind, Kind::NotFound)
    }

    /// Returns true if the error happened at the TCP or TLS layer.
    pub fn is_transport(&self) -> bool {
        matches!(self.inner.kind, Kind::Transport)
    }

    /// Returns true if the peer violated HTTP/1.1 framing.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if a per-operation deadline expired.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the operation was cancelled by the caller.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("preq::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", url);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Resolve => f.write_str("dns resolution failed")?,
            Kind::NotFound => f.write_str("no usable endpoint or connection")?,
            Kind::Transport => f.write_str("transport error")?,
            Kind::Protocol => f.write_str("http protocol error")?,
            Kind::Timeout => f.write_str("operation timed out")?,
            Kind::Canceled => f.write_str("operation was canceled")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Resolve,
    NotFound,
    Transport,
    Protocol,
    Timeout,
    Canceled,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
