use std::{fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use crate::error::BoxError;

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from a string slice.
    #[inline]
    pub fn new(host: Box<str>) -> Name {
        Name { host }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value.into())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, BoxError>> + Send>>;

/// Trait for customizing DNS resolution in preq.
pub trait Resolve: Send + Sync {
    /// Performs DNS resolution on a [`Name`], yielding endpoints with the
    /// given port filled in.
    ///
    /// It is assumed that `resolve` is always ready to be called, and does
    /// not need a mutable reference to `self`. Since trait objects cannot
    /// make use of associated types, the returned `Future` and its
    /// contained `Iterator` are boxed.
    fn resolve(&self, name: Name, port: u16) -> Resolving;
}

/// Trait for converting types into a shared DNS resolver
/// ([`Arc<dyn Resolve>`]).
///
/// Implemented for any [`Resolve`] type, [`Arc<T>`] where `T: Resolve`,
/// and [`Arc<dyn Resolve>`].
pub trait IntoResolve {
    /// Converts the implementor into an [`Arc<dyn Resolve>`].
    fn into_resolve(self) -> Arc<dyn Resolve>;
}

impl IntoResolve for Arc<dyn Resolve> {
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for Arc<R>
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for R
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        Arc::new(self)
    }
}
