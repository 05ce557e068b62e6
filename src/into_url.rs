use url::Url;

use crate::Error;

/// A trait to try to convert some type into a `Url`.
///
/// This trait is "sealed", such that only types within preq can
/// implement it.
pub trait IntoUrl: IntoUrlSealed {}

impl IntoUrl for Url {}
impl IntoUrl for String {}
impl IntoUrl for &Url {}
impl IntoUrl for &str {}
impl IntoUrl for &String {}

/// The sealed half of [`IntoUrl`].
pub trait IntoUrlSealed {
    /// Besides parsing as a valid `Url`, the `Url` must point at a host
    /// reachable over http or https for it to make sense in a request.
    fn into_url(self) -> crate::Result<Url>;

    /// The string representation of the candidate URL.
    fn as_str(&self) -> &str;
}

impl IntoUrlSealed for Url {
    fn into_url(self) -> crate::Result<Url> {
        match self.scheme() {
            "http" | "https" if self.has_host() => Ok(self),
            _ => Err(Error::builder(BadScheme).with_url(self)),
        }
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl IntoUrlSealed for &Url {
    fn into_url(self) -> crate::Result<Url> {
        self.clone().into_url()
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl<T> IntoUrlSealed for T
where
    T: AsRef<str> + sealed::Sealed,
{
    fn into_url(self) -> crate::Result<Url> {
        Url::parse(self.as_ref()).map_err(Error::builder)?.into_url()
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for &str {}
    impl Sealed for String {}
    impl Sealed for &String {}
}

#[derive(Debug)]
struct BadScheme;

impl std::fmt::Display for BadScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl std::error::Error for BadScheme {}
