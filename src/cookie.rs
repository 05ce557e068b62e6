//! HTTP cookies, as an opaque header-injector/extractor.
//!
//! The connection engine only ever talks to [`CookieStore`]: it collects
//! `Cookie` header values for the target URL before writing a request
//! and hands every `Set-Cookie` response header back. Matching policy
//! lives behind the trait.

use std::{collections::HashMap, sync::Arc};

use ::cookie::Cookie as RawCookie;
use http::HeaderValue;
use url::Url;

use crate::sync::RwLock;

/// Actions for a persistent cookie store providing session support.
pub trait CookieStore: Send + Sync {
    /// Store a set of `Set-Cookie` header values received from `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url);

    /// Get any `Cookie` values in the store for `url`.
    fn cookies(&self, url: &Url) -> Vec<HeaderValue>;
}

/// Trait for converting types into a shared cookie store
/// ([`Arc<dyn CookieStore>`]).
pub trait IntoCookieStore {
    /// Converts the implementor into an [`Arc<dyn CookieStore>`].
    fn into_cookie_store(self) -> Arc<dyn CookieStore>;
}

impl IntoCookieStore for Arc<dyn CookieStore> {
    #[inline]
    fn into_cookie_store(self) -> Arc<dyn CookieStore> {
        self
    }
}

impl<C> IntoCookieStore for Arc<C>
where
    C: CookieStore + 'static,
{
    #[inline]
    fn into_cookie_store(self) -> Arc<dyn CookieStore> {
        self
    }
}

impl<C> IntoCookieStore for C
where
    C: CookieStore + 'static,
{
    #[inline]
    fn into_cookie_store(self) -> Arc<dyn CookieStore> {
        Arc::new(self)
    }
}

/// A good default [`CookieStore`] implementation.
///
/// Cookies are kept per host and replaced by name; expiry and
/// domain-matching subtleties are intentionally out of scope here.
#[derive(Default)]
pub struct Jar(RwLock<HashMap<String, Vec<RawCookie<'static>>>>);

impl Jar {
    /// Creates an empty jar.
    pub fn new() -> Jar {
        Jar::default()
    }

    /// Adds a cookie string (as it would appear in `Set-Cookie`) scoped
    /// to the given URL's host.
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        if let (Ok(parsed), Some(host)) = (
            RawCookie::parse(cookie.to_owned()),
            url.host_str().map(str::to_owned),
        ) {
            let mut store = self.0.write();
            let list = store.entry(host).or_default();
            list.retain(|c| c.name() != parsed.name());
            list.push(parsed);
        }
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let Some(host) = url.host_str().map(str::to_owned) else {
            return;
        };

        let mut store = self.0.write();
        let list = store.entry(host).or_default();
        for header in cookie_headers {
            let Ok(s) = std::str::from_utf8(header.as_bytes()) else {
                continue;
            };
            if let Ok(parsed) = RawCookie::parse(s.to_owned()) {
                list.retain(|c| c.name() != parsed.name());
                list.push(parsed);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Vec<HeaderValue> {
        let Some(host) = url.host_str() else {
            return Vec::new();
        };

        self.0
            .read()
            .get(host)
            .into_iter()
            .flatten()
            .filter_map(|cookie| {
                HeaderValue::from_str(&format!("{}={}", cookie.name(), cookie.value())).ok()
            })
            .collect()
    }
}

impl std::fmt::Debug for Jar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jar").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_then_collect() {
        let jar = Jar::new();
        let url = Url::parse("http://example.com/").unwrap();
        let headers = [
            HeaderValue::from_static("sid=abc123; Path=/; HttpOnly"),
            HeaderValue::from_static("theme=dark"),
        ];
        jar.set_cookies(&mut headers.iter(), &url);

        let mut values: Vec<_> = jar
            .cookies(&url)
            .into_iter()
            .map(|v| v.to_str().unwrap().to_owned())
            .collect();
        values.sort();
        assert_eq!(values, ["sid=abc123", "theme=dark"]);
    }

    #[test]
    fn replaced_by_name_and_scoped_by_host() {
        let jar = Jar::new();
        let a = Url::parse("http://a.test/").unwrap();
        let b = Url::parse("http://b.test/").unwrap();
        jar.add_cookie_str("sid=old", &a);
        jar.add_cookie_str("sid=new", &a);

        let values = jar.cookies(&a);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].to_str().unwrap(), "sid=new");
        assert!(jar.cookies(&b).is_empty());
    }
}
