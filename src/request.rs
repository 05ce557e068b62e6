//! Per-request settings: extra headers, driver options, and an optional
//! cookie jar.

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::{cookie::IntoCookieStore, CookieStore, RedirectMode};

/// Options consumed by the request driver.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Redirect handling mode.
    pub redirect: RedirectMode,
    /// Refuse to follow a redirect that downgrades to plain `http`.
    pub enforce_tls: bool,
    /// Deadline applied to each transport operation of the exchange.
    pub timeout: Option<Duration>,
    /// Redirect hops before the response is handed back unfollowed.
    pub max_redirects: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            redirect: RedirectMode::default(),
            enforce_tls: false,
            timeout: None,
            max_redirects: 10,
        }
    }
}

/// The settings bundle accepted by `ropen`.
#[derive(Default)]
pub struct RequestSettings {
    /// Headers merged into the request (in addition to `Host`, cookies,
    /// and body framing headers, which the connection fills in).
    pub headers: HeaderMap,
    /// Driver options.
    pub options: RequestOptions,
    /// Cookie jar consulted for this request, if any.
    pub jar: Option<Arc<dyn CookieStore>>,
}

impl RequestSettings {
    /// Default settings: no extra headers, endpoint-mode redirects, no
    /// jar.
    pub fn new() -> RequestSettings {
        RequestSettings::default()
    }

    /// Adds a header to the request.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> RequestSettings {
        self.headers.append(name, value);
        self
    }

    /// Replaces the full header map.
    pub fn headers(mut self, headers: HeaderMap) -> RequestSettings {
        self.headers = headers;
        self
    }

    /// Sets the redirect mode.
    pub fn redirect(mut self, mode: RedirectMode) -> RequestSettings {
        self.options.redirect = mode;
        self
    }

    /// Requires TLS for the request and any followed redirect.
    pub fn enforce_tls(mut self) -> RequestSettings {
        self.options.enforce_tls = true;
        self
    }

    /// Applies a per-operation timeout to the exchange.
    pub fn timeout(mut self, dur: Duration) -> RequestSettings {
        self.options.timeout = Some(dur);
        self
    }

    /// Caps the number of followed redirect hops.
    pub fn max_redirects(mut self, max: usize) -> RequestSettings {
        self.options.max_redirects = max;
        self
    }

    /// Attaches a cookie jar.
    pub fn cookie_store(mut self, jar: impl IntoCookieStore) -> RequestSettings {
        self.jar = Some(jar.into_cookie_store());
        self
    }
}

impl std::fmt::Debug for RequestSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSettings")
            .field("headers", &self.headers)
            .field("options", &self.options)
            .field("jar", &self.jar.is_some())
            .finish()
    }
}
