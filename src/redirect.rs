//! Redirect modes and the in-pool target check.
//!
//! The pool's request driver only ever follows redirects it can serve
//! from its own endpoints; anything cross-authority is handed back to
//! the caller unfollowed, for a higher-level session to deal with.

use http::{header, StatusCode};
use url::Url;

/// How far a request is willing to follow redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Return every redirect response to the caller.
    None,
    /// Follow targets served by the same pool (same scheme and
    /// authority, or a relative `Location`).
    #[default]
    Endpoint,
    /// Follow targets on the same host. At pool level this is served by
    /// the same endpoints, so it behaves like [`RedirectMode::Endpoint`].
    SameHost,
    /// Follow any target. Cross-authority targets still surface to the
    /// caller here; only a session spanning pools can follow them.
    Any,
}

impl RedirectMode {
    pub(crate) fn follows(&self) -> bool {
        !matches!(self, RedirectMode::None)
    }
}

/// Resolves a `Location` header against the request URL, if the response
/// asks for a redirect at all.
pub(crate) fn target(status: StatusCode, headers: &http::HeaderMap, base: &Url) -> Option<Url> {
    if !status.is_redirection() {
        return None;
    }
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    base.join(location).ok()
}

/// Whether the pool that issued `base` also owns `next`.
pub(crate) fn same_pool(base: &Url, next: &Url) -> bool {
    base.scheme() == next.scheme()
        && base.host_str() == next.host_str()
        && base.port_or_known_default() == next.port_or_known_default()
}

/// 303, and historically 301/302, rewrite the method to GET and drop the
/// body; 307/308 replay the original request.
pub(crate) fn strips_body(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
    )
}
