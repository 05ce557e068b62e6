//! Connection keep-alive bookkeeping.
//!
//! After every response head the connection inspects the `Connection` and
//! `Keep-Alive` headers and updates its expiry deadline and remaining
//! request budget. The pool retires connections whose state says so on
//! its next inspection.

use std::time::{Duration, Instant};

use http::{header, HeaderMap, HeaderValue, Version};

/// Keep-alive lifetime applied when the server sends no `Keep-Alive`
/// header on an HTTP/1.1 connection.
pub(crate) const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(300);

/// Per-connection keep-alive state.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeepAlive {
    /// Absolute deadline after which the connection must be retired.
    /// `None` until the first response has been seen.
    pub(crate) expiry: Option<Instant>,
    /// Remaining exchanges the server is willing to serve, if bounded.
    pub(crate) max: Option<u64>,
}

impl KeepAlive {
    /// Re-derives the state from a response head.
    pub(crate) fn update(&mut self, version: Version, headers: &HeaderMap, now: Instant) {
        let mut alive = version != Version::HTTP_10;
        if let Some(value) = headers.get(header::CONNECTION) {
            if alive {
                alive = !token_present(value, "close");
            } else {
                alive = token_present(value, "keep-alive");
            }
        }

        if !alive {
            self.expiry = Some(now);
            return;
        }

        match headers.get("keep-alive").and_then(parse_params) {
            Some((timeout, max)) => {
                self.expiry = Some(now + timeout.unwrap_or(DEFAULT_KEEP_ALIVE));
                if max.is_some() {
                    self.max = max;
                }
            }
            None => {
                self.expiry = Some(now + DEFAULT_KEEP_ALIVE);
            }
        }
    }

    /// Consumes one exchange from a bounded budget.
    pub(crate) fn complete_exchange(&mut self) {
        if let Some(max) = self.max.as_mut() {
            *max = max.saturating_sub(1);
        }
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|deadline| deadline <= now)
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.max == Some(0)
    }

    /// Forces retirement on the next pool inspection.
    pub(crate) fn retire(&mut self, now: Instant) {
        self.expiry = Some(now);
    }
}

/// Checks a `Connection` header for a (case-insensitive) token.
fn token_present(value: &HeaderValue, token: &str) -> bool {
    value.to_str().is_ok_and(|s| {
        s.split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    })
}

/// Parses `Keep-Alive: timeout=T, max=N`; unknown parameters are ignored.
fn parse_params(value: &HeaderValue) -> Option<(Option<Duration>, Option<u64>)> {
    let s = value.to_str().ok()?;
    let mut timeout = None;
    let mut max = None;
    for param in s.split(',') {
        let mut kv = param.splitn(2, '=');
        let key = kv.next()?.trim();
        let val = kv.next()?.trim();
        if key.eq_ignore_ascii_case("timeout") {
            timeout = val.parse::<u64>().ok().map(Duration::from_secs);
        } else if key.eq_ignore_ascii_case("max") {
            max = val.parse::<u64>().ok();
        }
    }
    Some((timeout, max))
}
