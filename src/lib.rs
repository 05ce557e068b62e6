#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # preq
//!
//! A pooled HTTP/1.1 client. The heart of the crate is the
//! [`Pool`]: it resolves an authority to endpoints once, then multiplexes
//! requests over a bounded set of keep-alive connections, writing
//! pipelined requests in order while earlier responses are still being
//! streamed.
//!
//! - Streaming bodies in both directions ([`Body`], [`ResponseStream`])
//! - Keep-alive lifetime tracking (`Keep-Alive: timeout=..., max=...`)
//! - Plain TCP and TLS (rustls) transports behind one [`Pool`]
//! - An async surface and an equivalent [`blocking`] one
//!
//! ## Example
//!
//! ```rust,no_run
//! use preq::{Body, Method, Pool, RequestSettings};
//!
//! # async fn run() -> preq::Result<()> {
//! let pool = Pool::builder().limit(4).build();
//! pool.lookup("example.com").await?;
//!
//! let mut res = pool
//!     .ropen(Method::GET, "/", Body::empty(), &RequestSettings::new())
//!     .await?;
//! println!("status: {}", res.status());
//! while let Some(chunk) = res.chunk().await? {
//!     println!("read {} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Blocking
//!
//! The [`blocking`] module exposes the same operations driven on a
//! crate-owned runtime:
//!
//! ```rust,no_run
//! use preq::{blocking, Body, Method, RequestSettings};
//!
//! # fn run() -> preq::Result<()> {
//! let pool = blocking::Pool::new();
//! pool.lookup("example.com")?;
//! let text = pool
//!     .ropen(Method::GET, "/", Body::empty(), &RequestSettings::new())?
//!     .text()?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

pub use http::{header, Method, StatusCode, Version};

pub use self::{
    body::Body,
    conn::{Connection, ResponseStream},
    cookie::{CookieStore, IntoCookieStore, Jar},
    error::{BoxError, Error, Result},
    into_url::IntoUrl,
    pool::{Pool, PoolBuilder, Response, DEFAULT_POOL_SIZE},
    redirect::RedirectMode,
    request::{RequestOptions, RequestSettings},
    transport::{Endpoint, TlsContext},
};

pub mod blocking;
mod body;
mod conn;
mod cookie;
pub mod dns;
mod error;
mod into_url;
mod keep_alive;
mod pool;
mod proto;
mod redirect;
mod request;
mod sync;
mod transport;
