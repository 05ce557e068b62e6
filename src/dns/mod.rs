//! DNS resolution for the connection pool.

pub use gai::GaiResolver;
pub use resolve::{Addrs, IntoResolve, Name, Resolve, Resolving};

mod gai;
mod resolve;
