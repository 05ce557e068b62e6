use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    vec,
};

use log::debug;

use super::{Addrs, Name, Resolve, Resolving};

/// A resolver using blocking `getaddrinfo` calls in a threadpool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver {
    _priv: (),
}

/// A wrapper around `SocketAddrs` to implement the `Iterator` trait.
struct SocketAddrs {
    iter: vec::IntoIter<SocketAddr>,
}

// ==== impl GaiResolver ====

impl GaiResolver {
    /// Creates a new [`GaiResolver`].
    pub fn new() -> Self {
        GaiResolver { _priv: () }
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name, port: u16) -> Resolving {
        Box::pin(async move {
            let blocking = tokio::task::spawn_blocking(move || {
                debug!("resolving {}:{}", name, port);
                (name.as_str(), port)
                    .to_socket_addrs()
                    .map(|iter| SocketAddrs {
                        iter: iter.collect::<Vec<_>>().into_iter(),
                    })
            });

            match blocking.await {
                Ok(Ok(addrs)) => Ok(Box::new(addrs) as Addrs),
                Ok(Err(err)) => Err(err.into()),
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        Err(io::Error::new(io::ErrorKind::Interrupted, join_err).into())
                    } else {
                        Err(io::Error::other(join_err).into())
                    }
                }
            }
        })
    }
}

// ==== impl SocketAddrs ====

impl Iterator for SocketAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
