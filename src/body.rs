//! Request bodies and their streaming contract.
//!
//! A [`Body`] reports its framing (`Content-Length` vs chunked) and
//! content type, and acts as a push-source of bytes for the connection's
//! writer.

use std::{fmt, path::Path};

use bytes::{Bytes, BytesMut};
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{proto, Error};

const FILE_CHUNK: usize = 16 * 1024;

/// The body of a request.
pub struct Body {
    kind: Kind,
    content_type: Option<HeaderValue>,
}

enum Kind {
    Empty,
    Full(Bytes),
    File { path: std::path::PathBuf, len: u64 },
    Reader(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body {
            kind: Kind::Empty,
            content_type: None,
        }
    }

    /// A body from a file on disk, sent with its length and a content
    /// type guessed from the extension.
    pub async fn file(path: impl AsRef<Path>) -> crate::Result<Body> {
        let path = path.as_ref().to_owned();
        let meta = tokio::fs::metadata(&path).await.map_err(Error::builder)?;
        let content_type = mime_guess::from_path(&path)
            .first_raw()
            .and_then(|mime| HeaderValue::from_str(mime).ok());
        Ok(Body {
            kind: Kind::File {
                len: meta.len(),
                path,
            },
            content_type,
        })
    }

    /// A body streamed from a reader; sent with chunked transfer
    /// encoding since the total length is unknown.
    pub fn from_reader(reader: impl AsyncRead + Send + Sync + Unpin + 'static) -> Body {
        Body {
            kind: Kind::Reader(Box::new(reader)),
            content_type: None,
        }
    }

    /// Overrides the content type this body advertises.
    pub fn with_content_type(mut self, value: HeaderValue) -> Body {
        self.content_type = Some(value);
        self
    }

    /// The number of bytes this body will produce, when known up front.
    /// `None` means the body is sent chunked.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Full(bytes) => Some(bytes.len() as u64),
            Kind::File { len, .. } => Some(*len),
            Kind::Reader(_) => None,
        }
    }

    /// The content type this body advertises, if any.
    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.content_type.as_ref()
    }

    /// Attempts to clone the body for a replayed request. Streaming
    /// bodies cannot be replayed.
    pub fn try_clone(&self) -> Option<Body> {
        let kind = match &self.kind {
            Kind::Empty => Kind::Empty,
            Kind::Full(bytes) => Kind::Full(bytes.clone()),
            Kind::File { path, len } => Kind::File {
                path: path.clone(),
                len: *len,
            },
            Kind::Reader(_) => return None,
        };
        Some(Body {
            kind,
            content_type: self.content_type.clone(),
        })
    }

    /// Pushes the body bytes into the writer, framing them according to
    /// [`content_length`](Body::content_length).
    pub(crate) async fn write(self, io: &mut (impl AsyncWrite + Unpin)) -> crate::Result<()> {
        match self.kind {
            Kind::Empty => Ok(()),
            Kind::Full(bytes) => io.write_all(&bytes).await.map_err(Error::transport),
            Kind::File { path, .. } => {
                let mut file = tokio::fs::File::open(&path).await.map_err(Error::builder)?;
                let mut chunk = vec![0u8; FILE_CHUNK];
                loop {
                    let n = file.read(&mut chunk).await.map_err(Error::builder)?;
                    if n == 0 {
                        return Ok(());
                    }
                    io.write_all(&chunk[..n]).await.map_err(Error::transport)?;
                }
            }
            Kind::Reader(mut reader) => {
                let mut chunk = vec![0u8; FILE_CHUNK];
                let mut frame = BytesMut::new();
                loop {
                    let n = reader.read(&mut chunk).await.map_err(Error::builder)?;
                    if n == 0 {
                        return io
                            .write_all(proto::CHUNKED_END)
                            .await
                            .map_err(Error::transport);
                    }
                    frame.clear();
                    proto::encode_chunk(&mut frame, &chunk[..n]);
                    io.write_all(&frame).await.map_err(Error::transport)?;
                }
            }
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.write_str("Body::Empty"),
            Kind::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Kind::File { path, len } => f
                .debug_struct("Body::File")
                .field("path", path)
                .field("len", len)
                .finish(),
            Kind::Reader(_) => f.write_str("Body::Reader"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            kind: Kind::Full(bytes),
            content_type: None,
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Bytes::from(vec).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Bytes::from_static(slice).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body {
            kind: Kind::Full(Bytes::from(s)),
            content_type: Some(HeaderValue::from_static("text/plain; charset=utf-8")),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body {
            kind: Kind::Full(Bytes::from_static(s.as_bytes())),
            content_type: Some(HeaderValue::from_static("text/plain; charset=utf-8")),
        }
    }
}
