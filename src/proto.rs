//! HTTP/1.1 wire glue: request-head serialization, response-head parsing
//! on top of `httparse`, and body framing for both directions.

use std::fmt::Write as _;

use bytes::{Buf, Bytes, BytesMut};
use http::{
    header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, Method, StatusCode, Version,
};

use crate::Error;

pub(crate) const MAX_HEADERS: usize = 100;

/// totally scientific
const AVERAGE_HEADER_SIZE: usize = 30;

/// A parsed response head, surfaced before the body is consumed.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// Serializes a request head into `dst`.
///
/// The caller has already fixed up `Host`, cookies, and body headers;
/// this writes the request line followed by the headers verbatim.
pub(crate) fn encode_request_head(
    dst: &mut BytesMut,
    method: &Method,
    target: &str,
    headers: &HeaderMap,
) {
    dst.reserve(target.len() + 16 + headers.len() * AVERAGE_HEADER_SIZE);
    let _ = write!(dst, "{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

/// Tries to parse a complete response head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the head's
/// bytes are consumed from `buf`; any remainder is body data.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> crate::Result<Option<ResponseHead>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let (len, status, version, headers) = {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut parsed);
        match res.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let status =
                    StatusCode::from_u16(res.code.unwrap_or(0)).map_err(Error::protocol)?;
                let version = if res.version == Some(1) {
                    Version::HTTP_11
                } else {
                    Version::HTTP_10
                };
                let mut headers = HeaderMap::with_capacity(res.headers.len());
                for header in res.headers.iter() {
                    let name =
                        HeaderName::from_bytes(header.name.as_bytes()).map_err(Error::protocol)?;
                    let value = HeaderValue::from_bytes(header.value).map_err(Error::protocol)?;
                    headers.append(name, value);
                }
                (len, status, version, headers)
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::protocol(e)),
        }
    };

    buf.advance(len);

    Ok(Some(ResponseHead {
        status,
        version,
        headers,
    }))
}

/// What `Decoder::decode` produced from the buffered input.
pub(crate) enum Decoded {
    /// A run of body bytes, drained from the scratch buffer.
    Data(Bytes),
    /// The buffered input holds no complete piece; read more.
    NeedMore,
    /// The message body is complete.
    Complete,
}

/// Client-role body length decoder for one response.
#[derive(Debug)]
pub(crate) enum Decoder {
    /// No body (HEAD, 204, 304, or zero length).
    Empty,
    /// `Content-Length` countdown.
    Length(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked(Chunked),
    /// Close-delimited: body runs until EOF, connection is not reusable.
    Eof,
}

#[derive(Debug)]
pub(crate) enum Chunked {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
    Done,
}

impl Decoder {
    /// Picks the decoder for a response head, per the client rules of
    /// RFC 9112 §6.3.
    pub(crate) fn detect(method: &Method, head: &ResponseHead) -> crate::Result<Decoder> {
        if method == Method::HEAD
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
            || head.status.is_informational()
        {
            return Ok(Decoder::Empty);
        }

        if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
            let chunked = te
                .to_str()
                .is_ok_and(|s| {
                    s.rsplit(',')
                        .next()
                        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
                });
            if chunked {
                return Ok(Decoder::Chunked(Chunked::Size));
            }
            return Err(Error::protocol(ProtocolViolation(
                "unsupported transfer-encoding",
            )));
        }

        if let Some(len) = head.headers.get(CONTENT_LENGTH) {
            let len = len
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::protocol(ProtocolViolation("invalid content-length")))?;
            return Ok(if len == 0 {
                Decoder::Empty
            } else {
                Decoder::Length(len)
            });
        }

        Ok(Decoder::Eof)
    }

    /// A close-delimited body poisons keep-alive.
    pub(crate) fn forces_close(&self) -> bool {
        matches!(self, Decoder::Eof)
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self, Decoder::Empty | Decoder::Chunked(Chunked::Done))
    }

    /// Drains as much decoded body as `buf` allows.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> crate::Result<Decoded> {
        match self {
            Decoder::Empty => Ok(Decoded::Complete),
            Decoder::Length(remaining) => {
                if *remaining == 0 {
                    *self = Decoder::Empty;
                    return Ok(Decoded::Complete);
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                let data = buf.split_to(take).freeze();
                if *remaining == 0 {
                    *self = Decoder::Empty;
                }
                Ok(Decoded::Data(data))
            }
            Decoder::Chunked(state) => loop {
                match state {
                    Chunked::Size => match httparse::parse_chunk_size(buf) {
                        Ok(httparse::Status::Complete((consumed, size))) => {
                            buf.advance(consumed);
                            *state = if size == 0 {
                                Chunked::Trailer
                            } else {
                                Chunked::Data(size)
                            };
                        }
                        Ok(httparse::Status::Partial) => return Ok(Decoded::NeedMore),
                        Err(httparse::InvalidChunkSize) => {
                            return Err(Error::protocol(ProtocolViolation("invalid chunk size")))
                        }
                    },
                    Chunked::Data(remaining) => {
                        if buf.is_empty() {
                            return Ok(Decoded::NeedMore);
                        }
                        let take = (*remaining).min(buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        let done = *remaining == 0;
                        let data = buf.split_to(take).freeze();
                        if done {
                            *state = Chunked::DataCrlf;
                        }
                        return Ok(Decoded::Data(data));
                    }
                    Chunked::DataCrlf => {
                        if buf.len() < 2 {
                            return Ok(Decoded::NeedMore);
                        }
                        if &buf[..2] != b"\r\n" {
                            return Err(Error::protocol(ProtocolViolation(
                                "missing chunk terminator",
                            )));
                        }
                        buf.advance(2);
                        *state = Chunked::Size;
                    }
                    Chunked::Trailer => {
                        if buf.len() < 2 {
                            return Ok(Decoded::NeedMore);
                        }
                        if &buf[..2] == b"\r\n" {
                            buf.advance(2);
                            *state = Chunked::Done;
                            return Ok(Decoded::Complete);
                        }
                        // Skip one trailer line.
                        match buf.windows(2).position(|w| w == b"\r\n") {
                            Some(pos) => buf.advance(pos + 2),
                            None => return Ok(Decoded::NeedMore),
                        }
                    }
                    Chunked::Done => return Ok(Decoded::Complete),
                }
            },
            Decoder::Eof => {
                if buf.is_empty() {
                    Ok(Decoded::NeedMore)
                } else {
                    Ok(Decoded::Data(buf.split().freeze()))
                }
            }
        }
    }

    /// The transport hit EOF; decide whether the body was complete.
    pub(crate) fn on_eof(&mut self) -> crate::Result<()> {
        match self {
            Decoder::Eof => {
                *self = Decoder::Empty;
                Ok(())
            }
            Decoder::Empty => Ok(()),
            _ => Err(Error::protocol(ProtocolViolation("unexpected eof in body"))),
        }
    }
}

/// Encodes one chunk of a chunked request body.
pub(crate) fn encode_chunk(dst: &mut BytesMut, data: &[u8]) {
    let _ = write!(dst, "{:X}\r\n", data.len());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// The terminating chunk of a chunked request body.
pub(crate) const CHUNKED_END: &[u8] = b"0\r\n\r\n";

#[derive(Debug)]
pub(crate) struct ProtocolViolation(pub(crate) &'static str);

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ProtocolViolation {}
