//! HTTP/1.1 wire format.
//!
//! Encodes request heads and chunked bodies, and decodes response heads and
//! payloads. Decoders implement [`tokio_util::codec::Decoder`] over the
//! connection's read buffer so they can resume wherever a read left off.
//!
//! Response payload framing follows RFC 9112 section 6.3:
//!
//! 1. `HEAD` responses and 1xx/204/304 statuses have no body
//! 2. `Transfer-Encoding: chunked` wins over `Content-Length`
//! 3. `Content-Length` gives a fixed size
//! 4. otherwise the body runs until the server closes the connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io;
use tokio_util::codec::Decoder;
use tracing::trace;
use url::Url;

/// Maximum number of headers accepted in a response head.
const MAX_HEADERS: usize = 100;

/// Maximum size of a response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum length of a chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CodecError {
    #[error("malformed response head: {0}")]
    Head(#[from] httparse::Error),
    #[error("response head larger than {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("invalid header: {0}")]
    Header(String),
    #[error("invalid content-length")]
    ContentLength,
    #[error("invalid chunked encoding: {0}")]
    Chunked(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A parsed response status line and header block.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) reason: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the server wants the connection closed after this response.
    pub(crate) fn wants_close(&self) -> bool {
        let tokens = connection_tokens(&self.headers);
        match self.version {
            Version::HTTP_10 => !tokens.iter().any(|t| t == "keep-alive"),
            _ => tokens.iter().any(|t| t == "close"),
        }
    }
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect()
}

/// Decodes a response head.
#[derive(Debug, Default)]
pub(crate) struct HeadDecoder;

impl Decoder for HeadDecoder {
    type Item = ResponseHead;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);

        let len = match parsed.parse(&src[..])? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if src.len() > MAX_HEAD_BYTES {
                    return Err(CodecError::HeadTooLarge);
                }
                return Ok(None);
            }
        };

        let status = parsed
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(CodecError::Head(httparse::Error::Status))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let reason = parsed.reason.unwrap_or_default().to_string();

        let mut map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| CodecError::Header(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| CodecError::Header(e.to_string()))?;
            map.append(name, value);
        }

        src.advance(len);
        trace!(%status, header_len = len, "decoded response head");

        Ok(Some(ResponseHead {
            status,
            reason,
            version,
            headers: map,
        }))
    }
}

/// One step of a decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PayloadItem {
    Chunk(Bytes),
    Eof,
}

/// Decodes a response body according to its framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Empty,
    Length(u64),
    Chunked(ChunkedState),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

impl PayloadDecoder {
    pub(crate) fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    pub(crate) fn length(len: u64) -> Self {
        Self {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Self {
        Self {
            kind: Kind::Chunked(ChunkedState::Size),
        }
    }

    pub(crate) fn until_close() -> Self {
        Self {
            kind: Kind::UntilClose,
        }
    }

    /// Picks the framing for a response to `method`.
    pub(crate) fn for_response(method: &Method, head: &ResponseHead) -> Result<Self, CodecError> {
        let status = head.status;
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::empty());
        }

        let chunked = head
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Self::chunked());
        }

        let mut length = None;
        for value in head.headers.get_all(CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(CodecError::ContentLength)?;
            if length.is_some_and(|seen| seen != parsed) {
                return Err(CodecError::ContentLength);
            }
            length = Some(parsed);
        }

        Ok(match length {
            Some(len) => Self::length(len),
            None => Self::until_close(),
        })
    }

    /// The exact body size, when the framing states it.
    pub(crate) fn known_length(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty => Some(0),
            Kind::Length(len) => Some(len),
            _ => None,
        }
    }

    /// Whether the end of the body is marked in-band, leaving the connection usable.
    pub(crate) fn is_delimited(&self) -> bool {
        !matches!(self.kind, Kind::UntilClose)
    }

    fn decode_chunked(
        state: &mut ChunkedState,
        src: &mut BytesMut,
    ) -> Result<Option<PayloadItem>, CodecError> {
        loop {
            match *state {
                ChunkedState::Size => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > MAX_CHUNK_LINE {
                            return Err(CodecError::Chunked("chunk size line too long"));
                        }
                        return Ok(None);
                    };
                    let line = src.split_to(line_end + 2);
                    let size_text = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| CodecError::Chunked("chunk size is not ascii"))?;
                    let size_text = size_text.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_text, 16)
                        .map_err(|_| CodecError::Chunked("chunk size is not hex"))?;
                    *state = if size == 0 {
                        ChunkedState::Trailers
                    } else {
                        ChunkedState::Data(size)
                    };
                }
                ChunkedState::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64) as usize;
                    let chunk = src.split_to(take).freeze();
                    let left = remaining - take as u64;
                    *state = if left == 0 {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(left)
                    };
                    return Ok(Some(PayloadItem::Chunk(chunk)));
                }
                ChunkedState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(CodecError::Chunked("missing CRLF after chunk data"));
                    }
                    src.advance(2);
                    *state = ChunkedState::Size;
                }
                ChunkedState::Trailers => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > MAX_HEAD_BYTES {
                            return Err(CodecError::Chunked("trailers too large"));
                        }
                        return Ok(None);
                    };
                    src.advance(line_end + 2);
                    if line_end == 0 {
                        *state = ChunkedState::Done;
                    }
                }
                ChunkedState::Done => return Ok(Some(PayloadItem::Eof)),
            }
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Empty => Ok(Some(PayloadItem::Eof)),
            Kind::Length(0) => Ok(Some(PayloadItem::Eof)),
            Kind::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(src.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Some(PayloadItem::Chunk(src.split_to(take).freeze())))
            }
            Kind::Chunked(state) => Self::decode_chunked(state, src),
            Kind::UntilClose => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PayloadItem::Chunk(src.split().freeze())))
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.kind {
            Kind::UntilClose => {
                if src.is_empty() {
                    Ok(Some(PayloadItem::Eof))
                } else {
                    Ok(Some(PayloadItem::Chunk(src.split().freeze())))
                }
            }
            _ => match self.decode(src)? {
                Some(item) => Ok(Some(item)),
                None => Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the body was complete",
                ))),
            },
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Length(u64),
    Chunked,
}

/// Encodes a request line and header block into `dst`.
///
/// The request target is in origin form, or in absolute form when
/// `absolute_form` is set (plain HTTP through a forward proxy). `Host` and the
/// framing headers are derived here; any caller-supplied framing headers are
/// replaced.
pub(crate) fn encode_head(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    framing: BodyFraming,
    absolute_form: bool,
    dst: &mut BytesMut,
) {
    dst.put_slice(method.as_str().as_bytes());
    dst.put_u8(b' ');
    if absolute_form {
        let mut target = url.clone();
        target.set_fragment(None);
        dst.put_slice(target.as_str().as_bytes());
    } else {
        dst.put_slice(url.path().as_bytes());
        if let Some(query) = url.query() {
            dst.put_u8(b'?');
            dst.put_slice(query.as_bytes());
        }
    }
    dst.put_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(HOST) {
        dst.put_slice(b"host: ");
        dst.put_slice(url.host_str().unwrap_or_default().as_bytes());
        if let Some(port) = url.port() {
            dst.put_slice(format!(":{port}").as_bytes());
        }
        dst.put_slice(b"\r\n");
    }

    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }

    match framing {
        BodyFraming::Length(0) if !method_expects_body(method) => {}
        BodyFraming::Length(len) => {
            dst.put_slice(format!("content-length: {len}\r\n").as_bytes());
        }
        BodyFraming::Chunked => dst.put_slice(b"transfer-encoding: chunked\r\n"),
    }
    dst.put_slice(b"\r\n");
}

fn method_expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Encodes one chunk of a chunked body. Empty data is skipped, since a
/// zero-size chunk would end the body.
pub(crate) fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    dst.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// The terminating chunk of a chunked body.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
