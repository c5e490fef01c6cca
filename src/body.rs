//! Request bodies.
//!
//! A [`Body`] is empty, a buffer, or a lazily produced stream. Buffers can be
//! sent any number of times. A plain stream can be sent once: it is taken out
//! of the body when the first byte is about to be written, and any later
//! attempt to send it fails with [`Error::BodyAlreadyConsumed`]. A replayable
//! stream is rebuilt from its factory for every send.

use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

/// A stream of body chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

type StreamFactory = Arc<dyn Fn() -> ByteStream + Send + Sync>;

/// A request body.
///
/// Cloning is cheap. Clones of a one-shot stream share it, so only one of them
/// can ever be sent.
#[derive(Clone, Default)]
pub struct Body {
    kind: Kind,
}

#[derive(Clone, Default)]
enum Kind {
    #[default]
    Empty,
    Bytes(Bytes),
    Once {
        stream: Arc<Mutex<Option<ByteStream>>>,
        len: Option<u64>,
    },
    Replayable {
        factory: StreamFactory,
        len: Option<u64>,
    },
}

/// What an attempt actually writes.
pub(crate) enum BodySource {
    Empty,
    Bytes(Bytes),
    Stream {
        stream: ByteStream,
        len: Option<u64>,
    },
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Serializes `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_vec(value)
            .map(Self::from)
            .map_err(|e| Error::SerializationFailed(e.to_string()))
    }

    /// A one-shot stream of unknown length, sent with chunked encoding.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            kind: Kind::Once {
                stream: Arc::new(Mutex::new(Some(stream.boxed()))),
                len: None,
            },
        }
    }

    /// A one-shot stream of exactly `len` bytes, sent with `Content-Length`.
    pub fn sized_stream<S>(stream: S, len: u64) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            kind: Kind::Once {
                stream: Arc::new(Mutex::new(Some(stream.boxed()))),
                len: Some(len),
            },
        }
    }

    /// A stream that can be produced again for retries and redirects.
    ///
    /// # Examples
    ///
    /// ```
    /// use bytes::Bytes;
    /// use futures_util::stream;
    /// use spindle::Body;
    ///
    /// let body = Body::replayable(|| {
    ///     stream::iter(vec![Ok(Bytes::from_static(b"part one, ")), Ok(Bytes::from_static(b"part two"))])
    /// });
    /// assert!(body.is_replayable());
    /// ```
    pub fn replayable<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            kind: Kind::Replayable {
                factory: Arc::new(move || factory().boxed()),
                len: None,
            },
        }
    }

    /// Returns the body length if it is known up front.
    pub fn len(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Bytes(bytes) => Some(bytes.len() as u64),
            Kind::Once { len, .. } | Kind::Replayable { len, .. } => *len,
        }
    }

    /// Returns `true` for a body that is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Returns the buffered bytes, if this is a buffered body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            Kind::Empty => Some(&[]),
            Kind::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns `true` if the body can be sent more than once.
    pub fn is_replayable(&self) -> bool {
        !matches!(self.kind, Kind::Once { .. })
    }

    /// Returns `true` if this is a one-shot stream that was already taken.
    pub fn is_consumed(&self) -> bool {
        match &self.kind {
            Kind::Once { stream, .. } => crate::util::lock_unpoisoned(stream).is_none(),
            _ => false,
        }
    }

    /// Takes what to write for one attempt.
    pub(crate) fn open(&self) -> Result<BodySource> {
        match &self.kind {
            Kind::Empty => Ok(BodySource::Empty),
            Kind::Bytes(bytes) => Ok(BodySource::Bytes(bytes.clone())),
            Kind::Once { stream, len } => crate::util::lock_unpoisoned(stream)
                .take()
                .map(|stream| BodySource::Stream { stream, len: *len })
                .ok_or(Error::BodyAlreadyConsumed),
            Kind::Replayable { factory, len } => Ok(BodySource::Stream {
                stream: factory(),
                len: *len,
            }),
        }
    }

    /// Drains a one-shot stream into memory so the body can be resent.
    pub(crate) async fn buffered(self) -> Result<Self> {
        if !matches!(self.kind, Kind::Once { .. }) {
            return Ok(self);
        }
        let BodySource::Stream { mut stream, .. } = self.open()? else {
            return Ok(self);
        };
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(Error::BodyStream)?);
        }
        Ok(Self::from(buf.freeze()))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.write_str("Body::Empty"),
            Kind::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Kind::Once { len, .. } => write!(
                f,
                "Body::Stream(len: {:?}, consumed: {})",
                len,
                self.is_consumed()
            ),
            Kind::Replayable { len, .. } => write!(f, "Body::Replayable(len: {:?})", len),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::empty()
        } else {
            Self {
                kind: Kind::Bytes(bytes),
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}
