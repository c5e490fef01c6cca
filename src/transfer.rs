//! Moving bytes over a pooled connection.
//!
//! Writes a request, reads the response head, and reads the body as an
//! incremental [`BodyReader`]. Every socket operation runs under its own
//! write or read deadline, so a slow trickle of bytes never trips the limit
//! as long as each read makes progress in time.
//!
//! A connection goes back to the pool only after its body was read to a
//! delimited end. Errors, early closes, and bodies that end with the server
//! closing the socket all drop the connection instead.

use crate::body::BodySource;
use crate::codec::{
    self, BodyFraming, HeadDecoder, PayloadDecoder, PayloadItem, ResponseHead, LAST_CHUNK,
};
use crate::pool::Connection;
use crate::timeout::TimeoutController;
use crate::{Error, Request, Result, TimeoutPhase};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::{Method, StatusCode};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Buffered bodies up to this size are written together with the head.
const COALESCE_LIMIT: usize = 64 * 1024;

/// Writes `request` with `body` to `conn`.
pub(crate) async fn send_request(
    conn: &mut Connection,
    request: &Request,
    body: BodySource,
    timeouts: &TimeoutController,
) -> Result<()> {
    let framing = match &body {
        BodySource::Empty => BodyFraming::Length(0),
        BodySource::Bytes(bytes) => BodyFraming::Length(bytes.len() as u64),
        BodySource::Stream { len: Some(len), .. } => BodyFraming::Length(*len),
        BodySource::Stream { len: None, .. } => BodyFraming::Chunked,
    };

    let mut headers = request.headers().clone();
    let absolute_form = match &conn.forward_proxy {
        Some(proxy_headers) => {
            for (name, value) in proxy_headers {
                headers.insert(name.clone(), value.clone());
            }
            true
        }
        None => false,
    };

    let mut buf = BytesMut::with_capacity(1024);
    codec::encode_head(
        &request.method(),
        request.url(),
        &headers,
        framing,
        absolute_form,
        &mut buf,
    );

    match body {
        BodySource::Empty => write(conn, &buf, timeouts).await?,
        BodySource::Bytes(bytes) if bytes.len() <= COALESCE_LIMIT => {
            buf.extend_from_slice(&bytes);
            write(conn, &buf, timeouts).await?;
        }
        BodySource::Bytes(bytes) => {
            write(conn, &buf, timeouts).await?;
            write(conn, &bytes, timeouts).await?;
        }
        BodySource::Stream { mut stream, len } => {
            write(conn, &buf, timeouts).await?;
            let mut sent = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(Error::BodyStream)?;
                sent += chunk.len() as u64;
                if len.is_some_and(|len| sent > len) {
                    return Err(length_mismatch(len, sent));
                }
                if len.is_some() {
                    write(conn, &chunk, timeouts).await?;
                } else if !chunk.is_empty() {
                    buf.clear();
                    codec::encode_chunk(&chunk, &mut buf);
                    write(conn, &buf, timeouts).await?;
                }
            }
            match len {
                Some(len) if sent != len => return Err(length_mismatch(Some(len), sent)),
                Some(_) => {}
                None => write(conn, LAST_CHUNK, timeouts).await?,
            }
        }
    }

    timeouts
        .io(TimeoutPhase::Write, conn.io.flush(), |e| {
            Error::reset(timeouts.url(), false, e)
        })
        .await?;
    trace!(url = timeouts.url(), "request written");
    Ok(())
}

fn length_mismatch(declared: Option<u64>, sent: u64) -> Error {
    Error::BodyStream(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "body stream produced {} bytes but declared {}",
            sent,
            declared.unwrap_or_default()
        ),
    ))
}

async fn write(conn: &mut Connection, data: &[u8], timeouts: &TimeoutController) -> Result<()> {
    timeouts
        .io(TimeoutPhase::Write, conn.io.write_all(data), |e| {
            Error::reset(timeouts.url(), false, e)
        })
        .await
}

/// Reads the next final (non-1xx) response head from `conn`.
///
/// A connection that closes before a single byte of the head arrives yields a
/// [`ConnectErrorKind::Reset`](crate::ConnectErrorKind::Reset) connection
/// error marked `request_sent`, which is also how a keep-alive connection the
/// server already dropped shows up.
pub(crate) async fn read_head(
    conn: &mut Connection,
    timeouts: &TimeoutController,
) -> Result<ResponseHead> {
    loop {
        match HeadDecoder.decode(&mut conn.read_buf) {
            Ok(Some(head))
                if head.status.is_informational()
                    && head.status != StatusCode::SWITCHING_PROTOCOLS =>
            {
                trace!(status = %head.status, "skipping interim response");
                continue;
            }
            Ok(Some(head)) => return Ok(head),
            Ok(None) => {}
            Err(e) => return Err(Error::protocol(timeouts.url(), e.to_string())),
        }

        let read = timeouts
            .io(
                TimeoutPhase::Read,
                conn.io.read_buf(&mut conn.read_buf),
                |e| Error::reset(timeouts.url(), true, e),
            )
            .await?;
        if read == 0 {
            return Err(Error::reset(
                timeouts.url(),
                true,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the response head",
                ),
            ));
        }
    }
}

/// Reads a response body off a connection chunk by chunk.
///
/// Holds the connection until the body ends, then releases it to the pool.
/// Closing the reader early, or dropping it, closes the connection.
pub struct BodyReader {
    conn: Option<Connection>,
    decoder: PayloadDecoder,
    timeouts: TimeoutController,
    reusable: bool,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("url", &self.timeouts.url())
            .field("buffered_chunks", &self.pending.len())
            .field("open", &self.is_open())
            .finish()
    }
}

impl BodyReader {
    /// Starts reading the body that follows `head` on `conn`.
    pub(crate) fn new(
        conn: Connection,
        method: &Method,
        head: &ResponseHead,
        timeouts: TimeoutController,
    ) -> Result<Self> {
        let decoder = PayloadDecoder::for_response(method, head)
            .map_err(|e| Error::protocol(timeouts.url(), e.to_string()))?;
        Ok(Self {
            conn: Some(conn),
            decoder,
            timeouts,
            reusable: !head.wants_close(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// The body size announced by the server, if any.
    pub(crate) fn known_length(&self) -> Option<u64> {
        self.decoder.known_length()
    }

    /// Returns the next chunk, or `None` once the body has ended.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(conn) = self.conn.as_mut() else {
                return Ok(None);
            };

            match self.decoder.decode(&mut conn.read_buf) {
                Ok(Some(PayloadItem::Chunk(chunk))) if chunk.is_empty() => continue,
                Ok(Some(PayloadItem::Chunk(chunk))) => return Ok(Some(chunk)),
                Ok(Some(PayloadItem::Eof)) => {
                    self.finish();
                    return Ok(None);
                }
                Ok(None) => {}
                Err(e) => {
                    let err = Error::protocol(self.timeouts.url(), e.to_string());
                    self.abort();
                    return Err(err);
                }
            }

            let read = self
                .timeouts
                .io(
                    TimeoutPhase::Read,
                    conn.io.read_buf(&mut conn.read_buf),
                    |e| Error::reset(self.timeouts.url(), true, e),
                )
                .await;
            match read {
                Ok(0) => match self.decoder.decode_eof(&mut conn.read_buf) {
                    Ok(Some(PayloadItem::Chunk(chunk))) => return Ok(Some(chunk)),
                    Ok(Some(PayloadItem::Eof)) => {
                        self.reusable = false;
                        self.finish();
                        return Ok(None);
                    }
                    Ok(None) | Err(_) => {
                        let err = Error::reset(
                            self.timeouts.url(),
                            true,
                            io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed before the body was complete",
                            ),
                        );
                        self.abort();
                        return Err(err);
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
    }

    /// Stops reading and closes the connection. Unread bytes are discarded.
    pub fn close(&mut self) {
        self.pending.clear();
        self.done = true;
        if let Some(mut conn) = self.conn.take() {
            conn.request_close();
        }
    }

    /// Returns `true` while there may be more body to read.
    pub fn is_open(&self) -> bool {
        !self.pending.is_empty() || (!self.done && self.conn.is_some())
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(mut conn) = self.conn.take() {
            if !self.reusable || !self.decoder.is_delimited() {
                conn.request_close();
            }
            conn.release();
        }
    }

    fn abort(&mut self) {
        self.done = true;
        if let Some(mut conn) = self.conn.take() {
            conn.mark_broken();
        }
    }

    /// Reads up to `threshold` bytes into memory. Returns the whole body when
    /// it fits, or the reader with what was read queued in front of it.
    pub(crate) async fn buffer(mut self, threshold: Option<usize>) -> Result<Buffered> {
        if let (Some(limit), Some(len)) = (threshold, self.known_length()) {
            if len > limit as u64 {
                return Ok(Buffered::Streaming(self));
            }
        }

        let mut chunks = Vec::new();
        let mut total = 0usize;
        while let Some(chunk) = self.next_chunk().await? {
            total += chunk.len();
            chunks.push(chunk);
            if threshold.is_some_and(|limit| total > limit) {
                self.pending.extend(chunks);
                return Ok(Buffered::Streaming(self));
            }
        }

        Ok(Buffered::Complete(concat(chunks, total)))
    }
}

/// Outcome of [`BodyReader::buffer`].
#[derive(Debug)]
pub(crate) enum Buffered {
    Complete(Bytes),
    Streaming(BodyReader),
}

fn concat(mut chunks: Vec<Bytes>, total: usize) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }
    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}
