//! Responses and their bodies.
//!
//! A [`Response`] carries the status, headers and final URL of an exchange,
//! plus metadata about how it was obtained: the redirect history, the number
//! of attempts, and the total time spent. The body is either fully buffered or
//! still streaming off the connection, depending on its size and on whether
//! streaming was requested.

use crate::transfer::BodyReader;
use crate::{Error, RateLimitInfo, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use url::Url;

/// The response to a request.
///
/// # Examples
///
/// ```no_run
/// use spindle::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), spindle::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get("/users/123").send().await?;
///
/// println!("Status: {}", response.status);
/// println!("Request took {:?}", response.elapsed);
/// println!("Attempts: {}", response.attempts);
/// for hop in &response.history {
///     println!("Redirected by {} ({})", hop.url, hop.status);
/// }
///
/// let user: User = response.json().await?;
/// println!("User: {}", user.name);
/// # Ok(())
/// # }
/// ```
pub struct Response {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The reason phrase the server sent.
    pub reason: String,

    /// The HTTP version the server answered with.
    pub version: Version,

    /// The response headers.
    pub headers: HeaderMap,

    /// The URL that produced this response, after any redirects.
    pub url: Url,

    /// The redirect responses followed to get here, oldest first.
    pub history: Vec<Response>,

    /// Time from the start of the call until the final response head arrived,
    /// including rate-limit waits, retries and redirects.
    pub elapsed: Duration,

    /// The number of attempts made for the final hop.
    ///
    /// This will be `1` for requests that succeeded on the first try.
    pub attempts: usize,

    body: ResponseBody,
}

pub(crate) enum ResponseBody {
    Buffered(Bytes),
    Streaming(BodyReader),
    Closed,
}

impl Response {
    /// Creates a response with a buffered body.
    ///
    /// The engine builds responses itself; this is for after-hooks that
    /// replace a response, and for tests.
    ///
    /// # Examples
    ///
    /// ```
    /// use spindle::Response;
    /// use http::{HeaderMap, StatusCode};
    ///
    /// let url = url::Url::parse("https://example.com/").unwrap();
    /// let response = Response::new(StatusCode::OK, HeaderMap::new(), "hello", url);
    ///
    /// assert_eq!(response.reason, "OK");
    /// assert_eq!(response.body(), Some(&b"hello"[..]));
    /// assert!(!response.was_retried());
    /// ```
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>, url: Url) -> Self {
        Self {
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            version: Version::HTTP_11,
            headers,
            url,
            history: Vec::new(),
            elapsed: Duration::ZERO,
            attempts: 1,
            body: ResponseBody::Buffered(body.into()),
        }
    }

    pub(crate) fn from_parts(
        status: StatusCode,
        reason: String,
        version: Version,
        headers: HeaderMap,
        url: Url,
        body: ResponseBody,
    ) -> Self {
        Self {
            status,
            reason,
            version,
            headers,
            url,
            history: Vec::new(),
            elapsed: Duration::ZERO,
            attempts: 1,
            body,
        }
    }

    /// Returns the buffered body, or `None` while it is streaming or after it
    /// was consumed.
    pub fn body(&self) -> Option<&[u8]> {
        match &self.body {
            ResponseBody::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the body as text if it is buffered, replacing invalid UTF-8.
    pub fn text_lossy(&self) -> Option<String> {
        self.body()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Returns `true` if the body is being streamed and has not been fully read.
    pub fn is_stream_open(&self) -> bool {
        match &self.body {
            ResponseBody::Streaming(reader) => reader.is_open(),
            _ => false,
        }
    }

    /// Returns the next chunk of the body, or `None` once it has been read.
    ///
    /// A buffered body is returned as a single chunk.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            ResponseBody::Buffered(bytes) => {
                let bytes = std::mem::take(bytes);
                self.body = ResponseBody::Closed;
                Ok(Some(bytes).filter(|b| !b.is_empty()))
            }
            ResponseBody::Streaming(reader) => reader.next_chunk().await,
            ResponseBody::Closed => Ok(None),
        }
    }

    /// Stops reading the body. A streaming connection is closed rather than
    /// returned to the pool.
    pub fn close(&mut self) {
        if let ResponseBody::Streaming(reader) = &mut self.body {
            reader.close();
        }
        self.body = ResponseBody::Closed;
    }

    /// Reads the rest of the body into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        match std::mem::replace(&mut self.body, ResponseBody::Closed) {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Closed => Ok(Bytes::new()),
            ResponseBody::Streaming(mut reader) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = reader.next_chunk().await? {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Reads the body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the body and deserializes it as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeserializationFailed`] with the raw body when the
    /// body isn't valid JSON for `T`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let status = self.status;
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::DeserializationFailed {
            raw_response: String::from_utf8_lossy(&bytes).into_owned(),
            serde_error: e.to_string(),
            status,
        })
    }

    /// Turns the body into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Returns the value of a header as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the `Content-Type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Returns the `Content-Length` header, if it is a valid number.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns `true` if at least one redirect was followed.
    pub fn was_redirected(&self) -> bool {
        !self.history.is_empty()
    }

    /// Returns rate limit information from the headers.
    pub fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        RateLimitInfo::from_headers(&self.headers)
    }

    /// Returns the `name=value` pairs this response set with `Set-Cookie`.
    pub fn cookies(&self) -> Vec<(String, String)> {
        crate::cookie::set_cookie_pairs(&self.headers)
    }

    /// Converts a 4xx or 5xx response into [`Error::HttpStatus`].
    ///
    /// The error carries the body text when the body is buffered.
    ///
    /// # Examples
    ///
    /// ```
    /// use spindle::{Error, Response};
    /// use http::{HeaderMap, StatusCode};
    ///
    /// let url = url::Url::parse("https://example.com/missing").unwrap();
    /// let response = Response::new(StatusCode::NOT_FOUND, HeaderMap::new(), "no such thing", url);
    ///
    /// match response.error_for_status() {
    ///     Err(Error::HttpStatus { status, raw_response, .. }) => {
    ///         assert_eq!(status, StatusCode::NOT_FOUND);
    ///         assert_eq!(raw_response, "no such thing");
    ///     }
    ///     _ => panic!("expected an HTTP error"),
    /// }
    /// ```
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(self.into_status_error())
        } else {
            Ok(self)
        }
    }

    pub(crate) fn into_status_error(mut self) -> Error {
        let raw_response = self.text_lossy().unwrap_or_default();
        self.close();
        Error::HttpStatus {
            status: self.status,
            url: self.url.to_string(),
            raw_response,
            rate_limit_info: RateLimitInfo::from_headers(&self.headers),
            headers: Box::new(std::mem::take(&mut self.headers)),
        }
    }

    /// Reads a streaming body to the end so its connection can be reused, and
    /// keeps it buffered.
    ///
    /// At most `limit` bytes are kept. A longer body is cut there and its
    /// connection is closed instead of being read to the end.
    pub(crate) async fn drain(&mut self, limit: usize) -> Result<()> {
        let ResponseBody::Streaming(reader) = &mut self.body else {
            return Ok(());
        };
        let mut buf = BytesMut::new();
        while let Some(chunk) = reader.next_chunk().await? {
            if buf.len() + chunk.len() > limit {
                let room = limit - buf.len();
                buf.extend_from_slice(&chunk[..room]);
                reader.close();
                tracing::debug!(
                    url = %self.url,
                    limit,
                    "Discarding oversized body, closing its connection"
                );
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        self.body = ResponseBody::Buffered(buf.freeze());
        Ok(())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ResponseBody::Buffered(bytes) => format!("{} bytes", bytes.len()),
            ResponseBody::Streaming(_) => "streaming".to_string(),
            ResponseBody::Closed => "closed".to_string(),
        };
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("history", &self.history.len())
            .field("elapsed", &self.elapsed)
            .field("attempts", &self.attempts)
            .field("body", &body)
            .finish()
    }
}
