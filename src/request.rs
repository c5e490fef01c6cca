//! Request values.
//!
//! A [`Request`] describes one logical call: method, URL, headers, body, and
//! optional per-call overrides of the client's timeout, retry, redirect and
//! rate-limit settings. Requests are plain values; every `with_*` method
//! returns a new one.

use crate::{Body, Error, RateLimiter, RedirectPolicy, Result, RetryPolicy, Timeout};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::sync::Arc;
use url::Url;

/// A request to execute.
///
/// # Examples
///
/// ```
/// use spindle::{Request, RetryPolicy};
/// use http::Method;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), spindle::Error> {
/// let request = Request::parse(Method::POST, "https://api.example.com/jobs")?
///     .with_header("X-Request-Id", "42")?
///     .with_json(&serde_json::json!({"kind": "reindex"}))?
///     .with_timeout(Duration::from_secs(5))
///     .with_retry(RetryPolicy::exponential(3, Duration::from_millis(200), 2.0));
///
/// assert_eq!(request.method(), Method::POST);
/// assert_eq!(request.headers()["content-type"], "application/json");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Body,
    pub(crate) overrides: Overrides,
}

/// Per-call replacements for client-level settings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub(crate) timeout: Option<Timeout>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) redirect: Option<RedirectPolicy>,
    pub(crate) rate_limit: Option<RateLimitOverride>,
    pub(crate) raise_for_status: Option<bool>,
    pub(crate) stream: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum RateLimitOverride {
    Disabled,
    Limiter(Arc<RateLimiter>),
}

impl Request {
    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::empty(),
            overrides: Overrides::default(),
        }
    }

    /// Creates a request from an absolute URL string.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL doesn't parse.
    pub fn parse(method: Method, url: &str) -> Result<Self> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    /// Returns the method.
    pub fn method(&self) -> Method {
        self.method.clone()
    }

    /// Returns the target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the headers for in-place changes.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Returns `true` if the call asked for a streamed response.
    pub fn is_streaming(&self) -> bool {
        self.overrides.stream
    }

    /// Replaces the method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Replaces the URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// Sets a header, replacing any existing values of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        Ok(self.with_header_value(name, value))
    }

    /// Sets an already-typed header, replacing existing values.
    pub fn with_header_value(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a header value, keeping existing values of the same name.
    pub fn with_appended_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Removes every value of a header.
    pub fn without_header(mut self, name: impl http::header::AsHeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    /// Replaces all headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Appends a query parameter to the URL.
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    /// Replaces the body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as the JSON body and sets `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Body::json(value)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Overrides the client's timeouts for this call.
    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.overrides.timeout = Some(timeout.into());
        self
    }

    /// Overrides the client's retry policy for this call.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.overrides.retry = Some(policy);
        self
    }

    /// Overrides the client's redirect policy for this call.
    pub fn with_redirect(mut self, policy: RedirectPolicy) -> Self {
        self.overrides.redirect = Some(policy);
        self
    }

    /// Uses `limiter` instead of the client's rate limiter for this call.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.overrides.rate_limit = Some(RateLimitOverride::Limiter(limiter));
        self
    }

    /// Skips rate limiting for this call.
    pub fn without_rate_limit(mut self) -> Self {
        self.overrides.rate_limit = Some(RateLimitOverride::Disabled);
        self
    }

    /// Turns 4xx/5xx responses into [`Error::HttpStatus`] for this call.
    pub fn with_raise_for_status(mut self, raise: bool) -> Self {
        self.overrides.raise_for_status = Some(raise);
        self
    }

    /// Returns the response with its body unread, to be consumed with
    /// [`Response::chunk`](crate::Response::chunk) or
    /// [`Response::into_stream`](crate::Response::into_stream).
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.overrides.stream = stream;
        self
    }
}

pub(crate) fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::try_from(name)
        .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
    Ok((name, value))
}
