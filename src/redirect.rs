//! Redirect handling.
//!
//! [`RedirectPolicy::resolve`] turns a 3xx response into the next request of
//! the chain, rewriting method, body and headers the way browsers and RFC 9110
//! expect. [`RedirectChain`] keeps the followed responses and enforces the
//! maximum chain length.

use crate::{Body, Error, Request, Response, Result};
use http::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION,
    PROXY_AUTHORIZATION, TRANSFER_ENCODING,
};
use http::{Method, StatusCode};
use url::Url;

/// How 301 and 302 treat the request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectSemantics {
    /// Rewrite POST, or any request carrying a body, to a bodiless GET, as
    /// browsers do.
    #[default]
    Compatible,
    /// Keep the method and body, as RFC 9110 permits.
    Strict,
}

/// Controls whether and how redirects are followed.
///
/// # Examples
///
/// ```
/// use spindle::{RedirectPolicy, RedirectSemantics};
///
/// // Default: follow up to 10 redirects
/// let default = RedirectPolicy::default();
/// assert_eq!(default.max(), 10);
///
/// // Return 3xx responses as-is
/// let manual = RedirectPolicy::none();
/// assert!(!manual.follows());
///
/// let strict = RedirectPolicy::limited(3)
///     .semantics(RedirectSemantics::Strict)
///     .persist_credentials(true);
/// # let _ = strict;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPolicy {
    follow: bool,
    max: usize,
    semantics: RedirectSemantics,
    persist_credentials: bool,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            follow: true,
            max: 10,
            semantics: RedirectSemantics::default(),
            persist_credentials: false,
        }
    }
}

impl RedirectPolicy {
    /// Never follow redirects.
    pub fn none() -> Self {
        Self {
            follow: false,
            ..Self::default()
        }
    }

    /// Follow at most `max` redirects.
    pub fn limited(max: usize) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    /// Sets the 301/302 method handling.
    pub fn semantics(mut self, semantics: RedirectSemantics) -> Self {
        self.semantics = semantics;
        self
    }

    /// Keeps `Authorization`, `Cookie` and `Proxy-Authorization` when a
    /// redirect leaves the original origin.
    pub fn persist_credentials(mut self, persist: bool) -> Self {
        self.persist_credentials = persist;
        self
    }

    /// Returns `true` if redirects are followed.
    pub fn follows(&self) -> bool {
        self.follow
    }

    /// Returns the maximum chain length.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Builds the request that follows `response`, or `None` when the chain
    /// ends here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRedirect`] when the `Location` header is not a
    /// usable HTTP(S) URL.
    pub fn resolve(&self, request: &Request, response: &Response) -> Result<Option<Request>> {
        if !self.follow || !is_redirect(response.status) {
            return Ok(None);
        }
        let Some(location) = response.headers.get(LOCATION) else {
            return Ok(None);
        };

        let invalid = || Error::InvalidRedirect {
            url: response.url.to_string(),
            location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
        };
        let location = location.to_str().map_err(|_| invalid())?;
        let mut next_url = response.url.join(location).map_err(|_| invalid())?;
        if !matches!(next_url.scheme(), "http" | "https") || next_url.host().is_none() {
            return Err(invalid());
        }
        if next_url.fragment().is_none() {
            next_url.set_fragment(request.url().fragment());
        }

        let method = request.method();
        let (method, keep_body) = match response.status {
            StatusCode::SEE_OTHER if method == Method::HEAD => (Method::HEAD, false),
            StatusCode::SEE_OTHER => (Method::GET, false),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
                if self.semantics == RedirectSemantics::Compatible
                    && (method == Method::POST || !request.body().is_empty()) =>
            {
                (Method::GET, false)
            }
            _ => (method, true),
        };

        let mut headers = request.headers().clone();
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        if !keep_body {
            headers.remove(CONTENT_TYPE);
            headers.remove(CONTENT_ENCODING);
            headers.remove(TRANSFER_ENCODING);
        }
        if !self.persist_credentials && !same_origin(request.url(), &next_url) {
            headers.remove(AUTHORIZATION);
            headers.remove(COOKIE);
            headers.remove(PROXY_AUTHORIZATION);
        }

        let mut next = request
            .clone()
            .with_method(method)
            .with_url(next_url)
            .with_headers(headers);
        if !keep_body {
            next = next.with_body(Body::empty());
        }
        Ok(Some(next))
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn same_origin(left: &Url, right: &Url) -> bool {
    left.scheme() == right.scheme()
        && left
            .host_str()
            .zip(right.host_str())
            .is_some_and(|(l, r)| l.eq_ignore_ascii_case(r))
        && left.port_or_known_default() == right.port_or_known_default()
}

/// The responses followed so far in one call.
#[derive(Debug, Default)]
pub struct RedirectChain {
    max: usize,
    history: Vec<Response>,
}

impl RedirectChain {
    /// Creates an empty chain allowing `max` redirects.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            history: Vec::new(),
        }
    }

    /// Records a redirect that is about to be followed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyRedirects`] carrying the `max` responses already
    /// followed when the chain is full.
    pub fn record(&mut self, response: Response) -> Result<()> {
        if self.history.len() >= self.max {
            return Err(Error::TooManyRedirects {
                max: self.max,
                history: std::mem::take(&mut self.history),
            });
        }
        self.history.push(response);
        Ok(())
    }

    /// Returns the number of redirects followed.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns `true` if no redirect was followed.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Returns the followed responses, oldest first.
    pub fn into_history(self) -> Vec<Response> {
        self.history
    }
}
