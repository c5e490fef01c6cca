//! Error types for request execution.
//!
//! Every failure the engine can produce is a variant of [`Error`]. Variants keep the
//! context needed to debug a failed call: the URL involved, the phase that timed out,
//! the raw response body of an HTTP error, or the redirect history that overflowed.

use crate::rate_limit::RateLimitInfo;
use crate::response::Response;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;

/// A boxed error used by hooks, credential providers and body producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The phase of an attempt a timeout fired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    /// Waiting for a free connection from the pool.
    Pool,
    /// Establishing the transport (DNS, TCP, proxy tunnel, TLS handshake).
    Connect,
    /// Writing the request head or body.
    Write,
    /// Reading the response head or body.
    Read,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutPhase::Pool => "pool",
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Write => "write",
            TimeoutPhase::Read => "read",
        };
        f.write_str(name)
    }
}

/// What went wrong while talking to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    /// Host name resolution failed.
    Dns,
    /// The TCP connection could not be established.
    Tcp,
    /// The TLS handshake failed.
    Tls,
    /// The proxy refused or broke the tunnel.
    Proxy,
    /// An established connection was closed or reset mid-exchange.
    Reset {
        /// Whether the whole request had been written before the failure.
        /// The server may have acted on such a request.
        request_sent: bool,
    },
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectErrorKind::Dns => "dns",
            ConnectErrorKind::Tcp => "tcp",
            ConnectErrorKind::Tls => "tls",
            ConnectErrorKind::Proxy => "proxy",
            ConnectErrorKind::Reset {
                request_sent: false,
            } => "reset",
            ConnectErrorKind::Reset { request_sent: true } => "reset after send",
        };
        f.write_str(name)
    }
}

/// Which side of the hook pipeline a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// Runs on the outgoing request.
    Before,
    /// Runs on the final response.
    After,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::Before => f.write_str("before"),
            HookStage::After => f.write_str("after"),
        }
    }
}

/// The main error type for request execution.
///
/// # Examples
///
/// ```no_run
/// use spindle::{Client, Error, TimeoutPhase};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get("/endpoint").send().await {
///     Ok(response) => println!("status: {}", response.status),
///     Err(Error::Timeout { phase: TimeoutPhase::Read, .. }) => {
///         eprintln!("server was too slow to answer");
///     }
///     Err(Error::TooManyRedirects { history, .. }) => {
///         for hop in &history {
///             eprintln!("redirected from {}", hop.url);
///         }
///     }
///     Err(e) => eprintln!("other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transport could not be established or broke during the exchange.
    #[error("Connection error ({kind}) for {url}: {source}")]
    Connection {
        /// The kind of connection failure
        kind: ConnectErrorKind,
        /// The URL or pool key the connection was for
        url: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A phase deadline expired.
    ///
    /// Each phase of an attempt (pool wait, connect, write, read) has its own
    /// deadline, so the phase tells which part of the exchange was too slow.
    #[error("{phase} timeout after {timeout:?} for {url}")]
    Timeout {
        /// The phase that timed out
        phase: TimeoutPhase,
        /// The configured limit for that phase
        timeout: Duration,
        /// The URL being requested
        url: String,
    },

    /// The server sent something that is not valid HTTP/1.x.
    #[error("Protocol error from {url}: {message}")]
    Protocol {
        /// The URL being requested
        url: String,
        /// What was wrong with the server's bytes
        message: String,
    },

    /// The redirect chain was longer than the configured maximum.
    ///
    /// `history` carries exactly `max` responses, oldest first.
    #[error("Too many redirects (max {max})")]
    TooManyRedirects {
        /// The configured maximum
        max: usize,
        /// Every redirect response followed before giving up
        history: Vec<Response>,
    },

    /// A redirect response carried a `Location` that cannot be followed.
    #[error("Invalid redirect location {location:?} from {url}")]
    InvalidRedirect {
        /// The URL that answered with the redirect
        url: String,
        /// The raw `Location` value
        location: String,
    },

    /// A retryable failure kept happening until the attempt budget ran out.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// The number of attempts made
        attempts: usize,
        /// The error of the final attempt
        last_error: Box<Error>,
    },

    /// The rate limiter would have made the call wait longer than allowed.
    #[error("Rate limited on {key}: required wait {wait:?} exceeds {max_wait:?}")]
    RateLimited {
        /// The limiter key (host or `*` for a global limiter)
        key: String,
        /// The wait the limiter asked for
        wait: Duration,
        /// The configured maximum wait
        max_wait: Duration,
    },

    /// The server answered with a 4xx or 5xx status and status raising was enabled.
    ///
    /// # Fields
    ///
    /// * `status` - The HTTP status code
    /// * `raw_response` - The response body as text
    /// * `headers` - The response headers
    /// * `rate_limit_info` - Rate limit information parsed from the headers
    #[error("HTTP error {status} for {url}: {raw_response}")]
    HttpStatus {
        /// The HTTP status code
        status: StatusCode,
        /// The URL that answered
        url: String,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: Box<HeaderMap>,
        /// Rate limit information parsed from headers
        rate_limit_info: Option<RateLimitInfo>,
    },

    /// A one-shot request body was needed again after it had been sent.
    ///
    /// Use [`Body::replayable`](crate::Body::replayable) or
    /// [`RetryPolicy::buffer_lazy_bodies`](crate::RetryPolicy::buffer_lazy_bodies)
    /// for bodies that must survive retries or 307/308 redirects.
    #[error("Request body stream was already consumed by a previous attempt")]
    BodyAlreadyConsumed,

    /// The request body producer failed while the body was being sent.
    #[error("Request body stream failed: {0}")]
    BodyStream(#[source] std::io::Error),

    /// The call was cancelled through its cancellation token.
    #[error("Request was cancelled")]
    Cancelled,

    /// A before or after hook returned an error.
    #[error("{stage} hook `{name}` failed: {source}")]
    Hook {
        /// The name the hook was registered under
        name: String,
        /// Whether it was a before or after hook
        stage: HookStage,
        /// The error the hook returned
        #[source]
        source: BoxError,
    },

    /// The credential provider failed to produce or refresh credentials.
    #[error("Credential provider failed: {source}")]
    Credentials {
        /// The error the provider returned
        #[source]
        source: BoxError,
    },

    /// Failed to deserialize the response body into the expected type.
    ///
    /// # Fields
    ///
    /// * `raw_response` - The raw response body as a string
    /// * `serde_error` - The error message from serde
    /// * `status` - The HTTP status code of the response
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// Invalid configuration was provided.
    ///
    /// Raised by the builders when limits, timeouts, hooks or TLS material don't
    /// make sense, and when a header name or value can't be encoded.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The URL can't be requested (unsupported scheme, no host, relative without a base).
    #[error("Unsupported URL {0}")]
    UnsupportedUrl(String),

    /// The connection pool was closed by [`Client::close`](crate::Client::close).
    #[error("Connection pool is closed")]
    PoolClosed,
}

impl Error {
    /// Returns `true` if this error is potentially retryable.
    ///
    /// Connection failures, timeouts, and 5xx or 429 HTTP errors are considered
    /// retryable. Whether they are actually retried is up to the
    /// [`RetryPolicy`](crate::RetryPolicy).
    ///
    /// # Examples
    ///
    /// ```
    /// use spindle::Error;
    /// use http::StatusCode;
    ///
    /// let err = Error::HttpStatus {
    ///     status: StatusCode::SERVICE_UNAVAILABLE,
    ///     url: "https://api.example.com/".to_string(),
    ///     raw_response: "try later".to_string(),
    ///     headers: Box::default(),
    ///     rate_limit_info: None,
    /// };
    /// assert!(err.is_retryable());
    ///
    /// assert!(!Error::BodyAlreadyConsumed.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } => true,
            Error::Timeout { .. } => true,
            Error::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Returns `true` for errors a retry can never fix.
    ///
    /// These surface immediately regardless of the retry policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BodyAlreadyConsumed
                | Error::BodyStream(_)
                | Error::Cancelled
                | Error::Hook { .. }
                | Error::Credentials { .. }
                | Error::TooManyRedirects { .. }
                | Error::InvalidRedirect { .. }
                | Error::RateLimited { .. }
                | Error::ConfigurationError(_)
                | Error::SerializationFailed(_)
                | Error::InvalidUrl(_)
                | Error::UnsupportedUrl(_)
                | Error::PoolClosed
                | Error::RetryExhausted { .. }
        )
    }

    /// Returns `true` if this is a timeout in any phase.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns the phase that timed out, if this is a timeout.
    ///
    /// Looks through [`Error::RetryExhausted`] to the last attempt's error.
    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Error::Timeout { phase, .. } => Some(*phase),
            Error::RetryExhausted { last_error, .. } => last_error.timeout_phase(),
            _ => None,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpStatus { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::RetryExhausted { last_error, .. } => last_error.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::HttpStatus { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns rate limit information if available.
    ///
    /// This is only present for `HttpStatus` errors whose response carried rate
    /// limit headers.
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        match self {
            Error::HttpStatus {
                rate_limit_info, ..
            } => rate_limit_info.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn reset(
        url: impl Into<String>,
        request_sent: bool,
        source: std::io::Error,
    ) -> Self {
        Error::Connection {
            kind: ConnectErrorKind::Reset { request_sent },
            url: url.into(),
            source,
        }
    }

    pub(crate) fn protocol(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol {
            url: url.into(),
            message: message.into(),
        }
    }
}

/// A specialized `Result` type for request execution.
///
/// This is a convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_phase() {
        let err = Error::Timeout {
            phase: TimeoutPhase::Connect,
            timeout: Duration::from_millis(250),
            url: "http://example.com/".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "connect timeout after 250ms for http://example.com/"
        );
        assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Connect));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_exhausted_exposes_last_error() {
        let err = Error::RetryExhausted {
            attempts: 3,
            last_error: Box::new(Error::Timeout {
                phase: TimeoutPhase::Read,
                timeout: Duration::from_secs(1),
                url: "http://example.com/".to_string(),
            }),
        };
        assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Read));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = Error::HttpStatus {
            status: StatusCode::NOT_FOUND,
            url: "http://example.com/missing".to_string(),
            raw_response: "nope".to_string(),
            headers: Box::default(),
            rate_limit_info: None,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(err.raw_response(), Some("nope"));
    }

    #[test]
    fn test_hook_error_display() {
        let err = Error::Hook {
            name: "sign".to_string(),
            stage: HookStage::Before,
            source: "missing key".into(),
        };
        assert_eq!(err.to_string(), "before hook `sign` failed: missing key");
        assert!(err.is_fatal());
    }
}
