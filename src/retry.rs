//! Retry policies and predicates for handling transient failures.
//!
//! A [`RetryPolicy`] looks at the outcome of each attempt (an error, or a
//! response whose status may be worth retrying) and decides whether to try
//! again and how long to wait first. Classification can be replaced with a
//! custom [`RetryPredicate`]; the attempt budget, the optional elapsed-time
//! budget and fatal errors always apply.

use crate::{ConnectErrorKind, Error, RateLimitInfo, Response};
use http::{Method, StatusCode};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What a single attempt produced.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    /// The attempt failed before a response arrived.
    Error(&'a Error),
    /// The server answered. The body is buffered unless it was too large or
    /// the call is streaming.
    Response(&'a Response),
}

impl Outcome<'_> {
    /// Returns the response status, if there was a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Outcome::Response(response) => Some(response.status),
            Outcome::Error(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Outcome::Response(response) => format!("status {}", response.status),
            Outcome::Error(error) => error.to_string(),
        }
    }
}

/// The decision for a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `after`, then try again.
    Retry {
        /// Delay before the next attempt.
        after: Duration,
    },
    /// The outcome isn't retryable; return it as is.
    GiveUp,
    /// The outcome was retryable but the attempt or time budget ran out.
    Exhausted,
}

/// Bookkeeping for the attempts of one hop.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts made so far, counting the one just finished.
    pub attempt: usize,
    /// When the first attempt started.
    pub started: Instant,
    /// A description of the last failed outcome.
    pub last: Option<String>,
    /// Whether the request's method is idempotent, so that resending a
    /// request the server may already have processed is safe.
    pub idempotent: bool,
}

impl RetryState {
    pub(crate) fn new(method: &Method) -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
            last: None,
            idempotent: method.is_idempotent(),
        }
    }

    /// Time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn record(&mut self, outcome: &Outcome<'_>) {
        self.last = Some(outcome.describe());
    }
}

/// Defines when and how to retry failed requests.
///
/// The default policy makes a single attempt. Retryable by default are
/// connection failures, timeouts, and responses with status 429, 500, 502,
/// 503 or 504. A connection that breaks after the whole request was written
/// is only retried for idempotent methods, unless a custom predicate says
/// otherwise.
///
/// # Examples
///
/// ```
/// use spindle::RetryPolicy;
/// use std::time::Duration;
///
/// // No retries
/// let no_retry = RetryPolicy::none();
///
/// // Up to 4 attempts, waiting 100ms, 200ms, 400ms (with full jitter)
/// let exponential = RetryPolicy::exponential(4, Duration::from_millis(100), 2.0)
///     .max_delay(Duration::from_secs(10))
///     .jitter(true);
///
/// // Up to 3 attempts, 1s apart, only on 503
/// let fixed = RetryPolicy::fixed(3, Duration::from_secs(1))
///     .statuses([http::StatusCode::SERVICE_UNAVAILABLE]);
/// # let _ = (no_retry, exponential, fixed);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    factor: f64,
    max_delay: Duration,
    jitter: bool,
    statuses: Vec<StatusCode>,
    retry_on_timeout: bool,
    respect_retry_after: bool,
    max_retry_after: Duration,
    max_elapsed: Option<Duration>,
    buffer_lazy_bodies: bool,
    predicate: Option<Arc<dyn RetryPredicate>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
            statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            retry_on_timeout: true,
            respect_retry_after: true,
            max_retry_after: Duration::from_secs(60),
            max_elapsed: None,
            buffer_lazy_bodies: false,
            predicate: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("factor", &self.factor)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("statuses", &self.statuses)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("max_elapsed", &self.max_elapsed)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self::default()
    }

    /// Up to `max_attempts` attempts with delays of `base * factor^(n-1)`
    /// before retry `n`.
    pub fn exponential(max_attempts: usize, base: Duration, factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay: base,
            factor,
            ..Self::default()
        }
    }

    /// Up to `max_attempts` attempts with the same delay between them.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, 1.0)
    }

    /// Sets the total number of attempts, including the first.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Caps the computed backoff delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Draws each delay uniformly from `[0, delay]`.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the set of response statuses that are retried.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Whether timeouts are retried.
    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Whether `Retry-After` and `X-RateLimit-Reset` on a retried response
    /// replace the computed delay.
    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Caps delays taken from response headers.
    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    /// Stops retrying once the next attempt would start later than `max`
    /// after the first.
    pub fn max_elapsed(mut self, max: Duration) -> Self {
        self.max_elapsed = Some(max);
        self
    }

    /// Buffers one-shot request body streams before the first attempt so
    /// they can be resent.
    pub fn buffer_lazy_bodies(mut self, buffer: bool) -> Self {
        self.buffer_lazy_bodies = buffer;
        self
    }

    /// Replaces the built-in classification with `predicate`.
    pub fn predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Replaces the built-in classification with a closure.
    ///
    /// # Examples
    ///
    /// ```
    /// use spindle::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// // Retry any 5xx response, nothing else.
    /// let policy = RetryPolicy::fixed(3, Duration::from_millis(100))
    ///     .retry_if(|outcome, _attempt| outcome.status().is_some_and(|s| s.is_server_error()));
    /// # let _ = policy;
    /// ```
    pub fn retry_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&Outcome<'_>, usize) -> bool + Send + Sync + 'static,
    {
        self.predicate(predicate)
    }

    /// Returns the attempt budget.
    pub fn attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns `true` if more than one attempt is allowed.
    pub fn retries(&self) -> bool {
        self.max_attempts > 1
    }

    pub(crate) fn buffers_lazy_bodies(&self) -> bool {
        self.buffer_lazy_bodies
    }

    /// Returns the backoff before retry `retry` (1-indexed), before jitter.
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_for_retry(&self, retry: usize) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
        } else {
            delay
        }
    }

    fn classify(&self, state: &RetryState, outcome: &Outcome<'_>) -> bool {
        match outcome {
            Outcome::Response(response) => self.statuses.contains(&response.status),
            Outcome::Error(Error::Connection {
                kind: ConnectErrorKind::Reset { request_sent: true },
                ..
            }) => state.idempotent,
            Outcome::Error(Error::Connection { .. }) => true,
            Outcome::Error(Error::Timeout { .. }) => self.retry_on_timeout,
            Outcome::Error(_) => false,
        }
    }

    /// Decides what to do after the attempt recorded in `state` produced
    /// `outcome`.
    pub fn decide(&self, state: &RetryState, outcome: &Outcome<'_>) -> RetryDecision {
        if let Outcome::Error(error) = outcome {
            if error.is_fatal() {
                return RetryDecision::GiveUp;
            }
        }

        let retryable = match &self.predicate {
            Some(predicate) => predicate.should_retry(outcome, state.attempt),
            None => self.classify(state, outcome),
        };
        if !retryable || !self.retries() {
            return RetryDecision::GiveUp;
        }
        if state.attempt >= self.max_attempts {
            return RetryDecision::Exhausted;
        }

        let mut after = self.delay_for_retry(state.attempt);
        if self.respect_retry_after {
            if let Outcome::Response(response) = outcome {
                if let Some(delay) = RateLimitInfo::from_headers(&response.headers)
                    .and_then(|info| info.delay(self.max_retry_after))
                {
                    after = delay;
                }
            }
        }

        if let Some(max) = self.max_elapsed {
            if state.elapsed() + after > max {
                return RetryDecision::Exhausted;
            }
        }

        RetryDecision::Retry { after }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::ConfigurationError(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(Error::ConfigurationError(format!(
                "retry backoff factor must be at least 1.0, got {}",
                self.factor
            )));
        }
        Ok(())
    }
}

/// Trait for deciding whether an attempt's outcome should be retried.
///
/// Implement this trait to create custom retry logic based on the error,
/// the response status, headers or buffered body. Closures taking
/// `(&Outcome<'_>, usize)` implement it too.
///
/// # Examples
///
/// ```
/// use spindle::{Outcome, RetryPredicate};
///
/// struct RetryOnRateLimit;
///
/// impl RetryPredicate for RetryOnRateLimit {
///     fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
///         outcome.status().is_some_and(|status| status.as_u16() == 429)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Determines whether the attempt should be retried.
    ///
    /// # Arguments
    ///
    /// * `outcome` - What the attempt produced
    /// * `attempt` - The attempt number (1-indexed)
    fn should_retry(&self, outcome: &Outcome<'_>, attempt: usize) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&Outcome<'_>, usize) -> bool + Send + Sync,
{
    fn should_retry(&self, outcome: &Outcome<'_>, attempt: usize) -> bool {
        self(outcome, attempt)
    }
}

/// Retry only on 5xx responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryOn5xx;

impl RetryPredicate for RetryOn5xx {
    fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
        outcome.status().is_some_and(|s| s.is_server_error())
    }
}

/// Retry only on timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTimeout;

impl RetryPredicate for RetryOnTimeout {
    fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
        matches!(outcome, Outcome::Error(Error::Timeout { .. }))
    }
}

/// Retry only on connection errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
        matches!(outcome, Outcome::Error(Error::Connection { .. }))
    }
}

/// Combine multiple retry predicates with OR logic.
///
/// Retries if ANY of the predicates return `true`.
///
/// # Examples
///
/// ```
/// use spindle::retry::{OrPredicate, RetryOn5xx, RetryOnTimeout};
///
/// // Retry on 5xx responses OR timeouts
/// let predicate = OrPredicate::new(vec![
///     Box::new(RetryOn5xx),
///     Box::new(RetryOnTimeout),
/// ]);
/// ```
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, outcome: &Outcome<'_>, attempt: usize) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(outcome, attempt))
    }
}

/// Combine multiple retry predicates with AND logic.
///
/// Retries only if ALL of the predicates return `true`.
///
/// # Examples
///
/// ```
/// use spindle::retry::{AndPredicate, RetryOn5xx};
/// use spindle::{Outcome, RetryPredicate};
///
/// struct FirstAttemptsOnly(usize);
///
/// impl RetryPredicate for FirstAttemptsOnly {
///     fn should_retry(&self, _outcome: &Outcome<'_>, attempt: usize) -> bool {
///         attempt <= self.0
///     }
/// }
///
/// // Retry on 5xx responses AND only after the first 2 attempts
/// let predicate = AndPredicate::new(vec![
///     Box::new(RetryOn5xx),
///     Box::new(FirstAttemptsOnly(2)),
/// ]);
/// ```
pub struct AndPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl AndPredicate {
    /// Creates a new `AndPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for AndPredicate {
    fn should_retry(&self, outcome: &Outcome<'_>, attempt: usize) -> bool {
        self.predicates
            .iter()
            .all(|p| p.should_retry(outcome, attempt))
    }
}
