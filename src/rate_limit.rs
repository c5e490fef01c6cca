//! Client-side rate limiting and server rate-limit signals.
//!
//! [`RateLimiter`] gates outgoing attempts before a connection is acquired. It
//! supports a token bucket (burst plus steady refill) and a sliding window (at
//! most N requests in any window). Waits are reserved at acquire time, so
//! concurrent callers line up behind each other instead of all waking at once.
//!
//! [`RateLimitInfo`] reads the limits a server advertises (`Retry-After`,
//! `X-RateLimit-Reset`, ...) so retries can honor them.

use crate::pool::PoolKey;
use crate::util::lock_unpoisoned;
use http::HeaderMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// The limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitStrategy {
    /// Up to `capacity` requests at once, then `refill` requests every `per`.
    TokenBucket {
        /// Burst size, and the most tokens the bucket ever holds.
        capacity: u32,
        /// Tokens added per `per`.
        refill: u32,
        /// Refill period.
        per: Duration,
    },
    /// At most `requests` requests in any trailing `window`.
    SlidingWindow {
        /// Requests allowed per window.
        requests: u32,
        /// Window length.
        window: Duration,
    },
}

/// Which requests share a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimiterScope {
    /// Every request shares one limit.
    #[default]
    Global,
    /// Each `host:port` gets its own limit.
    PerHost,
}

/// A token-bucket or sliding-window request limiter.
///
/// # Examples
///
/// ```
/// use spindle::RateLimiter;
/// use std::time::Duration;
///
/// // Bursts of 5, then one request every 200ms, counted per host
/// let limiter = RateLimiter::token_bucket(5, 1, Duration::from_millis(200))
///     .per_host()
///     .max_wait(Duration::from_secs(10));
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    strategy: RateLimitStrategy,
    scope: LimiterScope,
    max_wait: Option<Duration>,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default)]
struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    windows: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl LimiterState {
    /// Forgets keys whose state is indistinguishable from a fresh one: full
    /// buckets and windows with nothing left in them.
    fn sweep(&mut self, now: Instant, strategy: RateLimitStrategy) {
        match strategy {
            RateLimitStrategy::TokenBucket {
                capacity,
                refill,
                per,
            } => {
                let capacity = f64::from(capacity);
                let per_second = f64::from(refill) / per.as_secs_f64();
                self.buckets.retain(|_, bucket| {
                    bucket.refill(now, capacity, per_second);
                    bucket.tokens < capacity
                });
            }
            RateLimitStrategy::SlidingWindow { window, .. } => {
                self.windows
                    .retain(|_, log| log.back().is_some_and(|at| *at + window > now));
            }
        }
        self.last_sweep = Some(now);
    }
}

/// Tokens may go negative: each negative token is a reservation some caller
/// is already sleeping on.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant, capacity: f64, per_second: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_second).min(capacity);
        self.last_refill = now;
    }

    fn wait_for_token(&self, per_second: f64) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / per_second)
        }
    }
}

impl RateLimiter {
    /// Creates a token-bucket limiter.
    pub fn token_bucket(capacity: u32, refill: u32, per: Duration) -> Self {
        Self::new(RateLimitStrategy::TokenBucket {
            capacity,
            refill,
            per,
        })
    }

    /// Creates a sliding-window limiter.
    pub fn sliding_window(requests: u32, window: Duration) -> Self {
        Self::new(RateLimitStrategy::SlidingWindow { requests, window })
    }

    /// Creates a limiter from a strategy.
    pub fn new(strategy: RateLimitStrategy) -> Self {
        Self {
            strategy,
            scope: LimiterScope::Global,
            max_wait: None,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Keeps a separate limit per host instead of one global limit.
    pub fn per_host(mut self) -> Self {
        self.scope = LimiterScope::PerHost;
        self
    }

    /// Fails with [`Error::RateLimited`](crate::Error::RateLimited) instead of
    /// waiting longer than `max_wait`.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Returns the strategy.
    pub fn strategy(&self) -> RateLimitStrategy {
        self.strategy
    }

    /// Returns the configured maximum wait.
    pub fn max_wait_limit(&self) -> Option<Duration> {
        self.max_wait
    }

    /// Reserves a slot for `key` and returns how long the caller must wait
    /// before using it. Never refuses, whatever `max_wait` says.
    ///
    /// Fails with [`Error::ConfigurationError`](crate::Error::ConfigurationError)
    /// if the limiter could never admit a request.
    pub fn acquire(&self, key: &str) -> crate::Result<Duration> {
        self.validate()?;
        Ok(self.reserve(key, None).unwrap_or_default())
    }

    /// Like [`acquire`](Self::acquire), but when the wait would exceed the
    /// configured `max_wait` nothing is reserved and
    /// [`Error::RateLimited`](crate::Error::RateLimited) is returned.
    pub fn try_acquire(&self, key: &str) -> crate::Result<Duration> {
        self.validate()?;
        self.reserve(key, self.max_wait)
            .map_err(|wait| crate::Error::RateLimited {
                key: key.to_string(),
                wait,
                max_wait: self.max_wait.unwrap_or_default(),
            })
    }

    /// The interval between sweeps of idle keys.
    fn sweep_period(&self) -> Duration {
        match self.strategy {
            RateLimitStrategy::TokenBucket { per, .. } => per,
            RateLimitStrategy::SlidingWindow { window, .. } => window,
        }
    }

    pub(crate) fn key_for(&self, pool_key: &PoolKey) -> String {
        match self.scope {
            LimiterScope::Global => "*".to_string(),
            LimiterScope::PerHost => format!("{}:{}", pool_key.host(), pool_key.port()),
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        let valid = match self.strategy {
            RateLimitStrategy::TokenBucket {
                capacity,
                refill,
                per,
            } => capacity > 0 && refill > 0 && !per.is_zero(),
            RateLimitStrategy::SlidingWindow { requests, window } => {
                requests > 0 && !window.is_zero()
            }
        };
        if valid {
            Ok(())
        } else {
            Err(crate::Error::ConfigurationError(format!(
                "rate limiter needs positive counts and periods, got {:?}",
                self.strategy
            )))
        }
    }

    fn reserve(&self, key: &str, max_wait: Option<Duration>) -> Result<Duration, Duration> {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        if state
            .last_sweep
            .map_or(true, |at| now.saturating_duration_since(at) >= self.sweep_period())
        {
            state.sweep(now, self.strategy);
        }

        match self.strategy {
            RateLimitStrategy::TokenBucket {
                capacity,
                refill,
                per,
            } => {
                let capacity = f64::from(capacity);
                let per_second = f64::from(refill) / per.as_secs_f64();
                let bucket = state
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| TokenBucket {
                        tokens: capacity,
                        last_refill: now,
                    });
                bucket.refill(now, capacity, per_second);
                let wait = bucket.wait_for_token(per_second);
                if max_wait.is_some_and(|max| wait > max) {
                    return Err(wait);
                }
                bucket.tokens -= 1.0;
                Ok(wait)
            }
            RateLimitStrategy::SlidingWindow { requests, window } => {
                let log = state.windows.entry(key.to_string()).or_default();
                while log.front().is_some_and(|at| *at + window <= now) {
                    log.pop_front();
                }
                let limit = requests as usize;
                // Entries may lie in the future: they are reservations.
                let slot = if log.len() < limit {
                    now
                } else {
                    log[log.len() - limit] + window
                };
                let slot = slot.max(now);
                let wait = slot - now;
                if max_wait.is_some_and(|max| wait > max) {
                    return Err(wait);
                }
                log.push_back(slot);
                Ok(wait)
            }
        }
    }
}

/// Information extracted from rate limit headers.
///
/// This struct contains parsed rate limit data from various standard and
/// common rate limit headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// When the rate limit resets (from X-RateLimit-Reset or RateLimit-Reset headers).
    pub reset_at: Option<SystemTime>,

    /// How long to wait before retrying (from Retry-After header).
    pub retry_after: Option<Duration>,

    /// Number of requests remaining in the current window.
    pub remaining: Option<u64>,
}

impl RateLimitInfo {
    /// Extracts rate limit information from HTTP response headers.
    ///
    /// Parses `Retry-After` (seconds or HTTP date), `X-RateLimit-Reset` and
    /// `RateLimit-Reset` (Unix timestamps), and `X-RateLimit-Remaining`.
    /// Returns `None` when none of them are present.
    ///
    /// # Examples
    ///
    /// ```
    /// use spindle::RateLimitInfo;
    /// use http::HeaderMap;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("retry-after", "60".parse().unwrap());
    ///
    /// let info = RateLimitInfo::from_headers(&headers).unwrap();
    /// assert_eq!(info.retry_after, Some(std::time::Duration::from_secs(60)));
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let info = Self {
            reset_at: parse_rate_limit_reset(headers),
            retry_after: parse_retry_after(headers),
            remaining: parse_rate_limit_remaining(headers),
        };
        if info.reset_at.is_none() && info.retry_after.is_none() && info.remaining.is_none() {
            None
        } else {
            Some(info)
        }
    }

    /// Returns how long the server asked us to wait, capped by `max_wait`.
    ///
    /// `retry_after` wins over `reset_at`. Returns `None` without either.
    pub fn delay(&self, max_wait: Duration) -> Option<Duration> {
        if let Some(retry_after) = self.retry_after {
            return Some(retry_after.min(max_wait));
        }

        if let Some(reset_at) = self.reset_at {
            if let Ok(until_reset) = reset_at.duration_since(SystemTime::now()) {
                return Some(until_reset.min(max_wait));
            }
        }

        None
    }

    /// Returns `true` if the server says the limit is currently hit.
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after.is_some() || self.remaining == Some(0)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    Some(
        date_time
            .duration_since(SystemTime::now())
            .unwrap_or_default(),
    )
}

fn parse_rate_limit_reset(headers: &HeaderMap) -> Option<SystemTime> {
    ["x-ratelimit-reset", "ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok()?.trim().parse::<u64>().ok())
        .map(|timestamp| UNIX_EPOCH + Duration::from_secs(timestamp))
        .next()
}

fn parse_rate_limit_remaining(headers: &HeaderMap) -> Option<u64> {
    let header = headers.get("x-ratelimit-remaining")?.to_str().ok()?;
    header.trim().parse().ok()
}
