//! Per-phase timeouts.
//!
//! An attempt goes through four phases, each with its own optional limit:
//! waiting for a pooled connection, connecting, writing the request and reading
//! the response. A phase's clock starts when the phase starts. The write and read
//! limits apply to each individual socket operation, so a large transfer that
//! keeps making progress is never cut off, while a stalled one is.

use crate::{Error, Result, TimeoutPhase};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Timeout configuration for the phases of a request attempt.
///
/// `None` disables the limit for that phase.
///
/// # Examples
///
/// ```
/// use spindle::{Timeout, TimeoutPhase};
/// use std::time::Duration;
///
/// // Same limit for every phase
/// let uniform = Timeout::all(Duration::from_secs(10));
/// assert_eq!(uniform.get(TimeoutPhase::Read), Some(Duration::from_secs(10)));
///
/// // Tight connect, generous read
/// let tuned = Timeout::default()
///     .connect(Duration::from_secs(2))
///     .read(Duration::from_secs(120));
/// assert_eq!(tuned.get(TimeoutPhase::Connect), Some(Duration::from_secs(2)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Maximum wait for a connection from the pool.
    pub pool: Option<Duration>,
    /// Maximum time to establish a connection, including TLS and proxy tunnels.
    pub connect: Option<Duration>,
    /// Maximum time for any single write.
    pub write: Option<Duration>,
    /// Maximum time for any single read.
    pub read: Option<Duration>,
}

impl Default for Timeout {
    fn default() -> Self {
        Self {
            pool: Some(Duration::from_secs(60)),
            connect: Some(Duration::from_secs(5)),
            write: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(30)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::all(duration)
    }
}

impl Timeout {
    /// Uses the same limit for every phase.
    pub fn all(duration: Duration) -> Self {
        Self {
            pool: Some(duration),
            connect: Some(duration),
            write: Some(duration),
            read: Some(duration),
        }
    }

    /// Disables every phase limit.
    pub fn none() -> Self {
        Self {
            pool: None,
            connect: None,
            write: None,
            read: None,
        }
    }

    /// Sets the pool-wait limit.
    pub fn pool(mut self, duration: Duration) -> Self {
        self.pool = Some(duration);
        self
    }

    /// Sets the connect limit.
    pub fn connect(mut self, duration: Duration) -> Self {
        self.connect = Some(duration);
        self
    }

    /// Sets the per-write limit.
    pub fn write(mut self, duration: Duration) -> Self {
        self.write = Some(duration);
        self
    }

    /// Sets the per-read limit.
    pub fn read(mut self, duration: Duration) -> Self {
        self.read = Some(duration);
        self
    }

    /// Returns the limit configured for `phase`.
    pub fn get(&self, phase: TimeoutPhase) -> Option<Duration> {
        match phase {
            TimeoutPhase::Pool => self.pool,
            TimeoutPhase::Connect => self.connect,
            TimeoutPhase::Write => self.write,
            TimeoutPhase::Read => self.read,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for phase in [
            TimeoutPhase::Pool,
            TimeoutPhase::Connect,
            TimeoutPhase::Write,
            TimeoutPhase::Read,
        ] {
            if self.get(phase) == Some(Duration::ZERO) {
                return Err(Error::ConfigurationError(format!(
                    "{phase} timeout must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Applies a [`Timeout`] to the phases of one attempt against one URL.
#[derive(Debug, Clone)]
pub struct TimeoutController {
    config: Timeout,
    url: Arc<str>,
}

impl TimeoutController {
    pub(crate) fn new(config: Timeout, url: &str) -> Self {
        Self {
            config,
            url: Arc::from(url),
        }
    }

    /// Returns the limit for `phase`.
    pub fn limit(&self, phase: TimeoutPhase) -> Option<Duration> {
        self.config.get(phase)
    }

    /// Runs `fut` under the deadline of `phase`, starting now.
    pub async fn run<F, T>(&self, phase: TimeoutPhase, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(limit) = self.config.get(phase) else {
            return fut.await;
        };
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.expired(phase)),
        }
    }

    /// Runs a single socket operation under the deadline of `phase`, mapping
    /// I/O failures through `on_io`.
    pub(crate) async fn io<F, T>(
        &self,
        phase: TimeoutPhase,
        fut: F,
        on_io: impl FnOnce(std::io::Error) -> Error,
    ) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        self.run(phase, async { fut.await.map_err(on_io) }).await
    }

    pub(crate) fn expired(&self, phase: TimeoutPhase) -> Error {
        Error::Timeout {
            phase,
            timeout: self.config.get(phase).unwrap_or_default(),
            url: self.url.to_string(),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let timeout = Timeout::default();
        assert_eq!(timeout.connect, Some(Duration::from_secs(5)));
        assert_eq!(timeout.read, Some(Duration::from_secs(30)));
        assert_eq!(timeout.write, Some(Duration::from_secs(10)));
        assert_eq!(timeout.pool, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_is_rejected() {
        let timeout = Timeout::default().write(Duration::ZERO);
        let err = timeout.validate().unwrap_err();
        assert!(err.to_string().contains("write timeout"));
        assert!(Timeout::none().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_phase() {
        let controller = TimeoutController::new(
            Timeout::none().read(Duration::from_millis(100)),
            "http://example.com/slow",
        );
        let result: Result<()> = controller
            .run(TimeoutPhase::Read, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(Error::Timeout { phase, timeout, url }) => {
                assert_eq!(phase, TimeoutPhase::Read);
                assert_eq!(timeout, Duration::from_millis(100));
                assert_eq!(url, "http://example.com/slow");
            }
            other => panic!("expected read timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_phase_never_fires() {
        let controller = TimeoutController::new(Timeout::none(), "http://example.com/");
        let value = controller
            .run(TimeoutPhase::Connect, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
