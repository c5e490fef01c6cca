//! Execution events.
//!
//! The executor reports notable moments of a call (failed attempts, retries,
//! redirects, failures and suppressed errors) to every registered
//! [`EventListener`]. Each event is also logged through `tracing`.

use http::{Method, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

/// Something that happened while executing a call.
#[derive(Debug, Clone)]
pub enum Event {
    /// An attempt ended in an error or a retryable status.
    AttemptFailed {
        /// The request method
        method: Method,
        /// The request URL
        url: Url,
        /// The attempt number (1-indexed)
        attempt: usize,
        /// What went wrong
        reason: String,
    },
    /// Another attempt is scheduled.
    Retrying {
        /// The request method
        method: Method,
        /// The request URL
        url: Url,
        /// The number of the upcoming attempt
        attempt: usize,
        /// How long the executor waits before it
        delay: Duration,
    },
    /// A redirect is being followed.
    Redirected {
        /// The URL that answered with the redirect
        from: Url,
        /// The URL of the next request
        to: Url,
        /// The redirect status
        status: StatusCode,
    },
    /// The call failed.
    Failed {
        /// The request method
        method: Method,
        /// The request URL
        url: Url,
        /// The error returned to the caller
        error: String,
    },
    /// The call failed in warn mode and the error was swallowed.
    Suppressed {
        /// The request method
        method: Method,
        /// The request URL
        url: Url,
        /// The suppressed error
        error: String,
    },
}

/// Receives [`Event`]s.
///
/// Closures taking `&Event` implement this trait.
///
/// # Examples
///
/// ```
/// use spindle::{Client, Event};
///
/// # fn example() -> Result<(), spindle::Error> {
/// let client = Client::builder()
///     .event_listener(|event: &Event| {
///         if let Event::Retrying { url, delay, .. } = event {
///             eprintln!("retrying {} in {:?}", url, delay);
///         }
///     })
///     .build()?;
/// # let _ = client;
/// # Ok(())
/// # }
/// ```
pub trait EventListener: Send + Sync {
    /// Called synchronously from the executor; keep it cheap.
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// The listeners registered on a client.
#[derive(Clone, Default)]
pub(crate) struct Events {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Events {
    pub(crate) fn add(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn emit(&self, event: Event) {
        match &event {
            Event::AttemptFailed {
                method,
                url,
                attempt,
                reason,
            } => warn!(method = %method, url = %url, attempt, reason = %reason, "attempt failed"),
            Event::Retrying {
                method,
                url,
                attempt,
                delay,
            } => info!(
                method = %method,
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            ),
            Event::Redirected { from, to, status } => {
                info!(from = %from, to = %to, status = %status, "following redirect")
            }
            Event::Failed { method, url, error } => {
                error!(method = %method, url = %url, error = %error, "request failed")
            }
            Event::Suppressed { method, url, error } => {
                warn!(method = %method, url = %url, error = %error, "request failed, error suppressed")
            }
        }
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}
