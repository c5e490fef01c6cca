//! # Spindle - an async HTTP client engine
//!
//! Spindle turns a request description into a completed response. Every call
//! runs through one engine that coordinates a keyed connection pool, phased
//! timeouts, an optional rate limiter, a retry policy, a redirect resolver and
//! a pipeline of before/after hooks, and that cleans up after itself when a
//! call is cancelled or dropped.
//!
//! ## Quick Start
//!
//! ```no_run
//! use spindle::{Client, RetryPolicy};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct CreateUser {
//!     name: String,
//!     email: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//!     email: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), spindle::Error> {
//!     // Create a client that retries transient failures
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .timeout(Duration::from_secs(30))
//!         .retry(RetryPolicy::exponential(4, Duration::from_millis(100), 2.0).jitter(true))
//!         .build()?;
//!
//!     // Make a GET request
//!     let response = client.get("/users/123").send().await?;
//!     println!("Request took {:?} over {} attempt(s)", response.elapsed, response.attempts);
//!     let user: User = response.json().await?;
//!     println!("User: {}", user.name);
//!
//!     // Make a POST request
//!     let new_user = CreateUser {
//!         name: "Alice".to_string(),
//!         email: "alice@example.com".to_string(),
//!     };
//!     let created: User = client.post("/users").json(&new_user).send().await?.json().await?;
//!     println!("Created user with ID: {}", created.id);
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Connection pooling** - Keep-alive connections keyed by scheme, host and port, with global and per-host caps
//! - **Phased timeouts** - Separate deadlines for pool wait, connect, write and read
//! - **Retries** - Exponential or fixed backoff with jitter, `Retry-After` support and custom predicates
//! - **Redirects** - Bounded chains with full history and credential stripping across hosts
//! - **Rate limiting** - Token bucket or sliding window, global or per host
//! - **Hooks** - Named before-request and after-response transforms
//! - **Streaming** - Large bodies stream in both directions
//! - **Cancellation** - Every wait races a `CancellationToken`
//! - **Structured logging** - Through `tracing`, plus an [`EventListener`] side channel
//!
//! ## Error Handling
//!
//! Errors keep the details needed to debug a failed call:
//!
//! ```no_run
//! use spindle::{Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get("/endpoint").raise_for_status(true).send().await {
//!     Ok(response) => {
//!         println!("Success: {}", response.text().await?);
//!     }
//!     Err(Error::HttpStatus { status, raw_response, .. }) => {
//!         eprintln!("HTTP error {}: {}", status, raw_response);
//!     }
//!     Err(Error::Timeout { phase, timeout, url }) => {
//!         eprintln!("{} timed out after {:?} in the {} phase", url, timeout, phase);
//!     }
//!     Err(Error::RetryExhausted { attempts, last_error }) => {
//!         eprintln!("Gave up after {} attempts: {}", attempts, last_error);
//!     }
//!     Err(e) => {
//!         eprintln!("Other error: {}", e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry Policies
//!
//! Configure how the client handles transient failures:
//!
//! ```no_run
//! use spindle::{Client, RetryPolicy, retry::{RetryOn5xx, RetryOnTimeout, OrPredicate}};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), spindle::Error> {
//! let client = Client::builder()
//!     .base_url("https://api.example.com")?
//!     .retry(
//!         RetryPolicy::exponential(5, Duration::from_millis(100), 2.0)
//!             .max_delay(Duration::from_secs(30))
//!             .jitter(true)
//!             .predicate(OrPredicate::new(vec![
//!                 Box::new(RetryOn5xx),
//!                 Box::new(RetryOnTimeout),
//!             ])),
//!     )
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod body;
mod client;
pub(crate) mod codec;
mod connect;
mod cookie;
mod error;
mod events;
mod executor;
mod hooks;
mod pool;
mod rate_limit;
mod redirect;
mod request;
mod response;
pub mod retry;
mod timeout;
mod tls;
pub(crate) mod transfer;
pub(crate) mod util;

pub use auth::{CredentialProvider, StaticCredentials};
pub use body::{Body, ByteStream};
pub use client::{Adapter, Client, ClientBuilder, ErrorMode, RequestBuilder};
pub use connect::{BoxedIo, Connect, Connected, HttpConnector, Io, Proxy, ProxySettings};
pub use cookie::{CookieStore, MemoryCookieJar};
pub use error::{BoxError, ConnectErrorKind, Error, HookStage, Result, TimeoutPhase};
pub use events::{Event, EventListener};
pub use hooks::{HookMode, Hooks};
pub use pool::{
    Checkout, ConnectSlot, Connection, ConnectionPool, PoolKey, PoolLimits, PoolStats, Scheme,
};
pub use rate_limit::{LimiterScope, RateLimitInfo, RateLimitStrategy, RateLimiter};
pub use redirect::{RedirectChain, RedirectPolicy, RedirectSemantics};
pub use request::Request;
pub use response::Response;
pub use retry::{Outcome, RetryDecision, RetryPolicy, RetryPredicate, RetryState};
pub use timeout::{Timeout, TimeoutController};
pub use tls::{RustlsFactory, TlsConnector, TlsContextFactory, TlsSettings};
pub use transfer::BodyReader;
