//! The HTTP client.
//!
//! The [`Client`] type is the main entry point for making HTTP requests.
//! Use [`ClientBuilder`] to configure and create clients, and the verb
//! methods ([`Client::get`], [`Client::post`], ...) to build individual calls.

use crate::connect::HttpConnector;
use crate::events::Events;
use crate::executor;
use crate::request::parse_header;
use crate::tls::RustlsFactory;
use crate::{
    Body, Connect, ConnectionPool, CookieStore, CredentialProvider, Error, EventListener,
    HookMode, Hooks, PoolLimits, PoolStats, ProxySettings, RateLimiter, RedirectPolicy, Request,
    Response, Result, RetryPolicy, Timeout, TlsContextFactory, TlsSettings,
};
use futures_util::stream::{self, StreamExt};
use http::{HeaderMap, Method};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Bodies up to this size are buffered before the response is returned.
pub(crate) const DEFAULT_STREAM_THRESHOLD: usize = 1024 * 1024;

/// What [`Client::fetch`] does with a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Return the error.
    #[default]
    Raise,
    /// Log it, emit [`Event::Suppressed`](crate::Event::Suppressed), and return `Ok(None)`.
    Warn,
}

/// Defaults for every request whose URL starts with a given prefix.
///
/// Mounted with [`ClientBuilder::mount`]. When several prefixes match, the
/// longest wins. Settings on a request override the adapter's, which
/// override the client's.
///
/// # Examples
///
/// ```no_run
/// use spindle::{Adapter, Client, RetryPolicy};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), spindle::Error> {
/// let billing = Adapter::new()
///     .header("x-api-key", "secret")?
///     .timeout(Duration::from_secs(60))
///     .retry(RetryPolicy::fixed(3, Duration::from_secs(1)));
///
/// let client = Client::builder()
///     .mount("https://billing.example.com/", billing)
///     .build()?;
/// # let _ = client;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Adapter {
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) redirect: Option<RedirectPolicy>,
}

impl Adapter {
    /// Creates an adapter that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header sent with every matching request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Sets the timeouts for matching requests.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Sets the retry policy for matching requests.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the redirect policy for matching requests.
    pub fn redirect(mut self, policy: RedirectPolicy) -> Self {
        self.redirect = Some(policy);
        self
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        if prefix.is_empty() {
            return Err(Error::ConfigurationError(
                "adapter prefix must not be empty".to_string(),
            ));
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// An HTTP client with pooled connections, retries, redirects and hooks.
///
/// The client is designed to be reused across many requests. Cloning is
/// cheap: clones share one connection pool and one rate limiter.
///
/// # Examples
///
/// ```no_run
/// use spindle::{Client, RetryPolicy};
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize)]
/// struct CreateUser {
///     name: String,
///     email: String,
/// }
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
///     email: String,
/// }
///
/// # async fn example() -> Result<(), spindle::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry(RetryPolicy::exponential(4, Duration::from_millis(100), 2.0).jitter(true))
///     .build()?;
///
/// // GET request
/// let user: User = client.get("/users/123").send().await?.json().await?;
/// println!("User: {}", user.name);
///
/// // POST request
/// let new_user = CreateUser {
///     name: "Alice".to_string(),
///     email: "alice@example.com".to_string(),
/// };
/// let created: User = client.post("/users").json(&new_user).send().await?.json().await?;
/// println!("Created user with ID: {}", created.id);
///
/// client.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) base_url: Option<Url>,
    pub(crate) default_headers: HeaderMap,
    pub(crate) default_cookies: Vec<(String, String)>,
    pub(crate) timeout: Timeout,
    pub(crate) retry: RetryPolicy,
    pub(crate) redirect: RedirectPolicy,
    pub(crate) pool: ConnectionPool,
    pub(crate) connector: Arc<dyn Connect>,
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
    pub(crate) hooks: Hooks,
    pub(crate) hook_mode: HookMode,
    pub(crate) credentials: Option<Arc<dyn CredentialProvider>>,
    pub(crate) cookies: Option<Arc<dyn CookieStore>>,
    pub(crate) events: Events,
    pub(crate) error_mode: ErrorMode,
    pub(crate) raise_for_status: bool,
    pub(crate) stream_threshold: Option<usize>,
    pub(crate) adapters: Vec<(String, Adapter)>,
}

impl ClientInner {
    /// The adapter with the longest prefix matching `url`.
    pub(crate) fn adapter_for(&self, url: &Url) -> Option<&Adapter> {
        self.adapters
            .iter()
            .filter(|(prefix, _)| url.as_str().starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, adapter)| adapter)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_ref().map(Url::as_str))
            .field("timeout", &self.inner.timeout)
            .field("redirect", &self.inner.redirect)
            .field("pool", &self.inner.pool.stats())
            .field("hooks", &self.inner.hooks)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spindle::Client;
    ///
    /// # async fn example() -> Result<(), spindle::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Starts a request with an arbitrary method.
    ///
    /// Relative URLs are joined to the base URL.
    pub fn request(&self, method: Method, url: impl AsRef<str>) -> RequestBuilder {
        let request = self
            .resolve_url(url.as_ref())
            .map(|url| Request::new(method, url));
        RequestBuilder {
            client: self.clone(),
            request,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts a GET request.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spindle::Client;
    ///
    /// # async fn example() -> Result<(), spindle::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let body = client.get("/status").send().await?.text().await?;
    /// println!("{}", body);
    /// # Ok(())
    /// # }
    /// ```
    pub fn get(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Starts a POST request.
    pub fn post(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Starts a PUT request.
    pub fn put(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Starts a PATCH request.
    pub fn patch(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Starts a DELETE request.
    pub fn delete(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Starts a HEAD request.
    pub fn head(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Starts an OPTIONS request.
    pub fn options(&self, url: impl AsRef<str>) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Executes a request: hooks, rate limiting, retries and redirects
    /// included.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails. Error statuses are returned as
    /// responses unless raise-for-status is enabled.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_with(request, &CancellationToken::new()).await
    }

    /// Executes a request that ends with [`Error::Cancelled`] as soon as
    /// `cancel` fires.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spindle::{Client, Request};
    /// use tokio_util::sync::CancellationToken;
    /// use std::time::Duration;
    ///
    /// # async fn example() -> Result<(), spindle::Error> {
    /// let client = Client::builder().build()?;
    /// let cancel = CancellationToken::new();
    ///
    /// let canceller = cancel.clone();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(2)).await;
    ///     canceller.cancel();
    /// });
    ///
    /// let request = Request::parse(http::Method::GET, "https://example.com/slow")?;
    /// match client.execute_with(request, &cancel).await {
    ///     Err(spindle::Error::Cancelled) => println!("gave up"),
    ///     other => println!("{:?}", other.map(|r| r.status)),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_with(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        executor::execute(&self.inner, request, cancel, ErrorMode::Raise).await
    }

    /// Executes a request under the client's [`ErrorMode`].
    ///
    /// In [`ErrorMode::Warn`] a failed call yields `Ok(None)` after an
    /// [`Event::Suppressed`](crate::Event::Suppressed) event and nothing is
    /// reported as a failure.
    pub async fn fetch(&self, request: Request) -> Result<Option<Response>> {
        self.fetch_with(request, &CancellationToken::new()).await
    }

    async fn fetch_with(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Option<Response>> {
        let mode = self.inner.error_mode;
        match executor::execute(&self.inner, request, cancel, mode).await {
            Ok(response) => Ok(Some(response)),
            Err(_) if mode == ErrorMode::Warn => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Executes a request and returns as soon as the response head is in,
    /// leaving the body on the connection.
    ///
    /// Read it with [`Response::chunk`] or [`Response::into_stream`]; the
    /// connection goes back to the pool once the body is fully read.
    pub async fn stream(&self, request: Request) -> Result<Response> {
        self.execute(request.with_streaming(true)).await
    }

    /// Executes independent requests concurrently, at most `concurrency` at a
    /// time (the pool's `max_connections` when `None`).
    ///
    /// Results come back in input order.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spindle::{Client, Request};
    /// use http::Method;
    ///
    /// # async fn example() -> Result<(), spindle::Error> {
    /// let client = Client::builder().build()?;
    /// let requests = (1..=10)
    ///     .map(|id| Request::parse(Method::GET, &format!("https://example.com/items/{}", id)))
    ///     .collect::<Result<Vec<_>, _>>()?;
    ///
    /// for result in client.execute_all(requests, Some(4)).await {
    ///     println!("{:?}", result.map(|r| r.status));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_all<I>(
        &self,
        requests: I,
        concurrency: Option<usize>,
    ) -> Vec<Result<Response>>
    where
        I: IntoIterator<Item = Request>,
    {
        let limit = concurrency
            .unwrap_or_else(|| self.inner.pool.limits().max_connections)
            .max(1);
        stream::iter(requests)
            .map(|request| self.execute(request))
            .buffered(limit)
            .collect()
            .await
    }

    /// Closes the pool. Idle connections are dropped, in-flight ones are
    /// closed when their calls finish, and new calls fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        tracing::debug!("closing client");
        self.inner.pool.close();
    }

    /// Returns `true` once [`Client::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Returns current connection pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.inner.base_url {
                Some(base) => Ok(base.join(url)?),
                None => Err(Error::UnsupportedUrl(format!(
                    "relative URL `{}` needs a base URL",
                    url
                ))),
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// A request being assembled by [`Client::get`] and friends.
///
/// Errors from setters (an invalid header, a body that fails to serialize)
/// are kept and returned by [`send`](RequestBuilder::send).
#[must_use = "a request does nothing until it is sent"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
    cancel: CancellationToken,
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl RequestBuilder {
    fn map(mut self, f: impl FnOnce(Request) -> Result<Request>) -> Self {
        self.request = self.request.and_then(f);
        self
    }

    /// Sets a header, replacing existing values.
    pub fn header(self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.map(|r| r.with_header(name, value))
    }

    /// Appends a query parameter.
    pub fn query(self, key: &str, value: &str) -> Self {
        self.map(|r| Ok(r.with_query(key, value)))
    }

    /// Sets the body.
    pub fn body(self, body: impl Into<Body>) -> Self {
        self.map(|r| Ok(r.with_body(body)))
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        self.map(|r| r.with_json(value))
    }

    /// Overrides the timeouts.
    pub fn timeout(self, timeout: impl Into<Timeout>) -> Self {
        self.map(|r| Ok(r.with_timeout(timeout)))
    }

    /// Overrides the retry policy.
    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.map(|r| Ok(r.with_retry(policy)))
    }

    /// Overrides the redirect policy.
    pub fn redirect(self, policy: RedirectPolicy) -> Self {
        self.map(|r| Ok(r.with_redirect(policy)))
    }

    /// Uses `limiter` instead of the client's rate limiter.
    pub fn rate_limiter(self, limiter: impl Into<Arc<RateLimiter>>) -> Self {
        self.map(|r| Ok(r.with_rate_limiter(limiter.into())))
    }

    /// Skips rate limiting for this call.
    pub fn without_rate_limit(self) -> Self {
        self.map(|r| Ok(r.without_rate_limit()))
    }

    /// Overrides whether 4xx/5xx responses become [`Error::HttpStatus`].
    pub fn raise_for_status(self, raise: bool) -> Self {
        self.map(|r| Ok(r.with_raise_for_status(raise)))
    }

    /// Cancels the call when `token` fires.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the assembled request without sending it.
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Sends the request.
    pub async fn send(self) -> Result<Response> {
        let request = self.request?;
        self.client.execute_with(request, &self.cancel).await
    }

    /// Sends the request and returns once the response head is in. See
    /// [`Client::stream`].
    pub async fn stream(self) -> Result<Response> {
        let request = self.request?.with_streaming(true);
        self.client.execute_with(request, &self.cancel).await
    }

    /// Sends the request under the client's [`ErrorMode`]. See
    /// [`Client::fetch`].
    pub async fn fetch(self) -> Result<Option<Response>> {
        let request = self.request?;
        self.client.fetch_with(request, &self.cancel).await
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use spindle::{ClientBuilder, PoolLimits, RateLimiter, RetryPolicy, Timeout};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), spindle::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Timeout::default().read(Duration::from_secs(120)))
///     .retry(RetryPolicy::exponential(3, Duration::from_millis(100), 2.0))
///     .pool_limits(PoolLimits::default().max_connections_per_host(4))
///     .rate_limiter(RateLimiter::token_bucket(10, 10, Duration::from_secs(1)))
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    default_cookies: Vec<(String, String)>,
    timeout: Timeout,
    retry: RetryPolicy,
    redirect: RedirectPolicy,
    pool_limits: PoolLimits,
    rate_limiter: Option<Arc<RateLimiter>>,
    proxies: ProxySettings,
    tls: TlsSettings,
    tls_factory: Arc<dyn TlsContextFactory>,
    connector: Option<Arc<dyn Connect>>,
    hooks: Hooks,
    hook_mode: HookMode,
    credentials: Option<Arc<dyn CredentialProvider>>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    events: Events,
    error_mode: ErrorMode,
    raise_for_status: bool,
    stream_threshold: Option<usize>,
    adapters: Vec<(String, Adapter)>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            default_cookies: Vec::new(),
            timeout: Timeout::default(),
            retry: RetryPolicy::default(),
            redirect: RedirectPolicy::default(),
            pool_limits: PoolLimits::default(),
            rate_limiter: None,
            proxies: ProxySettings::default(),
            tls: TlsSettings::default(),
            tls_factory: Arc::new(RustlsFactory),
            connector: None,
            hooks: Hooks::new(),
            hook_mode: HookMode::default(),
            credentials: None,
            cookie_store: None,
            events: Events::default(),
            error_mode: ErrorMode::default(),
            raise_for_status: false,
            stream_threshold: Some(DEFAULT_STREAM_THRESHOLD),
            adapters: Vec::new(),
        }
    }

    /// Sets the base URL that relative request URLs are joined to.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Adds a cookie sent with every request.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or either part contains `;`,
    /// `=` (name only) or control characters.
    pub fn cookie(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = (name.as_ref(), value.as_ref());
        let bad = |c: char| c == ';' || c.is_control();
        if name.trim().is_empty() || name.contains('=') || name.contains(bad) || value.contains(bad)
        {
            return Err(Error::ConfigurationError(format!(
                "Invalid cookie: {}={}",
                name, value
            )));
        }
        self.default_cookies
            .push((name.trim().to_string(), value.to_string()));
        Ok(self)
    }

    /// Sets the timeouts. A plain `Duration` applies to every phase.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Sets the retry policy. The default makes a single attempt.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the redirect policy. The default follows up to 10 redirects.
    pub fn redirect(mut self, policy: RedirectPolicy) -> Self {
        self.redirect = policy;
        self
    }

    /// Sets the connection pool limits.
    pub fn pool_limits(mut self, limits: PoolLimits) -> Self {
        self.pool_limits = limits;
        self
    }

    /// Sets the rate limiter consulted before every attempt.
    pub fn rate_limiter(mut self, limiter: impl Into<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = Some(limiter.into());
        self
    }

    /// Routes connections through proxies.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use spindle::{Client, Proxy, ProxySettings};
    ///
    /// # fn example() -> Result<(), spindle::Error> {
    /// let proxies = ProxySettings::all(Proxy::new("proxy.internal", 3128).basic_auth("me", "pw"))
    ///     .no_proxy("localhost");
    /// let client = Client::builder().proxy(proxies).build()?;
    /// # let _ = client;
    /// # Ok(())
    /// # }
    /// ```
    pub fn proxy(mut self, proxies: ProxySettings) -> Self {
        self.proxies = proxies;
        self
    }

    /// Sets the TLS settings used for HTTPS connections.
    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.tls = settings;
        self
    }

    /// Replaces the factory that turns [`TlsSettings`] into a TLS context.
    pub fn tls_factory(mut self, factory: impl TlsContextFactory + 'static) -> Self {
        self.tls_factory = Arc::new(factory);
        self
    }

    /// Replaces the transport. Proxy and TLS settings are then up to the
    /// connector.
    pub fn connector(mut self, connector: impl Connect) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets the before/after hooks.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets when before hooks run.
    pub fn hook_mode(mut self, mode: HookMode) -> Self {
        self.hook_mode = mode;
        self
    }

    /// Sets the credential provider.
    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Sets the cookie store. Keep a clone of the `Arc` to inspect it later.
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Adds an event listener.
    pub fn event_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.events.add(Arc::new(listener));
        self
    }

    /// Sets what [`Client::fetch`] does with failed calls.
    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Turns 4xx/5xx responses into [`Error::HttpStatus`] for every call.
    pub fn raise_for_status(mut self, raise: bool) -> Self {
        self.raise_for_status = raise;
        self
    }

    /// Sets the largest body buffered before the response is returned
    /// (1 MiB by default). Larger bodies stream. `None` always buffers.
    pub fn stream_threshold(mut self, threshold: Option<usize>) -> Self {
        self.stream_threshold = threshold;
        self
    }

    /// Applies `adapter` to every request whose URL starts with `prefix`.
    pub fn mount(mut self, prefix: impl Into<String>, adapter: Adapter) -> Self {
        self.adapters.push((prefix.into(), adapter));
        self
    }

    /// Builds the configured `Client`.
    ///
    /// Spawns the pool's idle reaper when called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of the configuration is invalid or the
    /// TLS context can't be built.
    pub fn build(self) -> Result<Client> {
        self.timeout.validate()?;
        self.retry.validate()?;
        self.pool_limits.validate()?;
        if let Some(limiter) = &self.rate_limiter {
            limiter.validate()?;
        }
        self.proxies.validate()?;
        self.hooks.validate()?;
        for (prefix, adapter) in &self.adapters {
            adapter.validate(prefix)?;
        }

        let connector: Arc<dyn Connect> = match self.connector {
            Some(connector) => connector,
            None => {
                let tls = self.tls_factory.build(&self.tls)?;
                Arc::new(HttpConnector::new(self.proxies, tls))
            }
        };

        let pool = ConnectionPool::new(self.pool_limits);
        pool.spawn_reaper();

        tracing::debug!(
            base_url = ?self.base_url.as_ref().map(Url::as_str),
            max_connections = self.pool_limits.max_connections,
            "client built"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                default_headers: self.default_headers,
                default_cookies: self.default_cookies,
                timeout: self.timeout,
                retry: self.retry,
                redirect: self.redirect,
                pool,
                connector,
                rate_limiter: self.rate_limiter,
                hooks: self.hooks,
                hook_mode: self.hook_mode,
                credentials: self.credentials,
                cookies: self.cookie_store,
                events: self.events,
                error_mode: self.error_mode,
                raise_for_status: self.raise_for_status,
                stream_threshold: self.stream_threshold,
                adapters: self.adapters,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_relative_urls_need_a_base() {
        let client = Client::builder().build().unwrap();
        let err = client.get("/users").build().unwrap_err();
        assert!(matches!(err, Error::UnsupportedUrl(_)));

        let request = client.get("https://example.com/users").build().unwrap();
        assert_eq!(request.url().as_str(), "https://example.com/users");
    }

    #[test]
    fn test_relative_urls_join_the_base() {
        let client = Client::builder()
            .base_url("https://api.example.com/v1/")
            .unwrap()
            .build()
            .unwrap();
        let request = client.get("users/7").query("full", "1").build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://api.example.com/v1/users/7?full=1"
        );
    }

    #[test]
    fn test_builder_errors_surface_on_build() {
        let client = Client::builder().build().unwrap();
        let result = client
            .post("https://example.com/")
            .header("bad header", "x")
            .body("ignored")
            .build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(Client::builder()
            .timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(Client::builder()
            .pool_limits(PoolLimits::default().max_connections(5).max_connections_per_host(6))
            .build()
            .is_err());
        assert!(Client::builder()
            .hooks(Hooks::new().before("dup", Ok).before("dup", Ok))
            .build()
            .is_err());
        assert!(Client::builder()
            .mount("", Adapter::new())
            .build()
            .is_err());
        assert!(Client::builder().cookie("a;b", "1").is_err());
        assert!(Client::builder().default_header("x", "line\nbreak").is_err());
    }

    #[test]
    fn test_longest_adapter_prefix_wins() {
        let client = Client::builder()
            .mount(
                "https://api.example.com/",
                Adapter::new().timeout(Duration::from_secs(1)),
            )
            .mount(
                "https://api.example.com/slow/",
                Adapter::new().timeout(Duration::from_secs(60)),
            )
            .build()
            .unwrap();

        let slow = Url::parse("https://api.example.com/slow/report").unwrap();
        let fast = Url::parse("https://api.example.com/users").unwrap();
        let other = Url::parse("https://other.example.com/").unwrap();
        let inner = &client.inner;
        assert_eq!(
            inner.adapter_for(&slow).and_then(|a| a.timeout),
            Some(Timeout::all(Duration::from_secs(60)))
        );
        assert_eq!(
            inner.adapter_for(&fast).and_then(|a| a.timeout),
            Some(Timeout::all(Duration::from_secs(1)))
        );
        assert!(inner.adapter_for(&other).is_none());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = Client::builder().build().unwrap();
        client.close();
        assert!(client.is_closed());
        let err = client.get("http://127.0.0.1:9/").send().await.unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }
}
