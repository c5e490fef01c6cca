//! Connection pool.
//!
//! Connections are keyed by `(scheme, host, port)` and bounded by a global cap
//! and a per-key cap. An acquire either gets an idle connection back
//! ([`Checkout::Reused`]) or a reserved slot to connect into
//! ([`Checkout::Vacant`]); when neither is possible it waits for a release until
//! the pool-wait deadline passes.
//!
//! Every [`Connection`] is owned by exactly one party: the pool's idle set or
//! the request using it. Dropping a connection (or an unfilled slot) without
//! handing it back frees its slot and closes the socket, so cancelled requests
//! never return half-used connections to the idle set.

use crate::connect::{BoxedIo, Connected};
use crate::util::lock_unpoisoned;
use crate::{Error, Result, TimeoutPhase};
use bytes::BytesMut;
use http::HeaderMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// URL scheme of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// The scheme as it appears in URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Identifies which connections are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl PoolKey {
    /// Creates a key. The host is lowercased.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derives the key for a request URL.
    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(Error::UnsupportedUrl(url.to_string())),
        };
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(Error::UnsupportedUrl(url.to_string())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::UnsupportedUrl(url.to_string()))?;
        Ok(Self::new(scheme, host, port))
    }

    /// Returns the scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Returns the lowercased host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

/// Size limits for a [`ConnectionPool`].
///
/// # Examples
///
/// ```
/// use spindle::PoolLimits;
/// use std::time::Duration;
///
/// let limits = PoolLimits::default()
///     .max_connections(100)
///     .max_connections_per_host(10)
///     .idle_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum number of open connections across all keys.
    pub max_connections: usize,
    /// Maximum number of open connections for one key.
    pub max_connections_per_host: usize,
    /// Maximum number of idle connections kept for reuse.
    pub max_idle: usize,
    /// How long an idle connection may sit unused before it is closed.
    pub idle_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_connections_per_host: 20,
            max_idle: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolLimits {
    /// Sets the global connection cap.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the per-key connection cap.
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    /// Sets how many idle connections are kept.
    pub fn max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }

    /// Sets the keep-alive expiry for idle connections.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let problem = if self.max_connections == 0 {
            Some("max_connections must be greater than zero")
        } else if self.max_connections_per_host == 0 {
            Some("max_connections_per_host must be greater than zero")
        } else if self.max_idle == 0 {
            Some("max_idle must be greater than zero")
        } else if self.max_connections_per_host > self.max_connections {
            Some("max_connections_per_host cannot exceed max_connections")
        } else if self.max_idle > self.max_connections {
            Some("max_idle cannot exceed max_connections")
        } else if self.idle_timeout.is_zero() {
            Some("idle_timeout must be greater than zero")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(Error::ConfigurationError(problem.to_string())),
            None => Ok(()),
        }
    }
}

/// A point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Open connections, idle or in use (including ones being established).
    pub connections: usize,
    /// Connections sitting in the idle set.
    pub idle: usize,
    /// Connections owned by in-flight requests.
    pub in_use: usize,
}

/// The result of [`ConnectionPool::acquire`].
#[derive(Debug)]
pub enum Checkout {
    /// A previously used connection for the key.
    Reused(Connection),
    /// Capacity reserved for a new connection; connect and [`fill`](ConnectSlot::fill) it.
    Vacant(ConnectSlot),
}

/// Capacity reserved in the pool for one connection.
///
/// Dropping the slot gives the capacity back.
pub struct ConnectSlot {
    key: PoolKey,
    pool: Weak<PoolInner>,
    armed: bool,
}

impl fmt::Debug for ConnectSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectSlot").field("key", &self.key).finish()
    }
}

impl ConnectSlot {
    /// Returns the key the slot was reserved for.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Turns the slot into a connection over `connected`.
    pub fn fill(self, connected: Connected) -> Connection {
        let id = self
            .pool
            .upgrade()
            .map_or(0, |pool| pool.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(id, key = %self.key, "opened connection");
        Connection {
            id,
            slot: self,
            io: connected.io,
            read_buf: BytesMut::with_capacity(8 * 1024),
            forward_proxy: connected.forward_proxy,
            idle_since: Instant::now(),
            broken: false,
            close_requested: false,
            reused: false,
        }
    }
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            lock_unpoisoned(&pool.state).forget(&self.key);
            pool.released.notify_waiters();
        }
    }
}

/// A pooled HTTP/1.1 connection.
///
/// Hand it back with [`ConnectionPool::release`]; dropping it closes the
/// transport and frees its slot.
pub struct Connection {
    id: u64,
    slot: ConnectSlot,
    pub(crate) io: BoxedIo,
    pub(crate) read_buf: BytesMut,
    pub(crate) forward_proxy: Option<HeaderMap>,
    idle_since: Instant,
    broken: bool,
    close_requested: bool,
    reused: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.slot.key)
            .field("reused", &self.reused)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Returns the key this connection belongs to.
    pub fn key(&self) -> &PoolKey {
        &self.slot.key
    }

    /// Returns `true` if the connection served an earlier request.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Marks the connection as unusable after a protocol or I/O failure.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Records that the server asked to close the connection after this exchange.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Returns `true` if the connection may go back to the idle set.
    pub fn is_reusable(&self) -> bool {
        !self.broken && !self.close_requested
    }

    /// Hands the connection back to the pool it came from.
    pub(crate) fn release(self) {
        if let Some(inner) = self.slot.pool.upgrade() {
            ConnectionPool { inner }.release(self);
        }
    }

    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.idle_since) >= idle_timeout
    }
}

/// A bounded, keyed pool of HTTP/1.1 connections.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limits", &self.inner.limits)
            .field("stats", &self.stats())
            .finish()
    }
}

struct PoolInner {
    limits: PoolLimits,
    state: Mutex<PoolState>,
    released: Notify,
    next_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    /// Oldest first; checkouts take from the back.
    idle: HashMap<PoolKey, Vec<Connection>>,
    open: HashMap<PoolKey, usize>,
    total: usize,
    idle_count: usize,
    closed: bool,
}

impl PoolState {
    fn reserve(&mut self, key: &PoolKey) {
        *self.open.entry(key.clone()).or_default() += 1;
        self.total += 1;
    }

    fn forget(&mut self, key: &PoolKey) {
        if let Some(count) = self.open.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.open.remove(key);
            }
        }
        self.total = self.total.saturating_sub(1);
    }

    /// Removes an idle connection's accounting now; the caller drops it once
    /// the lock is released.
    fn evict(&mut self, mut conn: Connection, out: &mut Vec<Connection>) {
        self.forget(conn.key());
        conn.slot.armed = false;
        out.push(conn);
    }

    fn take_idle(
        &mut self,
        key: &PoolKey,
        now: Instant,
        idle_timeout: Duration,
        evicted: &mut Vec<Connection>,
    ) -> Option<Connection> {
        let mut found = None;
        let mut stale = Vec::new();
        if let Some(list) = self.idle.get_mut(key) {
            while let Some(conn) = list.pop() {
                if conn.is_expired(now, idle_timeout) {
                    stale.push(conn);
                } else {
                    found = Some(conn);
                    break;
                }
            }
            if list.is_empty() {
                self.idle.remove(key);
            }
        }
        self.idle_count -= stale.len() + usize::from(found.is_some());
        for conn in stale {
            self.evict(conn, evicted);
        }
        found
    }

    /// Evicts the longest-idle connection of any key other than `except`.
    fn evict_oldest_other(&mut self, except: &PoolKey, evicted: &mut Vec<Connection>) -> bool {
        let oldest = self
            .idle
            .iter()
            .filter(|(key, _)| *key != except)
            .filter_map(|(key, list)| list.first().map(|conn| (key.clone(), conn.idle_since)))
            .min_by_key(|(_, since)| *since)
            .map(|(key, _)| key);
        let Some(key) = oldest else {
            return false;
        };
        let Some(list) = self.idle.get_mut(&key) else {
            return false;
        };
        let conn = list.remove(0);
        if list.is_empty() {
            self.idle.remove(&key);
        }
        self.idle_count -= 1;
        self.evict(conn, evicted);
        true
    }
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limits,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the pool's limits.
    pub fn limits(&self) -> PoolLimits {
        self.inner.limits
    }

    /// Gets a connection for `key`, waiting at most `wait` for capacity.
    ///
    /// The wait starts when this is called. `None` waits indefinitely.
    pub async fn acquire(&self, key: &PoolKey, wait: Option<Duration>) -> Result<Checkout> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        let limits = self.inner.limits;

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut evicted = Vec::new();
            let checkout = {
                let mut state = lock_unpoisoned(&self.inner.state);
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                let now = Instant::now();
                if let Some(mut conn) = state.take_idle(key, now, limits.idle_timeout, &mut evicted)
                {
                    conn.reused = true;
                    Some(Checkout::Reused(conn))
                } else {
                    let per_key = state.open.get(key).copied().unwrap_or(0);
                    let key_has_room = per_key < limits.max_connections_per_host;
                    let pool_has_room = state.total < limits.max_connections
                        || (key_has_room && state.evict_oldest_other(key, &mut evicted));
                    if key_has_room && pool_has_room {
                        state.reserve(key);
                        Some(Checkout::Vacant(ConnectSlot {
                            key: key.clone(),
                            pool: Arc::downgrade(&self.inner),
                            armed: true,
                        }))
                    } else {
                        None
                    }
                }
            };
            drop(evicted);

            if let Some(checkout) = checkout {
                return Ok(checkout);
            }

            debug!(key = %key, "pool at capacity, waiting for a connection");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::Timeout {
                            phase: TimeoutPhase::Pool,
                            timeout: wait.unwrap_or_default(),
                            url: key.to_string(),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Returns a connection to the pool.
    ///
    /// It joins the idle set if it is reusable, the pool is open and the idle
    /// set has room; otherwise it is closed.
    pub fn release(&self, mut conn: Connection) {
        let mut rejected = Vec::new();
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if conn.is_reusable() && !state.closed && state.idle_count < self.inner.limits.max_idle
            {
                conn.idle_since = Instant::now();
                state.idle.entry(conn.key().clone()).or_default().push(conn);
                state.idle_count += 1;
            } else {
                debug!(id = conn.id, key = %conn.key(), "closing connection");
                state.evict(conn, &mut rejected);
            }
        }
        drop(rejected);
        self.inner.released.notify_waiters();
    }

    /// Closes idle connections that outlived the idle timeout. Returns how
    /// many were closed.
    pub fn reap(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            let now = Instant::now();
            let idle_timeout = self.inner.limits.idle_timeout;
            let lists: Vec<_> = state.idle.drain().collect();
            for (key, list) in lists {
                let (expired, live): (Vec<_>, Vec<_>) = list
                    .into_iter()
                    .partition(|conn| conn.is_expired(now, idle_timeout));
                state.idle_count -= expired.len();
                for conn in expired {
                    state.evict(conn, &mut evicted);
                }
                if !live.is_empty() {
                    state.idle.insert(key, live);
                }
            }
        }
        let count = evicted.len();
        if count > 0 {
            self.inner.released.notify_waiters();
        }
        count
    }

    /// Closes every idle connection and refuses further acquires.
    ///
    /// Connections in use are closed when they are released.
    pub fn close(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.closed = true;
            let lists: Vec<_> = state.idle.drain().collect();
            state.idle_count = 0;
            for conn in lists.into_iter().flat_map(|(_, list)| list) {
                state.evict(conn, &mut evicted);
            }
        }
        debug!(closed = evicted.len(), "connection pool closed");
        drop(evicted);
        self.inner.released.notify_waiters();
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.inner.state).closed
    }

    /// Returns current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = lock_unpoisoned(&self.inner.state);
        PoolStats {
            connections: state.total,
            idle: state.idle_count,
            in_use: state.total - state.idle_count,
        }
    }

    /// Spawns a task that reaps expired idle connections in the background.
    ///
    /// Does nothing outside a Tokio runtime. The task ends with the pool.
    pub(crate) fn spawn_reaper(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::downgrade(&self.inner);
        let period = (self.inner.limits.idle_timeout / 2).max(Duration::from_millis(100));
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                let reaped = pool.reap();
                if reaped > 0 {
                    debug!(reaped, "reaped idle connections");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str) -> PoolKey {
        PoolKey::new(Scheme::Http, host, 80)
    }

    fn connect(slot: ConnectSlot) -> Connection {
        let (client, _server) = tokio::io::duplex(64);
        slot.fill(Connected::new(client))
    }

    async fn fresh(pool: &ConnectionPool, key: &PoolKey) -> Connection {
        match pool.acquire(key, Some(Duration::from_secs(1))).await.unwrap() {
            Checkout::Vacant(slot) => connect(slot),
            Checkout::Reused(conn) => panic!("expected a new connection, got {:?}", conn),
        }
    }

    #[test]
    fn test_pool_key_from_url() {
        let url = Url::parse("https://API.Example.com/v1").unwrap();
        let key = PoolKey::from_url(&url).unwrap();
        assert_eq!(key, PoolKey::new(Scheme::Https, "api.example.com", 443));
        assert_eq!(key.to_string(), "https://api.example.com:443");

        let ftp = Url::parse("ftp://example.com/file").unwrap();
        assert!(matches!(
            PoolKey::from_url(&ftp),
            Err(Error::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_limits_validation() {
        assert!(PoolLimits::default().validate().is_ok());
        assert!(PoolLimits::default().max_connections(0).validate().is_err());
        assert!(PoolLimits::default()
            .max_connections(5)
            .max_connections_per_host(6)
            .max_idle(5)
            .validate()
            .is_err());
        assert!(PoolLimits::default()
            .max_connections(5)
            .max_connections_per_host(5)
            .max_idle(6)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = ConnectionPool::new(PoolLimits::default());
        let key = key("example.com");

        let conn = fresh(&pool, &key).await;
        let id = conn.id;
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);

        match pool.acquire(&key, None).await.unwrap() {
            Checkout::Reused(conn) => {
                assert_eq!(conn.id, id);
                assert!(conn.is_reused());
            }
            Checkout::Vacant(_) => panic!("expected the idle connection"),
        }
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_slot() {
        let pool = ConnectionPool::new(PoolLimits::default());
        let key = key("example.com");

        let conn = fresh(&pool, &key).await;
        assert_eq!(pool.stats().connections, 1);
        drop(conn);
        assert_eq!(pool.stats(), PoolStats::default());

        let slot = match pool.acquire(&key, None).await.unwrap() {
            Checkout::Vacant(slot) => slot,
            Checkout::Reused(_) => panic!("nothing should be idle"),
        };
        assert_eq!(pool.stats().connections, 1);
        drop(slot);
        assert_eq!(pool.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_broken_connection_is_not_reused() {
        let pool = ConnectionPool::new(PoolLimits::default());
        let key = key("example.com");

        let mut conn = fresh(&pool, &key).await;
        conn.mark_broken();
        pool.release(conn);
        assert_eq!(pool.stats(), PoolStats::default());

        let mut conn = fresh(&pool, &key).await;
        conn.request_close();
        pool.release(conn);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_host_cap_blocks_until_release() {
        let limits = PoolLimits::default().max_connections_per_host(2);
        let pool = ConnectionPool::new(limits);
        let key = key("example.com");

        let first = fresh(&pool, &key).await;
        let _second = fresh(&pool, &key).await;

        let err = pool
            .acquire(&key, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Pool));

        // Another host is not affected by this host's cap.
        let _other = fresh(&pool, &PoolKey::new(Scheme::Http, "other.com", 80)).await;

        let waiter = {
            let pool = pool.clone();
            let key = key.clone();
            tokio::spawn(async move { pool.acquire(&key, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        pool.release(first);
        let checkout = waiter.await.unwrap().unwrap();
        assert!(matches!(checkout, Checkout::Reused(_)));
    }

    #[tokio::test]
    async fn test_global_cap_evicts_idle_of_other_key() {
        let limits = PoolLimits::default()
            .max_connections(1)
            .max_connections_per_host(1)
            .max_idle(1);
        let pool = ConnectionPool::new(limits);

        let conn = fresh(&pool, &key("a.com")).await;
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);

        let conn = fresh(&pool, &key("b.com")).await;
        assert_eq!(pool.stats().connections, 1);
        assert_eq!(pool.stats().idle, 0);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_connections_are_reaped() {
        let limits = PoolLimits::default().idle_timeout(Duration::from_secs(5));
        let pool = ConnectionPool::new(limits);
        let key = key("example.com");

        let conn = fresh(&pool, &key).await;
        pool.release(conn);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(pool.reap(), 1);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_connection_is_skipped_on_acquire() {
        let limits = PoolLimits::default().idle_timeout(Duration::from_secs(5));
        let pool = ConnectionPool::new(limits);
        let key = key("example.com");

        let conn = fresh(&pool, &key).await;
        pool.release(conn);
        tokio::time::advance(Duration::from_secs(6)).await;

        let checkout = pool.acquire(&key, None).await.unwrap();
        assert!(matches!(checkout, Checkout::Vacant(_)));
        assert_eq!(pool.stats().connections, 1);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire_and_drops_idle() {
        let pool = ConnectionPool::new(PoolLimits::default());
        let key = key("example.com");

        let idle = fresh(&pool, &key).await;
        let busy = fresh(&pool, &key).await;
        pool.release(idle);

        pool.close();
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.acquire(&key, None).await,
            Err(Error::PoolClosed)
        ));

        pool.release(busy);
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
