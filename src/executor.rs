//! Request execution.
//!
//! One call runs as three nested loops:
//!
//! 1. the redirect loop, one iteration per request in the chain (a *hop*)
//! 2. the retry loop, one iteration per attempt of a hop, with a fresh budget
//!    for every hop
//! 3. the connection loop, which moves an attempt to a new connection when a
//!    reused keep-alive connection turns out to be dead before any response
//!    byte arrived
//!
//! Every wait (rate limiter, pool, connect, socket I/O, backoff) is raced
//! against the call's cancellation token. Connections are owned by the
//! attempt that uses them, so an error, a cancellation or a dropped future
//! closes them instead of returning them to the pool.

use crate::client::{ClientInner, DEFAULT_STREAM_THRESHOLD};
use crate::events::Event;
use crate::pool::{Checkout, PoolKey};
use crate::request::RateLimitOverride;
use crate::response::ResponseBody;
use crate::retry::{Outcome, RetryDecision, RetryState};
use crate::timeout::TimeoutController;
use crate::transfer::{self, BodyReader, Buffered};
use crate::util::{cancellable, merge_headers, sleep_cancellable};
use crate::{
    ConnectErrorKind, Error, ErrorMode, HookMode, RateLimiter, RedirectChain, RedirectPolicy, Request,
    Response, Result, RetryPolicy, Timeout, TimeoutPhase,
};
use http::header::COOKIE;
use http::{HeaderValue, StatusCode};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Redirect bodies past this size are not worth reading to keep a
/// connection alive.
const REDIRECT_DRAIN_LIMIT: usize = 64 * 1024;

/// The settings that apply to one hop after request, adapter and client
/// defaults are layered.
#[derive(Debug, Clone)]
struct HopSettings {
    timeout: Timeout,
    retry: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    stream: bool,
}

impl HopSettings {
    fn resolve(inner: &ClientInner, request: &Request) -> Result<Self> {
        let adapter = inner.adapter_for(request.url());
        let overrides = &request.overrides;

        let timeout = overrides
            .timeout
            .or_else(|| adapter.and_then(|a| a.timeout))
            .unwrap_or(inner.timeout);
        let retry = overrides
            .retry
            .clone()
            .or_else(|| adapter.and_then(|a| a.retry.clone()))
            .unwrap_or_else(|| inner.retry.clone());
        let limiter = match &overrides.rate_limit {
            Some(RateLimitOverride::Disabled) => None,
            Some(RateLimitOverride::Limiter(limiter)) => Some(limiter.clone()),
            None => inner.rate_limiter.clone(),
        };

        timeout.validate()?;
        retry.validate()?;
        if let Some(limiter) = &limiter {
            limiter.validate()?;
        }

        Ok(Self {
            timeout,
            retry,
            limiter,
            stream: overrides.stream,
        })
    }
}

/// Runs `request` to completion.
///
/// A failure is reported as [`Event::Failed`], or as [`Event::Suppressed`]
/// when the caller is going to swallow it under [`ErrorMode::Warn`].
pub(crate) async fn execute(
    inner: &ClientInner,
    request: Request,
    cancel: &CancellationToken,
    mode: ErrorMode,
) -> Result<Response> {
    let method = request.method();
    let url = request.url().clone();
    let result = run_call(inner, request, cancel).await;
    if let Err(e) = &result {
        let error = e.to_string();
        inner.events.emit(match mode {
            ErrorMode::Raise => Event::Failed { method, url, error },
            ErrorMode::Warn => Event::Suppressed { method, url, error },
        });
    }
    result
}

async fn run_call(
    inner: &ClientInner,
    request: Request,
    cancel: &CancellationToken,
) -> Result<Response> {
    let started = Instant::now();
    let adapter = inner.adapter_for(request.url());

    let redirect: RedirectPolicy = request
        .overrides
        .redirect
        .or_else(|| adapter.and_then(|a| a.redirect))
        .unwrap_or(inner.redirect);
    let raise_for_status = request
        .overrides
        .raise_for_status
        .unwrap_or(inner.raise_for_status);

    let mut headers = inner.default_headers.clone();
    if let Some(adapter) = adapter {
        headers = merge_headers(&headers, &adapter.headers);
    }
    let headers = merge_headers(&headers, request.headers());
    let mut request = request.with_headers(headers);

    let mut chain = RedirectChain::new(redirect.max());
    loop {
        let mut hop = match inner.hook_mode {
            HookMode::OncePerCall => inner.hooks.run_before(request)?,
            HookMode::EveryAttempt => request,
        };
        PoolKey::from_url(hop.url())?;

        let mut response = run_hop(inner, &mut hop, cancel).await?;

        let Some(next) = redirect.resolve(&hop, &response)? else {
            response.history = chain.into_history();
            response.elapsed = started.elapsed();
            let mut response = inner.hooks.run_after(response)?;
            if raise_for_status
                && (response.status.is_client_error() || response.status.is_server_error())
            {
                let limit = inner.stream_threshold.unwrap_or(DEFAULT_STREAM_THRESHOLD);
                cancellable(cancel, response.drain(limit)).await?;
                return Err(response.into_status_error());
            }
            return Ok(response);
        };

        cancellable(cancel, response.drain(REDIRECT_DRAIN_LIMIT)).await?;
        inner.events.emit(Event::Redirected {
            from: response.url.clone(),
            to: next.url().clone(),
            status: response.status,
        });
        response.elapsed = started.elapsed();
        chain.record(response)?;
        request = next;
    }
}

/// Runs the attempts of one hop under its retry policy.
///
/// A one-shot body is buffered into `hop` itself when the policy asks for it,
/// so a 307/308 redirect built from `hop` can resend it too.
async fn run_hop(
    inner: &ClientInner,
    hop: &mut Request,
    cancel: &CancellationToken,
) -> Result<Response> {
    let settings = HopSettings::resolve(inner, hop)?;
    let method = hop.method();

    if settings.retry.buffers_lazy_bodies() && !hop.body().is_replayable() {
        let body = cancellable(cancel, hop.body().clone().buffered()).await?;
        *hop = hop.clone().with_body(body);
    }
    let request: &Request = hop;

    let mut state = RetryState::new(&method);
    let mut refreshed = false;
    loop {
        state.attempt += 1;
        let attempt_request = match inner.hook_mode {
            HookMode::EveryAttempt => inner.hooks.run_before(request.clone())?,
            HookMode::OncePerCall => request.clone(),
        };

        tracing::debug!(
            method = %method,
            url = %attempt_request.url(),
            attempt = state.attempt,
            "Executing HTTP request"
        );
        let result = attempt(inner, &attempt_request, &settings, cancel).await;

        if let (Ok(response), Some(provider), false) = (&result, &inner.credentials, refreshed) {
            if response.status == StatusCode::UNAUTHORIZED {
                refreshed = true;
                let renewed = cancellable(cancel, async {
                    provider
                        .refresh()
                        .await
                        .map_err(|source| Error::Credentials { source })
                })
                .await?;
                if renewed && !request.body().is_consumed() {
                    tracing::debug!(url = %request.url(), "credentials refreshed, resending");
                    state.attempt -= 1;
                    continue;
                }
            }
        }

        let outcome = match &result {
            Ok(response) => Outcome::Response(response),
            Err(e) => Outcome::Error(e),
        };
        let decision = settings.retry.decide(&state, &outcome);
        state.record(&outcome);
        let failed = result.is_err() || decision != RetryDecision::GiveUp;
        if failed {
            inner.events.emit(Event::AttemptFailed {
                method: method.clone(),
                url: request.url().clone(),
                attempt: state.attempt,
                reason: state.last.clone().unwrap_or_default(),
            });
        }

        match (decision, result) {
            (RetryDecision::Retry { after }, result) => {
                drop(result);
                if request.body().is_consumed() {
                    return Err(Error::BodyAlreadyConsumed);
                }
                inner.events.emit(Event::Retrying {
                    method: method.clone(),
                    url: request.url().clone(),
                    attempt: state.attempt + 1,
                    delay: after,
                });
                sleep_cancellable(cancel, after).await?;
            }
            (RetryDecision::Exhausted, Err(e)) => {
                return Err(Error::RetryExhausted {
                    attempts: state.attempt,
                    last_error: Box::new(e),
                });
            }
            (_, Ok(mut response)) => {
                response.attempts = state.attempt;
                return Ok(response);
            }
            (RetryDecision::GiveUp, Err(e)) => return Err(e),
        }
    }
}

/// One attempt: rate limit, connection, exchange, and the response body up to
/// the streaming threshold.
async fn attempt(
    inner: &ClientInner,
    request: &Request,
    settings: &HopSettings,
    cancel: &CancellationToken,
) -> Result<Response> {
    let url = request.url();
    let key = PoolKey::from_url(url)?;
    let timeouts = TimeoutController::new(settings.timeout, url.as_str());

    if let Some(limiter) = &settings.limiter {
        let limiter_key = limiter.key_for(&key);
        let wait = limiter.try_acquire(&limiter_key)?;
        if !wait.is_zero() {
            tracing::debug!(
                key = %limiter_key,
                delay_ms = wait.as_millis() as u64,
                "Rate limiter delaying request"
            );
            sleep_cancellable(cancel, wait).await?;
        }
    }

    let wire = wire_request(inner, request)?;

    loop {
        let checkout = cancellable(
            cancel,
            inner.pool.acquire(&key, timeouts.limit(TimeoutPhase::Pool)),
        )
        .await?;
        let mut conn = match checkout {
            Checkout::Reused(conn) => conn,
            Checkout::Vacant(slot) => {
                let connected = cancellable(
                    cancel,
                    timeouts.run(TimeoutPhase::Connect, inner.connector.connect(&key)),
                )
                .await?;
                slot.fill(connected)
            }
        };
        let reused = conn.is_reused();

        let body = wire.body().open()?;
        let exchange = async {
            transfer::send_request(&mut conn, &wire, body, &timeouts).await?;
            transfer::read_head(&mut conn, &timeouts).await
        };
        let head = match cancellable(cancel, exchange).await {
            Ok(head) => head,
            Err(e) if reused && is_stale(&e, &wire) => {
                tracing::debug!(
                    url = %url,
                    error = %e,
                    "Pooled connection was closed by the server, retrying on another"
                );
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Some(store) = &inner.cookies {
            store.store(url, &head.headers);
        }

        let reader = BodyReader::new(conn, &wire.method(), &head, timeouts)?;
        let body = if settings.stream {
            ResponseBody::Streaming(reader)
        } else {
            match cancellable(cancel, reader.buffer(inner.stream_threshold)).await? {
                Buffered::Complete(bytes) => ResponseBody::Buffered(bytes),
                Buffered::Streaming(reader) => ResponseBody::Streaming(reader),
            }
        };

        return Ok(Response::from_parts(
            head.status,
            head.reason,
            head.version,
            head.headers,
            url.clone(),
            body,
        ));
    }
}

/// Adds cookies and credentials to what goes on the wire.
fn wire_request(inner: &ClientInner, request: &Request) -> Result<Request> {
    let mut wire = request.clone();

    let mut cookies: Vec<String> = wire
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    cookies.extend(
        inner
            .default_cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value)),
    );
    if let Some(stored) = inner
        .cookies
        .as_ref()
        .and_then(|store| store.cookies(request.url()))
    {
        if let Ok(stored) = stored.to_str() {
            cookies.push(stored.to_string());
        }
    }
    if !cookies.is_empty() {
        let value = HeaderValue::try_from(cookies.join("; "))
            .map_err(|e| Error::ConfigurationError(format!("Invalid cookie header: {}", e)))?;
        wire.headers_mut().insert(COOKIE, value);
    }

    if let Some(provider) = &inner.credentials {
        let credentials = provider
            .credentials(&wire)
            .map_err(|source| Error::Credentials { source })?;
        let headers = merge_headers(wire.headers(), &credentials);
        wire = wire.with_headers(headers);
    }

    Ok(wire)
}

/// Whether a failed exchange on a reused connection can move to a fresh one.
///
/// The server may have acted on a request it received in full, so only
/// idempotent methods are resent after the write completed.
fn is_stale(error: &Error, wire: &Request) -> bool {
    let Error::Connection {
        kind: ConnectErrorKind::Reset { request_sent },
        ..
    } = error
    else {
        return false;
    };
    wire.body().is_replayable() && (!request_sent || wire.method().is_idempotent())
}
