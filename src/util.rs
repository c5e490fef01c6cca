//! Small helpers shared across the engine: poison-tolerant locking, header
//! layering, and racing futures against a call's cancellation token.

use crate::{Error, Result};
use http::HeaderMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Overlays `overrides` on `base`. A name present in `overrides` replaces every
/// value `base` had for it; repeated values within `overrides` are all kept.
pub(crate) fn merge_headers(base: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for name in overrides.keys() {
        merged.remove(name);
    }
    for (name, value) in overrides {
        merged.append(name.clone(), value.clone());
    }
    merged
}

/// Races `fut` against the cancellation token.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Sleeps for `delay` unless the token fires first.
pub(crate) async fn sleep_cancellable(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        };
    }
    cancellable(cancel, async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_merge_headers_override_replaces_all_values() {
        let mut base = HeaderMap::new();
        base.append("accept", HeaderValue::from_static("text/html"));
        base.append("accept", HeaderValue::from_static("text/plain"));
        base.insert("user-agent", HeaderValue::from_static("base"));

        let mut overrides = HeaderMap::new();
        overrides.append("accept", HeaderValue::from_static("application/json"));
        overrides.append("x-tag", HeaderValue::from_static("a"));
        overrides.append("x-tag", HeaderValue::from_static("b"));

        let merged = merge_headers(&base, &overrides);
        let accept: Vec<_> = merged.get_all("accept").iter().collect();
        assert_eq!(accept, vec!["application/json"]);
        assert_eq!(merged.get_all("x-tag").iter().count(), 2);
        assert_eq!(merged.get("user-agent").unwrap(), "base");
    }

    #[tokio::test]
    async fn test_sleep_cancellable_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = sleep_cancellable(&token, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
