//! Cookie persistence.
//!
//! A [`CookieStore`] sees every response's headers and supplies the `Cookie`
//! header for every request, redirects included. [`MemoryCookieJar`] keeps
//! cookies in memory for the lifetime of the client; persisting them anywhere
//! else is up to custom stores.

use crate::util::lock_unpoisoned;
use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderValue};
use std::fmt;
use std::sync::Mutex;
use url::Url;

/// Stores cookies between requests.
pub trait CookieStore: Send + Sync {
    /// Returns the `Cookie` header value for a request to `url`, if any.
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;

    /// Records the `Set-Cookie` headers of a response from `url`.
    fn store(&self, url: &Url, headers: &HeaderMap);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
}

impl StoredCookie {
    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        let path = url.path();
        let path_ok = path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')));
        domain_ok && path_ok && (!self.secure || url.scheme() == "https")
    }
}

/// An in-memory cookie jar.
///
/// Understands the `Domain`, `Path`, `Secure` and `Max-Age` attributes.
/// `Expires` is not interpreted; such cookies live as long as the jar.
///
/// # Examples
///
/// ```
/// use spindle::{CookieStore, MemoryCookieJar};
/// use http::HeaderMap;
///
/// let jar = MemoryCookieJar::new();
/// let url = url::Url::parse("https://example.com/account").unwrap();
///
/// let mut headers = HeaderMap::new();
/// headers.insert("set-cookie", "session=abc; Path=/; Secure".parse().unwrap());
/// jar.store(&url, &headers);
///
/// assert_eq!(jar.cookies(&url).unwrap(), "session=abc");
/// ```
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl fmt::Debug for MemoryCookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCookieJar")
            .field("cookies", &lock_unpoisoned(&self.cookies).len())
            .finish()
    }
}

impl MemoryCookieJar {
    /// Creates an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored cookies.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.cookies).len()
    }

    /// Returns `true` if the jar is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every cookie.
    pub fn clear(&self) {
        lock_unpoisoned(&self.cookies).clear();
    }
}

impl CookieStore for MemoryCookieJar {
    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let cookies = lock_unpoisoned(&self.cookies);
        let pairs: Vec<String> = cookies
            .iter()
            .filter(|cookie| cookie.matches(url))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        HeaderValue::try_from(pairs.join("; ")).ok()
    }

    fn store(&self, url: &Url, headers: &HeaderMap) {
        let Some(host) = url.host_str() else {
            return;
        };
        let host = host.to_ascii_lowercase();
        let mut cookies = lock_unpoisoned(&self.cookies);
        for value in headers.get_all(SET_COOKIE) {
            let Some((cookie, remove)) = value
                .to_str()
                .ok()
                .and_then(|v| parse_set_cookie(v, &host, url.path()))
            else {
                continue;
            };
            cookies.retain(|c| {
                !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
            });
            if !remove {
                cookies.push(cookie);
            }
        }
    }
}

/// Parses one `Set-Cookie` value. The flag is `true` when the cookie should be
/// deleted rather than stored.
fn parse_set_cookie(header: &str, host: &str, request_path: &str) -> Option<(StoredCookie, bool)> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = StoredCookie {
        name: name.to_string(),
        value: value.trim().trim_matches('"').to_string(),
        domain: host.to_string(),
        host_only: true,
        path: default_path(request_path),
        secure: false,
    };
    let mut remove = false;

    for attribute in parts {
        let (key, val) = attribute
            .split_once('=')
            .map_or((attribute.trim(), ""), |(k, v)| (k.trim(), v.trim()));
        match key.to_ascii_lowercase().as_str() {
            "domain" if !val.is_empty() => {
                let domain = val.trim_start_matches('.').to_ascii_lowercase();
                if host != domain && !host.ends_with(&format!(".{}", domain)) {
                    return None;
                }
                cookie.domain = domain;
                cookie.host_only = false;
            }
            "path" if val.starts_with('/') => cookie.path = val.to_string(),
            "secure" => cookie.secure = true,
            "max-age" => remove = val.parse::<i64>().map_or(false, |age| age <= 0),
            _ => {}
        }
    }
    Some((cookie, remove))
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

/// Returns the `name=value` pairs of the `Set-Cookie` headers in `headers`.
pub(crate) fn set_cookie_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}
