//! Transport establishment.
//!
//! The pool asks a [`Connect`] implementation for a fresh transport whenever it
//! has no idle connection to hand out. [`HttpConnector`] is the default: it
//! resolves the host, opens TCP, tunnels through an HTTPS proxy with `CONNECT`
//! when one is configured, and finishes with a TLS handshake for `https`.

use crate::codec::HeadDecoder;
use crate::error::ConnectErrorKind;
use crate::pool::{PoolKey, Scheme};
use crate::tls::TlsConnector;
use crate::{Error, Result};
use base64::Engine;
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use http::HeaderMap;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

/// A bidirectional byte stream a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

/// A boxed transport.
pub type BoxedIo = Box<dyn Io>;

/// A freshly established transport, ready for HTTP/1.1.
pub struct Connected {
    pub(crate) io: BoxedIo,
    pub(crate) forward_proxy: Option<HeaderMap>,
}

impl Connected {
    /// Wraps a transport that talks to the origin directly.
    pub fn new(io: impl Io) -> Self {
        Self {
            io: Box::new(io),
            forward_proxy: None,
        }
    }

    /// Wraps a transport to a plain HTTP proxy. Requests are sent in absolute
    /// form and carry `proxy_headers`.
    pub fn via_proxy(io: impl Io, proxy_headers: HeaderMap) -> Self {
        Self {
            io: Box::new(io),
            forward_proxy: Some(proxy_headers),
        }
    }
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("via_proxy", &self.forward_proxy.is_some())
            .finish_non_exhaustive()
    }
}

/// Opens transports for pool keys.
///
/// Implement this to run the engine over something other than TCP, e.g. an
/// in-memory duplex in tests.
pub trait Connect: Send + Sync + 'static {
    /// Establishes a new transport to `key`.
    fn connect<'a>(&'a self, key: &'a PoolKey) -> BoxFuture<'a, Result<Connected>>;
}

/// A forward proxy.
#[derive(Clone)]
pub struct Proxy {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    headers: HeaderMap,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl Proxy {
    /// Creates a proxy at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            headers: HeaderMap::new(),
        }
    }

    /// Authenticates to the proxy with HTTP Basic credentials.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sends an extra header to the proxy.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Returns the proxy host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the proxy port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::ConfigurationError(
                "proxy host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(Error::ConfigurationError(
                "proxy port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }

    /// Headers every message to the proxy carries.
    pub(crate) fn request_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        if let Some((user, password)) = &self.credentials {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}")).map_err(|e| {
                Error::ConfigurationError(format!("Invalid proxy credentials: {}", e))
            })?;
            headers.insert(PROXY_AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

/// Which proxy, if any, each scheme goes through.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    http: Option<Proxy>,
    https: Option<Proxy>,
    no_proxy: Vec<String>,
}

impl ProxySettings {
    /// Sends every request through `proxy`.
    pub fn all(proxy: Proxy) -> Self {
        Self {
            http: Some(proxy.clone()),
            https: Some(proxy),
            no_proxy: Vec::new(),
        }
    }

    /// Sends `http` requests through `proxy`.
    pub fn http(mut self, proxy: Proxy) -> Self {
        self.http = Some(proxy);
        self
    }

    /// Sends `https` requests through `proxy` (as a `CONNECT` tunnel).
    pub fn https(mut self, proxy: Proxy) -> Self {
        self.https = Some(proxy);
        self
    }

    /// Bypasses the proxy for `host` and its subdomains.
    pub fn no_proxy(mut self, host: impl Into<String>) -> Self {
        self.no_proxy.push(host.into().to_ascii_lowercase());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.http.iter().chain(self.https.iter()).try_for_each(Proxy::validate)
    }

    pub(crate) fn for_key(&self, key: &PoolKey) -> Option<&Proxy> {
        let host = key.host();
        let bypass = self.no_proxy.iter().any(|pattern| {
            let pattern = pattern.trim_start_matches('.');
            host == pattern || host.ends_with(&format!(".{pattern}"))
        });
        if bypass {
            return None;
        }
        match key.scheme() {
            Scheme::Http => self.http.as_ref(),
            Scheme::Https => self.https.as_ref(),
        }
    }
}

/// The default connector: TCP, optional proxy, TLS for `https`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    proxies: ProxySettings,
    tls: TlsConnector,
}

impl HttpConnector {
    /// Creates a connector.
    pub fn new(proxies: ProxySettings, tls: TlsConnector) -> Self {
        Self { proxies, tls }
    }

    async fn establish(&self, key: &PoolKey) -> Result<Connected> {
        let url = key.to_string();
        let proxy = self.proxies.for_key(key);
        let (host, port) = match proxy {
            Some(proxy) => (proxy.host(), proxy.port()),
            None => (key.host(), key.port()),
        };

        let tcp = open_tcp(host, port, &url).await?;
        let mut io: BoxedIo = Box::new(tcp);

        match (key.scheme(), proxy) {
            (Scheme::Http, None) => Ok(Connected { io, forward_proxy: None }),
            (Scheme::Http, Some(proxy)) => {
                tracing::debug!(proxy = %proxy.host(), target = %url, "forwarding through proxy");
                Ok(Connected {
                    io,
                    forward_proxy: Some(proxy.request_headers()?),
                })
            }
            (Scheme::Https, proxy) => {
                if let Some(proxy) = proxy {
                    tracing::debug!(proxy = %proxy.host(), target = %url, "opening CONNECT tunnel");
                    tunnel(&mut io, key, proxy).await.map_err(|source| Error::Connection {
                        kind: ConnectErrorKind::Proxy,
                        url: url.clone(),
                        source,
                    })?;
                }
                let io = self
                    .tls
                    .handshake(key.host(), io)
                    .await
                    .map_err(|source| Error::Connection {
                        kind: ConnectErrorKind::Tls,
                        url,
                        source,
                    })?;
                Ok(Connected { io, forward_proxy: None })
            }
        }
    }
}

impl Connect for HttpConnector {
    fn connect<'a>(&'a self, key: &'a PoolKey) -> BoxFuture<'a, Result<Connected>> {
        Box::pin(self.establish(key))
    }
}

async fn open_tcp(host: &str, port: u16, url: &str) -> Result<TcpStream> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| Error::Connection {
            kind: ConnectErrorKind::Dns,
            url: url.to_string(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                // Nagle only delays small request heads.
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(Error::Connection {
        kind: last_error
            .as_ref()
            .map_or(ConnectErrorKind::Dns, |_| ConnectErrorKind::Tcp),
        url: url.to_string(),
        source: last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
        }),
    })
}

async fn tunnel(io: &mut BoxedIo, key: &PoolKey, proxy: &Proxy) -> io::Result<()> {
    let authority = format!("{}:{}", key.host(), key.port());
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    let headers = proxy
        .request_headers()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    for (name, value) in &headers {
        let value = value
            .to_str()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    io.write_all(head.as_bytes()).await?;
    io.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let mut decoder = HeadDecoder::default();
    loop {
        if let Some(response) = decoder
            .decode(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        {
            if response.status.is_success() {
                return Ok(());
            }
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("proxy answered CONNECT with {}", response.status),
            ));
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_proxy_selection_and_bypass() {
        let settings = ProxySettings::default()
            .https(Proxy::new("proxy.local", 3128))
            .no_proxy("internal.example.com");

        let external = PoolKey::new(Scheme::Https, "api.example.com", 443);
        assert_eq!(settings.for_key(&external).unwrap().port(), 3128);

        let internal = PoolKey::new(Scheme::Https, "svc.internal.example.com", 443);
        assert!(settings.for_key(&internal).is_none());

        let plain = PoolKey::new(Scheme::Http, "api.example.com", 80);
        assert!(settings.for_key(&plain).is_none());
    }

    #[test]
    fn test_proxy_validation() {
        assert!(ProxySettings::all(Proxy::new("proxy.local", 0))
            .validate()
            .is_err());
        assert!(ProxySettings::all(Proxy::new("", 8080)).validate().is_err());
        assert!(ProxySettings::all(Proxy::new("proxy.local", 8080))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_proxy_basic_credentials() {
        let proxy = Proxy::new("proxy.local", 8080).basic_auth("user", "pass");
        let headers = proxy.request_headers().unwrap();
        assert_eq!(headers.get(PROXY_AUTHORIZATION).unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_connect_tunnel_handshake() {
        let (client, mut server) = duplex(4096);
        let mut io: BoxedIo = Box::new(client);
        let key = PoolKey::new(Scheme::Https, "api.example.com", 443);
        let proxy = Proxy::new("proxy.local", 3128).basic_auth("user", "pass");

        let server_task = tokio::spawn(async move {
            let mut received = vec![0u8; 1024];
            let n = server.read(&mut received).await.unwrap();
            let text = String::from_utf8_lossy(&received[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            text
        });

        tunnel(&mut io, &key, &proxy).await.unwrap();
        let request = server_task.await.unwrap();
        assert!(request.starts_with("CONNECT api.example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("proxy-authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_connect_tunnel_refused() {
        let (client, mut server) = duplex(4096);
        let mut io: BoxedIo = Box::new(client);
        let key = PoolKey::new(Scheme::Https, "api.example.com", 443);

        tokio::spawn(async move {
            let mut received = vec![0u8; 1024];
            let _ = server.read(&mut received).await;
            let _ = server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let err = tunnel(&mut io, &key, &Proxy::new("proxy.local", 3128))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("407"));
    }
}
