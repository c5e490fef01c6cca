//! TLS context construction.
//!
//! [`TlsSettings`] describes what the client wants (verification, client
//! identity, extra roots, cipher suites). A [`TlsContextFactory`] turns the
//! settings into a [`TlsConnector`]; the default [`RustlsFactory`] builds a
//! rustls client config trusting the webpki roots.

use crate::connect::BoxedIo;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// TLS options for HTTPS connections.
///
/// # Examples
///
/// ```
/// use spindle::TlsSettings;
///
/// let settings = TlsSettings::default()
///     .ca_bundle("/etc/ssl/internal-ca.pem")
///     .client_identity("/etc/ssl/client.pem", "/etc/ssl/client.key");
/// ```
#[derive(Debug, Clone)]
pub struct TlsSettings {
    verify: bool,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
    ca_bundle: Option<PathBuf>,
    ciphers: Vec<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify: true,
            client_cert: None,
            client_key: None,
            ca_bundle: None,
            ciphers: Vec::new(),
        }
    }
}

impl TlsSettings {
    /// Turns certificate verification on or off. Off accepts any certificate.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Presents a client certificate chain and key (both PEM) during the handshake.
    pub fn client_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    /// Trusts the certificates of a PEM bundle in addition to the webpki roots.
    pub fn ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    /// Restricts the cipher suites to the given IANA names, e.g.
    /// `TLS13_AES_256_GCM_SHA384`.
    pub fn ciphers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ciphers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Returns whether certificates are verified.
    pub fn verifies(&self) -> bool {
        self.verify
    }
}

/// Builds the TLS connector used for HTTPS connections.
pub trait TlsContextFactory: Send + Sync {
    /// Builds a connector from the client's settings.
    fn build(&self, settings: &TlsSettings) -> Result<TlsConnector>;
}

/// A ready-to-use TLS client context.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Wraps an existing rustls client config.
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsConnector::from(config),
        }
    }

    pub(crate) async fn handshake(&self, host: &str, io: BoxedIo) -> std::io::Result<BoxedIo> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let stream = self.inner.connect(name, io).await?;
        Ok(Box::new(stream))
    }
}

/// The default factory, backed by rustls with the ring provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustlsFactory;

impl TlsContextFactory for RustlsFactory {
    fn build(&self, settings: &TlsSettings) -> Result<TlsConnector> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !settings.ciphers.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                settings.ciphers.iter().any(|wanted| wanted == &name)
            });
            if provider.cipher_suites.is_empty() {
                return Err(tls_error(format!(
                    "none of the cipher suites {:?} are supported",
                    settings.ciphers
                )));
            }
        }
        let provider = Arc::new(provider);

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error(e.to_string()))?;

        let builder = if settings.verify {
            builder.with_root_certificates(root_store(settings)?)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
        };

        let config = match (&settings.client_cert, &settings.client_key) {
            (Some(cert), Some(key)) => {
                let chain = CertificateDer::pem_file_iter(cert)
                    .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
                    .map_err(|e| tls_error(format!("reading {}: {e}", cert.display())))?;
                if chain.is_empty() {
                    return Err(tls_error(format!("no certificates in {}", cert.display())));
                }
                let key = PrivateKeyDer::from_pem_file(key)
                    .map_err(|e| tls_error(format!("reading {}: {e}", key.display())))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| tls_error(e.to_string()))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(tls_error(
                    "client certificate and key must be configured together",
                ))
            }
        };

        Ok(TlsConnector::from_config(Arc::new(config)))
    }
}

fn root_store(settings: &TlsSettings) -> Result<RootCertStore> {
    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(bundle) = &settings.ca_bundle {
        let certs = CertificateDer::pem_file_iter(bundle)
            .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| tls_error(format!("reading {}: {e}", bundle.display())))?;
        let (added, _ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(tls_error(format!(
                "no usable certificates in {}",
                bundle.display()
            )));
        }
    }
    Ok(roots)
}

fn tls_error(message: impl fmt::Display) -> Error {
    Error::ConfigurationError(format!("TLS: {message}"))
}

#[derive(Debug)]
struct NoVerifier(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
