//! TLS for the cloud link.
//!
//! The relay's certificate is checked against configured trust anchors. A
//! client identity is optional and only sent when the relay asks for it.
//! The acceptor and certificate generators exist for relays and tests that
//! terminate the other side.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{BridgeError, Result};

/// Client-side TLS material, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Trust anchors for the relay certificate.
    pub ca_cert_pem: String,
    /// Client certificate chain, for relays requiring mutual TLS.
    #[serde(default)]
    pub client_cert_pem: Option<String>,
    /// Key for `client_cert_pem`.
    #[serde(default)]
    pub client_key_pem: Option<String>,
    /// Name to verify instead of the configured host.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Trust-only configuration.
    pub fn new(ca_cert_pem: impl Into<String>) -> Self {
        Self {
            ca_cert_pem: ca_cert_pem.into(),
            client_cert_pem: None,
            client_key_pem: None,
            server_name: None,
        }
    }

    /// Adds a client identity.
    pub fn with_client_identity(
        mut self,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        self.client_cert_pem = Some(cert_pem.into());
        self.client_key_pem = Some(key_pem.into());
        self
    }

    /// Checks that the PEM material parses.
    pub fn validate(&self) -> Result<()> {
        load_certs_from_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| BridgeError::config(format!("tls.ca_cert_pem: {}", e)))?;
        match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(cert), Some(key)) => {
                load_certs_from_pem(cert.as_bytes())
                    .map_err(|e| BridgeError::config(format!("tls.client_cert_pem: {}", e)))?;
                load_private_key_from_pem(key.as_bytes())
                    .map_err(|e| BridgeError::config(format!("tls.client_key_pem: {}", e)))?;
                Ok(())
            }
            (None, None) => Ok(()),
            _ => Err(BridgeError::config(
                "tls client certificate and key must be given together",
            )),
        }
    }
}

/// Client-side TLS connector.
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsConnector {
    /// Builds a connector from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut root_store = rustls::RootCertStore::empty();
        for cert in load_certs_from_pem(config.ca_cert_pem.as_bytes())? {
            root_store.add(cert).map_err(|e| BridgeError::Tls {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
        let client_config = match (&config.client_cert_pem, &config.client_key_pem) {
            (Some(cert), Some(key)) => {
                let certs = load_certs_from_pem(cert.as_bytes())?;
                let key = load_private_key_from_pem(key.as_bytes())?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| BridgeError::Tls {
                        reason: format!("failed to create client config: {}", e),
                    })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
            server_name: config.server_name.clone(),
        })
    }

    /// Runs the client handshake over `stream`.
    ///
    /// `host` is verified unless the configuration overrides the name.
    pub async fn connect<IO>(
        &self,
        host: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.server_name.as_deref().unwrap_or(host);
        let domain = if let Ok(ip) = name.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(name.to_string()).map_err(|e| BridgeError::Tls {
                reason: format!("invalid server name {}: {}", name, e),
            })?
        };
        self.inner
            .connect(domain, stream)
            .await
            .map_err(|e| BridgeError::Tls {
                reason: e.to_string(),
            })
    }
}

/// Server-side TLS acceptor.
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Builds an acceptor presenting `cert_chain_pem` without client auth.
    pub fn new(cert_chain_pem: &str, private_key_pem: &str) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(cert_chain_pem.as_bytes())?;
        let key = load_private_key_from_pem(private_key_pem.as_bytes())?;

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| BridgeError::Tls {
                reason: format!("failed to set server cert: {}", e),
            })?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Runs the server handshake over `stream`.
    pub async fn accept<IO>(&self, stream: IO) -> Result<tokio_rustls::server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner.accept(stream).await.map_err(|e| BridgeError::Tls {
            reason: e.to_string(),
        })
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cursor)
        .filter_map(|c| c.ok())
        .collect();

    if certs.is_empty() {
        return Err(BridgeError::Tls {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads a PKCS#8, PKCS#1 or SEC1 private key from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(BridgeError::Tls {
            reason: "no private key found in PEM".to_string(),
        }),
        Err(e) => Err(BridgeError::Tls {
            reason: format!("invalid private key PEM: {}", e),
        }),
    }
}

/// Generates a self-signed CA. Returns (certificate PEM, key PEM).
pub fn generate_self_signed_ca() -> Result<(String, String)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| BridgeError::Tls {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let cert = params.self_signed(&key_pair).map_err(|e| BridgeError::Tls {
        reason: format!("failed to create CA certificate: {}", e),
    })?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Generates a leaf certificate for `names` signed by the given CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    names: &[&str],
) -> Result<(String, String)> {
    let tls_err = |what: &str, e: rcgen::Error| BridgeError::Tls {
        reason: format!("{}: {}", what, e),
    };

    let ca_key =
        rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| tls_err("failed to parse CA key", e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| tls_err("failed to parse CA certificate", e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate key", e))?;
    let params = rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
        .map_err(|e| tls_err("failed to create certificate params", e))?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign certificate", e))?;

    Ok((cert.pem(), key.serialize_pem()))
}
