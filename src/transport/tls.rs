//! # TLS Configuration
//!
//! rustls server and client configuration loaded from PEM files.
//!
//! The server side presents a certificate chain and can optionally verify client
//! certificates against a CA bundle (mTLS). The client side trusts either a CA
//! bundle, the platform root store, or (for development) any certificate.
//!
//! Streams are wrapped by [`Acceptor`](super::Acceptor) and [`Connector`](super::Connector).

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::Item;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
    /// CA bundle used to verify client certificates
    client_ca_path: Option<PathBuf>,
    require_client_auth: bool,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
            client_ca_path: None,
            require_client_auth: false,
        }
    }

    /// Verify client certificates against `client_ca_path` and reject clients without one.
    pub fn with_client_auth<P: AsRef<Path>>(mut self, client_ca_path: P) -> Self {
        self.client_ca_path = Some(client_ca_path.as_ref().to_path_buf());
        self.require_client_auth = true;
        self
    }

    /// Whether clients without a certificate are turned away (only meaningful with a CA)
    pub fn require_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    /// Write a self-signed `localhost` certificate and key, for development and tests.
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        File::create(&cert_path)?.write_all(cert.cert.pem().as_bytes())?;
        File::create(&key_path)?.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;

        let builder = ServerConfig::builder().with_safe_defaults();
        let builder = match &self.client_ca_path {
            Some(ca_path) => {
                let roots = load_root_store(ca_path)?;
                if self.require_client_auth {
                    debug!("mTLS enabled, client certificates required");
                    builder.with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
                } else {
                    debug!("mTLS enabled, client certificates optional");
                    builder.with_client_cert_verifier(Arc::new(
                        AllowAnyAnonymousOrAuthenticatedClient::new(roots),
                    ))
                }
            }
            None => builder.with_no_client_auth(),
        };

        builder
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    /// CA bundle to trust instead of the platform roots
    ca_path: Option<PathBuf>,
    insecure: bool,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            ca_path: None,
            insecure: false,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Trust only the certificates in `ca_path`.
    pub fn with_ca_file<P: AsRef<Path>>(mut self, ca_path: P) -> Self {
        self.ca_path = Some(ca_path.as_ref().to_path_buf());
        self
    }

    /// Present a client certificate (mTLS).
    pub fn with_client_certificate<P: AsRef<Path>>(mut self, cert_path: P, key_path: P) -> Self {
        self.client_cert_path = Some(cert_path.as_ref().to_path_buf());
        self.client_key_path = Some(key_path.as_ref().to_path_buf());
        self
    }

    /// Accept any server certificate. Development only.
    pub fn insecure(mut self) -> Self {
        warn!("TLS certificate verification disabled");
        self.insecure = true;
        self
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let client_auth = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                Some((load_certs(cert_path)?, load_private_key(key_path)?))
            }
            _ => None,
        };

        let builder = ClientConfig::builder().with_safe_defaults();

        // The two verifier paths produce different builder states, so client auth is applied per branch.
        if self.insecure {
            let builder = builder.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
            match client_auth {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))),
                None => Ok(builder.with_no_client_auth()),
            }
        } else {
            let roots = match &self.ca_path {
                Some(ca_path) => load_root_store(ca_path)?,
                None => native_root_store()?,
            };
            let builder = builder.with_root_certificates(roots);
            match client_auth {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))),
                None => Ok(builder.with_no_client_auth()),
            }
        }
    }

    /// Name used for SNI and certificate verification
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError(format!("Invalid server name: {}", self.server_name)))
    }
}

struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .map_err(|_| ProtocolError::TlsError(format!("Failed to parse certificates in {}", path.display())))?;
    if certs.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// First PKCS#8, RSA or SEC1 key in the file
fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let items = rustls_pemfile::read_all(&mut open(path)?)
        .map_err(|_| ProtocolError::TlsError(format!("Failed to parse private key in {}", path.display())))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| ProtocolError::TlsError(format!("No private key found in {}", path.display())))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(&cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add CA certificate: {e}")))?;
    }
    Ok(store)
}

fn native_root_store() -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs()
        .map_err(|e| ProtocolError::TlsError(format!("Failed to load native certs: {e}")))?;
    for cert in native_certs {
        // Platform stores routinely carry a few certificates webpki cannot parse.
        if let Err(e) = store.add(&Certificate(cert.0)) {
            debug!(error = %e, "Skipping unparsable native certificate");
        }
    }
    Ok(store)
}
