//! TLS for the implicit-TLS listener variants.
//!
//! Certificates are loaded from the configured PEM paths. When either
//! file is missing at startup, a self-signed certificate is generated
//! (RSA 2048, SAN `DNS:localhost, IP:127.0.0.1`, 365-day validity) and
//! written to those paths. Minimum protocol version is TLS 1.2.

use crate::error::{MailError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);

        let certs = certs(&mut cert_reader)
            .map_err(|e| MailError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(MailError::Tls("No certificates found in file".to_string()));
        }

        debug!("Loaded {} certificate(s)", certs.len());

        let private_key = Self::load_private_key(key_path.as_ref())?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| MailError::Tls(format!("Failed to create TLS config: {}", e)))?;

        info!("TLS configuration created successfully");

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Load the configured certificate, generating a self-signed one
    /// first when either file is missing.
    pub fn load_or_generate<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if !cert_path.exists() || !key_path.exists() {
            info!(
                "TLS material missing, generating self-signed certificate at {:?}",
                cert_path
            );
            generate_self_signed_cert("localhost", cert_path, key_path)?;
        }

        Self::from_pem_files(cert_path, key_path)
    }

    fn load_private_key(key_path: &Path) -> Result<Vec<u8>> {
        let key_file = File::open(key_path)
            .map_err(|e| MailError::Tls(format!("Failed to open key file: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);

        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| MailError::Tls(format!("Failed to read private keys: {}", e)))?;

        if keys.is_empty() {
            // Retry as PKCS#1 ("BEGIN RSA PRIVATE KEY")
            let key_file = File::open(key_path)
                .map_err(|e| MailError::Tls(format!("Failed to open key file: {}", e)))?;
            let mut key_reader = BufReader::new(key_file);
            keys = rsa_private_keys(&mut key_reader)
                .map_err(|e| MailError::Tls(format!("Failed to read private keys: {}", e)))?;
        }

        if keys.is_empty() {
            return Err(MailError::Tls("No private key found in file".to_string()));
        }

        Ok(keys.remove(0))
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    /// TLS acceptor for wrapping accepted sockets.
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Generate a self-signed certificate and private key.
///
/// RSA 2048, SAN `DNS:<domain>, IP:127.0.0.1`, valid 365 days. Parent
/// directories are created as needed.
pub fn generate_self_signed_cert(
    domain: &str,
    cert_output: &Path,
    key_output: &Path,
) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName, KeyPair, SanType};
    use rsa::pkcs8::EncodePrivateKey;

    info!("Generating self-signed certificate for {}", domain);

    let mut rng = rand::rngs::OsRng;
    let rsa_key = rsa::RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| MailError::Tls(format!("Failed to generate RSA key: {}", e)))?;
    let key_der = rsa_key
        .to_pkcs8_der()
        .map_err(|e| MailError::Tls(format!("Failed to encode RSA key: {}", e)))?;
    let key_pair = KeyPair::from_der(key_der.as_bytes())
        .map_err(|e| MailError::Tls(format!("Failed to load RSA key pair: {}", e)))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        SanType::DnsName(domain.to_string()),
        SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
    ];
    params.alg = &rcgen::PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("Failed to generate certificate: {}", e)))?;

    for path in [cert_output, key_output] {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MailError::Tls(format!("Failed to create cert dir: {}", e)))?;
            }
        }
    }

    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;
    std::fs::write(cert_output, cert_pem)
        .map_err(|e| MailError::Tls(format!("Failed to write certificate: {}", e)))?;

    std::fs::write(key_output, cert.serialize_private_key_pem())
        .map_err(|e| MailError::Tls(format!("Failed to write private key: {}", e)))?;

    info!(
        "Self-signed certificate generated: {} and {}",
        cert_output.display(),
        key_output.display()
    );

    Ok(())
}
