//! Rustls setup for the distribution server. Clients (fetchers and operator
//! consoles) authenticate with certificates issued by the fleet CA.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::{ring::default_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::{certs, private_key};

use crate::error::{HubError, Result};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| HubError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let chain: Vec<CertificateDer> = certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| HubError::Tls(format!("cannot parse {}: {}", path.display(), e)))?;
    if chain.is_empty() {
        return Err(HubError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| HubError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| HubError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| HubError::Tls(format!("no private key in {}", path.display())))
}

/// Server TLS with mandatory client-certificate authentication against
/// `client_ca`.
pub async fn server_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: &Path,
) -> Result<RustlsConfig> {
    // rustls 0.23 requires a process-wide provider before config building.
    let _ = CryptoProvider::install_default(default_provider());

    let cert_chain = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(client_ca_path)? {
        roots
            .add(ca)
            .map_err(|e| HubError::Tls(format!("bad client CA certificate: {}", e)))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| HubError::Tls(format!("cannot build client verifier: {}", e)))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| HubError::Tls(format!("cannot build TLS config: {}", e)))?;

    Ok(RustlsConfig::from_config(Arc::new(config)))
}
