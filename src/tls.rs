//! TLS client configuration for the streaming channel.
//!
//! By default `wss://` connections use the platform trust roots.  When
//! `ca_file` is configured (self-hosted chat servers), a dedicated rustls
//! config trusting exactly that CA bundle is built and handed to
//! tokio-tungstenite's `Connector::Rustls`; the polling client gets the same
//! certificates as extra roots.

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;

use crate::config::LinkConfig;
use crate::error::{ChatError, Result};

/// Read every certificate from a PEM bundle.
pub fn load_ca_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .map_err(|e| ChatError::Config(format!("cannot read CA file {}: {e}", path.display())))?;
    let found: Vec<CertificateDer<'static>> = certs(&mut Cursor::new(pem))
        .collect::<std::io::Result<Vec<_>>>()?;
    if found.is_empty() {
        return Err(ChatError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(found)
}

/// The process-wide provider if one is installed, otherwise the
/// post-quantum provider.
fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls_post_quantum::provider()))
}

/// Build a `rustls::ClientConfig` trusting `cfg.ca_file`.  Returns `None`
/// when no CA file is configured.
pub fn build_tls_config(cfg: &LinkConfig) -> Result<Option<Arc<ClientConfig>>> {
    let Some(ca_file) = &cfg.ca_file else { return Ok(None) };

    let mut root_store = RootCertStore::empty();
    for cert in load_ca_certs(ca_file)? {
        root_store.add(cert)?;
    }

    let tls_config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(ChatError::Tls)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Some(Arc::new(tls_config)))
}
