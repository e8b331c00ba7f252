//! TLS support for the SMTP listener

use mailsink_common::{Error, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load a PEM keypair and build the STARTTLS acceptor.
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Config(format!("open certificate file: {}", e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(Error::Config(
            "no certificates found in certificate file".to_string(),
        ));
    }

    let key_file =
        File::open(key_path).map_err(|e| Error::Config(format!("open key file: {}", e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| Error::Config(format!("read private key: {}", e)))?
        .ok_or_else(|| Error::Config("no private key found in key file".to_string()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("build TLS config: {}", e)))?;

    info!(cert = %cert_path.display(), "TLS keypair loaded, STARTTLS enabled");

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
