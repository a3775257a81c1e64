use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::{AppError, AppResult};

/// Builds a TLS acceptor from a PEM certificate chain and a PEM private key.
pub fn load_tls_acceptor(cert_file: &str, key_file: &str) -> AppResult<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(AppError::InvalidConfig(format!(
            "no certificate found in {}",
            cert_file
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or_else(|| AppError::InvalidConfig(format!("no private key found in {}", key_file)))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}
