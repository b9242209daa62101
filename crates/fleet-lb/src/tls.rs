//! TLS termination at the load balancer.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use fleet_core::TlsCredential;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{LbError, LbResult};

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn load_tls_acceptor(credential: &TlsCredential) -> LbResult<TlsAcceptor> {
    let certs = read_certs(&credential.certfile)?;
    let key = read_key(&credential.keyfile)?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    debug!(certfile = %credential.certfile.display(), "TLS termination enabled");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> LbResult<BufReader<std::fs::File>> {
    let file = std::fs::File::open(path).map_err(|source| LbError::ReadPem {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn read_certs(path: &Path) -> LbResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| LbError::ReadPem {
            path: path.to_path_buf(),
            source,
        })
}

fn read_key(path: &Path) -> LbResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| LbError::ReadPem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| LbError::NoPrivateKey(path.to_path_buf()))
}
