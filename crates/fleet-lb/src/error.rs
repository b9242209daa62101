//! Error types for the load balancer.

use std::path::PathBuf;

use thiserror::Error;

pub type LbResult<T> = Result<T, LbError>;

#[derive(Debug, Error)]
pub enum LbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read {path}: {source}")]
    ReadPem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("forward to {target} failed: {reason}")]
    Forward { target: String, reason: String },
}
