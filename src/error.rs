use thiserror::Error;

use crate::config::ConfigError;
use crate::network::tls::TlsError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("Node key error: {0}")]
    NodeKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
