//! TLS error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Key decode error: {0}")]
    KeyDecode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("No certificate available for {0:?}")]
    NoCertificate(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TlsError {
    /// Prefix the message with the operation that failed, keeping the variant
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            TlsError::Config(m) => TlsError::Config(format!("{ctx}: {m}")),
            TlsError::Acme(m) => TlsError::Acme(format!("{ctx}: {m}")),
            TlsError::CertificateError(m) => TlsError::CertificateError(format!("{ctx}: {m}")),
            TlsError::KeyDecode(m) => TlsError::KeyDecode(format!("{ctx}: {m}")),
            TlsError::Storage(m) => TlsError::Storage(format!("{ctx}: {m}")),
            TlsError::Cache(m) => TlsError::Cache(format!("{ctx}: {m}")),
            TlsError::Timeout(m) => TlsError::Timeout(format!("{ctx}: {m}")),
            other => other,
        }
    }
}
