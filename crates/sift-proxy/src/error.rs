//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Certificate error.
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Connections did not drain in time.
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Certificate error type.
#[derive(Debug, Error)]
pub enum CertError {
    /// Failed to generate a certificate or key.
    #[error("Failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    /// Failed to read CA files.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA files.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA files.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// The root CA has not been loaded or generated yet.
    #[error("CA not initialized")]
    NotInitialized,

    /// Failed to build a TLS server config for a leaf certificate.
    #[error("Failed to build TLS config: {0}")]
    Tls(#[from] rustls::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
