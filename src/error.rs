//! Error types shared by the proxy components

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while classifying, resolving or tunneling a query,
/// and the fatal startup failures of the listeners.
#[derive(Debug, Error)]
pub enum Error {
    /// The domain allow-list could not be turned into a matcher
    #[error("failed to compile domain filter: {0}")]
    FilterCompile(String),

    /// Exchange with an upstream resolver failed or timed out
    #[error("upstream exchange with {addr} failed: {reason}")]
    Upstream { addr: SocketAddr, reason: String },

    /// A DNS message could not be packed to wire format
    #[error("failed to encode DNS message: {0}")]
    Encode(String),

    /// Bytes could not be unpacked into a DNS message
    #[error("failed to decode DNS message: {0}")]
    Decode(String),

    /// Tunnel call failed
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// A listener could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The tunnel server could not be reached
    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// TLS material could not be loaded or assembled
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn upstream(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Upstream {
            addr,
            reason: reason.into(),
        }
    }
}

/// Failures of the tunnel transport itself
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel connection is gone; no more calls can be served
    #[error("tunnel connection closed")]
    Closed,

    /// The server answered the call with an error
    #[error("remote error: {0}")]
    Remote(String),

    /// A frame could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on the tunnel stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
