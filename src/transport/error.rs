//! Domain-specific error types for the transport layer.
//!
//! Typed errors let the channel factory and its callers tell a refused
//! CONNECT apart from a bad proxy URL or a failed TLS handshake.

use std::time::Duration;

/// Errors that can occur while opening a channel to a remote endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The proxy was unreachable, hung up mid-handshake, or refused the CONNECT.
    #[error("Proxy CONNECT failed: {message}")]
    ProxyConnect { message: String },

    /// The proxy URL could not be turned into an endpoint.
    #[error("Invalid proxy URL '{url}': {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    /// Connecting to a host took longer than allowed.
    #[error("Connection to {addr} timed out after {timeout_secs} seconds")]
    ConnectTimeout { addr: String, timeout_secs: u64 },

    /// TLS setup or handshake failed.
    #[error("TLS handshake with {host} failed: {message}")]
    Tls { host: String, message: String },

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Creates a `ProxyConnect` error.
    pub fn proxy_connect(message: impl Into<String>) -> Self {
        Self::ProxyConnect {
            message: message.into(),
        }
    }

    /// Creates an `InvalidProxyUrl` error.
    pub fn invalid_proxy_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProxyUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ConnectTimeout` error from a `Duration`.
    pub fn connect_timeout(addr: impl Into<String>, timeout: Duration) -> Self {
        Self::ConnectTimeout {
            addr: addr.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Creates a `Tls` error.
    pub fn tls(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tls {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Returns true if the proxy refused or broke the CONNECT handshake.
    pub fn is_proxy_connect(&self) -> bool {
        matches!(self, Self::ProxyConnect { .. })
    }

    /// Returns true if this is a connect timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. })
    }
}
