//! Pluggable transport for platform RPC channels.
//!
//! Callers ask a [`ConnectionFactory`] for a channel to `host:port` and get
//! back an [`RpcChannel`] without knowing how it was built:
//! - `DirectFactory`: TCP, wrapped in TLS for remote hosts
//! - `TunneledFactory`: HTTP CONNECT through a proxy, then TLS to the target
//!
//! The strategy is chosen once at startup by [`select_factory`] and is
//! immutable afterwards.

mod error;
mod proxy;
mod tls;
mod tunnel;

pub(crate) use error::TransportError;
pub(crate) use proxy::{format_authority, ProxyEndpoint, PROXY_ENV_VARS};
pub(crate) use tunnel::{TunnelStream, TunnelTarget};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, info, warn};

/// Hosts whose traffic never leaves the machine and is never tunneled.
const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "::1"];

/// Byte stream a channel runs over.
pub(crate) trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelIo for T {}

/// How a channel reached its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// Plain TCP to a loopback address.
    Loopback,
    /// TLS straight to the target.
    Direct,
    /// TLS inside a CONNECT tunnel through the named proxy.
    Tunneled { proxy: String },
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Direct => write!(f, "direct"),
            Self::Tunneled { proxy } => write!(f, "tunneled via {proxy}"),
        }
    }
}

/// An established channel, ready for the RPC protocol layer.
pub(crate) struct RpcChannel {
    io: Box<dyn ChannelIo>,
    alpn: Option<Vec<u8>>,
    route: Route,
}

impl RpcChannel {
    fn new(io: Box<dyn ChannelIo>, alpn: Option<Vec<u8>>, route: Route) -> Self {
        Self { io, alpn, route }
    }

    /// The ALPN protocol the peer selected, if TLS was used.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Hands the stream to the protocol layer.
    pub fn into_io(self) -> Box<dyn ChannelIo> {
        self.io
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

/// Trait for strategies that open RPC channels.
#[async_trait]
pub(crate) trait ConnectionFactory: Send + Sync {
    /// Returns the strategy name for display.
    fn name(&self) -> &'static str;

    /// Opens a channel to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<RpcChannel, TransportError>;
}

/// Transport settings resolved from config and environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransportSettings {
    /// Forward proxy; `None` means connect directly.
    pub proxy: Option<ProxyEndpoint>,
    /// Skip server certificate validation on TLS channels.
    pub insecure_skip_verify: bool,
}

/// Picks the transport strategy for this process.
pub(crate) fn select_factory(
    settings: &TransportSettings,
) -> Result<Arc<dyn ConnectionFactory>, TransportError> {
    if settings.insecure_skip_verify {
        warn!("TLS certificate validation is disabled for platform channels");
    }
    let tls = tls::client_config(settings.insecure_skip_verify)?;
    let direct = DirectFactory::new(tls.clone());

    match &settings.proxy {
        Some(proxy) => {
            info!("Tunnel enabled via {}", proxy);
            Ok(Arc::new(TunneledFactory::new(
                direct,
                Arc::new(HttpConnectOpener::new(proxy.clone())),
                tls,
            )))
        }
        None => Ok(Arc::new(direct)),
    }
}

/// Returns true for targets that are always reached without the proxy.
pub(crate) fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    LOOPBACK_HOSTS.contains(&host)
}

/// Connects straight to the target.
#[derive(Clone)]
pub(crate) struct DirectFactory {
    tls: Arc<ClientConfig>,
}

impl DirectFactory {
    pub fn new(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }
}

#[async_trait]
impl ConnectionFactory for DirectFactory {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn connect(&self, host: &str, port: u16) -> Result<RpcChannel, TransportError> {
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let addr = proxy::format_authority(bare_host, port);
        let socket = tokio::time::timeout(tunnel::CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::connect_timeout(&addr, tunnel::CONNECT_TIMEOUT))??;
        socket.set_nodelay(true)?;

        if is_loopback(host) {
            debug!("Opened loopback channel to {}", addr);
            return Ok(RpcChannel::new(Box::new(socket), None, Route::Loopback));
        }

        let stream = tls::handshake(self.tls.clone(), host, socket).await?;
        let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        debug!("Opened direct TLS channel to {}", addr);
        Ok(RpcChannel::new(Box::new(stream), alpn, Route::Direct))
    }
}

/// Trait for the step that turns a target into a tunneled byte stream.
#[async_trait]
pub(crate) trait TunnelOpener: Send + Sync {
    /// Describes where tunnels go, for logs and channel routes.
    fn describe(&self) -> String;

    /// Opens a raw tunnel to `target`.
    async fn open(&self, target: &TunnelTarget) -> Result<TunnelStream, TransportError>;
}

/// Opens tunnels with HTTP CONNECT.
pub(crate) struct HttpConnectOpener {
    proxy: ProxyEndpoint,
}

impl HttpConnectOpener {
    pub fn new(proxy: ProxyEndpoint) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl TunnelOpener for HttpConnectOpener {
    fn describe(&self) -> String {
        self.proxy.to_string()
    }

    async fn open(&self, target: &TunnelTarget) -> Result<TunnelStream, TransportError> {
        tunnel::open(target, &self.proxy).await
    }
}

/// Sends remote traffic through a tunnel; loopback goes direct.
pub(crate) struct TunneledFactory {
    direct: DirectFactory,
    opener: Arc<dyn TunnelOpener>,
    tls: Arc<ClientConfig>,
}

impl TunneledFactory {
    pub fn new(
        direct: DirectFactory,
        opener: Arc<dyn TunnelOpener>,
        tls: Arc<ClientConfig>,
    ) -> Self {
        Self {
            direct,
            opener,
            tls,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TunneledFactory {
    fn name(&self) -> &'static str {
        "tunneled"
    }

    async fn connect(&self, host: &str, port: u16) -> Result<RpcChannel, TransportError> {
        if is_loopback(host) {
            return self.direct.connect(host, port).await;
        }

        let target = TunnelTarget::new(host, port);
        let tunnel = self.opener.open(&target).await?;

        // SNI names the target; the proxy only relays bytes.
        let stream = tls::handshake(self.tls.clone(), host, tunnel).await?;
        let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        debug!("Opened tunneled TLS channel to {}", target.authority());

        Ok(RpcChannel::new(
            Box::new(stream),
            alpn,
            Route::Tunneled {
                proxy: self.opener.describe(),
            },
        ))
    }
}

/// A factory whose proxy refuses every tunnel.
#[cfg(test)]
pub(crate) struct RefusingFactory;

#[cfg(test)]
#[async_trait]
impl ConnectionFactory for RefusingFactory {
    fn name(&self) -> &'static str {
        "refusing"
    }

    async fn connect(&self, _host: &str, _port: u16) -> Result<RpcChannel, TransportError> {
        Err(TransportError::proxy_connect(
            "CONNECT failed: HTTP/1.1 403 Forbidden",
        ))
    }
}
