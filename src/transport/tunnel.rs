//! HTTP CONNECT tunnel through a forward proxy.
//!
//! After a `200` reply the proxy relays raw bytes to the target, so the
//! returned stream can carry a TLS session addressed to the target host.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::proxy::{format_authority, ProxyEndpoint};
use super::TransportError;

/// Upper bound on connecting to a host, and on a proxy's CONNECT reply.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxies answer CONNECT with a handful of headers; anything bigger is refused.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// The real destination behind the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }
}

/// A socket that has completed the CONNECT handshake.
///
/// The buffered reader keeps any bytes the proxy sent past the header
/// terminator; writes go straight to the socket.
pub type TunnelStream = BufReader<TcpStream>;

/// Opens a tunnel to `target` through `proxy` with the default connect timeout.
pub async fn open(
    target: &TunnelTarget,
    proxy: &ProxyEndpoint,
) -> Result<TunnelStream, TransportError> {
    open_with_timeout(target, proxy, CONNECT_TIMEOUT).await
}

/// Opens a tunnel, bounding both the proxy connect and its CONNECT reply
/// by `timeout`.
pub async fn open_with_timeout(
    target: &TunnelTarget,
    proxy: &ProxyEndpoint,
    timeout: Duration,
) -> Result<TunnelStream, TransportError> {
    let proxy_addr = proxy.addr();
    debug!("Connecting to proxy {} for {}", proxy_addr, target.authority());

    let cannot_reach = |reason: String| {
        TransportError::proxy_connect(format!("cannot reach {proxy_addr}: {reason}"))
    };
    let socket = tokio::time::timeout(timeout, TcpStream::connect(&proxy_addr))
        .await
        .map_err(|_| cannot_reach(format!("timed out after {}s", timeout.as_secs())))?
        .map_err(|e| cannot_reach(e.to_string()))?;
    socket
        .set_nodelay(true)
        .map_err(|e| cannot_reach(e.to_string()))?;

    let mut stream = BufReader::new(socket);
    let head = tokio::time::timeout(timeout, exchange_connect(&mut stream, target, proxy))
        .await
        .map_err(|_| {
            TransportError::proxy_connect(format!(
                "no reply to CONNECT within {}s",
                timeout.as_secs()
            ))
        })??;
    let status_line = head.lines().next().unwrap_or_default().trim().to_string();

    if !is_success_status(&status_line) {
        // Dropping the stream closes the socket.
        return Err(TransportError::proxy_connect(format!(
            "CONNECT failed: {status_line}"
        )));
    }

    debug!("Tunnel established to {}", target.authority());
    Ok(stream)
}

/// Sends CONNECT and returns the proxy's response head.
async fn exchange_connect(
    stream: &mut TunnelStream,
    target: &TunnelTarget,
    proxy: &ProxyEndpoint,
) -> Result<String, TransportError> {
    stream
        .get_mut()
        .write_all(connect_request(target, proxy).as_bytes())
        .await
        .map_err(|e| TransportError::proxy_connect(format!("failed to send CONNECT: {e}")))?;
    read_response_head(stream).await
}

/// Builds the CONNECT request, including Basic auth when configured.
fn connect_request(target: &TunnelTarget, proxy: &ProxyEndpoint) -> String {
    let authority = target.authority();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(token) = proxy.basic_auth() {
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Reads through the blank line that ends the proxy's response headers,
/// never buffering more than `MAX_RESPONSE_HEAD` bytes.
async fn read_response_head<R>(reader: &mut R) -> Result<String, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    loop {
        let budget = (MAX_RESPONSE_HEAD - head.len()) as u64;
        let read = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await
            .map_err(|e| TransportError::proxy_connect(format!("failed to read reply: {e}")))?;

        if head.ends_with(b"\r\n\r\n") {
            return Ok(String::from_utf8_lossy(&head).into_owned());
        }
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::proxy_connect(format!(
                "proxy reply exceeds {MAX_RESPONSE_HEAD} bytes"
            )));
        }
        if read == 0 {
            return Err(TransportError::proxy_connect(
                "proxy closed connection during CONNECT",
            ));
        }
    }
}

/// `HTTP/1.x 200 ...` is the only reply that opens a tunnel.
fn is_success_status(status_line: &str) -> bool {
    status_line.split_whitespace().nth(1) == Some("200")
}
