//! Docker API requests carried over platform channels.
//!
//! A daemon named by `DOCKER_HOST=tcp://...` is reached through the
//! process-wide [`ConnectionFactory`], so a configured proxy tunnels the
//! platform traffic like any other RPC channel. Each request opens its own
//! channel and speaks HTTP over it; the connection lives as long as the
//! response body or the hijacked exec stream needs it.

use bollard::errors::Error as DockerError;
use bollard::{BollardRequest, Docker, API_DEFAULT_VERSION};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::header::{HeaderValue, HOST};
use hyper::{Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::SandboxError;
use crate::transport::{format_authority, ConnectionFactory, TransportError};

/// Port a TLS-protected Docker daemon listens on by convention.
const DEFAULT_DAEMON_PORT: u16 = 2376;

/// Seconds bollard waits for each response head.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Where a remote Docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DaemonAddr {
    pub host: String,
    pub port: u16,
}

impl DaemonAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a `DOCKER_HOST` value. Local sockets yield `None`.
    pub fn from_docker_host(value: &str) -> Result<Option<Self>, SandboxError> {
        let value = value.trim();
        if value.is_empty() || value.starts_with("unix://") || value.starts_with("npipe://") {
            return Ok(None);
        }

        let invalid = |reason: &str| {
            SandboxError::platform_unavailable(format!("invalid DOCKER_HOST '{value}': {reason}"))
        };
        if !value.starts_with("tcp://") {
            return Err(invalid("expected a tcp://, unix:// or npipe:// address"));
        }

        let url = reqwest::Url::parse(value).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        Ok(Some(Self::new(
            host,
            url.port().unwrap_or(DEFAULT_DAEMON_PORT),
        )))
    }
}

impl fmt::Display for DaemonAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_authority(&self.host, self.port))
    }
}

/// Builds a Docker client whose requests travel over `factory` channels.
pub(crate) fn docker_over(
    addr: &DaemonAddr,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<Docker, SandboxError> {
    let target = addr.clone();
    Docker::connect_with_custom_transport(
        move |request: BollardRequest| send(factory.clone(), target.clone(), request),
        Some(format!("http://{addr}")),
        REQUEST_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
    )
    .map_err(|e| SandboxError::platform_unavailable(format!("failed to set up Docker client: {e}")))
}

/// Recovers the transport failure behind a Docker client error, if any.
pub(crate) fn channel_fault(err: &DockerError) -> Option<&TransportError> {
    match err {
        DockerError::IOError { err } => err.get_ref()?.downcast_ref::<TransportError>(),
        _ => None,
    }
}

async fn send(
    factory: Arc<dyn ConnectionFactory>,
    addr: DaemonAddr,
    request: BollardRequest,
) -> Result<Response<Incoming>, DockerError> {
    let channel = factory
        .connect(&addr.host, addr.port)
        .await
        .map_err(|e| DockerError::IOError {
            err: std::io::Error::other(e),
        })?;
    let speaks_h2 = channel.alpn() == Some(b"h2".as_slice());
    let io = TokioIo::new(channel.into_io());

    if speaks_h2 {
        let (mut sender, connection) = http2::handshake(TokioExecutor::new(), io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Docker connection to {} closed: {}", addr, e);
            }
        });
        return Ok(sender.send_request(request).await?);
    }

    let request = into_origin_form(request)?;
    let (mut sender, connection) = http1::handshake(io).await?;
    tokio::spawn(async move {
        // Exec attach hijacks the connection.
        if let Err(e) = connection.with_upgrades().await {
            debug!("Docker connection to {} closed: {}", addr, e);
        }
    });
    Ok(sender.send_request(request).await?)
}

/// HTTP/1.1 puts the path on the request line and the authority in `Host`.
fn into_origin_form(mut request: BollardRequest) -> Result<BollardRequest, DockerError> {
    if let Some(authority) = request.uri().authority() {
        let host = HeaderValue::from_str(authority.as_str()).map_err(hyper::http::Error::from)?;
        request.headers_mut().entry(HOST).or_insert(host);
    }
    let path: Uri = request
        .uri()
        .path_and_query()
        .map_or("/", |path| path.as_str())
        .parse()
        .map_err(hyper::http::Error::from)?;
    *request.uri_mut() = path;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{select_factory, RefusingFactory, RpcChannel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Counts channels handed out by the process transport.
    struct CountingFactory {
        inner: Arc<dyn ConnectionFactory>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn connect(&self, host: &str, port: u16) -> Result<RpcChannel, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(host, port).await
        }
    }

    #[test]
    fn test_local_docker_hosts_need_no_channel() {
        assert_eq!(DaemonAddr::from_docker_host("").unwrap(), None);
        assert_eq!(
            DaemonAddr::from_docker_host("unix:///var/run/docker.sock").unwrap(),
            None
        );
        assert_eq!(
            DaemonAddr::from_docker_host("npipe:////./pipe/docker_engine").unwrap(),
            None
        );
    }

    #[test]
    fn test_tcp_docker_host() {
        assert_eq!(
            DaemonAddr::from_docker_host("tcp://docker.corp:2375").unwrap(),
            Some(DaemonAddr::new("docker.corp", 2375))
        );
        assert_eq!(
            DaemonAddr::from_docker_host("tcp://10.0.0.5").unwrap(),
            Some(DaemonAddr::new("10.0.0.5", 2376))
        );
        let addr = DaemonAddr::from_docker_host("tcp://[::1]:2376")
            .unwrap()
            .unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "[::1]:2376");
    }

    #[test]
    fn test_unsupported_docker_host() {
        let err = DaemonAddr::from_docker_host("ssh://me@docker.corp").unwrap_err();
        assert!(err.is_platform_unavailable());
        assert!(err.to_string().contains("DOCKER_HOST"));
    }

    #[tokio::test]
    async fn test_requests_travel_over_factory_channels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line.is_empty() || line == "\r\n" {
                    break;
                }
                head.push_str(&line);
            }
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK")
                .await
                .unwrap();
            reader.get_mut().flush().await.unwrap();
            head
        });

        let factory = Arc::new(CountingFactory {
            inner: select_factory(&Default::default()).unwrap(),
            calls: AtomicUsize::new(0),
        });
        let docker = docker_over(&DaemonAddr::new("127.0.0.1", port), factory.clone()).unwrap();

        assert_eq!(docker.ping().await.unwrap(), "OK");
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        let head = daemon.await.unwrap();
        assert!(head.starts_with("GET /v"), "{head}");
        assert!(head.contains("/_ping HTTP/1.1\r\n"), "{head}");
        assert!(head
            .to_ascii_lowercase()
            .contains(&format!("host: 127.0.0.1:{port}\r\n")));
    }

    #[tokio::test]
    async fn test_refused_tunnel_is_recoverable_from_docker_error() {
        let docker =
            docker_over(&DaemonAddr::new("docker.corp", 2376), Arc::new(RefusingFactory)).unwrap();

        let err = docker.ping().await.unwrap_err();
        let transport = channel_fault(&err).unwrap();
        assert!(transport.is_proxy_connect());
        assert!(transport.to_string().contains("403 Forbidden"));
    }
}
