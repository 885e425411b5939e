//! Connectivity check for platform RPC channels.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::time::Instant;

use crate::transport::{format_authority, select_factory, Route};

/// Splits an endpoint URL into host and port, defaulting the port by scheme.
pub(crate) fn endpoint(server_url: &str) -> Result<(String, u16)> {
    let url = reqwest::Url::parse(server_url)
        .with_context(|| format!("Invalid server URL: {server_url}"))?;
    let Some(host) = url.host_str() else {
        bail!("Server URL has no host: {server_url}");
    };
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    Ok((host, port))
}

/// Formats a successful probe.
pub(crate) fn format_probe(
    target: &str,
    strategy: &str,
    route: &Route,
    alpn: Option<&[u8]>,
    elapsed_ms: u128,
) -> String {
    let alpn = alpn.map_or_else(
        || "none".to_string(),
        |proto| String::from_utf8_lossy(proto).into_owned(),
    );

    let mut out = String::new();
    writeln!(&mut out, "\n{} Channel open to {}", "✓".green(), target.cyan()).unwrap();
    writeln!(&mut out, "  Strategy:  {}", strategy.cyan()).unwrap();
    writeln!(&mut out, "  Route:     {}", route.to_string().cyan()).unwrap();
    writeln!(&mut out, "  ALPN:      {}", alpn.cyan()).unwrap();
    writeln!(&mut out, "  Time:      {}", format!("{elapsed_ms}ms").cyan()).unwrap();
    out
}

/// Entry point: opens one channel and reports how it got there.
pub async fn run(
    host: Option<String>,
    port: Option<u16>,
    insecure_skip_verify: bool,
) -> Result<()> {
    let mut config = super::load_config()?;
    if insecure_skip_verify {
        config.transport.insecure_skip_verify = true;
    }

    let (default_host, default_port) = endpoint(&config.platform.server_url)?;
    let host = host.unwrap_or(default_host);
    let port = port.unwrap_or(default_port);

    let settings = config
        .transport
        .settings()
        .context("Invalid proxy configuration")?;
    let factory = select_factory(&settings)?;

    let target = format_authority(&host, port);
    let started = Instant::now();
    let channel = match factory.connect(&host, port).await {
        Ok(channel) => channel,
        Err(e) => {
            let hint = match &settings.proxy {
                Some(proxy) if e.is_proxy_connect() => {
                    Some(format!("Proxy {proxy} could not open the tunnel; check its URL and credentials"))
                }
                None if e.is_timeout() => {
                    Some("No proxy is configured; set HTTPS_PROXY if egress needs one".to_string())
                }
                _ => None,
            };
            let err = anyhow::Error::new(e).context(format!("Failed to open channel to {target}"));
            return Err(match hint {
                Some(hint) => err.context(hint),
                None => err,
            });
        }
    };

    print!(
        "{}",
        format_probe(
            &target,
            factory.name(),
            channel.route(),
            channel.alpn(),
            started.elapsed().as_millis()
        )
    );
    Ok(())
}
