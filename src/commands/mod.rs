//! CLI command implementations.
//!
//! Each submodule keeps its decisions and formatting pure and does IO only
//! in its `run` entry point.

pub mod clean;
pub mod probe;
pub mod shell;
pub mod verify;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, Credentials};
use crate::sandbox::{AppHandle, DockerPlatform, ImageRef, SandboxError, SandboxPlatform};
use crate::transport::{select_factory, ConnectionFactory};

/// Shown when the channel to a remote platform could not be opened.
const CHANNEL_HINT: &str = "Check DOCKER_HOST and the proxy settings (HTTPS_PROXY, [transport])";

/// Loads `repro-runner.toml` from the working directory and overlays the
/// environment.
pub(crate) fn load_config() -> Result<Config> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = Config::load(&cwd).context("Failed to load configuration")?;
    config.apply_env();
    Ok(config)
}

/// Picks the transport every platform channel of this run goes through.
pub(crate) fn channel_factory(config: &Config) -> Result<Arc<dyn ConnectionFactory>> {
    let settings = config
        .transport
        .settings()
        .context("Invalid proxy configuration")?;
    let factory = select_factory(&settings)?;
    info!("Platform transport: {}", factory.name());
    Ok(factory)
}

/// Connects to the sandbox platform, with a hint when it is not running.
pub(crate) async fn connect_platform(
    credentials: Option<&Credentials>,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<DockerPlatform> {
    DockerPlatform::connect(credentials, factory)
        .await
        .map_err(|e| with_hint(e, "Is the Docker daemon running?"))
}

/// Resolves the app grouping and image every sandbox of this run shares.
pub(crate) async fn prepare(
    platform: &dyn SandboxPlatform,
    config: &Config,
) -> Result<(AppHandle, ImageRef)> {
    let app = platform.lookup_app(&config.platform.app_name).await?;
    let image = platform
        .resolve_image(&config.platform.image)
        .await
        .map_err(|e| with_hint(e, "Check [platform] image and the registry credentials"))?;
    Ok((app, image))
}

fn with_hint(err: SandboxError, hint: &'static str) -> anyhow::Error {
    let hint = if err.is_channel_failed() {
        Some(CHANNEL_HINT)
    } else if err.is_platform_unavailable() || err.is_image_not_found() {
        Some(hint)
    } else {
        None
    };
    let err = anyhow::Error::new(err);
    match hint {
        Some(hint) => err.context(hint),
        None => err,
    }
}
