//! Disposable sandboxes for running verification commands.
//!
//! [`SandboxPlatform`] is the narrow contract the runner and the shell need
//! from a sandbox provider. `DockerPlatform` implements it on top of a
//! Docker daemon, reaching a remote one over the process's channel
//! factory; tests use `MockPlatform`.

pub(crate) mod channel;
mod docker;
mod error;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerPlatform;
pub(crate) use error::SandboxError;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::time::Duration;

/// A named grouping that sandboxes are created under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AppHandle {
    pub name: String,
}

/// A container image the platform can start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageRef {
    pub reference: String,
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone)]
pub(crate) struct SandboxSpec {
    pub app: AppHandle,
    pub image: ImageRef,
    /// Lifetime after which the platform reclaims the sandbox on its own.
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    /// Memory limit such as `"2g"`; `None` leaves the platform default.
    pub memory: Option<String>,
}

/// A running sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SandboxHandle {
    pub id: String,
}

/// Which process stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

/// A chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// A command started inside a sandbox.
///
/// `output` ends when the process closes its streams; the exit code is
/// then available by passing `id` to [`SandboxPlatform::wait`].
pub(crate) struct ExecSession {
    pub id: String,
    pub output: BoxStream<'static, Result<OutputChunk, SandboxError>>,
}

/// Trait for sandbox providers.
///
/// Every operation is a potentially slow remote call and may fail.
#[async_trait]
pub(crate) trait SandboxPlatform: Send + Sync {
    /// Returns the platform name for display.
    fn name(&self) -> &'static str;

    /// Looks up the app grouping, creating it if missing.
    async fn lookup_app(&self, name: &str) -> Result<AppHandle, SandboxError>;

    /// Makes sure the image is available and returns a reference to it.
    async fn resolve_image(&self, reference: &str) -> Result<ImageRef, SandboxError>;

    /// Creates and starts a sandbox.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Starts `command` inside the sandbox.
    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        command: &[String],
    ) -> Result<ExecSession, SandboxError>;

    /// Waits for the command started as `exec_id` and returns its exit code.
    async fn wait(&self, exec_id: &str) -> Result<i64, SandboxError>;

    /// Terminates a sandbox. Terminating one that is already gone succeeds.
    async fn terminate(&self, sandbox: &SandboxHandle) -> Result<(), SandboxError>;

    /// Removes sandboxes left behind under `app`, returning how many.
    async fn cleanup_orphaned(&self, app: &AppHandle) -> Result<u32, SandboxError>;
}
