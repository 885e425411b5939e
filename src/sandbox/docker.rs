use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::{future, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::channel::{self, DaemonAddr};
use super::{
    AppHandle, ExecSession, ImageRef, OutputChunk, SandboxError, SandboxHandle, SandboxPlatform,
    SandboxSpec,
};
use crate::config::Credentials;
use crate::transport::ConnectionFactory;

/// Label that ties a container to its app grouping.
const APP_LABEL: &str = "repro-runner.app";

/// How often `wait` re-checks an exec that has closed its streams.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs sandboxes as containers on a Docker daemon.
///
/// Apps are container labels, sandboxes are containers running
/// `sleep <timeout>` so they expire on their own, and platform
/// credentials authenticate image pulls.
pub(crate) struct DockerPlatform {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerPlatform {
    /// Connects to the daemon named by `DOCKER_HOST` (or the local socket).
    ///
    /// A `tcp://` daemon is reached over `factory` channels. Without
    /// credentials, image pulls are anonymous.
    pub async fn connect(
        credentials: Option<&Credentials>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, SandboxError> {
        let docker_host = std::env::var("DOCKER_HOST").unwrap_or_default();
        let platform = match DaemonAddr::from_docker_host(&docker_host)? {
            Some(addr) => {
                info!(
                    "Reaching Docker daemon at {} over the {} transport",
                    addr,
                    factory.name()
                );
                Self::over_channel(&addr, factory, credentials)?
            }
            None => {
                let docker = Docker::connect_with_local_defaults().map_err(|e| {
                    SandboxError::platform_unavailable(format!("failed to connect to Docker: {e}"))
                })?;
                Self::with_client(docker, credentials)
            }
        };

        platform.docker.ping().await.map_err(|e| {
            fault(e, |e| {
                SandboxError::platform_unavailable(format!("cannot ping Docker daemon: {e}"))
            })
        })?;

        Ok(platform)
    }

    /// Talks to a remote daemon through channels opened by `factory`.
    pub fn over_channel(
        addr: &DaemonAddr,
        factory: Arc<dyn ConnectionFactory>,
        credentials: Option<&Credentials>,
    ) -> Result<Self, SandboxError> {
        Ok(Self::with_client(
            channel::docker_over(addr, factory)?,
            credentials,
        ))
    }

    fn with_client(docker: Docker, credentials: Option<&Credentials>) -> Self {
        Self {
            docker,
            credentials: credentials.map(|c| DockerCredentials {
                username: Some(c.token_id.clone()),
                password: Some(c.token_secret.clone()),
                ..Default::default()
            }),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<(), SandboxError> {
        info!("Pulling image {}...", reference);

        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let mut stream =
            self.docker
                .create_image(Some(options), None, self.credentials.clone());

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(error) = info.error {
                        warn!("Pull of {} failed: {}", reference, error);
                        return Err(SandboxError::image_not_found(reference));
                    }
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", reference, status.trim());
                    }
                }
                Err(e) => {
                    warn!("Pull of {} failed: {}", reference, e);
                    return Err(fault(e, |_| SandboxError::image_not_found(reference)));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl SandboxPlatform for DockerPlatform {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn lookup_app(&self, name: &str) -> Result<AppHandle, SandboxError> {
        // Labels need no registration; the app exists once a container carries it.
        Ok(AppHandle {
            name: name.to_string(),
        })
    }

    async fn resolve_image(&self, reference: &str) -> Result<ImageRef, SandboxError> {
        if let Err(e) = self.docker.inspect_image(reference).await {
            if let Some(transport) = channel::channel_fault(&e) {
                return Err(SandboxError::channel_failed(transport.to_string()));
            }
            self.pull_image(reference).await?;
        }
        Ok(ImageRef {
            reference: reference.to_string(),
        })
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let name = format!(
            "{}-{}",
            spec.app.name,
            uuid::Uuid::new_v4().simple().to_string().get(..8).unwrap_or("sandbox")
        );

        let memory = spec
            .memory
            .as_deref()
            .map(parse_memory_limit)
            .transpose()?;

        let config = ContainerConfig {
            image: Some(spec.image.reference.clone()),
            cmd: Some(vec![
                "sleep".to_string(),
                spec.timeout.as_secs().max(1).to_string(),
            ]),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(HashMap::from([(
                APP_LABEL.to_string(),
                spec.app.name.clone(),
            )])),
            host_config: Some(HostConfig {
                memory,
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!("Creating container: {}", name);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                fault(e, |e| {
                    SandboxError::sandbox_failed(format!("failed to create {name}: {e}"))
                })
            })?;

        let handle = SandboxHandle { id: created.id };

        debug!("Starting container: {}", name);
        if let Err(e) = self.docker.start_container::<String>(&handle.id, None).await {
            // Never hand back a sandbox the caller would not know to tear down.
            let _ = self.terminate(&handle).await;
            return Err(SandboxError::sandbox_failed(format!(
                "failed to start {name}: {e}"
            )));
        }

        Ok(handle)
    }

    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        command: &[String],
    ) -> Result<ExecSession, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &sandbox.id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                fault(e, |e| SandboxError::exec_failed(format!("failed to create exec: {e}")))
            })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| {
                fault(e, |e| SandboxError::exec_failed(format!("failed to start exec: {e}")))
            })?;

        let StartExecResults::Attached { output, .. } = started else {
            return Err(SandboxError::exec_failed("exec started detached"));
        };

        let output = output
            .filter_map(|item| {
                future::ready(match item {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        Some(Ok(OutputChunk::stdout(String::from_utf8_lossy(&message))))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(OutputChunk::stderr(String::from_utf8_lossy(&message))))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(SandboxError::exec_failed(format!(
                        "error reading exec output: {e}"
                    )))),
                })
            })
            .boxed();

        Ok(ExecSession {
            id: exec.id,
            output,
        })
    }

    async fn wait(&self, exec_id: &str) -> Result<i64, SandboxError> {
        loop {
            let inspect = self.docker.inspect_exec(exec_id).await.map_err(|e| {
                fault(e, |e| SandboxError::exec_failed(format!("failed to inspect exec: {e}")))
            })?;

            if inspect.running != Some(true) {
                return inspect
                    .exit_code
                    .ok_or_else(|| SandboxError::exec_failed("exec finished without exit code"));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    async fn terminate(&self, sandbox: &SandboxHandle) -> Result<(), SandboxError> {
        debug!("Removing container: {}", sandbox.id);
        match self
            .docker
            .remove_container(
                &sandbox.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // auto_remove may have beaten us to it.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(fault(e, |e| {
                SandboxError::sandbox_failed(format!("failed to remove {}: {e}", sandbox.id))
            })),
        }
    }

    async fn cleanup_orphaned(&self, app: &AppHandle) -> Result<u32, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{APP_LABEL}={}", app.name)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| {
                fault(e, |e| SandboxError::sandbox_failed(format!("failed to list containers: {e}")))
            })?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.terminate(&SandboxHandle { id: id.clone() }).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove orphaned sandbox {}: {}", id, e),
            }
        }
        Ok(removed)
    }
}

/// Reports a broken platform channel as such; `fallback` maps everything else.
fn fault(err: DockerError, fallback: impl FnOnce(DockerError) -> SandboxError) -> SandboxError {
    match channel::channel_fault(&err) {
        Some(transport) => SandboxError::channel_failed(transport.to_string()),
        None => fallback(err),
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || SandboxError::sandbox_failed(format!("invalid memory limit: {limit}"));

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(|_| invalid())?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(|_| invalid())?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(|_| invalid())
    }
}
