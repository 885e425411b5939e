//! Mock sandbox platform for testing.
//!
//! Scripts a behavior per reproduction id (read from the sandbox's
//! `REPRO_ID` env var) and tracks lifecycle calls for test assertions.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    AppHandle, ExecSession, ImageRef, OutputChunk, SandboxError, SandboxHandle, SandboxPlatform,
    SandboxSpec,
};

/// What a scripted sandbox does when its command runs.
#[derive(Debug, Clone)]
pub(crate) enum MockBehavior {
    /// Print the output to stdout and exit with the code.
    Exit { code: i64, stdout: String, stderr: String },
    /// Sandbox creation fails.
    CreateFault(String),
    /// Command execution fails after the sandbox exists.
    ExecFault(String),
    /// The command writes to stderr, then its output stream breaks.
    StreamFault { stderr: String, message: String },
    /// The command reports progress on stderr and never finishes.
    Hang,
    /// The exec call panics.
    Panic,
}

impl MockBehavior {
    pub fn pass() -> Self {
        Self::Exit {
            code: 0,
            stdout: "verified\n".to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i64, stderr: &str) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// A scripted platform that records every lifecycle call.
#[derive(Debug, Clone)]
pub(crate) struct MockPlatform {
    behaviors: Arc<HashMap<String, MockBehavior>>,
    default: MockBehavior,
    exec_delay: Duration,
    sandboxes: Arc<Mutex<HashMap<String, String>>>,
    exit_codes: Arc<Mutex<HashMap<String, i64>>>,
    next_id: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    terminated: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockPlatform {
    /// Creates a platform where every id gets `default`.
    pub fn new(default: MockBehavior) -> Self {
        Self {
            behaviors: Arc::new(HashMap::new()),
            default,
            exec_delay: Duration::from_millis(10),
            sandboxes: Arc::default(),
            exit_codes: Arc::default(),
            next_id: Arc::default(),
            created: Arc::default(),
            terminated: Arc::default(),
            active: Arc::default(),
            max_active: Arc::default(),
        }
    }

    /// Overrides the behavior for one id.
    pub fn with(mut self, repro_id: &str, behavior: MockBehavior) -> Self {
        Arc::make_mut(&mut self.behaviors).insert(repro_id.to_string(), behavior);
        self
    }

    /// Sets how long each command takes before producing output.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Highest number of sandboxes alive at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, repro_id: &str) -> MockBehavior {
        self.behaviors
            .get(repro_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    fn behavior_of_sandbox(&self, sandbox: &SandboxHandle) -> MockBehavior {
        let repro_id = self
            .sandboxes
            .lock()
            .unwrap()
            .get(&sandbox.id)
            .cloned()
            .unwrap_or_default();
        self.behavior_for(&repro_id)
    }
}

#[async_trait]
impl SandboxPlatform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn lookup_app(&self, name: &str) -> Result<AppHandle, SandboxError> {
        Ok(AppHandle {
            name: name.to_string(),
        })
    }

    async fn resolve_image(&self, reference: &str) -> Result<ImageRef, SandboxError> {
        Ok(ImageRef {
            reference: reference.to_string(),
        })
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let repro_id = spec.env.get("REPRO_ID").cloned().unwrap_or_default();
        if let MockBehavior::CreateFault(msg) = self.behavior_for(&repro_id) {
            return Err(SandboxError::sandbox_failed(msg));
        }

        let id = format!("sb-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sandboxes.lock().unwrap().insert(id.clone(), repro_id);
        self.created.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        Ok(SandboxHandle { id })
    }

    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        _command: &[String],
    ) -> Result<ExecSession, SandboxError> {
        tokio::time::sleep(self.exec_delay).await;
        let session_id = format!("{}-exec", sandbox.id);

        match self.behavior_of_sandbox(sandbox) {
            MockBehavior::Exit {
                code,
                stdout,
                stderr,
            } => {
                self.exit_codes
                    .lock()
                    .unwrap()
                    .insert(session_id.clone(), code);
                let chunks = vec![Ok(OutputChunk::stdout(stdout)), Ok(OutputChunk::stderr(stderr))];
                Ok(ExecSession {
                    id: session_id,
                    output: stream::iter(chunks).boxed(),
                })
            }
            MockBehavior::ExecFault(msg) => Err(SandboxError::exec_failed(msg)),
            MockBehavior::StreamFault { stderr, message } => {
                let chunks = vec![
                    Ok(OutputChunk::stderr(stderr)),
                    Err(SandboxError::exec_failed(message)),
                ];
                Ok(ExecSession {
                    id: session_id,
                    output: stream::iter(chunks).boxed(),
                })
            }
            MockBehavior::Hang => {
                let progress: Result<OutputChunk, SandboxError> =
                    Ok(OutputChunk::stderr("still working\n"));
                Ok(ExecSession {
                    id: session_id,
                    output: stream::iter([progress]).chain(stream::pending()).boxed(),
                })
            }
            MockBehavior::Panic => panic!("simulated exec panic"),
            MockBehavior::CreateFault(_) => unreachable!("sandbox was never created"),
        }
    }

    async fn wait(&self, exec_id: &str) -> Result<i64, SandboxError> {
        self.exit_codes
            .lock()
            .unwrap()
            .get(exec_id)
            .copied()
            .ok_or_else(|| SandboxError::exec_failed("unknown exec session"))
    }

    async fn terminate(&self, sandbox: &SandboxHandle) -> Result<(), SandboxError> {
        if self.sandboxes.lock().unwrap().remove(&sandbox.id).is_some() {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn cleanup_orphaned(&self, _app: &AppHandle) -> Result<u32, SandboxError> {
        let ids: Vec<String> = self.sandboxes.lock().unwrap().keys().cloned().collect();
        for id in &ids {
            self.terminate(&SandboxHandle { id: id.clone() }).await?;
        }
        Ok(u32::try_from(ids.len()).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec_for(repro_id: &str) -> SandboxSpec {
        SandboxSpec {
            app: AppHandle {
                name: "test".to_string(),
            },
            image: ImageRef {
                reference: "img".to_string(),
            },
            timeout: Duration::from_secs(60),
            env: BTreeMap::from([("REPRO_ID".to_string(), repro_id.to_string())]),
            memory: None,
        }
    }

    #[tokio::test]
    async fn test_mock_tracks_lifecycle() {
        let platform = MockPlatform::new(MockBehavior::pass());
        let sandbox = platform.create_sandbox(&spec_for("A")).await.unwrap();
        assert_eq!(platform.created(), 1);

        let session = platform.exec(&sandbox, &[]).await.unwrap();
        assert_eq!(platform.wait(&session.id).await.unwrap(), 0);

        platform.terminate(&sandbox).await.unwrap();
        platform.terminate(&sandbox).await.unwrap();
        assert_eq!(platform.terminated(), 1);
    }

    #[tokio::test]
    async fn test_mock_create_fault() {
        let platform = MockPlatform::new(MockBehavior::pass())
            .with("B", MockBehavior::CreateFault("no capacity".to_string()));
        assert!(platform.create_sandbox(&spec_for("B")).await.is_err());
        assert_eq!(platform.created(), 0);
    }

    #[tokio::test]
    async fn test_mock_cleanup_orphaned() {
        let platform = MockPlatform::new(MockBehavior::pass());
        platform.create_sandbox(&spec_for("A")).await.unwrap();
        platform.create_sandbox(&spec_for("B")).await.unwrap();
        let app = platform.lookup_app("test").await.unwrap();
        assert_eq!(platform.cleanup_orphaned(&app).await.unwrap(), 2);
        assert_eq!(platform.terminated(), 2);
    }
}
