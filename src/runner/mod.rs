//! Bounded-concurrency batch verification.
//!
//! Each reproduction id becomes one task: take a slot, create a sandbox,
//! run the verifier, capture output, tear the sandbox down, give the slot
//! back. A task's failure is recorded in its own [`TaskResult`] and never
//! touches its siblings.

mod result;
mod summary;

pub(crate) use result::{TaskResult, TaskStatus};
pub(crate) use summary::{format_progress, format_summary, BatchSummary};

use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::sandbox::{
    AppHandle, ImageRef, OutputStream, SandboxError, SandboxHandle, SandboxPlatform, SandboxSpec,
};
use result::{TailBuffer, STDERR_LIMIT, STDOUT_LIMIT};

/// Upper bound on tearing a sandbox down once its task is over.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings shared by every task in a batch.
#[derive(Debug, Clone)]
pub(crate) struct RunnerConfig {
    pub app: AppHandle,
    pub image: ImageRef,
    /// Verifier argv; the reproduction id is appended.
    pub command: Vec<String>,
    pub api_url: String,
    pub results_dir: String,
    pub concurrency: usize,
    /// Deadline for a whole task, sandbox creation included.
    pub task_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub memory: Option<String>,
}

/// Environment the verifier expects inside its sandbox.
///
/// `REPRO_ID` and `PRUVA_RESULTS_DIR` are only set when a reproduction is
/// selected.
pub(crate) fn verification_env(
    api_url: &str,
    repro_id: Option<&str>,
    results_dir: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("PRUVA_SANDBOX".to_string(), "true".to_string()),
        ("PRUVA_API_URL".to_string(), api_url.to_string()),
    ]);
    if let Some(id) = repro_id {
        env.insert("REPRO_ID".to_string(), id.to_string());
        env.insert("PRUVA_RESULTS_DIR".to_string(), results_dir.to_string());
    }
    env
}

/// Runs verification tasks with at most `concurrency` in flight.
pub(crate) struct BatchRunner {
    platform: Arc<dyn SandboxPlatform>,
    config: Arc<RunnerConfig>,
    slots: Arc<Semaphore>,
}

impl BatchRunner {
    pub fn new(platform: Arc<dyn SandboxPlatform>, config: RunnerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            platform,
            config: Arc::new(config),
            slots,
        }
    }

    /// Verifies every id and returns results in completion order.
    ///
    /// `on_result` sees each result as soon as its task finishes.
    pub async fn run<F>(&self, repro_ids: &[String], mut on_result: F) -> Vec<TaskResult>
    where
        F: FnMut(&TaskResult),
    {
        let mut tasks = JoinSet::new();
        for (index, repro_id) in repro_ids.iter().enumerate() {
            let platform = self.platform.clone();
            let config = self.config.clone();
            let slots = self.slots.clone();
            let repro_id = repro_id.clone();
            tasks.spawn(async move {
                (
                    index,
                    run_task(platform.as_ref(), &config, slots, repro_id).await,
                )
            });
        }

        let mut reported = vec![false; repro_ids.len()];
        let mut results = Vec::with_capacity(repro_ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    reported[index] = true;
                    on_result(&result);
                    results.push(result);
                }
                Err(e) => error!("Verification task died: {}", e),
            }
        }

        // A task that died outside its own fault handling still gets a result.
        for (index, repro_id) in repro_ids.iter().enumerate() {
            if !reported[index] {
                let mut result = TaskResult::new(repro_id.clone());
                result.finish_error("verification task aborted", String::new(), String::new());
                on_result(&result);
                results.push(result);
            }
        }

        results
    }
}

/// Output captured from one command, bounded per stream.
struct Capture {
    stdout: TailBuffer,
    stderr: TailBuffer,
}

impl Capture {
    fn new() -> Self {
        Self {
            stdout: TailBuffer::new(STDOUT_LIMIT),
            stderr: TailBuffer::new(STDERR_LIMIT),
        }
    }

    fn finish(self) -> (String, String) {
        (self.stdout.into_string(), self.stderr.into_string())
    }
}

async fn run_task(
    platform: &dyn SandboxPlatform,
    config: &RunnerConfig,
    slots: Arc<Semaphore>,
    repro_id: String,
) -> TaskResult {
    let mut result = TaskResult::new(repro_id.clone());
    let Ok(_permit) = slots.acquire_owned().await else {
        result.finish_error("concurrency gate closed", String::new(), String::new());
        return result;
    };

    let started = Instant::now();
    let deadline = started + config.task_timeout;
    info!("Verifying {}", repro_id);

    let spec = SandboxSpec {
        app: config.app.clone(),
        image: config.image.clone(),
        timeout: config.sandbox_timeout,
        env: verification_env(&config.api_url, Some(&repro_id), &config.results_dir),
        memory: config.memory.clone(),
    };

    match timeout_at(deadline, platform.create_sandbox(&spec)).await {
        Ok(Ok(sandbox)) => {
            debug!("Sandbox {} ready for {}", sandbox.id, repro_id);
            let mut command = config.command.clone();
            command.push(repro_id.clone());

            let mut capture = Capture::new();
            let outcome = timeout_at(
                deadline,
                AssertUnwindSafe(execute(platform, &sandbox, &command, &mut capture))
                    .catch_unwind(),
            )
            .await;
            let (stdout, stderr) = capture.finish();

            match outcome {
                Ok(Ok(Ok(exit_code))) => result.finish_exited(exit_code, stdout, stderr),
                Ok(Ok(Err(fault))) => result.finish_error(fault, stdout, stderr),
                Ok(Err(panic)) => {
                    result.finish_error(panic_message(panic.as_ref()), stdout, stderr);
                }
                Err(_) => result.finish_timeout(config.task_timeout, stdout, stderr),
            }

            teardown(platform, &sandbox, &repro_id).await;
        }
        Ok(Err(fault)) => result.finish_error(fault, String::new(), String::new()),
        Err(_) => result.finish_timeout(config.task_timeout, String::new(), String::new()),
    }

    result.set_duration(started.elapsed());
    info!(
        "{} finished: {} ({}s)",
        repro_id, result.status, result.duration_secs
    );
    result
}

/// Runs the verifier and streams its output into `capture`.
async fn execute(
    platform: &dyn SandboxPlatform,
    sandbox: &SandboxHandle,
    command: &[String],
    capture: &mut Capture,
) -> Result<i64, SandboxError> {
    let mut session = platform.exec(sandbox, command).await?;

    while let Some(chunk) = session.output.next().await {
        let chunk = chunk?;
        match chunk.stream {
            OutputStream::Stdout => capture.stdout.push(&chunk.text),
            OutputStream::Stderr => capture.stderr.push(&chunk.text),
        }
    }

    platform.wait(&session.id).await
}

async fn teardown(platform: &dyn SandboxPlatform, sandbox: &SandboxHandle, repro_id: &str) {
    match timeout(TEARDOWN_TIMEOUT, platform.terminate(sandbox)).await {
        Ok(Ok(())) => debug!("Sandbox {} terminated", sandbox.id),
        Ok(Err(e)) => warn!("Failed to terminate sandbox for {}: {}", repro_id, e),
        Err(_) => warn!(
            "Terminating sandbox for {} timed out after {}s",
            repro_id,
            TEARDOWN_TIMEOUT.as_secs()
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("verification task panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{MockBehavior, MockPlatform};
    use crate::sandbox::channel::DaemonAddr;
    use crate::sandbox::DockerPlatform;
    use crate::transport::RefusingFactory;

    fn runner_config(concurrency: usize) -> RunnerConfig {
        RunnerConfig {
            app: AppHandle {
                name: "test-app".to_string(),
            },
            image: ImageRef {
                reference: "verify:latest".to_string(),
            },
            command: vec!["pruva-verify".to_string()],
            api_url: "http://api.test/v1".to_string(),
            results_dir: "/tmp/pruva-results".to_string(),
            concurrency,
            task_timeout: Duration::from_secs(30),
            sandbox_timeout: Duration::from_secs(60),
            memory: None,
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn status_of(results: &[TaskResult], id: &str) -> TaskStatus {
        results
            .iter()
            .find(|r| r.repro_id == id)
            .map(|r| r.status)
            .unwrap()
    }

    #[test]
    fn test_verification_env() {
        let env = verification_env("http://api", Some("REPRO-1"), "/tmp/out");
        assert_eq!(env["PRUVA_SANDBOX"], "true");
        assert_eq!(env["PRUVA_API_URL"], "http://api");
        assert_eq!(env["REPRO_ID"], "REPRO-1");
        assert_eq!(env["PRUVA_RESULTS_DIR"], "/tmp/out");

        let env = verification_env("http://api", None, "/tmp/out");
        assert!(!env.contains_key("REPRO_ID"));
        assert!(!env.contains_key("PRUVA_RESULTS_DIR"));
    }

    #[tokio::test]
    async fn test_faulting_task_does_not_affect_siblings() {
        let platform = MockPlatform::new(MockBehavior::pass())
            .with("B", MockBehavior::ExecFault("simulated exception".to_string()));
        let runner = BatchRunner::new(Arc::new(platform.clone()), runner_config(2));
        let repro_ids = ids(&["A", "B", "C"]);

        let results = runner.run(&repro_ids, |_| {}).await;
        let summary = BatchSummary::new(&repro_ids, results);

        assert_eq!(summary.results().len(), 3);
        assert_eq!(status_of(summary.results(), "A"), TaskStatus::Pass);
        assert_eq!(status_of(summary.results(), "B"), TaskStatus::Error);
        assert_eq!(status_of(summary.results(), "C"), TaskStatus::Pass);
        assert!(summary.results()[1].stderr.contains("simulated exception"));
        assert!(!summary.all_passed());
        assert_eq!(platform.created(), platform.terminated());
    }

    #[tokio::test]
    async fn test_never_exceeds_concurrency_limit() {
        for limit in [1, 3, 8] {
            let platform = MockPlatform::new(MockBehavior::pass())
                .with_exec_delay(Duration::from_millis(20));
            let runner = BatchRunner::new(Arc::new(platform.clone()), runner_config(limit));
            let repro_ids: Vec<String> = (0..12).map(|i| format!("R-{i}")).collect();

            let results = runner.run(&repro_ids, |_| {}).await;

            assert_eq!(results.len(), 12);
            assert!(
                platform.max_active() <= limit,
                "limit {limit} exceeded: {}",
                platform.max_active()
            );
        }
    }

    #[tokio::test]
    async fn test_every_id_gets_exactly_one_result() {
        let platform = MockPlatform::new(MockBehavior::pass())
            .with("fail", MockBehavior::fail(2, "assertion failed"))
            .with("nocreate", MockBehavior::CreateFault("quota".to_string()))
            .with("exec", MockBehavior::ExecFault("reset".to_string()))
            .with("panic", MockBehavior::Panic);
        let runner = BatchRunner::new(Arc::new(platform.clone()), runner_config(2));
        let repro_ids = ids(&["ok", "fail", "nocreate", "exec", "panic"]);

        let mut seen = Vec::new();
        let results = runner
            .run(&repro_ids, |r| seen.push(r.repro_id.clone()))
            .await;

        assert_eq!(results.len(), repro_ids.len());
        seen.sort();
        let mut expected = repro_ids.clone();
        expected.sort();
        assert_eq!(seen, expected);

        assert_eq!(status_of(&results, "ok"), TaskStatus::Pass);
        assert_eq!(status_of(&results, "fail"), TaskStatus::Fail);
        assert_eq!(status_of(&results, "nocreate"), TaskStatus::Error);
        assert_eq!(status_of(&results, "exec"), TaskStatus::Error);
        assert_eq!(status_of(&results, "panic"), TaskStatus::Error);
        assert!(results
            .iter()
            .all(|r| r.status != TaskStatus::Unknown));

        // "nocreate" never got a sandbox; everything else was torn down.
        assert_eq!(platform.created(), 4);
        assert_eq!(platform.terminated(), 4);
    }

    #[tokio::test]
    async fn test_timeout_still_tears_down() {
        let platform = MockPlatform::new(MockBehavior::Hang);
        let mut config = runner_config(1);
        config.task_timeout = Duration::from_millis(100);
        let runner = BatchRunner::new(Arc::new(platform.clone()), config);

        let results = runner.run(&ids(&["slow"]), |_| {}).await;

        assert_eq!(results[0].status, TaskStatus::Timeout);
        assert!(results[0].stderr.starts_with("still working\n"));
        assert!(results[0].stderr.contains("timed out"));
        assert_eq!(platform.created(), 1);
        assert_eq!(platform.terminated(), 1);
    }

    #[tokio::test]
    async fn test_failure_captures_output_and_missing_deps() {
        let platform = MockPlatform::new(MockBehavior::fail(
            127,
            "bash: foo123: command not found\n",
        ));
        let runner = BatchRunner::new(Arc::new(platform), runner_config(1));

        let results = runner.run(&ids(&["X"]), |_| {}).await;

        let result = &results[0];
        assert_eq!(result.status, TaskStatus::Fail);
        assert_eq!(result.exit_code, 127);
        assert_eq!(result.missing_deps.len(), 1);
        assert_eq!(result.missing_deps[0].name, "foo123");
    }

    #[tokio::test]
    async fn test_stream_fault_keeps_earlier_stderr() {
        let platform = MockPlatform::new(MockBehavior::StreamFault {
            stderr: "fetching fixtures\n".to_string(),
            message: "connection reset".to_string(),
        });
        let runner = BatchRunner::new(Arc::new(platform.clone()), runner_config(1));

        let results = runner.run(&ids(&["X"]), |_| {}).await;

        assert_eq!(results[0].status, TaskStatus::Error);
        assert!(results[0].stderr.starts_with("fetching fixtures\n"));
        assert!(results[0].stderr.contains("connection reset"));
        assert_eq!(platform.terminated(), 1);
    }

    #[tokio::test]
    async fn test_refused_tunnel_ends_tasks_as_error() {
        let platform = DockerPlatform::over_channel(
            &DaemonAddr::new("docker.corp", 2376),
            Arc::new(RefusingFactory),
            None,
        )
        .unwrap();
        let runner = BatchRunner::new(Arc::new(platform), runner_config(2));
        let repro_ids = ids(&["A", "B"]);

        let results = runner.run(&repro_ids, |_| {}).await;

        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.status, TaskStatus::Error);
            assert!(result.stderr.contains("Proxy CONNECT failed"));
            assert_eq!(result.exit_code, -1);
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let platform = MockPlatform::new(MockBehavior::pass());
        let runner = BatchRunner::new(Arc::new(platform.clone()), runner_config(4));
        let results = runner.run(&[], |_| {}).await;
        assert!(results.is_empty());
        assert_eq!(platform.created(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            panic_message(payload.as_ref()),
            "verification task panicked: boom"
        );
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert!(panic_message(payload.as_ref()).ends_with("bang"));
    }
}
