//! Per-task outcome record.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::classify::{classify, MissingDependency};

/// Bytes of stdout kept per task.
pub(crate) const STDOUT_LIMIT: usize = 10_000;
/// Bytes of stderr kept per task.
pub(crate) const STDERR_LIMIT: usize = 5_000;

/// Terminal state of one verification task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TaskStatus {
    Pass,
    Fail,
    Timeout,
    Error,
    #[default]
    Unknown,
}

impl TaskStatus {
    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of verifying one reproduction.
///
/// Starts as `Unknown` and is finished exactly once by the task that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TaskResult {
    pub repro_id: String,
    pub status: TaskStatus,
    pub exit_code: i64,
    pub duration_secs: f64,
    pub stdout: String,
    pub stderr: String,
    pub missing_deps: Vec<MissingDependency>,
}

impl TaskResult {
    pub fn new(repro_id: impl Into<String>) -> Self {
        Self {
            repro_id: repro_id.into(),
            status: TaskStatus::Unknown,
            exit_code: -1,
            duration_secs: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            missing_deps: Vec::new(),
        }
    }

    /// The process exited; 0 passes, anything else fails.
    pub fn finish_exited(&mut self, exit_code: i64, stdout: String, stderr: String) {
        self.exit_code = exit_code;
        self.stdout = stdout;
        self.stderr = stderr;
        self.finish(if exit_code == 0 {
            TaskStatus::Pass
        } else {
            TaskStatus::Fail
        });
    }

    /// The task ran past its deadline.
    pub fn finish_timeout(&mut self, limit: Duration, stdout: String, stderr: String) {
        self.stdout = stdout;
        self.stderr = append_fault(
            stderr,
            &format!("Task timed out after {} seconds", limit.as_secs()),
        );
        self.finish(TaskStatus::Timeout);
    }

    /// The task hit a fault before producing an exit code.
    pub fn finish_error(&mut self, fault: impl std::fmt::Display, stdout: String, stderr: String) {
        self.stdout = stdout;
        self.stderr = append_fault(stderr, &fault.to_string());
        self.finish(TaskStatus::Error);
    }

    fn finish(&mut self, status: TaskStatus) {
        debug_assert_eq!(self.status, TaskStatus::Unknown, "task finished twice");
        self.status = status;
        self.missing_deps = classify(&format!("{}\n{}", self.stdout, self.stderr));
    }

    pub fn set_duration(&mut self, elapsed: Duration) {
        self.duration_secs = (elapsed.as_secs_f64() * 10.0).round() / 10.0;
    }
}

/// Puts the fault after whatever the command wrote to stderr.
fn append_fault(mut captured: String, fault: &str) -> String {
    if !captured.is_empty() && !captured.ends_with('\n') {
        captured.push('\n');
    }
    captured.push_str(fault);
    captured
}

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
pub(crate) struct TailBuffer {
    limit: usize,
    buf: Vec<u8>,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.extend_from_slice(text.as_bytes());
        // Trim in batches so long streams don't shift the buffer on every push.
        if self.buf.len() > self.limit * 2 {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
        }
    }

    /// The retained tail, starting on a character boundary.
    pub fn into_string(self) -> String {
        let start = self.buf.len().saturating_sub(self.limit);
        let mut tail = &self.buf[start..];
        while let Some((&b, rest)) = tail.split_first() {
            // Skip UTF-8 continuation bytes cut off by the trim.
            if b & 0b1100_0000 != 0b1000_0000 {
                break;
            }
            tail = rest;
        }
        String::from_utf8_lossy(tail).into_owned()
    }
}
