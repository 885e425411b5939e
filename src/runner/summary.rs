//! Batch aggregation and reporting.
//!
//! Counting and formatting are pure; the JSON report is the only IO.

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;
use std::path::Path;

use super::{TaskResult, TaskStatus};
use crate::classify::MissingDependency;

/// How much of each stream the failure details show.
const DETAIL_CHARS: usize = 500;

/// Aggregate view of a finished batch.
#[derive(Debug, Clone)]
pub(crate) struct BatchSummary {
    results: Vec<TaskResult>,
    passed: usize,
    failed: usize,
    errored: usize,
}

impl BatchSummary {
    /// Builds the summary, putting results back in submission order.
    pub fn new(repro_ids: &[String], mut results: Vec<TaskResult>) -> Self {
        let mut position: HashMap<&str, usize> = HashMap::new();
        for (index, id) in repro_ids.iter().enumerate() {
            position.entry(id.as_str()).or_insert(index);
        }
        results.sort_by_key(|r| {
            position
                .get(r.repro_id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });

        let count = |status: TaskStatus| results.iter().filter(|r| r.status == status).count();
        let passed = count(TaskStatus::Pass);
        let failed = count(TaskStatus::Fail);
        let errored = results.len() - passed - failed;

        Self {
            results,
            passed,
            failed,
            errored,
        }
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    pub fn passed(&self) -> usize {
        self.passed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Tasks that ended in `error`, `timeout`, or never finished.
    pub fn errored(&self) -> usize {
        self.errored
    }

    /// True only if every task passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.status.is_pass())
    }

    /// Every missing dependency across the batch, de-duplicated and sorted.
    pub fn missing_dependencies(&self) -> BTreeSet<&MissingDependency> {
        self.results
            .iter()
            .flat_map(|r| r.missing_deps.iter())
            .collect()
    }

    /// Writes the machine-readable report.
    pub fn write_json(&self, path: &Path, api_url: &str) -> Result<()> {
        let report = Report {
            generated_at: Utc::now().to_rfc3339(),
            api_url,
            total: self.results.len(),
            passed: self.passed,
            failed: self.failed,
            errors: self.errored,
            missing_deps: self.missing_dependencies().into_iter().collect(),
            results: &self.results,
        };

        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results file: {}", path.display()))
    }
}

#[derive(Serialize)]
struct Report<'a> {
    generated_at: String,
    api_url: &'a str,
    total: usize,
    passed: usize,
    failed: usize,
    errors: usize,
    missing_deps: Vec<&'a MissingDependency>,
    results: &'a [TaskResult],
}

/// One line per finished task, printed as results stream in.
pub(crate) fn format_progress(result: &TaskResult) -> String {
    let icon = match result.status {
        TaskStatus::Pass => "✅".green(),
        TaskStatus::Fail => "❌".red(),
        TaskStatus::Timeout => "⏰".yellow(),
        TaskStatus::Error => "⚠️".yellow(),
        TaskStatus::Unknown => "?".dimmed(),
    };

    let mut out = format!(
        "  {} {}: {} ({}s)",
        icon,
        result.repro_id,
        result.status.to_string().to_uppercase(),
        result.duration_secs
    );
    for dep in &result.missing_deps {
        write!(&mut out, "\n      Missing {}: {}", dep.kind, dep.name).unwrap();
    }
    out
}

/// Full end-of-run report: counts, missing dependencies, failure details.
pub(crate) fn format_summary(summary: &BatchSummary) -> String {
    let mut out = String::new();
    let rule = "━".repeat(60);

    writeln!(&mut out, "\n{}", rule.dimmed()).unwrap();
    writeln!(&mut out, "{}", "   Results Summary".yellow().bold()).unwrap();
    writeln!(&mut out, "{}", rule.dimmed()).unwrap();
    writeln!(&mut out, "  Total:   {}", summary.results().len()).unwrap();
    writeln!(&mut out, "  Passed:  {}", summary.passed().to_string().green()).unwrap();
    writeln!(&mut out, "  Failed:  {}", summary.failed().to_string().red()).unwrap();
    writeln!(&mut out, "  Errors:  {}", summary.errored().to_string().yellow()).unwrap();

    let missing = summary.missing_dependencies();
    if !missing.is_empty() {
        writeln!(&mut out, "\n  Missing dependencies (add to the sandbox image):").unwrap();
        for dep in missing {
            writeln!(&mut out, "    - {dep}").unwrap();
        }
    }

    for result in summary.results().iter().filter(|r| !r.status.is_pass()) {
        writeln!(
            &mut out,
            "\n--- {} ({}, exit {}, {}s) ---",
            result.repro_id.bold(),
            result.status.to_string().to_uppercase(),
            result.exit_code,
            result.duration_secs
        )
        .unwrap();
        if !result.stderr.is_empty() {
            writeln!(&mut out, "STDERR (last {DETAIL_CHARS} chars):").unwrap();
            writeln!(&mut out, "{}", tail_chars(&result.stderr, DETAIL_CHARS)).unwrap();
        }
        if !result.stdout.is_empty() {
            writeln!(&mut out, "STDOUT (last {DETAIL_CHARS} chars):").unwrap();
            writeln!(&mut out, "{}", tail_chars(&result.stdout, DETAIL_CHARS)).unwrap();
        }
    }

    if summary.all_passed() {
        writeln!(&mut out, "\n{} All verifications passed", "✓".green()).unwrap();
    } else {
        writeln!(&mut out, "\n{} Some verifications failed", "✗".red()).unwrap();
    }
    out
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max)
        .map_or(0, |(index, _)| index);
    &text[start..]
}
