use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{BatchConfig, Config, Credentials};
use crate::listing::ListingClient;
use crate::runner::{format_progress, format_summary, BatchRunner, BatchSummary, RunnerConfig};
use crate::sandbox::SandboxPlatform;

/// Options for `repro-runner verify`.
#[derive(Debug, Clone, Default)]
pub struct VerifyArgs {
    pub repro_ids: Vec<String>,
    pub latest: Option<usize>,
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub results_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

impl VerifyArgs {
    /// Flags win over file and environment values.
    fn apply(&self, config: &mut Config) {
        if let Some(latest) = self.latest {
            config.batch.latest = latest;
        }
        if let Some(concurrency) = self.concurrency {
            config.batch.concurrency = concurrency;
        }
        if let Some(timeout) = self.timeout_secs {
            config.batch.task_timeout_secs = timeout;
        }
        if self.insecure_skip_verify {
            config.transport.insecure_skip_verify = true;
        }
    }
}

/// Trims ids, drops blanks, and keeps the first of any duplicates.
pub(crate) fn normalize_ids(raw: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

async fn resolve_repro_ids(explicit: &[String], batch: &BatchConfig) -> Result<Vec<String>> {
    let ids = normalize_ids(explicit);
    if !ids.is_empty() {
        return Ok(ids);
    }

    println!(
        "{} Fetching the {} latest published reproductions...",
        "→".cyan(),
        batch.latest
    );
    let client = ListingClient::new(&batch.api_url)?;
    let ids = client
        .fetch_latest(batch.latest)
        .await
        .context("Failed to fetch published reproductions")?;
    if ids.is_empty() {
        bail!("No published reproductions found at {}", batch.api_url);
    }
    Ok(ids)
}

/// Entry point: verifies the batch and returns whether every task passed.
pub async fn run(args: VerifyArgs) -> Result<bool> {
    let credentials = Credentials::from_env()?;
    let mut config = super::load_config()?;
    args.apply(&mut config);
    let command = config.batch.command_argv()?;

    let factory = super::channel_factory(&config)?;

    let repro_ids = resolve_repro_ids(&args.repro_ids, &config.batch).await?;

    let platform = super::connect_platform(Some(&credentials), factory).await?;
    let (app, image) = super::prepare(&platform, &config).await?;

    print!("{}", format_banner(&config, platform.name(), repro_ids.len()));

    let runner = BatchRunner::new(
        Arc::new(platform),
        RunnerConfig {
            app,
            image,
            command,
            api_url: config.batch.api_url.clone(),
            results_dir: config.batch.results_dir.clone(),
            concurrency: config.batch.concurrency,
            task_timeout: config.batch.task_timeout(),
            sandbox_timeout: config.platform.sandbox_timeout(),
            memory: Some(config.platform.memory.clone()).filter(|m| !m.trim().is_empty()),
        },
    );
    let results = runner
        .run(&repro_ids, |result| println!("{}", format_progress(result)))
        .await;

    let summary = BatchSummary::new(&repro_ids, results);
    print!("{}", format_summary(&summary));

    if let Some(path) = &args.results_file {
        summary.write_json(path, &config.batch.api_url)?;
        println!("  Results written to {}", path.display().to_string().cyan());
    }

    Ok(summary.all_passed())
}

fn format_banner(config: &Config, platform: &str, total: usize) -> String {
    let mut out = String::new();
    writeln!(&mut out, "\n{}", "━".repeat(60).dimmed()).unwrap();
    writeln!(&mut out, "{}", "   Reproduction Verification".yellow().bold()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(60).dimmed()).unwrap();
    writeln!(&mut out, "  Platform:     {}", platform.cyan()).unwrap();
    writeln!(&mut out, "  Image:        {}", config.platform.image.cyan()).unwrap();
    writeln!(&mut out, "  API:          {}", config.batch.api_url.cyan()).unwrap();
    writeln!(&mut out, "  Tasks:        {}", total.to_string().cyan()).unwrap();
    writeln!(
        &mut out,
        "  Concurrency:  {}",
        config.batch.concurrency.max(1).to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Timeout:      {}",
        format!("{}s", config.batch.task_timeout_secs).cyan()
    )
    .unwrap();
    writeln!(&mut out, "{}\n", "━".repeat(60).dimmed()).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_normalize_ids() {
        let ids = normalize_ids(&strings(&[" A ", "", "B", "A", "  ", "C"]));
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_normalize_ids_empty() {
        assert!(normalize_ids(&[]).is_empty());
        assert!(normalize_ids(&strings(&[" "])).is_empty());
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        let args = VerifyArgs {
            latest: Some(3),
            concurrency: Some(2),
            timeout_secs: Some(60),
            insecure_skip_verify: true,
            ..Default::default()
        };
        args.apply(&mut config);
        assert_eq!(config.batch.latest, 3);
        assert_eq!(config.batch.concurrency, 2);
        assert_eq!(config.batch.task_timeout_secs, 60);
        assert!(config.transport.insecure_skip_verify);
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let mut config = Config::default();
        VerifyArgs::default().apply(&mut config);
        assert_eq!(config.batch.concurrency, 8);
        assert_eq!(config.batch.task_timeout_secs, 1800);
        assert!(!config.transport.insecure_skip_verify);
    }

    #[tokio::test]
    async fn test_explicit_ids_skip_listing() {
        let batch = BatchConfig {
            // Unroutable; reaching the network would fail the test.
            api_url: "http://127.0.0.1:1/v1".to_string(),
            ..Default::default()
        };
        let ids = resolve_repro_ids(&strings(&["X", "Y"]), &batch)
            .await
            .unwrap();
        assert_eq!(ids, vec!["X", "Y"]);
    }

    #[test]
    fn test_banner() {
        let banner = format_banner(&Config::default(), "mock", 4);
        assert!(banner.contains("Reproduction Verification"));
        assert!(banner.contains("1800s"));
        assert!(banner.contains("mock"));
    }
}
