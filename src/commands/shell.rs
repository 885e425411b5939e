//! Interactive shell inside a single sandbox.
//!
//! The sandbox is terminated however the session ends: `exit`, EOF,
//! Ctrl-C, an error, or a panic.

use anyhow::{Context, Result};
use colored::Colorize;
use futures_util::{FutureExt, StreamExt};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::runner::verification_env;
use crate::sandbox::{OutputStream, SandboxHandle, SandboxPlatform, SandboxSpec};

const PROMPT: &str = "sandbox$ ";

/// What to do with one line of input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ShellInput<'a> {
    Skip,
    Exit,
    Run(&'a str),
}

pub(crate) fn parse_input(line: &str) -> ShellInput<'_> {
    match line.trim() {
        "" => ShellInput::Skip,
        "exit" | "quit" => ShellInput::Exit,
        command => ShellInput::Run(command),
    }
}

/// Runs `line` under `bash -c`, streaming its output, and returns the exit code.
async fn run_command(
    platform: &dyn SandboxPlatform,
    sandbox: &SandboxHandle,
    line: &str,
) -> Result<i64> {
    let argv = ["bash".to_string(), "-c".to_string(), line.to_string()];
    let mut session = platform.exec(sandbox, &argv).await?;

    while let Some(chunk) = session.output.next().await {
        let chunk = chunk?;
        match chunk.stream {
            OutputStream::Stdout => {
                print!("{}", chunk.text);
                std::io::stdout().flush().ok();
            }
            OutputStream::Stderr => eprint!("{}", chunk.text),
        }
    }

    Ok(platform.wait(&session.id).await?)
}

/// Reads commands from `input` until `exit`, EOF, or Ctrl-C.
///
/// A failed command is reported and the session carries on.
pub(crate) async fn interact<R>(
    platform: &dyn SandboxPlatform,
    sandbox: &SandboxHandle,
    input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        print!("{PROMPT}");
        std::io::stdout().flush().context("Failed to write prompt")?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        let command = match parse_input(&line) {
            ShellInput::Skip => continue,
            ShellInput::Exit => return Ok(()),
            ShellInput::Run(command) => command,
        };

        debug!("Running in sandbox: {}", command);
        tokio::select! {
            outcome = run_command(platform, sandbox, command) => match outcome {
                Ok(0) => {}
                Ok(code) => println!("{}", format!("(exit code: {code})").dimmed()),
                Err(e) => eprintln!("{} {:#}", "Error:".red(), e),
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
        }
    }
}

/// Entry point: opens a sandbox and hands the terminal to it.
pub async fn run(repro_id: Option<String>) -> Result<()> {
    let credentials = Credentials::from_env()?;
    let config = super::load_config()?;

    let factory = super::channel_factory(&config)?;
    let platform = super::connect_platform(Some(&credentials), factory).await?;
    let (app, image) = super::prepare(&platform, &config).await?;

    let spec = SandboxSpec {
        app,
        image,
        timeout: config.platform.sandbox_timeout(),
        env: verification_env(
            &config.batch.api_url,
            repro_id.as_deref(),
            &config.batch.results_dir,
        ),
        memory: Some(config.platform.memory.clone()).filter(|m| !m.trim().is_empty()),
    };
    let sandbox = platform.create_sandbox(&spec).await?;

    println!(
        "\n{} Sandbox {} ready. Type {} or press Ctrl-D to leave.",
        "✓".green(),
        sandbox.id.get(..12).unwrap_or(&sandbox.id).cyan(),
        "exit".bold()
    );
    if let Some(id) = &repro_id {
        println!("  REPRO_ID={}", id.cyan());
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let outcome = AssertUnwindSafe(interact(&platform, &sandbox, stdin))
        .catch_unwind()
        .await;

    if let Err(e) = platform.terminate(&sandbox).await {
        warn!("Failed to terminate sandbox {}: {}", sandbox.id, e);
    } else {
        println!("{} Sandbox terminated.", "✓".green());
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
