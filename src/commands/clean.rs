//! Remove sandboxes left behind by interrupted runs.
//!
//! Formatting is pure. IO happens only at the top level.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use crate::config::Credentials;
use crate::sandbox::{AppHandle, SandboxPlatform};

/// Removes every orphaned sandbox under `app`.
pub(crate) async fn clean_orphans(platform: &dyn SandboxPlatform, app: &str) -> Result<u32> {
    let app: AppHandle = platform.lookup_app(app).await?;
    Ok(platform.cleanup_orphaned(&app).await?)
}

/// Format the clean results as a displayable string
pub fn format_results(app: &str, removed: u32) -> String {
    let mut out = String::new();
    if removed == 0 {
        writeln!(
            &mut out,
            "\n{} No orphaned sandboxes found for {}.",
            "ℹ".blue(),
            app.cyan()
        )
        .unwrap();
    } else {
        let noun = if removed == 1 { "sandbox" } else { "sandboxes" };
        writeln!(
            &mut out,
            "\n{} Removed {} orphaned {} for {}.",
            "✓".green(),
            removed,
            noun,
            app.cyan()
        )
        .unwrap();
    }
    out
}

/// Entry point: cleans the configured app grouping
pub async fn run() -> Result<()> {
    let config = super::load_config()?;
    // Listing and removing needs no registry access.
    let credentials = Credentials::from_env().ok();
    let factory = super::channel_factory(&config)?;
    let platform = super::connect_platform(credentials.as_ref(), factory).await?;

    let removed = clean_orphans(&platform, &config.platform.app_name).await?;
    print!("{}", format_results(&config.platform.app_name, removed));
    Ok(())
}
