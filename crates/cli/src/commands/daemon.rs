//! Daemon command

use anyhow::{Context, Result};
use harvester::{Daemon, RuntimeConfig};

/// Run every configured collector until Ctrl-C
pub async fn cmd_daemon(mut runtime: RuntimeConfig, foreground: bool) -> Result<()> {
  runtime.foreground = foreground;
  Daemon::from_runtime_config(runtime)
    .run()
    .await
    .context("Failed to run daemon")?;
  Ok(())
}
