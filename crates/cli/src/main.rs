//! Harvester CLI - collection agent for mail, mail index and watched directories

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvester::RuntimeConfig;

mod commands;
mod logging;

use commands::{cmd_config_show, cmd_daemon, cmd_scan, cmd_watch};
use logging::{init_cli_logging, init_daemon_logging};

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Collect, enrich and hand off mail, indexed messages and watched files")]
#[command(after_help = "\
QUICK START:
  harvester config show           # Effective configuration
  harvester scan                  # One pass over the local mail index
  harvester watch ~/Downloads     # Print file events as JSON lines
  harvester daemon --foreground   # Run every collector until Ctrl-C")]
struct Cli {
  /// Configuration file (default: <config_dir>/config.toml)
  #[arg(long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `harvester config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show current effective configuration
  #[command(long_about = "Show the current effective configuration.\n\n\
    Displays which config file is being used and its contents as TOML.")]
  Show,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the collectors until Ctrl-C
  Daemon {
    /// Log to the console instead of the rolling log file
    #[arg(long)]
    foreground: bool,
  },
  /// Run one incremental scan of the local mail index
  #[command(after_help = "\
Without --commit the watermark is left untouched, so the same rows are
reported again on the next run.")]
  Scan {
    /// Maximum rows to read (default: mail_index.scan_limit)
    #[arg(short, long)]
    limit: Option<usize>,
    /// Advance the watermark past every resolved and filtered row
    #[arg(long)]
    commit: bool,
  },
  /// Watch a directory and print created files as JSON lines
  Watch {
    /// Directory to watch
    dir: PathBuf,
    /// File name pattern
    #[arg(short, long, default_value = "*")]
    glob: String,
  },
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let runtime = RuntimeConfig::load(cli.config).context("Failed to load configuration")?;

  // Keep the guard alive for the whole process so buffered logs are flushed
  let _guard = match &cli.command {
    Commands::Daemon { foreground } => init_daemon_logging(&runtime, *foreground),
    _ => {
      init_cli_logging(&runtime.config.daemon.log_level);
      None
    }
  };

  match cli.command {
    Commands::Daemon { foreground } => cmd_daemon(runtime, foreground).await,
    Commands::Scan { limit, commit } => cmd_scan(&runtime, limit, commit).await,
    Commands::Watch { dir, glob } => cmd_watch(&runtime, dir, glob).await,
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(&runtime),
    },
  }
}
