//! Logging setup for CLI commands and the daemon

use harvester::RuntimeConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "harvester.log";

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::level_filters::LevelFilter {
  use tracing::level_filters::LevelFilter;

  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Config level as the default directive, `RUST_LOG` wins when set
fn env_filter(level: &str) -> EnvFilter {
  EnvFilter::builder()
    .with_default_directive(parse_log_level(level).into())
    .from_env_lossy()
}

/// Console logging for one-shot commands (stderr, so stdout stays JSON)
pub fn init_cli_logging(level: &str) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(level))
    .with_writer(std::io::stderr)
    .init();
}

/// Initialize logging for the daemon.
///
/// In foreground mode: console with colors.
/// Otherwise: rolling file in the data directory, no ANSI.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_daemon_logging(runtime: &RuntimeConfig, foreground: bool) -> Option<WorkerGuard> {
  let daemon = &runtime.config.daemon;
  let filter = env_filter(&daemon.log_level);

  if foreground {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let log_dir = &runtime.data_dir;
  if let Err(e) = std::fs::create_dir_all(log_dir) {
    init_cli_logging(&daemon.log_level);
    tracing::warn!(path = %log_dir.display(), err = %e, "Cannot create log directory, logging to console");
    return None;
  }

  let file_appender = match daemon.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(log_dir, LOG_FILE),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
