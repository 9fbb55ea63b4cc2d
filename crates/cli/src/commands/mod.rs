//! CLI command implementations

mod config;
mod daemon;
mod scan;
mod watch;

pub use config::cmd_config_show;
pub use daemon::cmd_daemon;
pub use scan::cmd_scan;
pub use watch::cmd_watch;
