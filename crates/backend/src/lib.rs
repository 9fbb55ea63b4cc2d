pub mod actor;
pub mod collect;
pub mod enrichment;
pub mod index;
pub mod mail;
pub mod sink;

mod domain;
pub use domain::{config, document};

pub mod dirs;

mod daemon;
pub use daemon::{Daemon, DaemonError, RuntimeConfig};
