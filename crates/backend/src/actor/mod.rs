//! Long-running concurrency components
//!
//! - [`EnrichmentScheduler`]: two-pool admission control for enrichment work
//! - [`WatchService`]: debounced directory watches feeding a bounded event queue
//!
//! Both are cheap to share and own their background tasks. Callers interact
//! through `&self` methods; completion is reported through callbacks.

pub mod scheduler;
pub mod watcher;

#[cfg(test)]
pub(crate) mod __tests__;

pub use scheduler::{EnrichmentScheduler, PoolKind, SchedulerConfig, SchedulerError, SchedulerStats};
pub use watcher::{
  FileEventKind, FileSystemEvent, WatchDescriptor, WatchError, WatchService, WatchServiceConfig, WatchSpec, WatchStats,
};
