//! Watch command: print created files as JSON lines

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use harvester::{
  RuntimeConfig,
  actor::{WatchService, WatchServiceConfig, WatchSpec},
};
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Watch `dir` until Ctrl-C
pub async fn cmd_watch(runtime: &RuntimeConfig, dir: PathBuf, glob: String) -> Result<()> {
  let service = WatchService::new(WatchServiceConfig::from(&runtime.config.watch));
  let descriptor = service
    .add_watch(WatchSpec::new("cli", dir, glob))
    .context("Failed to watch directory")?;
  info!(path = %descriptor.path.display(), glob = %descriptor.glob, "Watching");

  let mut timer = interval(POLL_INTERVAL);
  timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

  loop {
    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => break,

        _ = timer.tick() => {
            let events = service.poll_events(usize::MAX, None);
            if events.is_empty() {
                continue;
            }
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            let ids: Vec<String> = events.into_iter().map(|e| e.id).collect();
            service.acknowledge_events(&ids);
        }
    }
  }

  service.stop();
  Ok(())
}
