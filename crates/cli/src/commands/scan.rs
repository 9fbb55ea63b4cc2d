//! One-shot scan of the local mail index

use anyhow::{Context, Result};
use harvester::{
  RuntimeConfig,
  index::{MailIndexScanner, ScanBatch},
};
use serde::Serialize;

#[derive(Serialize)]
struct ScanReport {
  #[serde(flatten)]
  batch: ScanBatch,
  /// Watermark after `--commit`, absent otherwise
  #[serde(skip_serializing_if = "Option::is_none")]
  committed_watermark: Option<i64>,
}

/// Scan once and print the batch as JSON
pub async fn cmd_scan(runtime: &RuntimeConfig, limit: Option<usize>, commit: bool) -> Result<()> {
  let config = runtime.config.mail_index.clone();
  let limit = limit.unwrap_or(config.scan_limit);

  let report = tokio::task::spawn_blocking(move || -> Result<ScanReport> {
    let accept_filtered = config.accept_filtered;
    let scanner = MailIndexScanner::open(config).context("Failed to open mail index scanner")?;
    let batch = scanner
      .run_incremental_scan(limit)
      .context("Failed to scan mail index")?;

    let committed_watermark = if commit {
      let resolved: Vec<_> = batch.messages.iter().filter(|m| m.file.is_some()).cloned().collect();
      let mut accepted: Vec<i64> = resolved.iter().map(|m| m.record.row_id).collect();
      if accept_filtered {
        accepted.extend(batch.filtered.iter().copied());
      }
      accepted.extend(batch.absent_ids());
      Some(scanner.commit(&accepted, &resolved).context("Failed to commit scan")?)
    } else {
      None
    };

    Ok(ScanReport {
      batch,
      committed_watermark,
    })
  })
  .await
  .context("Scan task failed")??;

  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(())
}
