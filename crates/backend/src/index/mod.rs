//! Local mail index scanner
//!
//! Incrementally reads the mail client's message index, drops mailbox noise,
//! and resolves each remaining message to its on-disk content file.
//!
//! # Watermark
//!
//! The persisted watermark is the highest row id up to which every row has
//! been accepted downstream. [`MailIndexScanner::commit`] only advances it
//! through the contiguous run of accepted ids following it, so a row that was
//! scanned but not accepted is seen again on the next scan. Filtered rows are
//! reported in [`ScanBatch::filtered`]; callers that want the watermark to pass
//! them must include them in the accepted set, and likewise the ids of deleted
//! rows reported by [`ScanBatch::absent_ids`].
//!
//! Scans are synchronous and bounded by `limit`; async callers should run them
//! on a blocking thread.

pub mod query;
pub mod resolve;
pub mod state;

use std::{
  collections::{BTreeMap, BTreeSet},
  path::PathBuf,
  sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use query::MessageRecord;
pub use resolve::ResolveError;
pub use state::{ResolvedFile, ScannerState, StateError};

use crate::domain::config::MailIndexConfig;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
  #[error("Failed to open message index {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: rusqlite::Error,
  },

  #[error("Message index query failed: {0}")]
  Query(#[from] rusqlite::Error),

  #[error(transparent)]
  State(#[from] StateError),
}

/// A message that passed the noise filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedMessage {
  pub record: MessageRecord,
  /// `None` when the content file could not be located
  pub file: Option<ResolvedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
  pub row_id: i64,
  pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanBatch {
  /// Kept rows in ascending row id order, resolved or not
  pub messages: Vec<ScannedMessage>,
  /// One per kept row whose content file could not be located
  pub warnings: Vec<ScanWarning>,
  /// Watermark the scan started from
  pub watermark: i64,
  /// Row ids dropped by the noise filter
  pub filtered: Vec<i64>,
}

impl ScanBatch {
  /// Every row id the scan saw, ascending
  pub fn seen_ids(&self) -> Vec<i64> {
    let mut ids: Vec<i64> = self
      .messages
      .iter()
      .map(|m| m.record.row_id)
      .chain(self.filtered.iter().copied())
      .collect();
    ids.sort_unstable();
    ids
  }

  /// Row ids between the starting watermark and the highest id seen that have
  /// no row in the index (deleted messages). The scan reads rows in ascending
  /// order, so nothing can appear in these gaps later.
  pub fn absent_ids(&self) -> Vec<i64> {
    let seen = self.seen_ids();
    let Some(&max_seen) = seen.last() else {
      return Vec::new();
    };
    let seen: BTreeSet<i64> = seen.into_iter().collect();
    (self.watermark + 1..max_seen)
      .filter(|id| !seen.contains(id))
      .collect()
  }
}

pub struct MailIndexScanner {
  config: MailIndexConfig,
  state: Mutex<ScannerState>,
}

impl MailIndexScanner {
  /// Load persisted state and prepare to scan
  pub fn open(config: MailIndexConfig) -> Result<Self, ScanError> {
    let state = ScannerState::load(&config.state_path)?;
    info!(
      index = %config.index_path.display(),
      watermark = state.last_row_id,
      cached = state.cache.len(),
      "Mail index scanner ready"
    );
    Ok(Self {
      config,
      state: Mutex::new(state),
    })
  }

  fn state(&self) -> MutexGuard<'_, ScannerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn config(&self) -> &MailIndexConfig {
    &self.config
  }

  pub fn watermark(&self) -> i64 {
    self.state().last_row_id
  }

  pub fn cached_files(&self) -> BTreeMap<i64, ResolvedFile> {
    self.state().cache.clone()
  }

  /// Read up to `limit` rows after the watermark, filter noise, and resolve files
  pub fn run_incremental_scan(&self, limit: usize) -> Result<ScanBatch, ScanError> {
    let (watermark, cache) = {
      let state = self.state();
      (state.last_row_id, state.cache.clone())
    };

    let conn = query::open_read_only(&self.config.index_path).map_err(|source| ScanError::Open {
      path: self.config.index_path.clone(),
      source,
    })?;
    let records = query::messages_after(&conn, watermark, limit)?;
    let scanned = records.len();

    let resolver = resolve::Resolver {
      mail_root: &self.config.mail_root,
      hash_buckets: &self.config.hash_buckets,
      walk_entry_limit: self.config.walk_entry_limit,
    };

    let mut batch = ScanBatch {
      watermark,
      ..Default::default()
    };
    for record in records {
      if record.in_noise_mailbox(&self.config.blocked_folder_keywords) && !record.is_vip(self.config.vip_flag_mask) {
        debug!(row_id = record.row_id, mailbox = ?record.mailbox_name(), "Filtered noise mailbox");
        batch.filtered.push(record.row_id);
        continue;
      }

      let file = match resolver.resolve(&record, cache.get(&record.row_id)) {
        Ok(file) => Some(file),
        Err(e) => {
          batch.warnings.push(ScanWarning {
            row_id: record.row_id,
            message: e.to_string(),
          });
          None
        }
      };
      batch.messages.push(ScannedMessage { record, file });
    }

    if !batch.warnings.is_empty() {
      warn!(
        unresolved = batch.warnings.len(),
        mail_root = %self.config.mail_root.display(),
        "Some messages could not be resolved to content files"
      );
    }
    info!(
      scanned,
      kept = batch.messages.len(),
      filtered = batch.filtered.len(),
      warnings = batch.warnings.len(),
      watermark,
      "Mail index scan complete"
    );
    Ok(batch)
  }

  /// Record downstream acceptance and persist the new state.
  ///
  /// Returns the new watermark: the end of the contiguous run of accepted ids
  /// following the current one. Resolved files of `accepted_messages` are
  /// cached, keeping the highest row ids up to the cache capacity.
  pub fn commit(&self, accepted_ids: &[i64], accepted_messages: &[ScannedMessage]) -> Result<i64, ScanError> {
    let accepted: BTreeSet<i64> = accepted_ids.iter().copied().collect();
    let mut state = self.state();

    let mut next = state.clone();
    while accepted.contains(&(next.last_row_id + 1)) {
      next.last_row_id += 1;
    }
    for message in accepted_messages {
      if let Some(file) = &message.file {
        next.cache.insert(message.record.row_id, file.clone());
      }
    }
    next.trim_cache(self.config.cache_capacity);

    next.save(&self.config.state_path)?;
    if next.last_row_id != state.last_row_id {
      debug!(from = state.last_row_id, to = next.last_row_id, "Watermark advanced");
    }
    *state = next;
    Ok(state.last_row_id)
  }
}
