//! Persisted scanner state: the watermark plus the resolved-file cache.
//!
//! Written atomically (temp file, fsync, rename) so a crash mid-write leaves
//! the previous state intact. A missing file is a fresh start.

use std::{
  collections::BTreeMap,
  ffi::OsString,
  fs::File,
  io::Write,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A message's on-disk content file, as last resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
  pub path: PathBuf,
  pub inode: u64,
  /// Modification time, seconds since the Unix epoch
  pub mtime: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
  #[error("Failed to read scanner state {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to write scanner state {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Scanner state {path} is corrupt: {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("Failed to encode scanner state: {0}")]
  Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerState {
  /// Highest contiguously accepted row id
  pub last_row_id: i64,

  /// Resolved files keyed by row id
  #[serde(default)]
  pub cache: BTreeMap<i64, ResolvedFile>,
}

impl ScannerState {
  pub fn load(path: &Path) -> Result<Self, StateError> {
    let bytes = match std::fs::read(path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "No scanner state, starting fresh");
        return Ok(Self::default());
      }
      Err(source) => {
        return Err(StateError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn save(&self, path: &Path) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(self).map_err(StateError::Encode)?;
    let write_err = |source| StateError::Write {
      path: path.to_path_buf(),
      source,
    };

    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp).map_err(write_err)?;
    file.write_all(&bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
  }

  /// Drop the lowest row ids until at most `capacity` entries remain
  pub fn trim_cache(&mut self, capacity: usize) {
    while self.cache.len() > capacity {
      self.cache.pop_first();
    }
  }
}
