//! Downstream destinations for enriched documents.
//!
//! Submission is at-least-once: the index watermark is the only crash
//! checkpoint, so a sink may see the same `external_id` again after a restart
//! and must treat it idempotently.

use std::{
  path::{Path, PathBuf},
  sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::trace;

use crate::domain::document::EnrichedDocument;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
  #[error("Failed to write {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to encode document: {0}")]
  Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
  async fn submit(&self, document: EnrichedDocument) -> Result<(), SinkError>;
}

/// Appends one JSON object per line
pub struct JsonLinesSink {
  path: PathBuf,
  file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      file: tokio::sync::Mutex::new(None),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn io_error(&self, source: std::io::Error) -> SinkError {
    SinkError::Io {
      path: self.path.clone(),
      source,
    }
  }
}

#[async_trait]
impl DocumentSink for JsonLinesSink {
  async fn submit(&self, document: EnrichedDocument) -> Result<(), SinkError> {
    let mut line = serde_json::to_vec(&document)?;
    line.push(b'\n');

    let mut guard = self.file.lock().await;
    if guard.is_none() {
      if let Some(parent) = self.path.parent()
        && !parent.as_os_str().is_empty()
      {
        tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
      }
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&self.path)
        .await
        .map_err(|e| self.io_error(e))?;
      *guard = Some(file);
    }

    if let Some(file) = guard.as_mut() {
      let written = async {
        file.write_all(&line).await?;
        file.flush().await
      }
      .await;
      if let Err(e) = written {
        // Reopen on the next submission
        *guard = None;
        return Err(self.io_error(e));
      }
    }

    trace!(external_id = %document.document.external_id, path = %self.path.display(), "Document written");
    Ok(())
  }
}

/// Keeps submitted documents in memory
#[derive(Debug, Default)]
pub struct MemorySink {
  documents: Mutex<Vec<EnrichedDocument>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn documents(&self) -> Vec<EnrichedDocument> {
    self.documents.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn len(&self) -> usize {
    self.documents.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl DocumentSink for MemorySink {
  async fn submit(&self, document: EnrichedDocument) -> Result<(), SinkError> {
    self
      .documents
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(document);
    Ok(())
  }
}
