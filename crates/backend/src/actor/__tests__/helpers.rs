//! Test helpers for actor integration tests.
//!
//! Provides a `ControlledEnricher` whose calls block until the test releases
//! them, document builders, and `WatchTestContext` for directory fixtures.

use std::{
  collections::HashMap,
  path::PathBuf,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use async_trait::async_trait;
use filetime::FileTime;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::{
  domain::document::{CollectorDocument, EnrichedDocument, ImageAttachment, SourceType},
  enrichment::{Enricher, EnrichmentError},
};

/// Enricher whose calls wait until `release(external_id)` is called.
///
/// Documents whose external id starts with `fail` return an error, and ids
/// starting with `panic` panic once released.
#[derive(Default)]
pub struct ControlledEnricher {
  gates: Mutex<HashMap<String, Arc<Notify>>>,
  started: Mutex<Vec<String>>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl ControlledEnricher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn gate(&self, id: &str) -> Arc<Notify> {
    let mut gates = self.gates.lock().expect("gates lock");
    gates.entry(id.to_string()).or_default().clone()
  }

  /// Let the enrichment of `id` finish (stores a permit if it has not started yet)
  pub fn release(&self, id: &str) {
    self.gate(id).notify_one();
  }

  pub fn started(&self) -> Vec<String> {
    self.started.lock().expect("started lock").clone()
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Enricher for ControlledEnricher {
  fn name(&self) -> &str {
    "controlled"
  }

  async fn enrich(&self, document: CollectorDocument) -> Result<EnrichedDocument, EnrichmentError> {
    let id = document.external_id.clone();
    self.started.lock().expect("started lock").push(id.clone());
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);

    self.gate(&id).notified().await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if id.starts_with("fail") {
      return Err(EnrichmentError::Failed(format!("refused {id}")));
    }
    if id.starts_with("panic") {
      panic!("enricher blew up on {id}");
    }
    Ok(EnrichedDocument::unenriched(document))
  }
}

/// Text document without attachments
pub fn text_doc(id: &str) -> CollectorDocument {
  CollectorDocument::new(SourceType::File, id, format!("content of {id}"), id.as_bytes())
}

/// Document with `images` image attachments
pub fn image_doc(id: &str, images: usize) -> CollectorDocument {
  let attachments = (0..images)
    .map(|i| ImageAttachment {
      filename: format!("{id}-{i}.png"),
      mime_type: "image/png".to_string(),
      size: 1024,
      content_id: None,
      path: None,
    })
    .collect();
  text_doc(id).with_images(attachments)
}

/// Temporary directory fixture for watch service tests.
pub struct WatchTestContext {
  pub dir: TempDir,
}

impl WatchTestContext {
  pub fn new() -> Self {
    Self {
      dir: TempDir::new().expect("create watch temp dir"),
    }
  }

  pub fn path(&self, name: &str) -> PathBuf {
    self.dir.path().join(name)
  }

  /// Write a file and return its path
  pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
    let path = self.path(name);
    std::fs::write(&path, content).expect("write file");
    path
  }

  /// Write a file whose mtime lies `secs_ago` seconds in the past
  pub fn write_old_file(&self, name: &str, content: &str, secs_ago: i64) -> PathBuf {
    let path = self.write_file(name, content);
    let now = FileTime::now();
    let old = FileTime::from_unix_time(now.unix_seconds() - secs_ago, 0);
    filetime::set_file_mtime(&path, old).expect("set mtime");
    path
  }
}
