//! WatchService - debounced directory watches feeding a bounded event queue
//!
//! Each registered watch runs its own task that combines a native `notify`
//! subscription with a fallback poll of the same directory. Both triggers run
//! one detection routine, whose findings are debounced per path before being
//! appended to the queue shared by all watches of the service.
//!
//! # Design
//!
//! 1. notify's sync callback uses `try_send` to forward events to a channel
//!    (a full channel drops the event; the fallback poll covers the gap)
//! 2. The watch task lists the directory, applies the glob filter, and treats
//!    any entry modified within the recency window as newly created
//! 3. Detections are debounced per path; repeated triggers inside the window
//!    collapse into one event carrying the latest observed state
//! 4. Settled paths become [`FileSystemEvent`]s in a bounded FIFO that drops
//!    its oldest entry on overflow
//!
//! # Lifecycle
//!
//! A watch runs until `remove_watch`, `stop`, or the service is dropped.
//! Stopping cancels the native subscription, the poll timer, and any pending
//! debounced paths.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  path::{Path, PathBuf},
  sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
  time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use globset::{Glob, GlobMatcher};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::config::{WatchConfig, WatchDirectoryConfig};

// ============================================================================
// Configuration
// ============================================================================

/// Timing and capacity settings for a WatchService
#[derive(Debug, Clone)]
pub struct WatchServiceConfig {
  /// Maximum queued events across all watches
  pub queue_capacity: usize,
  /// Per-path debounce window
  pub debounce: Duration,
  /// Fallback poll interval
  pub poll_interval: Duration,
  /// Files modified within this window count as newly created
  pub recent_window: Duration,
}

impl Default for WatchServiceConfig {
  fn default() -> Self {
    Self::from(&WatchConfig::default())
  }
}

impl From<&WatchConfig> for WatchServiceConfig {
  fn from(config: &WatchConfig) -> Self {
    Self {
      queue_capacity: config.queue_capacity,
      debounce: Duration::from_millis(config.debounce_ms),
      poll_interval: Duration::from_millis(config.poll_interval_ms),
      recent_window: Duration::from_millis(config.recent_window_ms),
    }
  }
}

impl WatchServiceConfig {
  /// How often pending paths are checked for having settled
  fn sweep_interval(&self) -> Duration {
    (self.debounce / 5).max(Duration::from_millis(10))
  }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when registering or removing watches
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
  #[error("Watch path does not exist: {0}")]
  PathNotFound(PathBuf),

  #[error("Watch path is not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("Watch id already registered: {0}")]
  DuplicateId(String),

  #[error("Watch id not registered: {0}")]
  UnknownId(String),

  #[error("Invalid glob {glob:?}: {source}")]
  InvalidGlob {
    glob: String,
    #[source]
    source: globset::Error,
  },

  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

// ============================================================================
// Public Types
// ============================================================================

/// Registration request for one directory watch
#[derive(Debug, Clone)]
pub struct WatchSpec {
  pub id: String,
  pub path: PathBuf,
  pub glob: String,
  pub target: Option<String>,
  pub handoff: Option<String>,
}

impl WatchSpec {
  pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, glob: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      path: path.into(),
      glob: glob.into(),
      target: None,
      handoff: None,
    }
  }

  pub fn target(mut self, target: impl Into<String>) -> Self {
    self.target = Some(target.into());
    self
  }

  pub fn handoff(mut self, handoff: impl Into<String>) -> Self {
    self.handoff = Some(handoff.into());
    self
  }
}

impl From<&WatchDirectoryConfig> for WatchSpec {
  fn from(config: &WatchDirectoryConfig) -> Self {
    Self {
      id: config.id.clone(),
      path: config.path.clone(),
      glob: config.glob.clone(),
      target: config.target.clone(),
      handoff: config.handoff.clone(),
    }
  }
}

/// A registered watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchDescriptor {
  pub id: String,
  pub path: PathBuf,
  pub glob: String,
  pub target: Option<String>,
  pub handoff: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
  Created,
  Modified,
  Deleted,
  Renamed,
}

/// A delivered change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSystemEvent {
  pub id: String,
  pub watch_id: String,
  pub kind: FileEventKind,
  pub path: PathBuf,
  pub timestamp: DateTime<Utc>,
  pub size: u64,
  pub filename: String,
  pub extension: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchStats {
  pub active_watches: usize,
  pub queued_events: usize,
  pub capacity: usize,
  /// Events evicted by overflow since the service started
  pub dropped_events: u64,
}

type CreatedCallback = Box<dyn Fn(&FileSystemEvent) + Send + Sync>;

// ============================================================================
// Event Queue
// ============================================================================

/// Bounded FIFO that favors freshness: overflow evicts the oldest event
#[derive(Debug)]
struct EventQueue {
  events: VecDeque<FileSystemEvent>,
  capacity: usize,
  dropped: u64,
}

impl EventQueue {
  fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      events: VecDeque::with_capacity(capacity.min(1024)),
      capacity,
      dropped: 0,
    }
  }

  /// Append an event, returning the evicted one on overflow
  fn push(&mut self, event: FileSystemEvent) -> Option<FileSystemEvent> {
    let evicted = if self.events.len() >= self.capacity {
      self.dropped += 1;
      self.events.pop_front()
    } else {
      None
    };
    self.events.push_back(event);
    evicted
  }

  fn poll(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<FileSystemEvent> {
    self
      .events
      .iter()
      .filter(|event| since.is_none_or(|since| event.timestamp > since))
      .take(limit)
      .cloned()
      .collect()
  }

  fn acknowledge(&mut self, ids: &[String]) -> usize {
    let before = self.events.len();
    self.events.retain(|event| !ids.contains(&event.id));
    before - self.events.len()
  }

  fn clear(&mut self) -> usize {
    let cleared = self.events.len();
    self.events.clear();
    cleared
  }
}

/// State shared by every watch task of one service
struct Shared {
  queue: Mutex<EventQueue>,
  on_created: OnceLock<CreatedCallback>,
}

impl Shared {
  fn queue(&self) -> MutexGuard<'_, EventQueue> {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn enqueue(&self, event: FileSystemEvent) {
    if let Some(evicted) = self.queue().push(event.clone()) {
      warn!(
        watch_id = %evicted.watch_id,
        path = %evicted.path.display(),
        "Event queue full, dropped oldest event"
      );
    }

    if event.kind == FileEventKind::Created
      && let Some(callback) = self.on_created.get()
    {
      callback(&event);
    }
  }
}

// ============================================================================
// Debouncer
// ============================================================================

/// Observed state of a file, used both as debounce payload and to suppress
/// re-delivery of an unchanged file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileSnapshot {
  pub size: u64,
  pub modified: SystemTime,
}

/// A detection that is being debounced
#[derive(Debug)]
struct PendingChange {
  snapshot: FileSnapshot,
  last_event: Instant,
}

/// Per-path trailing-edge debounce, drained by a periodic sweep
#[derive(Debug)]
pub(crate) struct Debouncer {
  window: Duration,
  pending: HashMap<PathBuf, PendingChange>,
}

impl Debouncer {
  pub(crate) fn new(window: Duration) -> Self {
    Self {
      window,
      pending: HashMap::new(),
    }
  }

  /// Record a trigger; a pending path keeps one entry with the latest snapshot
  pub(crate) fn trigger(&mut self, path: PathBuf, snapshot: FileSnapshot, now: Instant) {
    match self.pending.get_mut(&path) {
      Some(change) => {
        trace!(path = %path.display(), "Coalescing repeated trigger");
        change.snapshot = snapshot;
        change.last_event = now;
      }
      None => {
        self.pending.insert(
          path,
          PendingChange {
            snapshot,
            last_event: now,
          },
        );
      }
    }
  }

  /// Remove and return the paths that have been quiet for a full window
  pub(crate) fn take_settled(&mut self, now: Instant) -> Vec<(PathBuf, FileSnapshot)> {
    let settled: Vec<PathBuf> = self
      .pending
      .iter()
      .filter(|(_, change)| now.duration_since(change.last_event) >= self.window)
      .map(|(path, _)| path.clone())
      .collect();

    settled
      .into_iter()
      .filter_map(|path| self.pending.remove(&path).map(|change| (path, change.snapshot)))
      .collect()
  }

  pub(crate) fn len(&self) -> usize {
    self.pending.len()
  }
}

// ============================================================================
// WatchTask
// ============================================================================

/// Per-watch task: owns the debounce state for one directory
struct WatchTask {
  watch_id: String,
  root: PathBuf,
  matcher: Arc<GlobMatcher>,
  config: WatchServiceConfig,
  shared: Arc<Shared>,
  cancel: CancellationToken,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
  debouncer: Debouncer,
  /// Snapshot of each path's last delivered event
  delivered: HashMap<PathBuf, FileSnapshot>,
}

impl WatchTask {
  async fn run(mut self) {
    debug!(watch_id = %self.watch_id, root = %self.root.display(), "Watch task started");

    let mut poll_timer = tokio::time::interval(self.config.poll_interval);
    poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_timer = tokio::time::interval(self.config.sweep_interval());
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              break;
          }

          event = self.event_rx.recv() => {
              match event {
                  Some(Ok(event)) => {
                      if matches!(event.kind, EventKind::Access(_)) {
                          continue;
                      }
                      trace!(watch_id = %self.watch_id, kind = ?event.kind, "Native change notification");
                      self.detect().await;
                  }
                  Some(Err(e)) => {
                      warn!(watch_id = %self.watch_id, error = %e, "Watcher error");
                  }
                  None => {
                      debug!(watch_id = %self.watch_id, "Native subscription closed");
                      break;
                  }
              }
          }

          _ = poll_timer.tick() => {
              self.detect().await;
          }

          _ = sweep_timer.tick() => {
              self.flush_settled();
          }
      }
    }

    if self.debouncer.len() > 0 {
      debug!(watch_id = %self.watch_id, pending = self.debouncer.len(), "Discarding pending changes on stop");
    }
    debug!(watch_id = %self.watch_id, "Watch task stopped");
  }

  /// Detection routine shared by native notifications and the fallback poll
  async fn detect(&mut self) {
    let root = self.root.clone();
    let matcher = Arc::clone(&self.matcher);
    let files = match tokio::task::spawn_blocking(move || list_matching_files(&root, &matcher)).await {
      Ok(Ok(files)) => files,
      Ok(Err(e)) => {
        warn!(watch_id = %self.watch_id, root = %self.root.display(), error = %e, "Failed to list watched directory");
        return;
      }
      Err(e) => {
        warn!(watch_id = %self.watch_id, error = %e, "Directory listing task failed");
        return;
      }
    };

    let now = Instant::now();
    let wall_now = SystemTime::now();
    let mut seen = HashSet::with_capacity(files.len());

    for (path, snapshot) in files {
      seen.insert(path.clone());

      // Future mtimes (clock skew) count as recent
      let age = wall_now.duration_since(snapshot.modified).unwrap_or(Duration::ZERO);
      if age > self.config.recent_window {
        continue;
      }
      if self.delivered.get(&path) == Some(&snapshot) {
        continue;
      }
      self.debouncer.trigger(path, snapshot, now);
    }

    self.delivered.retain(|path, _| seen.contains(path));
  }

  fn flush_settled(&mut self) {
    let settled = self.debouncer.take_settled(Instant::now());
    if settled.is_empty() {
      return;
    }
    trace!(watch_id = %self.watch_id, count = settled.len(), "Flushing settled changes");

    for (path, snapshot) in settled {
      if !path.exists() {
        trace!(path = %path.display(), "File vanished before delivery");
        continue;
      }
      self.delivered.insert(path.clone(), snapshot);
      let event = build_event(&self.watch_id, path, snapshot.size);
      debug!(watch_id = %self.watch_id, path = %event.path.display(), size = event.size, "File created");
      self.shared.enqueue(event);
    }
  }
}

/// Regular files directly under `root` whose name matches `matcher`
fn list_matching_files(root: &Path, matcher: &GlobMatcher) -> std::io::Result<Vec<(PathBuf, FileSnapshot)>> {
  let mut files = Vec::new();
  for entry in std::fs::read_dir(root)?.flatten() {
    let Ok(metadata) = entry.metadata() else {
      continue;
    };
    if !metadata.is_file() || !matcher.is_match(entry.file_name()) {
      continue;
    }
    let Ok(modified) = metadata.modified() else {
      continue;
    };
    files.push((
      entry.path(),
      FileSnapshot {
        size: metadata.len(),
        modified,
      },
    ));
  }
  Ok(files)
}

fn build_event(watch_id: &str, path: PathBuf, size: u64) -> FileSystemEvent {
  let filename = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();
  let extension = path.extension().map(|ext| ext.to_string_lossy().to_lowercase());
  FileSystemEvent {
    id: uuid::Uuid::now_v7().to_string(),
    watch_id: watch_id.to_string(),
    kind: FileEventKind::Created,
    path,
    timestamp: Utc::now(),
    size,
    filename,
    extension,
  }
}

// ============================================================================
// WatchService
// ============================================================================

struct ActiveWatch {
  descriptor: WatchDescriptor,
  cancel: CancellationToken,
  // The notify watcher must be held to keep the subscription alive
  _watcher: RecommendedWatcher,
  task: JoinHandle<()>,
}

impl ActiveWatch {
  fn shutdown(self) -> WatchDescriptor {
    self.cancel.cancel();
    self.task.abort();
    self.descriptor
  }
}

/// Maintains independent directory watches and a pollable event queue.
///
/// Must be created from within a Tokio runtime.
pub struct WatchService {
  config: WatchServiceConfig,
  shared: Arc<Shared>,
  watches: DashMap<String, ActiveWatch>,
  runtime: Handle,
}

impl WatchService {
  pub fn new(config: WatchServiceConfig) -> Self {
    let shared = Arc::new(Shared {
      queue: Mutex::new(EventQueue::new(config.queue_capacity)),
      on_created: OnceLock::new(),
    });
    Self {
      config,
      shared,
      watches: DashMap::new(),
      runtime: Handle::current(),
    }
  }

  /// Register a directory watch
  pub fn add_watch(&self, spec: WatchSpec) -> Result<WatchDescriptor, WatchError> {
    let glob = if spec.glob.trim().is_empty() {
      "*".to_string()
    } else {
      spec.glob.clone()
    };

    let vacant = match self.watches.entry(spec.id.clone()) {
      Entry::Occupied(_) => return Err(WatchError::DuplicateId(spec.id)),
      Entry::Vacant(vacant) => vacant,
    };

    validate_directory(&spec.path)?;
    let matcher = Glob::new(&glob)
      .map_err(|source| WatchError::InvalidGlob {
        glob: glob.clone(),
        source,
      })?
      .compile_matcher();

    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
    let mut watcher = RecommendedWatcher::new(
      move |res| {
        // Runs on notify's thread; a full channel drops the event
        let _ = event_tx.try_send(res);
      },
      Config::default(),
    )
    .map_err(WatchError::Init)?;
    watcher
      .watch(&spec.path, RecursiveMode::NonRecursive)
      .map_err(WatchError::Watch)?;

    let descriptor = WatchDescriptor {
      id: spec.id.clone(),
      path: spec.path.clone(),
      glob,
      target: spec.target,
      handoff: spec.handoff,
      created_at: Utc::now(),
    };

    let cancel = CancellationToken::new();
    let task = WatchTask {
      watch_id: spec.id,
      root: spec.path,
      matcher: Arc::new(matcher),
      config: self.config.clone(),
      shared: Arc::clone(&self.shared),
      cancel: cancel.clone(),
      event_rx,
      debouncer: Debouncer::new(self.config.debounce),
      delivered: HashMap::new(),
    };
    let task = self.runtime.spawn(task.run());

    info!(watch_id = %descriptor.id, path = %descriptor.path.display(), glob = %descriptor.glob, "Watch added");

    vacant.insert(ActiveWatch {
      descriptor: descriptor.clone(),
      cancel,
      _watcher: watcher,
      task,
    });
    Ok(descriptor)
  }

  /// Remove a watch, cancelling its subscription, poll timer, and pending changes
  pub fn remove_watch(&self, id: &str) -> Result<WatchDescriptor, WatchError> {
    let (_, active) = self
      .watches
      .remove(id)
      .ok_or_else(|| WatchError::UnknownId(id.to_string()))?;
    let descriptor = active.shutdown();
    info!(watch_id = %descriptor.id, "Watch removed");
    Ok(descriptor)
  }

  pub fn list_watches(&self) -> Vec<WatchDescriptor> {
    let mut watches: Vec<WatchDescriptor> = self.watches.iter().map(|w| w.descriptor.clone()).collect();
    watches.sort_by(|a, b| a.id.cmp(&b.id));
    watches
  }

  /// Queued events in enqueue order, newer than `since`, at most `limit`.
  ///
  /// Polling does not consume events; acknowledge them to remove them.
  pub fn poll_events(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<FileSystemEvent> {
    self.shared.queue().poll(limit, since)
  }

  /// Remove events by id, returning how many were removed
  pub fn acknowledge_events(&self, ids: &[String]) -> usize {
    self.shared.queue().acknowledge(ids)
  }

  pub fn clear_events(&self) -> usize {
    self.shared.queue().clear()
  }

  pub fn stats(&self) -> WatchStats {
    let queue = self.shared.queue();
    WatchStats {
      active_watches: self.watches.len(),
      queued_events: queue.events.len(),
      capacity: queue.capacity,
      dropped_events: queue.dropped,
    }
  }

  /// Set the callback invoked for every created event as it is enqueued.
  ///
  /// Can be set once; returns `false` if a callback was already set.
  pub fn set_created_callback<F>(&self, callback: F) -> bool
  where
    F: Fn(&FileSystemEvent) + Send + Sync + 'static,
  {
    self.shared.on_created.set(Box::new(callback)).is_ok()
  }

  /// Stop every watch
  pub fn stop(&self) {
    let ids: Vec<String> = self.watches.iter().map(|w| w.key().clone()).collect();
    for id in ids {
      if let Some((_, active)) = self.watches.remove(&id) {
        active.shutdown();
      }
    }
    debug!("Watch service stopped");
  }
}

impl Drop for WatchService {
  fn drop(&mut self) {
    self.stop();
  }
}

fn validate_directory(path: &Path) -> Result<(), WatchError> {
  if !path.exists() {
    return Err(WatchError::PathNotFound(path.to_path_buf()));
  }
  if !path.is_dir() {
    return Err(WatchError::NotADirectory(path.to_path_buf()));
  }
  Ok(())
}
