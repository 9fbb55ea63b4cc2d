//! EnrichmentScheduler - bounded-concurrency enrichment with two worker pools
//!
//! Collectors hand normalized documents to the scheduler, which runs the
//! [`Enricher`] for at most `max_normal_enrichments + 1` documents at once and
//! reports each result through a completion callback.
//!
//! # Pools
//!
//! - **Normal**: `max_normal_enrichments` slots, accepts any document
//! - **Attachment-free**: one slot (optional), only documents without images
//!
//! Documents that find no free slot wait in a FIFO queue. When a slot frees
//! up, that pool is refilled first, then every pool with spare capacity gets
//! a chance to drain the queue further.
//!
//! # Invariants
//!
//! - A document id is tracked at most once (running or waiting)
//! - The completion callback fires exactly once per accepted submission
//! - Pool counters only change inside the state lock; a slot is released by
//!   the task's own completion path, never by `cancel`

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use tokio::{runtime::Handle, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
  domain::{
    config::EnrichmentConfig,
    document::{CollectorDocument, EnrichedDocument},
  },
  enrichment::Enricher,
};

/// Completion callback: `(document_id, enriched)`; `None` on failure or cancellation
pub type CompletionFn = Box<dyn FnOnce(String, Option<EnrichedDocument>) + Send + 'static>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Normal pool capacity (clamped to at least 1)
  pub max_normal_enrichments: usize,
  /// Whether the single attachment-free slot exists
  pub attachment_free_pool: bool,
}

impl From<&EnrichmentConfig> for SchedulerConfig {
  fn from(config: &EnrichmentConfig) -> Self {
    Self {
      max_normal_enrichments: config.max_normal_enrichments,
      attachment_free_pool: config.attachment_free_pool,
    }
  }
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
  Normal,
  AttachmentFree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
  pub active_normal: usize,
  pub active_attachment_free: usize,
  pub waiting: usize,
  pub max_normal: usize,
  pub attachment_free_enabled: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
  #[error("Document {0} is already queued or in flight")]
  AlreadyQueued(String),
  #[error("Document {0} is not queued or in flight")]
  NotTracked(String),
  #[error("Completion for document {0} was dropped")]
  Dropped(String),
}

// ============================================================================
// Internal State
// ============================================================================

struct Job {
  id: String,
  document: CollectorDocument,
  on_complete: CompletionFn,
}

struct Running {
  pool: PoolKind,
  cancel: CancellationToken,
  on_complete: CompletionFn,
}

#[derive(Default)]
struct SchedulerState {
  active_normal: usize,
  active_attachment_free: usize,
  running: HashMap<String, Running>,
  waiting: VecDeque<Job>,
  waiters: HashMap<String, Vec<oneshot::Sender<Option<EnrichedDocument>>>>,
}

impl SchedulerState {
  fn is_tracked(&self, id: &str) -> bool {
    self.running.contains_key(id) || self.waiting.iter().any(|job| job.id == id)
  }

  /// Remove the oldest waiting job that has no image attachments
  fn take_first_attachment_free(&mut self) -> Option<Job> {
    let pos = self.waiting.iter().position(|job| !job.document.has_attachments())?;
    self.waiting.remove(pos)
  }
}

struct Inner {
  enricher: Arc<dyn Enricher>,
  max_normal: usize,
  attachment_free_enabled: bool,
  runtime: Handle,
  state: Mutex<SchedulerState>,
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, SchedulerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn normal_has_capacity(&self, state: &SchedulerState) -> bool {
    state.active_normal < self.max_normal
  }

  fn attachment_free_idle(&self, state: &SchedulerState) -> bool {
    self.attachment_free_enabled && state.active_attachment_free == 0
  }

  /// Pick a pool for a new submission, or `None` to queue it
  fn assign(&self, state: &SchedulerState, document: &CollectorDocument) -> Option<PoolKind> {
    if document.has_attachments() {
      return self.normal_has_capacity(state).then_some(PoolKind::Normal);
    }
    if self.attachment_free_idle(state) {
      Some(PoolKind::AttachmentFree)
    } else if self.normal_has_capacity(state) {
      Some(PoolKind::Normal)
    } else {
      None
    }
  }

  /// Record the job as running in `pool` and spawn its task
  fn start(self: &Arc<Self>, state: &mut SchedulerState, job: Job, pool: PoolKind) {
    match pool {
      PoolKind::Normal => state.active_normal += 1,
      PoolKind::AttachmentFree => state.active_attachment_free += 1,
    }

    let cancel = CancellationToken::new();
    let Job {
      id,
      document,
      on_complete,
    } = job;

    trace!(document_id = %id, pool = ?pool, images = document.images.len(), "Starting enrichment");

    state.running.insert(
      id.clone(),
      Running {
        pool,
        cancel: cancel.clone(),
        on_complete,
      },
    );

    let inner = Arc::clone(self);
    let enricher = Arc::clone(&self.enricher);
    self.runtime.spawn(async move {
      // A nested task so a panicking enricher surfaces as a JoinError
      let work = tokio::spawn(async move { enricher.enrich(document).await });
      let abort = work.abort_handle();

      let result = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          abort.abort();
          debug!(document_id = %id, "Enrichment cancelled");
          None
        }

        joined = work => match joined {
          Ok(Ok(enriched)) => Some(enriched),
          Ok(Err(e)) => {
            warn!(document_id = %id, err = %e, "Enrichment failed");
            None
          }
          Err(e) => {
            warn!(document_id = %id, err = %e, "Enrichment task aborted");
            None
          }
        },
      };

      inner.complete(&id, result);
    });
  }

  /// Completion path: release the slot, refill pools, then notify outside the lock
  fn complete(self: &Arc<Self>, id: &str, result: Option<EnrichedDocument>) {
    let (on_complete, waiters) = {
      let mut state = self.lock();
      let Some(running) = state.running.remove(id) else {
        warn!(document_id = %id, "Completion for untracked document");
        return;
      };
      match running.pool {
        PoolKind::Normal => state.active_normal -= 1,
        PoolKind::AttachmentFree => state.active_attachment_free -= 1,
      }
      self.refill(&mut state, running.pool);
      let waiters = state.waiters.remove(id).unwrap_or_default();
      (running.on_complete, waiters)
    };

    for waiter in waiters {
      let _ = waiter.send(result.clone());
    }
    on_complete(id.to_string(), result);
  }

  /// Refill the freed pool first, then let any pool with spare capacity drain the queue
  fn refill(self: &Arc<Self>, state: &mut SchedulerState, freed: PoolKind) {
    match freed {
      PoolKind::Normal => {
        if self.normal_has_capacity(state)
          && let Some(job) = state.waiting.pop_front()
        {
          self.start(state, job, PoolKind::Normal);
        }
      }
      PoolKind::AttachmentFree => {
        if self.attachment_free_idle(state)
          && let Some(job) = state.take_first_attachment_free()
        {
          self.start(state, job, PoolKind::AttachmentFree);
        }
      }
    }

    loop {
      let mut progressed = false;

      if self.attachment_free_idle(state)
        && let Some(job) = state.take_first_attachment_free()
      {
        self.start(state, job, PoolKind::AttachmentFree);
        progressed = true;
      }

      if self.normal_has_capacity(state)
        && let Some(job) = state.waiting.pop_front()
      {
        self.start(state, job, PoolKind::Normal);
        progressed = true;
      }

      if !progressed {
        break;
      }
    }
  }
}

// ============================================================================
// EnrichmentScheduler
// ============================================================================

/// Throttles how many documents are enriched at once.
///
/// Cheap to clone; all clones share one state. Must be created from within a
/// Tokio runtime, whose handle is used to spawn enrichment tasks.
#[derive(Clone)]
pub struct EnrichmentScheduler {
  inner: Arc<Inner>,
}

impl EnrichmentScheduler {
  pub fn new(enricher: Arc<dyn Enricher>, config: SchedulerConfig) -> Self {
    Self::with_runtime(enricher, config, Handle::current())
  }

  pub fn with_runtime(enricher: Arc<dyn Enricher>, config: SchedulerConfig, runtime: Handle) -> Self {
    let max_normal = config.max_normal_enrichments.max(1);
    debug!(
      enricher = enricher.name(),
      max_normal,
      attachment_free_pool = config.attachment_free_pool,
      "Enrichment scheduler created"
    );
    Self {
      inner: Arc::new(Inner {
        enricher,
        max_normal,
        attachment_free_enabled: config.attachment_free_pool,
        runtime,
        state: Mutex::new(SchedulerState::default()),
      }),
    }
  }

  /// Submit a document for enrichment.
  ///
  /// Returns `false` if `document_id` is already running or waiting; the
  /// callback is then dropped without being called. Otherwise `on_complete`
  /// fires exactly once, from a runtime worker.
  pub fn submit<F>(&self, document: CollectorDocument, document_id: impl Into<String>, on_complete: F) -> bool
  where
    F: FnOnce(String, Option<EnrichedDocument>) + Send + 'static,
  {
    let id = document_id.into();
    let mut state = self.inner.lock();

    if state.is_tracked(&id) {
      debug!(document_id = %id, "Document already queued");
      return false;
    }

    let pool = self.inner.assign(&state, &document);
    let job = Job {
      id,
      document,
      on_complete: Box::new(on_complete),
    };

    match pool {
      Some(pool) => self.inner.start(&mut state, job, pool),
      None => {
        trace!(document_id = %job.id, waiting = state.waiting.len() + 1, "Pools full, queueing");
        state.waiting.push_back(job);
      }
    }
    true
  }

  /// Submit and wait for the result
  pub async fn submit_and_wait(
    &self,
    document: CollectorDocument,
    document_id: impl Into<String>,
  ) -> Result<Option<EnrichedDocument>, SchedulerError> {
    let id = document_id.into();
    let (tx, rx) = oneshot::channel();
    let accepted = self.submit(document, id.clone(), move |_, result| {
      let _ = tx.send(result);
    });
    if !accepted {
      return Err(SchedulerError::AlreadyQueued(id));
    }
    rx.await.map_err(|_| SchedulerError::Dropped(id))
  }

  /// Wait for an already-submitted document to finish
  pub async fn await_result(&self, document_id: &str) -> Result<Option<EnrichedDocument>, SchedulerError> {
    let rx = self.register_waiter(document_id)?;
    rx.await.map_err(|_| SchedulerError::Dropped(document_id.to_string()))
  }

  /// Blocking variant of [`await_result`](Self::await_result) for non-async callers.
  ///
  /// Must not be called from a runtime worker thread.
  pub fn blocking_await_result(&self, document_id: &str) -> Result<Option<EnrichedDocument>, SchedulerError> {
    let rx = self.register_waiter(document_id)?;
    rx.blocking_recv()
      .map_err(|_| SchedulerError::Dropped(document_id.to_string()))
  }

  fn register_waiter(&self, document_id: &str) -> Result<oneshot::Receiver<Option<EnrichedDocument>>, SchedulerError> {
    let mut state = self.inner.lock();
    if !state.is_tracked(document_id) {
      return Err(SchedulerError::NotTracked(document_id.to_string()));
    }
    let (tx, rx) = oneshot::channel();
    state.waiters.entry(document_id.to_string()).or_default().push(tx);
    Ok(rx)
  }

  /// Cancel a document.
  ///
  /// A running task is signalled and keeps its slot until its completion path
  /// runs. A waiting document is dropped from the queue and its callback fires
  /// with `None` right away. Returns `false` if the id is unknown.
  pub fn cancel(&self, document_id: &str) -> bool {
    let removed = {
      let mut state = self.inner.lock();
      if let Some(running) = state.running.get(document_id) {
        running.cancel.cancel();
        return true;
      }
      let Some(pos) = state.waiting.iter().position(|job| job.id == document_id) else {
        return false;
      };
      let job = state.waiting.remove(pos);
      let waiters = state.waiters.remove(document_id).unwrap_or_default();
      job.map(|job| (job, waiters))
    };

    match removed {
      Some((job, waiters)) => {
        debug!(document_id = %job.id, "Removed waiting document");
        for waiter in waiters {
          let _ = waiter.send(None);
        }
        (job.on_complete)(job.id, None);
        true
      }
      None => false,
    }
  }

  /// Cancel every running task and drop every waiting document
  pub fn cancel_all(&self) {
    let ids: Vec<String> = {
      let state = self.inner.lock();
      state
        .running
        .keys()
        .cloned()
        .chain(state.waiting.iter().map(|job| job.id.clone()))
        .collect()
    };
    for id in ids {
      self.cancel(&id);
    }
  }

  pub fn stats(&self) -> SchedulerStats {
    let state = self.inner.lock();
    SchedulerStats {
      active_normal: state.active_normal,
      active_attachment_free: state.active_attachment_free,
      waiting: state.waiting.len(),
      max_normal: self.inner.max_normal,
      attachment_free_enabled: self.inner.attachment_free_enabled,
    }
  }

  /// Pool a running document occupies; `None` if waiting or unknown
  pub fn assigned_pool(&self, document_id: &str) -> Option<PoolKind> {
    self.inner.lock().running.get(document_id).map(|running| running.pool)
  }

  pub fn is_tracked(&self, document_id: &str) -> bool {
    self.inner.lock().is_tracked(document_id)
  }
}

impl std::fmt::Debug for EnrichmentScheduler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EnrichmentScheduler").field("stats", &self.stats()).finish()
  }
}
