//! Daemon supervisor wiring collectors into the enrichment pipeline.
//!
//! # Architecture
//!
//! ```text
//! Daemon (Supervisor)
//!   ├── IndexCollector   (local mail index, every scan_interval_secs)
//!   ├── MailCollector    (one per account, every mail_poll_interval_secs)
//!   ├── WatchService     (configured directories, created-callback → consumer task)
//!   └── Pipeline         (EnrichmentScheduler → DocumentSink)
//! ```
//!
//! # Lifecycle
//!
//! 1. Create master `CancellationToken`
//! 2. Build the scheduler and pipeline
//! 3. Open the index scanner (a corrupt state file is fatal)
//! 4. Build one mail client per account (bad credentials skip that account)
//! 5. Register configured watches
//! 6. Run every loop until cancelled
//! 7. Graceful shutdown: stop watches, cancel mail clients and enrichments, join loops

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{StreamExt, future::join_all, stream};
use serde::Serialize;
use tokio::{
  signal,
  sync::mpsc,
  task::JoinHandle,
  time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
  actor::{
    scheduler::{EnrichmentScheduler, SchedulerConfig, SchedulerError},
    watcher::{FileSystemEvent, WatchService, WatchServiceConfig, WatchSpec},
  },
  collect, dirs,
  domain::{
    config::{Config, ConfigError, MailAccountConfig},
    document::CollectorDocument,
  },
  enrichment::{Enricher, PassthroughEnricher},
  index::{MailIndexScanner, ScanError, ScannedMessage},
  mail::{EnvSecretStore, FileSecretStore, LayeredSecretStore, MailClient, MailError, SecretStore},
  sink::{DocumentSink, JsonLinesSink},
};

/// Failed deliveries of one index row before it is committed as skipped
const MAX_INDEX_ATTEMPTS: u32 = 3;

/// Remote message ids remembered between polls
const SEEN_MESSAGE_CAPACITY: u64 = 10_000;

// ============================================================================
// Configuration
// ============================================================================

/// Daemon runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Full configuration
  pub config: Config,
  /// File the configuration was read from (may not exist)
  pub config_path: PathBuf,
  /// Base directory for state, logs and output
  pub data_dir: PathBuf,
  /// Run in foreground mode (console logging)
  pub foreground: bool,
}

impl RuntimeConfig {
  /// Load from `config_path`, or the user config path when `None`
  pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
    let config_path = config_path.unwrap_or_else(Config::user_config_path);
    let config = Config::load(&config_path)?;
    Ok(Self {
      config,
      config_path,
      data_dir: dirs::default_data_dir(),
      foreground: false,
    })
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error(transparent)]
  Scan(#[from] ScanError),

  #[error("Background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

// ============================================================================
// Pipeline
// ============================================================================

/// Scheduler plus sink: the path every collected document takes
#[derive(Clone)]
pub(crate) struct Pipeline {
  scheduler: Arc<EnrichmentScheduler>,
  sink: Arc<dyn DocumentSink>,
}

impl Pipeline {
  pub(crate) fn new(scheduler: Arc<EnrichmentScheduler>, sink: Arc<dyn DocumentSink>) -> Self {
    Self { scheduler, sink }
  }

  /// Enrich and submit one document. Returns whether the sink accepted it.
  pub(crate) async fn process(&self, document: CollectorDocument) -> bool {
    let id = document.external_id.clone();
    match self.scheduler.submit_and_wait(document, id.clone()).await {
      Ok(Some(enriched)) => match self.sink.submit(enriched).await {
        Ok(()) => {
          trace!(document_id = %id, "Document submitted");
          true
        }
        Err(e) => {
          warn!(document_id = %id, err = %e, "Sink rejected document");
          false
        }
      },
      Ok(None) => {
        warn!(document_id = %id, "Enrichment failed or was cancelled");
        false
      }
      Err(SchedulerError::AlreadyQueued(_)) => {
        debug!(document_id = %id, "Document already in flight");
        false
      }
      Err(e) => {
        warn!(document_id = %id, err = %e, "Enrichment result lost");
        false
      }
    }
  }
}

// ============================================================================
// Local mail index
// ============================================================================

/// Outcome of one index cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexCycle {
  pub scanned: usize,
  pub submitted: usize,
  pub skipped: usize,
  pub warnings: usize,
  pub watermark: i64,
}

pub(crate) struct IndexCollector {
  scanner: Arc<MailIndexScanner>,
  pipeline: Pipeline,
  /// Failed deliveries per row above the watermark
  attempts: HashMap<i64, u32>,
  /// Rows above the watermark already accepted by the sink
  delivered: HashSet<i64>,
}

impl IndexCollector {
  pub(crate) fn new(scanner: Arc<MailIndexScanner>, pipeline: Pipeline) -> Self {
    Self {
      scanner,
      pipeline,
      attempts: HashMap::new(),
      delivered: HashSet::new(),
    }
  }

  /// Scan, deliver every resolved message, and commit what was accepted
  pub(crate) async fn run_cycle(&mut self) -> Result<IndexCycle, DaemonError> {
    let limit = self.scanner.config().scan_limit;
    let accept_filtered = self.scanner.config().accept_filtered;
    let scanner = Arc::clone(&self.scanner);
    let batch = tokio::task::spawn_blocking(move || scanner.run_incremental_scan(limit)).await??;

    // Rows held back by an earlier gap are not sent again
    let pending: Vec<&ScannedMessage> = batch
      .messages
      .iter()
      .filter(|m| !self.delivered.contains(&m.record.row_id))
      .collect();
    let results: Vec<bool> = join_all(pending.iter().map(|message| self.deliver(message))).await;
    let newly_delivered: HashSet<i64> = pending
      .iter()
      .zip(results)
      .filter(|(_, ok)| *ok)
      .map(|(m, _)| m.record.row_id)
      .collect();

    let mut cycle = IndexCycle {
      scanned: batch.messages.len() + batch.filtered.len(),
      warnings: batch.warnings.len(),
      ..Default::default()
    };
    let mut accepted_ids = Vec::new();
    let mut accepted_messages = Vec::new();
    for message in &batch.messages {
      let row_id = message.record.row_id;
      if newly_delivered.contains(&row_id) {
        cycle.submitted += 1;
        self.attempts.remove(&row_id);
        self.delivered.insert(row_id);
      } else if self.delivered.contains(&row_id) {
        // delivered in an earlier cycle
      } else {
        let attempts = self.attempts.entry(row_id).or_default();
        *attempts += 1;
        if *attempts < MAX_INDEX_ATTEMPTS {
          continue;
        }
        warn!(row_id, attempts = *attempts, "Giving up on message, committing as skipped");
        self.attempts.remove(&row_id);
        cycle.skipped += 1;
      }
      accepted_ids.push(row_id);
      accepted_messages.push(message.clone());
    }
    if accept_filtered {
      accepted_ids.extend(batch.filtered.iter().copied());
    }
    accepted_ids.extend(batch.absent_ids());

    let scanner = Arc::clone(&self.scanner);
    cycle.watermark =
      tokio::task::spawn_blocking(move || scanner.commit(&accepted_ids, &accepted_messages)).await??;
    self.attempts.retain(|&row_id, _| row_id > cycle.watermark);
    self.delivered.retain(|&row_id| row_id > cycle.watermark);

    if cycle.scanned > 0 {
      info!(
        scanned = cycle.scanned,
        submitted = cycle.submitted,
        skipped = cycle.skipped,
        warnings = cycle.warnings,
        watermark = cycle.watermark,
        "Mail index cycle complete"
      );
    }
    Ok(cycle)
  }

  async fn deliver(&self, message: &ScannedMessage) -> bool {
    let Some(file) = &message.file else {
      return false;
    };
    let bytes = match tokio::fs::read(&file.path).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(row_id = message.record.row_id, path = %file.path.display(), err = %e, "Failed to read message file");
        return false;
      }
    };
    self
      .pipeline
      .process(collect::document_from_index(message, &bytes))
      .await
  }

  async fn run(mut self, period: Duration, cancel: CancellationToken) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
          biased;

          _ = cancel.cancelled() => {
              debug!("Mail index collector shutting down");
              break;
          }

          _ = timer.tick() => {
              if let Err(e) = self.run_cycle().await {
                  error!(err = %e, "Mail index cycle failed");
              }
          }
      }
    }
  }
}

// ============================================================================
// Remote mailboxes
// ============================================================================

pub(crate) struct MailCollector {
  client: Arc<MailClient>,
  folders: Vec<String>,
  lookback: chrono::Duration,
  pipeline: Pipeline,
  seen: moka::future::Cache<String, ()>,
}

impl MailCollector {
  pub(crate) fn new(client: Arc<MailClient>, config: &MailAccountConfig, pipeline: Pipeline) -> Self {
    let lookback_days = config.lookback_days.max(1);
    Self {
      client,
      folders: config.folders.clone(),
      lookback: chrono::Duration::days(lookback_days),
      pipeline,
      seen: moka::future::Cache::builder()
        .max_capacity(SEEN_MESSAGE_CAPACITY)
        .time_to_live(Duration::from_secs(lookback_days as u64 * 86_400 + 86_400))
        .build(),
    }
  }

  /// Search every folder and deliver messages not delivered before.
  ///
  /// Returns the number of documents the sink accepted.
  pub(crate) async fn poll(&self) -> usize {
    let until = Utc::now();
    let since = until - self.lookback;
    let mut submitted = 0;
    for folder in &self.folders {
      match self.poll_folder(folder, since, until).await {
        Ok(count) => submitted += count,
        Err(MailError::Cancelled) => break,
        // Already logged with provider detail by the client
        Err(e) => debug!(account = %self.client.account(), folder, err = %e, "Folder poll failed"),
      }
    }
    submitted
  }

  async fn poll_folder(&self, folder: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<usize, MailError> {
    let account = self.client.account();
    let ids = self.client.search_messages(folder, since, until).await?;
    let fresh: Vec<_> = ids
      .into_iter()
      .filter(|id| !self.seen.contains_key(&seen_key(folder, *id)))
      .collect();
    if fresh.is_empty() {
      return Ok(0);
    }
    debug!(account = %account, folder, count = fresh.len(), "Fetching new messages");

    let results: Vec<bool> = stream::iter(fresh)
      .map(|id| async move {
        let raw = match self.client.fetch_message(folder, id).await {
          Ok(raw) => raw,
          Err(_) => return false,
        };
        let document = collect::document_from_remote(account, folder, id, &raw);
        let ok = self.pipeline.process(document).await;
        if ok {
          self.seen.insert(seen_key(folder, id), ()).await;
        }
        ok
      })
      .buffer_unordered(self.client.fetch_concurrency())
      .collect()
      .await;

    Ok(results.into_iter().filter(|ok| *ok).count())
  }

  async fn run(self, period: Duration, cancel: CancellationToken) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
          biased;

          _ = cancel.cancelled() => {
              debug!(account = %self.client.account(), "Mail collector shutting down");
              break;
          }

          _ = timer.tick() => {
              let submitted = self.poll().await;
              if submitted > 0 {
                  info!(account = %self.client.account(), submitted, "Mail poll complete");
              }
          }
      }
    }
  }
}

fn seen_key(folder: &str, id: u32) -> String {
  format!("{folder}:{id}")
}

// ============================================================================
// Watched directories
// ============================================================================

/// Turn a created-file event into a document and push it through the pipeline
pub(crate) async fn deliver_file_event(event: &FileSystemEvent, pipeline: &Pipeline) -> bool {
  let bytes = match tokio::fs::read(&event.path).await {
    Ok(bytes) => bytes,
    Err(e) => {
      warn!(watch_id = %event.watch_id, path = %event.path.display(), err = %e, "Failed to read watched file");
      return false;
    }
  };
  let modified = modified_at(&event.path).await;
  pipeline
    .process(collect::document_from_file(&event.path, &bytes, modified))
    .await
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
  let metadata = tokio::fs::metadata(path).await.ok()?;
  metadata.modified().ok().map(DateTime::<Utc>::from)
}

/// Route created events from the watch service to a consumer task
pub(crate) fn spawn_watch_consumer(
  watch: Arc<WatchService>,
  pipeline: Pipeline,
  cancel: CancellationToken,
) -> JoinHandle<()> {
  let (tx, mut rx) = mpsc::unbounded_channel::<FileSystemEvent>();
  watch.set_created_callback(move |event| {
    let _ = tx.send(event.clone());
  });

  tokio::spawn(async move {
    loop {
      let event = tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          event = rx.recv() => match event {
              Some(event) => event,
              None => break,
          },
      };
      if deliver_file_event(&event, &pipeline).await {
        watch.acknowledge_events(std::slice::from_ref(&event.id));
      }
    }
    debug!("Watch consumer shutting down");
  })
}

// ============================================================================
// Daemon
// ============================================================================

/// The Harvester daemon: supervises every collector until cancelled.
pub struct Daemon {
  runtime_config: RuntimeConfig,
  enricher: Arc<dyn Enricher>,
  sink: Arc<dyn DocumentSink>,
  secrets: Arc<dyn SecretStore>,
}

impl Daemon {
  pub fn new(
    runtime_config: RuntimeConfig,
    enricher: Arc<dyn Enricher>,
    sink: Arc<dyn DocumentSink>,
    secrets: Arc<dyn SecretStore>,
  ) -> Self {
    Self {
      runtime_config,
      enricher,
      sink,
      secrets,
    }
  }

  /// Daemon with the passthrough enricher, the configured JSON-lines sink,
  /// and secrets from the secrets directory falling back to the environment.
  pub fn from_runtime_config(runtime_config: RuntimeConfig) -> Self {
    let config = &runtime_config.config;
    let sink = Arc::new(JsonLinesSink::new(config.sink.path.clone()));
    let secrets = Arc::new(LayeredSecretStore::new(vec![
      Box::new(FileSecretStore::new(config.secrets.directory.clone())),
      Box::new(EnvSecretStore::default()),
    ]));
    Self::new(runtime_config, Arc::new(PassthroughEnricher), sink, secrets)
  }

  /// Run until Ctrl-C
  pub async fn run(self) -> Result<(), DaemonError> {
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = signal::ctrl_c().await {
        warn!(err = %e, "Failed to listen for ctrl-c");
        return;
      }
      info!("Received ctrl-c, shutting down...");
      cancel_for_signal.cancel();
    });

    self.run_until(cancel).await
  }

  /// Run until `cancel` fires
  pub async fn run_until(self, cancel: CancellationToken) -> Result<(), DaemonError> {
    let config = &self.runtime_config.config;
    info!(
      config = %self.runtime_config.config_path.display(),
      data_dir = %self.runtime_config.data_dir.display(),
      enricher = self.enricher.name(),
      "Starting Harvester daemon"
    );

    let scheduler = Arc::new(EnrichmentScheduler::new(
      Arc::clone(&self.enricher),
      SchedulerConfig::from(&config.enrichment),
    ));
    let pipeline = Pipeline::new(Arc::clone(&scheduler), Arc::clone(&self.sink));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.mail_index.enabled {
      let mail_index = config.mail_index.clone();
      let scanner = tokio::task::spawn_blocking(move || MailIndexScanner::open(mail_index)).await??;
      let collector = IndexCollector::new(Arc::new(scanner), pipeline.clone());
      let period = Duration::from_secs(config.daemon.scan_interval_secs.max(1));
      tasks.push(tokio::spawn(collector.run(period, cancel.child_token())));
    }

    let mut clients = Vec::new();
    for account in &config.accounts {
      let client = match MailClient::new(account, self.secrets.as_ref()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
          error!(account = %account.id, err = %e, "Skipping mail account");
          continue;
        }
      };
      clients.push(Arc::clone(&client));
      let collector = MailCollector::new(client, account, pipeline.clone());
      let period = Duration::from_secs(config.daemon.mail_poll_interval_secs.max(1));
      tasks.push(tokio::spawn(collector.run(period, cancel.child_token())));
    }

    let watch = Arc::new(WatchService::new(WatchServiceConfig::from(&config.watch)));
    for directory in &config.watch.directories {
      if let Err(e) = watch.add_watch(WatchSpec::from(directory)) {
        warn!(watch_id = %directory.id, path = %directory.path.display(), err = %e, "Skipping watch");
      }
    }
    tasks.push(spawn_watch_consumer(Arc::clone(&watch), pipeline.clone(), cancel.child_token()));

    info!(
      mail_index = config.mail_index.enabled,
      accounts = clients.len(),
      watches = watch.list_watches().len(),
      "Daemon running"
    );

    cancel.cancelled().await;

    info!("Shutting down...");
    watch.stop();
    for client in &clients {
      client.cancel();
    }
    scheduler.cancel_all();

    for result in join_all(tasks).await {
      if let Err(e) = result {
        warn!(err = %e, "Collector task ended abnormally");
      }
    }

    info!("Daemon shutdown complete");
    Ok(())
  }
}
