//! Configuration for the Harvester daemon.
//!
//! A single TOML file (`<config_dir>/config.toml`). Every section is
//! `#[serde(default)]` so a partial file only overrides what it names.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dirs;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

// ============================================================================
// Daemon Configuration
// ============================================================================

/// Daemon lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  pub log_rotation: String,

  /// Seconds between incremental scans of the local mail index
  pub scan_interval_secs: u64,

  /// Seconds between searches of each remote mailbox
  pub mail_poll_interval_secs: u64,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
      scan_interval_secs: 60,
      mail_poll_interval_secs: 300,
    }
  }
}

// ============================================================================
// Enrichment Configuration
// ============================================================================

/// Enrichment scheduler pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
  /// Capacity of the normal pool (clamped to at least 1)
  pub max_normal_enrichments: usize,

  /// Enable the single-slot pool reserved for documents without image attachments
  pub attachment_free_pool: bool,
}

impl Default for EnrichmentConfig {
  fn default() -> Self {
    Self {
      max_normal_enrichments: num_cpus::get().max(1),
      attachment_free_pool: true,
    }
  }
}

// ============================================================================
// Local Mail Index Configuration
// ============================================================================

/// Local mail index scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailIndexConfig {
  pub enabled: bool,

  /// Path to the message index database
  pub index_path: PathBuf,

  /// Root of the on-disk mail store (one directory per account)
  pub mail_root: PathBuf,

  /// Where the watermark and resolved-file cache are persisted
  pub state_path: PathBuf,

  /// Maximum rows read per incremental scan
  pub scan_limit: usize,

  /// Folder-name keywords that mark a mailbox as noise
  pub blocked_folder_keywords: Vec<String>,

  /// Flag bits that mark a message as VIP (kept regardless of folder)
  pub vip_flag_mask: i64,

  /// Subdirectories of `Data/` probed before falling back to a directory walk
  pub hash_buckets: Vec<String>,

  /// Maximum directory entries inspected by the fallback walk
  pub walk_entry_limit: usize,

  /// Capacity of the resolved-file cache
  pub cache_capacity: usize,

  /// Commit rows dropped by the noise filter as seen, so the watermark can pass them
  pub accept_filtered: bool,
}

impl Default for MailIndexConfig {
  fn default() -> Self {
    let mail_root = dirs::home_dir().join("Library").join("Mail").join("V10");
    Self {
      enabled: false,
      index_path: mail_root.join("MailData").join("Envelope Index"),
      mail_root,
      state_path: dirs::default_data_dir().join("mail_index_state.json"),
      scan_limit: 200,
      blocked_folder_keywords: ["junk", "trash", "spam", "bin", "deleted", "promotions"]
        .into_iter()
        .map(String::from)
        .collect(),
      vip_flag_mask: 1 << 17,
      hash_buckets: (0..10).map(|b| b.to_string()).collect(),
      walk_entry_limit: 200,
      cache_capacity: 500,
      accept_filtered: true,
    }
  }
}

// ============================================================================
// Mail Account Configuration
// ============================================================================

/// Transport security for a mail account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
  /// TLS from the first byte (IMAPS, usually port 993)
  #[default]
  Tls,
  /// Plaintext greeting upgraded with STARTTLS
  StartTls,
  /// No transport security
  Plain,
}

/// How the account authenticates. Both secrets come from the secret store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
  /// App-specific password
  #[default]
  Password,
  /// OAuth2 bearer token (SASL XOAUTH2)
  OAuth2,
}

/// One remote mailbox account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailAccountConfig {
  pub id: String,
  pub hostname: String,
  pub port: u16,
  pub username: String,
  pub security: SecurityMode,
  pub auth: AuthMode,

  /// Opaque reference resolved through the secret store
  pub secret_ref: String,

  pub folders: Vec<String>,

  /// Maximum concurrent fetches (clamped to at least 1)
  pub fetch_concurrency: usize,

  pub timeout_secs: u64,

  /// How far back each poll searches
  pub lookback_days: i64,
}

impl Default for MailAccountConfig {
  fn default() -> Self {
    Self {
      id: String::new(),
      hostname: String::new(),
      port: 993,
      username: String::new(),
      security: SecurityMode::Tls,
      auth: AuthMode::Password,
      secret_ref: String::new(),
      folders: vec!["INBOX".to_string()],
      fetch_concurrency: 4,
      timeout_secs: 30,
      lookback_days: 7,
    }
  }
}

// ============================================================================
// Watch Configuration
// ============================================================================

/// A directory watch registered at daemon startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchDirectoryConfig {
  pub id: String,
  pub path: PathBuf,
  #[serde(default = "default_glob")]
  pub glob: String,
  #[serde(default)]
  pub target: Option<String>,
  #[serde(default)]
  pub handoff: Option<String>,
}

fn default_glob() -> String {
  "*".to_string()
}

/// Filesystem watch service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
  /// Capacity of the shared event queue
  pub queue_capacity: usize,

  /// Per-path debounce window in milliseconds
  pub debounce_ms: u64,

  /// Fallback poll interval in milliseconds
  pub poll_interval_ms: u64,

  /// Files modified within this window count as newly created
  pub recent_window_ms: u64,

  pub directories: Vec<WatchDirectoryConfig>,
}

impl Default for WatchConfig {
  fn default() -> Self {
    Self {
      queue_capacity: 1024,
      debounce_ms: 500,
      poll_interval_ms: 1000,
      recent_window_ms: 2000,
      directories: Vec::new(),
    }
  }
}

// ============================================================================
// Sink / Secrets Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
  /// JSON-lines file that receives enriched documents
  pub path: PathBuf,
}

impl Default for SinkConfig {
  fn default() -> Self {
    Self {
      path: dirs::default_data_dir().join("documents.jsonl"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
  /// Directory holding one file per secret reference
  pub directory: PathBuf,
}

impl Default for SecretsConfig {
  fn default() -> Self {
    Self {
      directory: dirs::default_config_dir().join("secrets"),
    }
  }
}

// ============================================================================
// Root Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub daemon: DaemonConfig,
  pub enrichment: EnrichmentConfig,
  pub mail_index: MailIndexConfig,
  pub accounts: Vec<MailAccountConfig>,
  pub watch: WatchConfig,
  pub sink: SinkConfig,
  pub secrets: SecretsConfig,
}

impl Config {
  /// Default config file location
  pub fn user_config_path() -> PathBuf {
    dirs::default_config_dir().join("config.toml")
  }

  /// Load from an explicit path. A missing file yields defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    if !path.exists() {
      return Ok(Self::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load from the user config path, falling back to defaults
  pub fn load_global() -> Result<Self, ConfigError> {
    Self::load(&Self::user_config_path())
  }

  pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(content)
  }
}
