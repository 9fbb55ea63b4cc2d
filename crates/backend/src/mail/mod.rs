//! Remote mailbox access
//!
//! One [`MailClient`] per account. Credentials are resolved once at
//! construction through a [`SecretStore`], so a bad reference surfaces as a
//! configuration error rather than a later authentication failure.
//!
//! # Concurrency
//!
//! Fetches hold a permit from a per-account semaphore sized to
//! `fetch_concurrency` for the whole round-trip, retries included. The permit
//! is released on every exit path, cancellation included. Searches are not
//! limited.
//!
//! # Retries
//!
//! Both operations retry transient provider errors with exponential backoff
//! (see [`retry::RetryConfig`]). Authentication and disabled-protocol errors
//! surface on the first attempt.

pub mod error;
pub mod imap;
pub mod retry;
pub mod secret;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use error::{MailError, PROVIDER_DOMAIN, ProviderError, ProviderErrorKind};
pub use imap::{ImapSettings, ImapTransport};
pub use retry::RetryConfig;
pub use secret::{EnvSecretStore, FileSecretStore, LayeredSecretStore, MemorySecretStore, SecretError, SecretStore};

use crate::domain::config::{AuthMode, MailAccountConfig, SecurityMode};

/// Message identifier within a folder (IMAP UID)
pub type MessageId = u32;

// ============================================================================
// Credentials
// ============================================================================

/// Resolved account credentials
#[derive(Clone)]
pub struct Credentials {
  pub username: String,
  pub auth: AuthMode,
  secret: String,
}

impl Credentials {
  pub fn new(username: impl Into<String>, auth: AuthMode, secret: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      auth,
      secret: secret.into(),
    }
  }

  /// Password or OAuth2 access token, depending on `auth`
  pub fn secret(&self) -> &str {
    &self.secret
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("auth", &self.auth)
      .field("secret", &"<redacted>")
      .finish()
  }
}

/// Resolve and validate an account's credentials
pub fn resolve_credentials(config: &MailAccountConfig, secrets: &dyn SecretStore) -> Result<Credentials, MailError> {
  let invalid = |reason: &str, source: Option<SecretError>| MailError::InvalidCredentials {
    account: config.id.clone(),
    reason: reason.to_string(),
    source,
  };

  if config.auth == AuthMode::OAuth2 && config.security == SecurityMode::Plain {
    return Err(MailError::UnsupportedAuth {
      account: config.id.clone(),
      reason: "OAuth2 tokens are never sent over an unencrypted connection".to_string(),
    });
  }
  if config.username.trim().is_empty() {
    return Err(invalid("username is empty", None));
  }

  let bytes = secrets
    .resolve(&config.secret_ref)
    .map_err(|e| invalid("secret could not be resolved", Some(e)))?;
  let secret = String::from_utf8(bytes).map_err(|_| invalid("secret is not valid UTF-8", None))?;
  if secret.is_empty() {
    return Err(invalid("secret is empty", None));
  }

  Ok(Credentials::new(config.username.clone(), config.auth, secret))
}

// ============================================================================
// Transport
// ============================================================================

/// Protocol seam beneath [`MailClient`]
#[async_trait]
pub trait MailTransport: Send + Sync {
  /// Ids of messages received in `[since, until]`, in any order
  async fn search(&self, folder: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<MessageId>, ProviderError>;

  /// Raw RFC 822 bytes of one message; empty if the server returned no body
  async fn fetch(&self, folder: &str, id: MessageId) -> Result<Vec<u8>, ProviderError>;
}

// ============================================================================
// MailClient
// ============================================================================

pub struct MailClient {
  account: String,
  transport: Arc<dyn MailTransport>,
  fetch_permits: Arc<Semaphore>,
  fetch_concurrency: usize,
  retry: RetryConfig,
  cancel: CancellationToken,
}

impl MailClient {
  /// Build a client for an account, resolving its credentials immediately
  pub fn new(config: &MailAccountConfig, secrets: &dyn SecretStore) -> Result<Self, MailError> {
    let credentials = match resolve_credentials(config, secrets) {
      Ok(credentials) => credentials,
      Err(e) => {
        error!(account = %config.id, err = %e, "Mail account credentials unusable");
        return Err(e);
      }
    };

    let settings = ImapSettings {
      hostname: config.hostname.clone(),
      port: config.port,
      security: config.security,
      timeout: Duration::from_secs(config.timeout_secs.max(1)),
      max_idle_connections: config.fetch_concurrency.max(1),
    };
    let transport = ImapTransport::new(settings, credentials);
    Ok(Self::with_transport(config.id.clone(), Arc::new(transport), config.fetch_concurrency))
  }

  pub fn with_transport(account: impl Into<String>, transport: Arc<dyn MailTransport>, fetch_concurrency: usize) -> Self {
    let fetch_concurrency = fetch_concurrency.max(1);
    Self {
      account: account.into(),
      transport,
      fetch_permits: Arc::new(Semaphore::new(fetch_concurrency)),
      fetch_concurrency,
      retry: RetryConfig::default(),
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_retry(mut self, retry: RetryConfig) -> Self {
    self.retry = retry;
    self
  }

  pub fn account(&self) -> &str {
    &self.account
  }

  /// Ids of messages received in `[since, until]`, most recent first
  pub async fn search_messages(
    &self,
    folder: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
  ) -> Result<Vec<MessageId>, MailError> {
    let search = retry::retry_transient(&self.retry, "search", move |_| self.transport.search(folder, since, until));

    let result = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return Err(MailError::Cancelled),
        result = search => result,
    };

    match result {
      Ok(mut ids) => {
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        debug!(account = %self.account, folder, count = ids.len(), "Search complete");
        Ok(ids)
      }
      Err(source) => {
        warn!(
          account = %self.account,
          folder,
          domain = source.domain,
          code = source.code,
          err = %source,
          "Search failed"
        );
        Err(MailError::Search {
          folder: folder.to_string(),
          source,
        })
      }
    }
  }

  /// Raw bytes of one message
  pub async fn fetch_message(&self, folder: &str, id: MessageId) -> Result<Vec<u8>, MailError> {
    let _permit = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return Err(MailError::Cancelled),
        permit = Arc::clone(&self.fetch_permits).acquire_owned() => {
            permit.map_err(|_| MailError::Cancelled)?
        }
    };

    let fetch = retry::retry_transient(&self.retry, "fetch", move |_| self.transport.fetch(folder, id));
    let result = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return Err(MailError::Cancelled),
        result = fetch => result,
    };

    match result {
      Ok(body) if body.is_empty() => {
        warn!(account = %self.account, folder, message_id = id, "Server returned an empty message body");
        Err(MailError::EmptyResponse {
          folder: folder.to_string(),
          message_id: id,
        })
      }
      Ok(body) => Ok(body),
      Err(source) => {
        warn!(
          account = %self.account,
          folder,
          message_id = id,
          domain = source.domain,
          code = source.code,
          err = %source,
          "Fetch failed"
        );
        Err(MailError::Fetch {
          folder: folder.to_string(),
          message_id: id,
          source,
        })
      }
    }
  }

  /// Cancel every in-flight and future operation of this client
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Permits not currently held by a fetch
  pub fn available_fetch_permits(&self) -> usize {
    self.fetch_permits.available_permits()
  }

  pub fn fetch_concurrency(&self) -> usize {
    self.fetch_concurrency
  }
}

impl fmt::Debug for MailClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MailClient")
      .field("account", &self.account)
      .field("fetch_concurrency", &self.fetch_concurrency)
      .field("available_permits", &self.fetch_permits.available_permits())
      .finish()
  }
}
