//! Error taxonomy for remote mailbox access.
//!
//! [`ProviderError`] is what the protocol layer reports; [`MailError`] is what
//! callers of [`super::MailClient`] see. Search and fetch failures wrap the
//! provider error so its code and domain stay available for diagnostics.

use std::fmt;

use serde::Serialize;

use super::secret::SecretError;

/// Error domain reported with every provider error
pub const PROVIDER_DOMAIN: &str = "imap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
  Network,
  Connection,
  TlsNegotiation,
  Certificate,
  Parse,
  Authentication,
  ProtocolDisabled,
  Throttled,
  Fetch,
  Idle,
  Noop,
  Identity,
  NoSuchFolder,
  Other,
}

impl ProviderErrorKind {
  /// Stable numeric code, logged alongside the domain
  pub fn code(self) -> i32 {
    match self {
      Self::Network => 1,
      Self::Connection => 2,
      Self::TlsNegotiation => 3,
      Self::Certificate => 4,
      Self::Parse => 5,
      Self::Authentication => 6,
      Self::ProtocolDisabled => 7,
      Self::Throttled => 8,
      Self::Fetch => 9,
      Self::Idle => 10,
      Self::Noop => 11,
      Self::Identity => 12,
      Self::NoSuchFolder => 13,
      Self::Other => 99,
    }
  }

  /// Whether an operation failing with this kind may succeed on retry.
  ///
  /// Authentication and disabled-protocol failures need operator action.
  pub fn is_transient(self) -> bool {
    matches!(
      self,
      Self::Network
        | Self::Connection
        | Self::TlsNegotiation
        | Self::Certificate
        | Self::Parse
        | Self::Throttled
        | Self::Fetch
        | Self::Idle
        | Self::Noop
        | Self::Identity
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Connection => "connection",
      Self::TlsNegotiation => "tls_negotiation",
      Self::Certificate => "certificate",
      Self::Parse => "parse",
      Self::Authentication => "authentication",
      Self::ProtocolDisabled => "protocol_disabled",
      Self::Throttled => "throttled",
      Self::Fetch => "fetch",
      Self::Idle => "idle",
      Self::Noop => "noop",
      Self::Identity => "identity",
      Self::NoSuchFolder => "no_such_folder",
      Self::Other => "other",
    }
  }
}

impl fmt::Display for ProviderErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A classified failure from the mail provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{domain} error {code} ({kind}): {message}")]
pub struct ProviderError {
  pub kind: ProviderErrorKind,
  pub code: i32,
  pub domain: &'static str,
  pub message: String,
}

impl ProviderError {
  pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      code: kind.code(),
      domain: PROVIDER_DOMAIN,
      message: message.into(),
    }
  }

  pub fn is_transient(&self) -> bool {
    self.kind.is_transient()
  }
}

/// Errors returned by [`super::MailClient`]
#[derive(Debug, thiserror::Error)]
pub enum MailError {
  #[error("Invalid credentials for account {account}: {reason}")]
  InvalidCredentials {
    account: String,
    reason: String,
    #[source]
    source: Option<SecretError>,
  },

  #[error("Unsupported auth mode for account {account}: {reason}")]
  UnsupportedAuth { account: String, reason: String },

  #[error("Search failed in {folder}: {source}")]
  Search {
    folder: String,
    #[source]
    source: ProviderError,
  },

  #[error("Fetch of message {message_id} in {folder} failed: {source}")]
  Fetch {
    folder: String,
    message_id: u32,
    #[source]
    source: ProviderError,
  },

  #[error("Mail operation cancelled")]
  Cancelled,

  #[error("Empty response for message {message_id} in {folder}")]
  EmptyResponse { folder: String, message_id: u32 },
}

impl MailError {
  /// The underlying provider error, for search and fetch failures
  pub fn provider(&self) -> Option<&ProviderError> {
    match self {
      Self::Search { source, .. } | Self::Fetch { source, .. } => Some(source),
      _ => None,
    }
  }
}
