//! Secret stores resolving opaque references to credential bytes.
//!
//! Account configuration only ever holds a reference; the password or token
//! itself is looked up once, when the mail client is built.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
  #[error("Invalid secret reference {0:?}")]
  InvalidReference(String),

  #[error("Secret not found: {0}")]
  NotFound(String),

  #[error("Secret backend error for {reference}: {message}")]
  Backend { reference: String, message: String },
}

pub trait SecretStore: Send + Sync {
  fn resolve(&self, reference: &str) -> Result<Vec<u8>, SecretError>;
}

/// References are restricted to a portable, path-safe alphabet
fn validate_reference(reference: &str) -> Result<(), SecretError> {
  let valid = !reference.is_empty()
    && !reference.starts_with('.')
    && reference
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
  if valid {
    Ok(())
  } else {
    Err(SecretError::InvalidReference(reference.to_string()))
  }
}

fn trim_line_ending(mut bytes: Vec<u8>) -> Vec<u8> {
  while matches!(bytes.last(), Some(b'\n' | b'\r')) {
    bytes.pop();
  }
  bytes
}

// ============================================================================
// File store
// ============================================================================

/// One file per reference under a directory
#[derive(Debug, Clone)]
pub struct FileSecretStore {
  directory: PathBuf,
}

impl FileSecretStore {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }
}

impl SecretStore for FileSecretStore {
  fn resolve(&self, reference: &str) -> Result<Vec<u8>, SecretError> {
    validate_reference(reference)?;
    let path = self.directory.join(reference);
    trace!(path = %path.display(), "Resolving file secret");
    match std::fs::read(&path) {
      Ok(bytes) => Ok(trim_line_ending(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SecretError::NotFound(reference.to_string())),
      Err(e) => Err(SecretError::Backend {
        reference: reference.to_string(),
        message: e.to_string(),
      }),
    }
  }
}

// ============================================================================
// Environment store
// ============================================================================

/// Maps `my-account.token` to `<PREFIX>MY_ACCOUNT_TOKEN`
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
  prefix: String,
}

impl EnvSecretStore {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self { prefix: prefix.into() }
  }

  pub fn variable_name(&self, reference: &str) -> String {
    let name: String = reference
      .chars()
      .map(|c| match c {
        '-' | '.' => '_',
        c => c.to_ascii_uppercase(),
      })
      .collect();
    format!("{}{}", self.prefix, name)
  }
}

impl Default for EnvSecretStore {
  fn default() -> Self {
    Self::new("HARVESTER_SECRET_")
  }
}

impl SecretStore for EnvSecretStore {
  fn resolve(&self, reference: &str) -> Result<Vec<u8>, SecretError> {
    validate_reference(reference)?;
    match std::env::var(self.variable_name(reference)) {
      Ok(value) => Ok(value.into_bytes()),
      Err(std::env::VarError::NotPresent) => Err(SecretError::NotFound(reference.to_string())),
      Err(e @ std::env::VarError::NotUnicode(_)) => Err(SecretError::Backend {
        reference: reference.to_string(),
        message: e.to_string(),
      }),
    }
  }
}

// ============================================================================
// In-memory / layered stores
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
  secrets: HashMap<String, Vec<u8>>,
}

impl MemorySecretStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_secret(mut self, reference: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
    self.secrets.insert(reference.into(), secret.into());
    self
  }
}

impl SecretStore for MemorySecretStore {
  fn resolve(&self, reference: &str) -> Result<Vec<u8>, SecretError> {
    validate_reference(reference)?;
    self
      .secrets
      .get(reference)
      .cloned()
      .ok_or_else(|| SecretError::NotFound(reference.to_string()))
  }
}

/// Tries each store in order; only `NotFound` falls through to the next
pub struct LayeredSecretStore {
  stores: Vec<Box<dyn SecretStore>>,
}

impl LayeredSecretStore {
  pub fn new(stores: Vec<Box<dyn SecretStore>>) -> Self {
    Self { stores }
  }
}

impl SecretStore for LayeredSecretStore {
  fn resolve(&self, reference: &str) -> Result<Vec<u8>, SecretError> {
    validate_reference(reference)?;
    for store in &self.stores {
      match store.resolve(reference) {
        Err(SecretError::NotFound(_)) => continue,
        other => return other,
      }
    }
    Err(SecretError::NotFound(reference.to_string()))
  }
}
