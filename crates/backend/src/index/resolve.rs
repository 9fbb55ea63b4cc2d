//! Mapping index rows to their `.emlx` content files.
//!
//! Mailbox URLs map onto the store layout as
//! `<mail_root>/<account>/<segment>.mbox/.../[<store-id>/]Data/...`.
//! Resolution tries, in order: the cached path, fixed candidate paths, and a
//! bounded walk of the mailbox directory.

use std::{
  fs::Metadata,
  path::{Path, PathBuf},
  time::UNIX_EPOCH,
};

use tracing::trace;
use walkdir::WalkDir;

use super::{query::MessageRecord, state::ResolvedFile};

/// Directory name used for mailboxes that belong to no account
const LOCAL_MAILBOXES: &str = "Mailboxes";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
  #[error("message has no mailbox")]
  NoMailbox,

  #[error("unrecognised mailbox url {0}")]
  InvalidMailboxUrl(String),

  #[error("no content file found (checked {candidates} candidates, walked {walked} entries)")]
  NotFound { candidates: usize, walked: usize },
}

pub struct Resolver<'a> {
  pub mail_root: &'a Path,
  pub hash_buckets: &'a [String],
  pub walk_entry_limit: usize,
}

impl Resolver<'_> {
  pub fn resolve(&self, record: &MessageRecord, cached: Option<&ResolvedFile>) -> Result<ResolvedFile, ResolveError> {
    if let Some(cached) = cached
      && let Some(file) = resolved_file(&cached.path)
      && file.inode == cached.inode
    {
      trace!(row_id = record.row_id, path = %file.path.display(), "Resolved from cache");
      return Ok(file);
    }

    let url = record.mailbox_url.as_deref().ok_or(ResolveError::NoMailbox)?;
    let mailbox = mailbox_dir(self.mail_root, url).ok_or_else(|| ResolveError::InvalidMailboxUrl(url.to_string()))?;

    let ids = message_ids(record);
    let candidates = self.candidates(&mailbox, &ids);
    for candidate in &candidates {
      if let Some(file) = resolved_file(candidate) {
        trace!(row_id = record.row_id, path = %candidate.display(), "Resolved candidate path");
        return Ok(file);
      }
    }

    let (found, walked) = self.walk(&mailbox, &ids);
    match found {
      Some(file) => {
        trace!(row_id = record.row_id, path = %file.path.display(), walked, "Resolved by directory walk");
        Ok(file)
      }
      None => Err(ResolveError::NotFound {
        candidates: candidates.len(),
        walked,
      }),
    }
  }

  /// Direct paths by remote id then row id, then the same under each bucket
  fn candidates(&self, mailbox: &Path, ids: &[String]) -> Vec<PathBuf> {
    let roots = data_roots(mailbox);
    let mut candidates = Vec::new();
    for root in &roots {
      for id in ids {
        candidates.push(root.join("Messages").join(format!("{id}.emlx")));
      }
    }
    for root in &roots {
      for bucket in self.hash_buckets {
        for id in ids {
          candidates.push(root.join(bucket).join("Messages").join(format!("{id}.emlx")));
        }
      }
    }
    candidates
  }

  fn walk(&self, mailbox: &Path, ids: &[String]) -> (Option<ResolvedFile>, usize) {
    let mut walked = 0;
    for entry in WalkDir::new(mailbox).min_depth(1).into_iter().filter_map(Result::ok) {
      if walked >= self.walk_entry_limit {
        break;
      }
      walked += 1;

      let Some(name) = entry.file_name().to_str() else {
        continue;
      };
      if entry.file_type().is_file()
        && name.ends_with(".emlx")
        && ids.iter().any(|id| name_matches_id(name, id))
        && let Some(file) = resolved_file(entry.path())
      {
        return (Some(file), walked);
      }
    }
    (None, walked)
  }
}

/// Remote id first (when known), then row id
fn message_ids(record: &MessageRecord) -> Vec<String> {
  let mut ids = Vec::with_capacity(2);
  if let Some(remote) = record.remote_id.as_deref()
    && !remote.contains(['/', '\\'])
  {
    ids.push(remote.to_string());
  }
  let row_id = record.row_id.to_string();
  if !ids.contains(&row_id) {
    ids.push(row_id);
  }
  ids
}

/// `101.emlx` and `101.partial.emlx` match 101; `1010.emlx` does not
fn name_matches_id(name: &str, id: &str) -> bool {
  name
    .strip_prefix(id)
    .and_then(|rest| rest.chars().next())
    .is_some_and(|next| !next.is_ascii_digit())
}

/// Mailbox directory for a mailbox URL
pub fn mailbox_dir(mail_root: &Path, url: &str) -> Option<PathBuf> {
  let parsed = url::Url::parse(url).ok()?;
  let account = match parsed.host_str() {
    Some(host) if !host.is_empty() => decode(host),
    _ => LOCAL_MAILBOXES.to_string(),
  };

  let mut dir = mail_root.join(account);
  let mut segments = 0;
  for segment in parsed.path_segments()?.filter(|s| !s.is_empty()) {
    let segment = decode(segment);
    if segment == "." || segment == ".." {
      return None;
    }
    dir.push(format!("{segment}.mbox"));
    segments += 1;
  }
  (segments > 0).then_some(dir)
}

fn decode(value: &str) -> String {
  urlencoding::decode(value)
    .map(|s| s.into_owned())
    .unwrap_or_else(|_| value.to_string())
}

/// `Data` directories of a mailbox: its own, and one per store subdirectory
fn data_roots(mailbox: &Path) -> Vec<PathBuf> {
  let mut roots = Vec::new();
  let direct = mailbox.join("Data");
  if direct.is_dir() {
    roots.push(direct);
  }
  if let Ok(entries) = std::fs::read_dir(mailbox) {
    let mut stores: Vec<PathBuf> = entries
      .flatten()
      .map(|entry| entry.path().join("Data"))
      .filter(|data| data.is_dir())
      .collect();
    stores.sort();
    roots.extend(stores);
  }
  roots
}

pub fn resolved_file(path: &Path) -> Option<ResolvedFile> {
  let metadata = std::fs::metadata(path).ok()?;
  if !metadata.is_file() {
    return None;
  }
  Some(ResolvedFile {
    path: path.to_path_buf(),
    inode: inode(&metadata),
    mtime: metadata
      .modified()
      .ok()
      .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0),
  })
}

#[cfg(unix)]
fn inode(metadata: &Metadata) -> u64 {
  use std::os::unix::fs::MetadataExt;
  metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &Metadata) -> u64 {
  0
}
