//! Batched read of the external message index.
//!
//! One statement per scan: messages after the watermark, ascending by row id,
//! with subject, sender, mailbox and recipient lists joined in.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Row, params, types::ValueRef};
use serde::{Deserialize, Serialize};

/// Separator used when concatenating recipient addresses
const LIST_SEPARATOR: char = '\u{1f}';

const BATCH_QUERY: &str = "
SELECT
  m.ROWID,
  m.remote_id,
  s.subject,
  a.address,
  a.comment,
  m.date_sent,
  mb.url,
  m.flags,
  (SELECT GROUP_CONCAT(ra.address, char(31))
     FROM recipients r JOIN addresses ra ON ra.ROWID = r.address
    WHERE r.message = m.ROWID AND r.type = 0) AS to_list,
  (SELECT GROUP_CONCAT(ra.address, char(31))
     FROM recipients r JOIN addresses ra ON ra.ROWID = r.address
    WHERE r.message = m.ROWID AND r.type = 1) AS cc_list
FROM messages m
LEFT JOIN subjects s ON s.ROWID = m.subject
LEFT JOIN addresses a ON a.ROWID = m.sender
LEFT JOIN mailboxes mb ON mb.ROWID = m.mailbox
WHERE m.ROWID > ?1
ORDER BY m.ROWID ASC
LIMIT ?2";

/// One row of the message index. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
  pub row_id: i64,
  /// Server-assigned id, when the store knows it
  pub remote_id: Option<String>,
  pub subject: Option<String>,
  pub sender: Option<String>,
  pub sender_name: Option<String>,
  pub to: Vec<String>,
  pub cc: Vec<String>,
  pub sent_at: Option<DateTime<Utc>>,
  pub mailbox_url: Option<String>,
  pub flags: i64,
}

impl MessageRecord {
  pub fn is_vip(&self, mask: i64) -> bool {
    self.flags & mask != 0
  }

  /// Last path segment of the mailbox URL, percent-decoded
  pub fn mailbox_name(&self) -> Option<String> {
    let url = self.mailbox_url.as_deref()?;
    let segment = url.trim_end_matches('/').rsplit('/').next()?;
    let decoded = urlencoding::decode(segment).map(|s| s.into_owned()).unwrap_or_else(|_| segment.to_string());
    (!decoded.is_empty()).then_some(decoded)
  }

  /// Whether the mailbox name contains a blocked keyword as a whole word.
  ///
  /// "Junk E-mail" matches `junk`, "Cabinet" does not match `bin`.
  pub fn in_noise_mailbox(&self, blocked_keywords: &[String]) -> bool {
    let Some(name) = self.mailbox_name() else {
      return false;
    };
    let name = words(&name);
    blocked_keywords.iter().any(|keyword| {
      let keyword = words(keyword);
      !keyword.is_empty() && name.windows(keyword.len()).any(|run| run == keyword.as_slice())
    })
  }
}

fn words(text: &str) -> Vec<String> {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| !w.is_empty())
    .map(str::to_lowercase)
    .collect()
}

pub fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
  Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
}

/// Rows with `ROWID > after`, ascending, at most `limit`
pub fn messages_after(conn: &Connection, after: i64, limit: usize) -> rusqlite::Result<Vec<MessageRecord>> {
  let limit = i64::try_from(limit).unwrap_or(i64::MAX);
  let mut stmt = conn.prepare(BATCH_QUERY)?;
  let rows = stmt.query_map(params![after, limit], read_record)?;
  rows.collect()
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
  let remote_id = match row.get_ref(1)? {
    ValueRef::Integer(id) => Some(id.to_string()),
    ValueRef::Text(text) => Some(String::from_utf8_lossy(text).into_owned()).filter(|s| !s.is_empty()),
    _ => None,
  };
  let sent_at = row
    .get::<_, Option<i64>>(5)?
    .and_then(|secs| DateTime::from_timestamp(secs, 0));

  Ok(MessageRecord {
    row_id: row.get(0)?,
    remote_id,
    subject: row.get(2)?,
    sender: row.get(3)?,
    sender_name: row.get::<_, Option<String>>(4)?.filter(|s| !s.is_empty()),
    sent_at,
    mailbox_url: row.get(6)?,
    flags: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
    to: split_list(row.get(8)?),
    cc: split_list(row.get(9)?),
  })
}

fn split_list(value: Option<String>) -> Vec<String> {
  value
    .map(|list| {
      list
        .split(LIST_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
    })
    .unwrap_or_default()
}
