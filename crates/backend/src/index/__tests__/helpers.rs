//! Fixture for scanner tests: a message index database plus a mail store tree.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use tempfile::TempDir;

use crate::{
  domain::config::MailIndexConfig,
  index::{MailIndexScanner, ScannerState},
};

pub const ACCOUNT: &str = "7F3C2A10-ACCOUNT";
pub const STORE: &str = "A1B2C3D4-STORE";

const SCHEMA: &str = "
CREATE TABLE subjects (ROWID INTEGER PRIMARY KEY, subject TEXT);
CREATE TABLE addresses (ROWID INTEGER PRIMARY KEY, address TEXT, comment TEXT);
CREATE TABLE mailboxes (ROWID INTEGER PRIMARY KEY, url TEXT);
CREATE TABLE messages (
  ROWID INTEGER PRIMARY KEY,
  remote_id INTEGER,
  subject INTEGER,
  sender INTEGER,
  date_sent INTEGER,
  mailbox INTEGER,
  flags INTEGER
);
CREATE TABLE recipients (ROWID INTEGER PRIMARY KEY, message INTEGER, address INTEGER, type INTEGER, position INTEGER);
";

pub struct MailStoreFixture {
  pub dir: TempDir,
  conn: Connection,
}

impl MailStoreFixture {
  pub fn new() -> Self {
    let dir = TempDir::new().expect("create mail store dir");
    std::fs::create_dir_all(dir.path().join("mail").join("MailData")).expect("create MailData");
    let conn = Connection::open(dir.path().join("mail").join("MailData").join("Envelope Index")).expect("open index");
    conn.execute_batch(SCHEMA).expect("create schema");
    Self { dir, conn }
  }

  pub fn mail_root(&self) -> PathBuf {
    self.dir.path().join("mail")
  }

  pub fn config(&self) -> MailIndexConfig {
    let mail_root = self.mail_root();
    MailIndexConfig {
      enabled: true,
      index_path: mail_root.join("MailData").join("Envelope Index"),
      state_path: self.dir.path().join("state").join("mail_index_state.json"),
      mail_root,
      ..Default::default()
    }
  }

  pub fn scanner(&self) -> MailIndexScanner {
    MailIndexScanner::open(self.config()).expect("open scanner")
  }

  /// Persist a starting watermark
  pub fn set_watermark(&self, row_id: i64) {
    let state = ScannerState {
      last_row_id: row_id,
      ..Default::default()
    };
    state.save(&self.config().state_path).expect("save state");
  }

  pub fn add_mailbox(&self, id: i64, name: &str) {
    let url = format!("imap://{ACCOUNT}/{}", urlencoding::encode(name));
    self
      .conn
      .execute("INSERT INTO mailboxes (ROWID, url) VALUES (?1, ?2)", params![id, url])
      .expect("insert mailbox");
  }

  pub fn add_address(&self, id: i64, address: &str, comment: &str) {
    self
      .conn
      .execute(
        "INSERT INTO addresses (ROWID, address, comment) VALUES (?1, ?2, ?3)",
        params![id, address, comment],
      )
      .expect("insert address");
  }

  pub fn add_message(&self, row_id: i64, remote_id: Option<i64>, mailbox: i64, flags: i64) {
    self
      .conn
      .execute(
        "INSERT INTO subjects (ROWID, subject) VALUES (?1, ?2)",
        params![row_id, format!("Subject {row_id}")],
      )
      .expect("insert subject");
    self
      .conn
      .execute(
        "INSERT INTO messages (ROWID, remote_id, subject, sender, date_sent, mailbox, flags)
         VALUES (?1, ?2, ?1, NULL, 1700000000, ?3, ?4)",
        params![row_id, remote_id, mailbox, flags],
      )
      .expect("insert message");
  }

  pub fn set_sender(&self, row_id: i64, address: i64) {
    self
      .conn
      .execute("UPDATE messages SET sender = ?2 WHERE ROWID = ?1", params![row_id, address])
      .expect("update sender");
  }

  pub fn add_recipient(&self, row_id: i64, address: i64, kind: i64, position: i64) {
    self
      .conn
      .execute(
        "INSERT INTO recipients (message, address, type, position) VALUES (?1, ?2, ?3, ?4)",
        params![row_id, address, kind, position],
      )
      .expect("insert recipient");
  }

  /// Data directory of a mailbox's store
  pub fn data_dir(&self, mailbox: &str) -> PathBuf {
    self
      .mail_root()
      .join(ACCOUNT)
      .join(format!("{mailbox}.mbox"))
      .join(STORE)
      .join("Data")
  }

  /// Write an `.emlx` file at `relative` under the mailbox's Data directory
  pub fn write_emlx(&self, mailbox: &str, relative: impl AsRef<Path>) -> PathBuf {
    let path = self.data_dir(mailbox).join(relative);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("create message dir");
    std::fs::write(&path, "42\nSubject: test\r\n\r\nbody\r\n").expect("write emlx");
    path
  }
}
