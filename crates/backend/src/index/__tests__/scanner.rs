//! MailIndexScanner tests against a real index database and mail store tree.

use std::path::PathBuf;

use pretty_assertions::assert_eq;

use super::helpers::MailStoreFixture;
use crate::index::{MailIndexScanner, MessageRecord, ResolvedFile, ScanError, ScannedMessage};

fn ids(messages: &[ScannedMessage]) -> Vec<i64> {
  messages.iter().map(|m| m.record.row_id).collect()
}

fn synthetic(row_id: i64) -> ScannedMessage {
  ScannedMessage {
    record: MessageRecord {
      row_id,
      remote_id: None,
      subject: None,
      sender: None,
      sender_name: None,
      to: Vec::new(),
      cc: Vec::new(),
      sent_at: None,
      mailbox_url: None,
      flags: 0,
    },
    file: Some(ResolvedFile {
      path: PathBuf::from(format!("/mail/{row_id}.emlx")),
      inode: row_id as u64,
      mtime: 0,
    }),
  }
}

#[test]
fn test_trash_row_is_filtered_and_watermark_stops_at_gap() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "INBOX");
  fixture.add_mailbox(2, "Trash");
  fixture.add_message(101, None, 1, 0);
  fixture.add_message(102, None, 2, 0);
  fixture.add_message(103, Some(5003), 1, 0);
  fixture.write_emlx("INBOX", "Messages/101.emlx");
  fixture.write_emlx("INBOX", "3/Messages/5003.emlx");
  fixture.set_watermark(100);

  let scanner = fixture.scanner();
  let batch = scanner.run_incremental_scan(50).expect("scan");

  assert_eq!(batch.watermark, 100);
  assert_eq!(ids(&batch.messages), vec![101, 103]);
  assert_eq!(batch.filtered, vec![102]);
  assert!(batch.warnings.is_empty());
  assert_eq!(batch.seen_ids(), vec![101, 102, 103]);
  assert!(
    batch.messages[1]
      .file
      .as_ref()
      .is_some_and(|f| f.path.ends_with("3/Messages/5003.emlx"))
  );

  let watermark = scanner.commit(&[101, 103], &batch.messages).expect("commit");
  assert_eq!(watermark, 101);

  // Persisted across restarts; 102 and 103 come back
  let reopened = fixture.scanner();
  assert_eq!(reopened.watermark(), 101);
  let again = reopened.run_incremental_scan(50).expect("rescan");
  assert_eq!(ids(&again.messages), vec![103]);
  assert_eq!(again.filtered, vec![102]);

  // Including the filtered id lets the watermark pass it
  let watermark = reopened.commit(&again.seen_ids(), &again.messages).expect("commit");
  assert_eq!(watermark, 103);
}

#[test]
fn test_vip_message_survives_noise_filter() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "Junk");
  fixture.add_message(1, None, 1, 1 << 17);
  fixture.add_message(2, None, 1, 0);
  fixture.write_emlx("Junk", "Messages/1.emlx");

  let batch = fixture.scanner().run_incremental_scan(50).expect("scan");
  assert_eq!(ids(&batch.messages), vec![1]);
  assert_eq!(batch.filtered, vec![2]);
}

#[test]
fn test_contiguous_watermark_advance() {
  let fixture = MailStoreFixture::new();
  fixture.set_watermark(10);
  let scanner = fixture.scanner();

  assert_eq!(scanner.commit(&[11, 12, 14], &[]).expect("commit"), 12);
  assert_eq!(scanner.commit(&[], &[]).expect("empty commit"), 12);
  assert_eq!(scanner.commit(&[9, 10], &[]).expect("stale ids"), 12);
  assert_eq!(scanner.commit(&[13, 14, 15], &[]).expect("fill gap"), 15);
}

#[test]
fn test_deleted_rows_are_reported_absent() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "INBOX");
  fixture.add_message(101, None, 1, 0);
  fixture.add_message(104, None, 1, 0);
  fixture.set_watermark(99);

  let scanner = fixture.scanner();
  let batch = scanner.run_incremental_scan(50).expect("scan");
  assert_eq!(batch.seen_ids(), vec![101, 104]);
  assert_eq!(batch.absent_ids(), vec![100, 102, 103]);

  let mut accepted = batch.seen_ids();
  accepted.extend(batch.absent_ids());
  assert_eq!(scanner.commit(&accepted, &[]).expect("commit"), 104);

  let empty = scanner.run_incremental_scan(50).expect("empty scan");
  assert!(empty.absent_ids().is_empty());
}

#[test]
fn test_unresolved_message_is_returned_with_warning() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "INBOX");
  fixture.add_message(1, None, 1, 0);
  fixture.add_message(2, None, 1, 0);
  fixture.write_emlx("INBOX", "Messages/2.emlx");

  let batch = fixture.scanner().run_incremental_scan(50).expect("scan");
  assert_eq!(ids(&batch.messages), vec![1, 2]);
  assert!(batch.messages[0].file.is_none());
  assert!(batch.messages[1].file.is_some());
  assert_eq!(batch.warnings.len(), 1);
  assert_eq!(batch.warnings[0].row_id, 1);
}

#[test]
fn test_scan_respects_limit_and_joins_metadata() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "INBOX");
  fixture.add_address(1, "alice@example.com", "Alice");
  fixture.add_address(2, "bob@example.com", "");
  fixture.add_address(3, "carol@example.com", "");
  for row_id in 1..=3 {
    fixture.add_message(row_id, None, 1, 0);
  }
  fixture.set_sender(1, 1);
  fixture.add_recipient(1, 2, 0, 0);
  fixture.add_recipient(1, 3, 1, 0);

  let batch = fixture.scanner().run_incremental_scan(2).expect("scan");
  assert_eq!(ids(&batch.messages), vec![1, 2]);

  let record = &batch.messages[0].record;
  assert_eq!(record.subject.as_deref(), Some("Subject 1"));
  assert_eq!(record.sender.as_deref(), Some("alice@example.com"));
  assert_eq!(record.sender_name.as_deref(), Some("Alice"));
  assert_eq!(record.to, vec!["bob@example.com".to_string()]);
  assert_eq!(record.cc, vec!["carol@example.com".to_string()]);
  assert_eq!(record.sent_at.map(|t| t.timestamp()), Some(1_700_000_000));
}

#[test]
fn test_walk_finds_files_outside_candidate_paths() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "INBOX");
  fixture.add_message(101, None, 1, 0);
  fixture.write_emlx("INBOX", "1/0/Messages/1010.emlx");
  let nested = fixture.write_emlx("INBOX", "1/0/Messages/101.partial.emlx");

  let batch = fixture.scanner().run_incremental_scan(50).expect("scan");
  assert_eq!(batch.messages[0].file.as_ref().map(|f| f.path.clone()), Some(nested));
}

#[test]
fn test_cached_path_is_used_before_searching() {
  let fixture = MailStoreFixture::new();
  fixture.add_mailbox(1, "INBOX");
  fixture.add_message(1, None, 1, 0);
  fixture.add_message(2, None, 1, 0);
  let odd = fixture.write_emlx("INBOX", "deep/er/Messages/2.emlx");

  let scanner = fixture.scanner();
  let batch = scanner.run_incremental_scan(50).expect("scan");
  // Row 1 is not accepted, so the watermark stays put but 2 is cached
  assert_eq!(scanner.commit(&[2], &batch.messages[1..]).expect("commit"), 0);
  assert_eq!(scanner.cached_files().get(&2).map(|f| f.path.clone()), Some(odd.clone()));

  // Without a walk budget the file is only reachable through the cache
  let scanner = MailIndexScanner::open(crate::domain::config::MailIndexConfig {
    walk_entry_limit: 0,
    ..fixture.config()
  })
  .expect("reopen");
  let batch = scanner.run_incremental_scan(50).expect("rescan");
  assert_eq!(batch.messages[1].file.as_ref().map(|f| f.path.clone()), Some(odd));
  assert_eq!(batch.warnings.len(), 1);
  assert_eq!(batch.warnings[0].row_id, 1);
}

#[test]
fn test_cache_keeps_highest_row_ids() {
  let fixture = MailStoreFixture::new();
  let scanner = fixture.scanner();

  let messages: Vec<ScannedMessage> = (1..=600).map(synthetic).collect();
  let accepted: Vec<i64> = (1..=600).collect();
  assert_eq!(scanner.commit(&accepted, &messages).expect("commit"), 600);

  let cache = fixture.scanner().cached_files();
  assert_eq!(cache.len(), 500);
  assert_eq!(cache.keys().next(), Some(&101));
  assert_eq!(cache.keys().last(), Some(&600));
}

#[test]
fn test_missing_index_is_an_error() {
  let fixture = MailStoreFixture::new();
  let scanner = MailIndexScanner::open(crate::domain::config::MailIndexConfig {
    index_path: fixture.dir.path().join("absent").join("Envelope Index"),
    ..fixture.config()
  })
  .expect("open");
  assert!(matches!(scanner.run_incremental_scan(10), Err(ScanError::Open { .. })));
}
