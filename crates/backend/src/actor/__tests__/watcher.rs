//! WatchService integration tests against real temporary directories.

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use super::helpers::WatchTestContext;
use crate::actor::watcher::{FileEventKind, FileSystemEvent, WatchError, WatchService, WatchServiceConfig, WatchSpec};

fn fast_config() -> WatchServiceConfig {
  WatchServiceConfig {
    queue_capacity: 64,
    debounce: Duration::from_millis(100),
    poll_interval: Duration::from_millis(200),
    recent_window: Duration::from_secs(2),
  }
}

/// Wait until at least `count` events are queued or the deadline passes
async fn wait_for_events(service: &WatchService, count: usize) -> Vec<FileSystemEvent> {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  loop {
    let events = service.poll_events(usize::MAX, None);
    if events.len() >= count || tokio::time::Instant::now() >= deadline {
      return events;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
}

#[tokio::test]
async fn test_add_watch_validates_path_and_id() {
  let ctx = WatchTestContext::new();
  let file = ctx.write_file("plain.txt", "x");
  let service = WatchService::new(fast_config());

  let missing = service.add_watch(WatchSpec::new("missing", ctx.path("nope"), "*"));
  assert!(matches!(missing, Err(WatchError::PathNotFound(_))));

  let not_dir = service.add_watch(WatchSpec::new("file", file, "*"));
  assert!(matches!(not_dir, Err(WatchError::NotADirectory(_))));

  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*.txt"))
    .expect("first registration");
  let duplicate = service.add_watch(WatchSpec::new("docs", ctx.dir.path(), "*"));
  assert!(matches!(duplicate, Err(WatchError::DuplicateId(_))));

  let bad_glob = service.add_watch(WatchSpec::new("bad", ctx.dir.path(), "[unclosed"));
  assert!(matches!(bad_glob, Err(WatchError::InvalidGlob { .. })));

  assert_eq!(service.list_watches().len(), 1);
}

#[tokio::test]
async fn test_list_and_remove_watches() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(fast_config());

  let descriptor = service
    .add_watch(
      WatchSpec::new("b-downloads", ctx.dir.path(), "")
        .target("documents")
        .handoff("inbox"),
    )
    .expect("add");
  assert_eq!(descriptor.glob, "*");
  assert_eq!(descriptor.target.as_deref(), Some("documents"));
  service
    .add_watch(WatchSpec::new("a-desktop", ctx.dir.path(), "*"))
    .expect("add");

  let ids: Vec<String> = service.list_watches().into_iter().map(|w| w.id).collect();
  assert_eq!(ids, vec!["a-desktop", "b-downloads"]);

  let removed = service.remove_watch("b-downloads").expect("remove");
  assert_eq!(removed.handoff.as_deref(), Some("inbox"));
  assert!(matches!(service.remove_watch("b-downloads"), Err(WatchError::UnknownId(_))));
  assert_eq!(service.stats().active_watches, 1);

  service.stop();
  assert!(service.list_watches().is_empty());
}

#[tokio::test]
async fn test_new_file_delivers_one_created_event() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(fast_config());
  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*.txt"))
    .expect("add");

  let path = ctx.write_file("report.txt", "quarterly numbers");
  let events = wait_for_events(&service, 1).await;
  assert_eq!(events.len(), 1);

  let event = &events[0];
  assert_eq!(event.kind, FileEventKind::Created);
  assert_eq!(event.watch_id, "docs");
  assert_eq!(event.path, path);
  assert_eq!(event.filename, "report.txt");
  assert_eq!(event.extension.as_deref(), Some("txt"));
  assert_eq!(event.size, "quarterly numbers".len() as u64);

  // Later polls over the unchanged file must not re-deliver it
  tokio::time::sleep(Duration::from_millis(700)).await;
  assert_eq!(service.poll_events(usize::MAX, None).len(), 1);
}

#[tokio::test]
async fn test_rapid_writes_collapse_into_one_event() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(WatchServiceConfig {
    debounce: Duration::from_millis(300),
    ..fast_config()
  });
  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*"))
    .expect("add");

  for i in 0..5 {
    ctx.write_file("draft.md", &"x".repeat(i + 1));
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  let events = wait_for_events(&service, 1).await;
  tokio::time::sleep(Duration::from_millis(600)).await;
  let events_after = service.poll_events(usize::MAX, None);

  assert_eq!(events.len(), 1);
  assert_eq!(events_after.len(), 1);
  assert_eq!(events_after[0].size, 5);
}

#[tokio::test]
async fn test_spaced_changes_deliver_two_events() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(WatchServiceConfig {
    debounce: Duration::from_millis(300),
    ..fast_config()
  });
  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*"))
    .expect("add");

  ctx.write_file("ledger.csv", "a");
  tokio::time::sleep(Duration::from_millis(600)).await;
  ctx.write_file("ledger.csv", "a,b");

  let events = wait_for_events(&service, 2).await;
  tokio::time::sleep(Duration::from_millis(600)).await;
  let events_after = service.poll_events(usize::MAX, None);

  assert_eq!(events.len(), 2);
  assert_eq!(events_after.len(), 2);
  let sizes: Vec<u64> = events_after.iter().map(|e| e.size).collect();
  assert_eq!(sizes, vec![1, 3]);
  assert!(events_after.iter().all(|e| e.filename == "ledger.csv"));
}

#[tokio::test]
async fn test_glob_and_recency_filters() {
  let ctx = WatchTestContext::new();
  ctx.write_old_file("archive.txt", "old news", 60);
  let service = WatchService::new(fast_config());
  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*.pdf"))
    .expect("add");

  ctx.write_file("notes.txt", "not matching");
  ctx.write_file("paper.pdf", "%PDF-1.7");

  let events = wait_for_events(&service, 1).await;
  tokio::time::sleep(Duration::from_millis(500)).await;
  let events_after = service.poll_events(usize::MAX, None);

  assert_eq!(events.len(), 1);
  assert_eq!(events_after.len(), 1);
  assert_eq!(events_after[0].filename, "paper.pdf");
}

#[tokio::test]
async fn test_created_callback_and_acknowledge() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(fast_config());
  let seen: Arc<Mutex<Vec<String>>> = Arc::default();

  let sink = Arc::clone(&seen);
  assert!(service.set_created_callback(move |event| {
    sink.lock().expect("seen lock").push(event.filename.clone());
  }));
  assert!(!service.set_created_callback(|_| {}));

  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*"))
    .expect("add");
  ctx.write_file("a.txt", "a");

  let events = wait_for_events(&service, 1).await;
  assert_eq!(events.len(), 1);
  assert_eq!(*seen.lock().expect("seen lock"), vec!["a.txt".to_string()]);

  let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
  assert_eq!(service.acknowledge_events(&ids), 1);
  assert_eq!(service.stats().queued_events, 0);
}

#[tokio::test]
async fn test_removed_watch_stops_delivering() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(fast_config());
  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*"))
    .expect("add");
  service.remove_watch("docs").expect("remove");

  ctx.write_file("late.txt", "too late");
  tokio::time::sleep(Duration::from_millis(600)).await;

  assert!(service.poll_events(usize::MAX, None).is_empty());
}

#[tokio::test]
async fn test_queue_overflow_keeps_newest() {
  let ctx = WatchTestContext::new();
  let service = WatchService::new(WatchServiceConfig {
    queue_capacity: 2,
    ..fast_config()
  });
  service
    .add_watch(WatchSpec::new("docs", ctx.dir.path(), "*"))
    .expect("add");

  for name in ["one.txt", "two.txt", "three.txt"] {
    ctx.write_file(name, name);
    // Let each file settle so delivery order is deterministic
    tokio::time::sleep(Duration::from_millis(400)).await;
  }
  tokio::time::sleep(Duration::from_millis(400)).await;

  let stats = service.stats();
  assert_eq!(stats.capacity, 2);
  assert_eq!(stats.queued_events, 2);
  assert_eq!(stats.dropped_events, 1);

  let names: Vec<String> = service
    .poll_events(usize::MAX, None)
    .into_iter()
    .map(|e| e.filename)
    .collect();
  assert_eq!(names, vec!["two.txt", "three.txt"]);
}
