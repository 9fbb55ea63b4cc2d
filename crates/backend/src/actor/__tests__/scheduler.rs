use std::{
  collections::HashMap,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use tokio::{sync::mpsc, time::timeout};

use super::helpers::{ControlledEnricher, image_doc, text_doc};
use crate::{
  actor::scheduler::{EnrichmentScheduler, PoolKind, SchedulerConfig, SchedulerError},
  domain::document::EnrichedDocument,
};

fn scheduler(enricher: &Arc<ControlledEnricher>, max_normal: usize, attachment_free: bool) -> EnrichmentScheduler {
  EnrichmentScheduler::new(
    enricher.clone(),
    SchedulerConfig {
      max_normal_enrichments: max_normal,
      attachment_free_pool: attachment_free,
    },
  )
}

/// Submit with a callback that forwards completions to a channel
fn submit_to(
  scheduler: &EnrichmentScheduler,
  tx: &mpsc::UnboundedSender<(String, Option<EnrichedDocument>)>,
  doc: crate::domain::document::CollectorDocument,
) -> bool {
  let id = doc.external_id.clone();
  let tx = tx.clone();
  scheduler.submit(doc, id, move |id, result| {
    let _ = tx.send((id, result));
  })
}

async fn next_completion(
  rx: &mut mpsc::UnboundedReceiver<(String, Option<EnrichedDocument>)>,
) -> (String, Option<EnrichedDocument>) {
  timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("timeout waiting for completion")
    .expect("completion channel closed")
}

#[tokio::test]
async fn test_duplicate_submission_is_rejected() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, true);
  let (tx, mut rx) = mpsc::unbounded_channel();

  // In flight (attachment-free slot), in flight (normal), and waiting
  assert!(submit_to(&scheduler, &tx, text_doc("a")));
  assert!(submit_to(&scheduler, &tx, image_doc("b", 2)));
  assert!(submit_to(&scheduler, &tx, image_doc("c", 1)));

  assert!(!submit_to(&scheduler, &tx, text_doc("a")));
  assert!(!submit_to(&scheduler, &tx, text_doc("b")));
  assert!(!submit_to(&scheduler, &tx, image_doc("c", 3)));
  assert_eq!(scheduler.stats().waiting, 1);

  for id in ["a", "b", "c"] {
    enricher.release(id);
  }
  let mut done = Vec::new();
  for _ in 0..3 {
    done.push(next_completion(&mut rx).await.0);
  }
  done.sort();
  assert_eq!(done, vec!["a", "b", "c"]);

  // Once finished the id may be submitted again
  assert!(submit_to(&scheduler, &tx, text_doc("a")));
  enricher.release("a");
  assert_eq!(next_completion(&mut rx).await.0, "a");
}

#[tokio::test]
async fn test_attachment_document_never_uses_attachment_free_pool() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, true);
  let (tx, mut rx) = mpsc::unbounded_channel();

  assert!(submit_to(&scheduler, &tx, image_doc("img-1", 1)));
  assert_eq!(scheduler.assigned_pool("img-1"), Some(PoolKind::Normal));

  // Attachment-free slot is idle, but the normal pool is full: wait
  assert!(submit_to(&scheduler, &tx, image_doc("img-2", 1)));
  assert_eq!(scheduler.assigned_pool("img-2"), None);
  let stats = scheduler.stats();
  assert_eq!(stats.active_normal, 1);
  assert_eq!(stats.active_attachment_free, 0);
  assert_eq!(stats.waiting, 1);

  // A text document takes the idle attachment-free slot ahead of the queue
  assert!(submit_to(&scheduler, &tx, text_doc("txt")));
  assert_eq!(scheduler.assigned_pool("txt"), Some(PoolKind::AttachmentFree));

  // Freeing the attachment-free slot must not pull the image document
  enricher.release("txt");
  assert_eq!(next_completion(&mut rx).await.0, "txt");
  assert_eq!(scheduler.assigned_pool("img-2"), None);
  assert_eq!(scheduler.stats().waiting, 1);

  // Freeing the normal slot does
  enricher.release("img-1");
  assert_eq!(next_completion(&mut rx).await.0, "img-1");
  assert_eq!(scheduler.assigned_pool("img-2"), Some(PoolKind::Normal));

  enricher.release("img-2");
  let (id, result) = next_completion(&mut rx).await;
  assert_eq!(id, "img-2");
  assert_eq!(result.expect("enriched").images.len(), 1);
}

#[tokio::test]
async fn test_attachment_free_burst_spills_into_normal_pool() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 3, true);
  let (tx, mut rx) = mpsc::unbounded_channel();

  for i in 1..=5 {
    assert!(submit_to(&scheduler, &tx, text_doc(&format!("d{i}"))));
  }

  assert_eq!(scheduler.assigned_pool("d1"), Some(PoolKind::AttachmentFree));
  for id in ["d2", "d3", "d4"] {
    assert_eq!(scheduler.assigned_pool(id), Some(PoolKind::Normal));
  }
  assert_eq!(scheduler.stats().waiting, 1);

  enricher.release("d3");
  assert_eq!(next_completion(&mut rx).await.0, "d3");
  assert_eq!(scheduler.assigned_pool("d5"), Some(PoolKind::Normal));

  enricher.release("d1");
  assert_eq!(next_completion(&mut rx).await.0, "d1");
  let stats = scheduler.stats();
  assert_eq!(stats.active_attachment_free, 0);
  assert_eq!(stats.active_normal, 3);
  assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_disabled_attachment_free_pool_routes_everything_to_normal() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, false);
  let (tx, mut rx) = mpsc::unbounded_channel();

  assert!(submit_to(&scheduler, &tx, text_doc("t1")));
  assert!(submit_to(&scheduler, &tx, text_doc("t2")));
  assert_eq!(scheduler.assigned_pool("t1"), Some(PoolKind::Normal));
  assert_eq!(scheduler.assigned_pool("t2"), None);

  enricher.release("t1");
  assert_eq!(next_completion(&mut rx).await.0, "t1");
  assert_eq!(scheduler.assigned_pool("t2"), Some(PoolKind::Normal));
  enricher.release("t2");
  next_completion(&mut rx).await;
}

#[tokio::test]
async fn test_enrichment_failure_reports_none_and_unblocks_queue() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, false);
  let (tx, mut rx) = mpsc::unbounded_channel();

  assert!(submit_to(&scheduler, &tx, text_doc("fail-1")));
  assert!(submit_to(&scheduler, &tx, text_doc("ok-1")));

  enricher.release("fail-1");
  let (id, result) = next_completion(&mut rx).await;
  assert_eq!(id, "fail-1");
  assert!(result.is_none());

  enricher.release("ok-1");
  let (id, result) = next_completion(&mut rx).await;
  assert_eq!(id, "ok-1");
  assert!(result.is_some());
}

#[tokio::test]
async fn test_panicking_enricher_reports_none() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, false);

  let waiting = {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.submit_and_wait(text_doc("panic-1"), "panic-1").await })
  };
  tokio::task::yield_now().await;
  enricher.release("panic-1");

  let result = timeout(Duration::from_secs(5), waiting)
    .await
    .expect("timeout")
    .expect("join")
    .expect("accepted");
  assert!(result.is_none());
  assert_eq!(scheduler.stats().active_normal, 0);
}

#[tokio::test]
async fn test_cancel_running_frees_slot_through_completion_path() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, false);
  let (tx, mut rx) = mpsc::unbounded_channel();

  assert!(submit_to(&scheduler, &tx, text_doc("slow")));
  assert!(submit_to(&scheduler, &tx, text_doc("next")));

  assert!(scheduler.cancel("slow"));
  let (id, result) = next_completion(&mut rx).await;
  assert_eq!(id, "slow");
  assert!(result.is_none());

  // The completion path handed the slot to the waiting document
  assert_eq!(scheduler.assigned_pool("next"), Some(PoolKind::Normal));
  assert_eq!(scheduler.stats().active_normal, 1);

  enricher.release("next");
  assert_eq!(next_completion(&mut rx).await.0, "next");
  assert!(!scheduler.cancel("next"));
}

#[tokio::test]
async fn test_cancel_waiting_fires_callback_immediately() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, false);
  let (tx, mut rx) = mpsc::unbounded_channel();

  assert!(submit_to(&scheduler, &tx, text_doc("first")));
  assert!(submit_to(&scheduler, &tx, text_doc("queued")));

  assert!(scheduler.cancel("queued"));
  let (id, result) = rx.try_recv().expect("callback fired synchronously");
  assert_eq!(id, "queued");
  assert!(result.is_none());
  assert_eq!(scheduler.stats().waiting, 0);
  assert!(!scheduler.is_tracked("queued"));

  enricher.release("first");
  next_completion(&mut rx).await;
}

#[tokio::test]
async fn test_await_result_for_tracked_and_unknown_documents() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, true);

  assert!(matches!(
    scheduler.await_result("nope").await,
    Err(SchedulerError::NotTracked(_))
  ));

  assert!(scheduler.submit(text_doc("doc"), "doc", |_, _| {}));
  let waiter = {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.await_result("doc").await })
  };
  tokio::task::yield_now().await;
  enricher.release("doc");

  let result = timeout(Duration::from_secs(5), waiter)
    .await
    .expect("timeout")
    .expect("join")
    .expect("tracked");
  assert_eq!(result.expect("enriched").document.external_id, "doc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_await_result() {
  let enricher = ControlledEnricher::new();
  let scheduler = scheduler(&enricher, 1, true);

  assert!(scheduler.submit(image_doc("blocking", 1), "blocking", |_, _| {}));
  let blocking = {
    let scheduler = scheduler.clone();
    tokio::task::spawn_blocking(move || scheduler.blocking_await_result("blocking"))
  };
  tokio::time::sleep(Duration::from_millis(50)).await;
  enricher.release("blocking");

  let result = timeout(Duration::from_secs(5), blocking)
    .await
    .expect("timeout")
    .expect("join")
    .expect("tracked");
  assert!(result.is_some());
}

/// Tiny deterministic generator for interleaving fuzz
struct Lcg(u64);

impl Lcg {
  fn next(&mut self) -> u64 {
    self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    self.0 >> 33
  }
}

#[tokio::test]
async fn test_pool_capacity_invariant_under_random_interleavings() {
  const MAX_NORMAL: usize = 3;

  for seed in [1_u64, 7, 42, 1234] {
    let enricher = ControlledEnricher::new();
    let scheduler = scheduler(&enricher, MAX_NORMAL, true);
    let completions = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let done = Arc::new(AtomicUsize::new(0));
    let mut rng = Lcg(seed);
    let mut with_images = Vec::new();
    let mut accepted = Vec::new();
    let mut next_id = 0;

    for _ in 0..300 {
      if rng.next() % 3 != 0 || accepted.is_empty() {
        let id = format!("doc-{next_id}");
        next_id += 1;
        let images = (rng.next() % 3) as usize;
        let doc = if images == 0 { text_doc(&id) } else { image_doc(&id, images) };
        let completions = completions.clone();
        let done = done.clone();
        let ok = scheduler.submit(doc, id.clone(), move |id, _| {
          *completions.lock().expect("lock").entry(id).or_default() += 1;
          done.fetch_add(1, Ordering::SeqCst);
        });
        assert!(ok);
        if images > 0 {
          with_images.push(id.clone());
        }
        accepted.push(id);
      } else {
        let idx = (rng.next() as usize) % accepted.len();
        enricher.release(&accepted[idx]);
        tokio::task::yield_now().await;
      }

      let stats = scheduler.stats();
      assert!(stats.active_normal <= MAX_NORMAL, "seed {seed}: {stats:?}");
      assert!(stats.active_attachment_free <= 1, "seed {seed}: {stats:?}");
      for id in &with_images {
        assert_ne!(scheduler.assigned_pool(id), Some(PoolKind::AttachmentFree));
      }
    }

    for id in &accepted {
      enricher.release(id);
    }
    timeout(Duration::from_secs(10), async {
      while done.load(Ordering::SeqCst) < accepted.len() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("all completions fire");

    let completions = completions.lock().expect("lock");
    assert_eq!(completions.len(), accepted.len());
    assert!(completions.values().all(|count| *count == 1));
    assert!(enricher.max_in_flight() <= MAX_NORMAL + 1);
    let stats = scheduler.stats();
    assert_eq!((stats.active_normal, stats.active_attachment_free, stats.waiting), (0, 0, 0));
  }
}
