mod common;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::{coordinator, memory_store, BASE_URL, PRINCIPAL};
use newsletter_core::error::{AppError, Result};
use newsletter_core::idempotency::{
    IdempotencyKey, IdempotencyRecord, IdempotencyStatus, StoredResponse, TransactionalHandler,
};
use newsletter_core::models::{NewSubscriber, TaskKind, TaskStatus};
use newsletter_core::outbox::OutboxWriter;
use newsletter_core::repositories::{Fault, Store, StoreTx};
use newsletter_core::services::{SubscribeHandler, CONFIRMATION_SUBJECT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Barrier, Notify};

fn subscribe(email: &str, name: &str) -> SubscribeHandler {
    SubscribeHandler::new(NewSubscriber::parse(email, name).unwrap(), BASE_URL)
}

/// Writes an outbox task, then fails.
struct FailingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl TransactionalHandler for FailingHandler {
    fn operation(&self) -> &'static str {
        "failing"
    }

    fn fingerprint(&self) -> String {
        "failing".to_string()
    }

    async fn handle(&self, tx: &mut dyn StoreTx) -> Result<StoredResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        OutboxWriter::new()
            .enqueue(tx, TaskKind::SendConfirmationEmail, serde_json::json!({}))
            .await?;
        Err(AppError::Validation("downstream rejected the request".to_string()))
    }
}

/// Blocks inside the transaction until released.
struct GatedHandler {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl TransactionalHandler for GatedHandler {
    fn operation(&self) -> &'static str {
        "gated"
    }

    fn fingerprint(&self) -> String {
        "gated".to_string()
    }

    async fn handle(&self, tx: &mut dyn StoreTx) -> Result<StoredResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        OutboxWriter::new()
            .enqueue(tx, TaskKind::SendConfirmationEmail, serde_json::json!({}))
            .await?;
        StoredResponse::json(201, &serde_json::json!({"ok": true}))
    }
}

/// Sleeps briefly so concurrent callers overlap.
struct SlowHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl TransactionalHandler for SlowHandler {
    fn operation(&self) -> &'static str {
        "slow"
    }

    fn fingerprint(&self) -> String {
        "slow".to_string()
    }

    async fn handle(&self, _tx: &mut dyn StoreTx) -> Result<StoredResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        StoredResponse::json(200, &serde_json::json!({"call": call}))
    }
}

#[tokio::test]
async fn test_subscribe_with_key_executes_once_and_replays() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);
    let handler = subscribe("ursula@example.com", "Ursula");

    let first = coordinator
        .execute(PRINCIPAL, Some("abc123"), &handler)
        .await
        .expect("first request should succeed");
    assert!(!first.replayed);
    assert_eq!(first.response.status_code, 201);

    let subscribers = memory.subscribers();
    assert_eq!(subscribers.len(), 1);
    let tasks = memory.outbox_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::SendConfirmationEmail);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].payload["subject"], CONFIRMATION_SUBJECT);
    assert_eq!(tasks[0].payload["recipient"], "ursula@example.com");

    let second = coordinator
        .execute(PRINCIPAL, Some("abc123"), &handler)
        .await
        .expect("retry should replay");
    assert!(second.replayed);
    assert_eq!(second.response, first.response);

    assert_eq!(memory.subscribers().len(), 1);
    assert_eq!(memory.outbox_tasks().len(), 1);

    let record = memory_record(&memory, "abc123").await;
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.response(), Some(first.response));
}

async fn memory_record(store: &newsletter_core::repositories::InMemoryStore, key: &str) -> IdempotencyRecord {
    store
        .find_idempotency_record(PRINCIPAL, &IdempotencyKey::parse(key).unwrap())
        .await
        .unwrap()
        .expect("record should exist")
}

#[tokio::test]
async fn test_replay_preserves_header_order_and_body_bytes() {
    let (_, store) = memory_store();
    let coordinator = coordinator(store);
    let handler = subscribe("le.guin@example.com", "Ursula");

    let first = coordinator.execute(PRINCIPAL, Some("order-1"), &handler).await.unwrap();
    let names: Vec<&str> = first.response.headers.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["content-type", "location"]);

    let replay = coordinator.execute(PRINCIPAL, Some("order-1"), &handler).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.response.headers, first.response.headers);
    assert_eq!(replay.response.body, first.response.body);
}

#[tokio::test]
async fn test_key_reused_with_different_payload_is_rejected() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);

    coordinator
        .execute(PRINCIPAL, Some("abc123"), &subscribe("a@example.com", "A"))
        .await
        .unwrap();

    let err = coordinator
        .execute(PRINCIPAL, Some("abc123"), &subscribe("b@example.com", "B"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::KeyReused(_)));
    assert_eq!(memory.subscribers().len(), 1);
    assert_eq!(memory.outbox_tasks().len(), 1);
}

#[tokio::test]
async fn test_same_key_for_different_principals_is_independent() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);

    let a = coordinator
        .execute("principal-a", Some("shared"), &subscribe("a@example.com", "A"))
        .await
        .unwrap();
    let b = coordinator
        .execute("principal-b", Some("shared"), &subscribe("b@example.com", "B"))
        .await
        .unwrap();

    assert!(!a.replayed);
    assert!(!b.replayed);
    assert_eq!(memory.subscribers().len(), 2);
}

#[tokio::test]
async fn test_missing_key_executes_without_dedup() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);

    coordinator.execute(PRINCIPAL, None, &subscribe("a@example.com", "A")).await.unwrap();
    coordinator.execute(PRINCIPAL, None, &subscribe("b@example.com", "B")).await.unwrap();

    assert_eq!(memory.subscribers().len(), 2);
    assert_eq!(memory.outbox_tasks().len(), 2);

    // Without a key the business constraint is the only protection.
    let err = coordinator
        .execute(PRINCIPAL, None, &subscribe("a@example.com", "A"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Duplicate(_)));
    assert_eq!(memory.outbox_tasks().len(), 2);
}

#[tokio::test]
async fn test_invalid_key_is_rejected_before_execution() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);

    for raw in ["", "has space", "under_score", &"k".repeat(129)] {
        let err = coordinator
            .execute(PRINCIPAL, Some(raw), &subscribe("a@example.com", "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidKey(_)), "{raw:?}");
    }
    assert!(memory.subscribers().is_empty());
}

#[tokio::test]
async fn test_failed_handler_leaves_no_trace_and_retry_is_fresh() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);
    let failing = FailingHandler {
        calls: AtomicUsize::new(0),
    };

    for _ in 0..2 {
        let err = coordinator.execute(PRINCIPAL, Some("retry-me"), &failing).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    assert!(memory.outbox_tasks().is_empty());
    assert!(memory
        .find_idempotency_record(PRINCIPAL, &IdempotencyKey::parse("retry-me").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_completion_failure_rolls_back_business_write() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);
    let handler = subscribe("ursula@example.com", "Ursula");

    memory.inject_fault(Fault::CompleteIdempotency);
    let err = coordinator.execute(PRINCIPAL, Some("abc123"), &handler).await.unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert!(memory.subscribers().is_empty());
    assert!(memory.outbox_tasks().is_empty());

    let retry = coordinator.execute(PRINCIPAL, Some("abc123"), &handler).await.unwrap();
    assert!(!retry.replayed);
    assert_eq!(memory.subscribers().len(), 1);
    assert_eq!(memory.outbox_tasks().len(), 1);
}

#[tokio::test]
async fn test_commit_failure_is_not_replayed() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);
    let handler = subscribe("ursula@example.com", "Ursula");

    memory.inject_fault(Fault::Commit);
    assert!(coordinator.execute(PRINCIPAL, Some("k-commit"), &handler).await.is_err());

    let retry = coordinator.execute(PRINCIPAL, Some("k-commit"), &handler).await.unwrap();
    assert!(!retry.replayed);
}

#[tokio::test]
async fn test_duplicate_while_in_progress_is_conflict() {
    let (memory, store) = memory_store();
    let coordinator = Arc::new(coordinator(store));
    let gated = Arc::new(GatedHandler {
        entered: Notify::new(),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });

    let first = {
        let coordinator = Arc::clone(&coordinator);
        let gated = Arc::clone(&gated);
        tokio::spawn(async move { coordinator.execute(PRINCIPAL, Some("busy"), gated.as_ref()).await })
    };
    gated.entered.notified().await;

    let err = coordinator
        .execute(PRINCIPAL, Some("busy"), gated.as_ref())
        .await
        .unwrap_err();
    match err {
        AppError::Conflict { retry_after_secs, .. } => assert_eq!(retry_after_secs, 1),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(memory.outbox_tasks().is_empty(), "in-flight work must not be visible");

    gated.release.notify_one();
    let original = first.await.unwrap().unwrap();
    assert!(!original.replayed);

    let replay = coordinator.execute(PRINCIPAL, Some("busy"), gated.as_ref()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.response, original.response);
    assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
    assert_eq!(memory.outbox_tasks().len(), 1);

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.fresh_requests, 1);
    assert_eq!(snapshot.in_progress_rejections, 1);
    assert_eq!(snapshot.replayed_requests, 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_execute_exactly_once() {
    let (_, store) = memory_store();
    let coordinator = Arc::new(coordinator(store));
    let handler = Arc::new(SlowHandler {
        calls: AtomicUsize::new(0),
    });
    let barrier = Arc::new(Barrier::new(8));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let coordinator = Arc::clone(&coordinator);
        let handler = Arc::clone(&handler);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            coordinator.execute(PRINCIPAL, Some("race"), handler.as_ref()).await
        }));
    }

    let mut fresh = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(response) if !response.replayed => fresh += 1,
            Ok(_) => {}
            Err(AppError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recent_started_record_is_in_progress() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);
    let handler = subscribe("ursula@example.com", "Ursula");
    let key = IdempotencyKey::parse("abc123").unwrap();

    memory.seed_idempotency_record(IdempotencyRecord::started(
        PRINCIPAL,
        &key,
        &handler.fingerprint(),
        Utc::now() - Duration::minutes(1),
    ));

    let err = coordinator.execute(PRINCIPAL, Some("abc123"), &handler).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));
    assert!(memory.subscribers().is_empty());
}

#[tokio::test]
async fn test_abandoned_started_record_is_taken_over() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);
    let handler = subscribe("ursula@example.com", "Ursula");
    let key = IdempotencyKey::parse("abc123").unwrap();

    memory.seed_idempotency_record(IdempotencyRecord::started(
        PRINCIPAL,
        &key,
        &handler.fingerprint(),
        Utc::now() - Duration::minutes(30),
    ));

    let response = coordinator.execute(PRINCIPAL, Some("abc123"), &handler).await.unwrap();
    assert!(!response.replayed);
    assert_eq!(memory.subscribers().len(), 1);
    assert!(memory_record(&memory, "abc123").await.is_completed());
}

#[tokio::test]
async fn test_store_outage_surfaces_as_unavailable() {
    let (memory, store) = memory_store();
    let coordinator = coordinator(store);

    memory.inject_fault(Fault::Begin);
    let err = coordinator
        .execute(PRINCIPAL, Some("abc123"), &subscribe("a@example.com", "A"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert_eq!(coordinator.metrics().snapshot().failed_requests, 1);
}
