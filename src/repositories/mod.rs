pub mod memory;
pub mod postgres;

pub use memory::{Fault, InMemoryStore};
pub use postgres::{PgStore, PgStoreTx};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::idempotency::{IdempotencyKey, IdempotencyRecord, StartAttempt, StoredResponse};
use crate::models::{NewsletterIssue, OutboxTask, Subscriber, TaskStatus};

/// The transactional store the pipeline is built on.
///
/// Pool-level operations live here; anything that must commit together with a
/// business mutation goes through a [`StoreTx`] obtained from [`Store::begin`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn find_idempotency_record(
        &self,
        principal_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Atomically moves up to `limit` claimable tasks to `in_flight`.
    ///
    /// Claimable means pending with `available_at <= now`, or in flight with a
    /// claim older than `reclaim_before`. No task is handed to two callers.
    /// Every claim carries a fresh `claim_token`. Reclaiming an abandoned
    /// task counts the abandoned execution in `attempt_count`.
    async fn claim_outbox_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxTask>>;

    /// Marks an in-flight task done.
    ///
    /// Returns false unless the task is still in flight under `claim_token`,
    /// i.e. it was reclaimed or already settled by another worker.
    async fn complete_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns an in-flight task to pending for a later attempt.
    async fn retry_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool>;

    /// Marks an in-flight task permanently failed.
    async fn fail_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find_outbox_task(&self, task_id: Uuid) -> Result<Option<OutboxTask>>;

    async fn list_outbox_tasks(&self, status: TaskStatus, limit: i64) -> Result<Vec<OutboxTask>>;

    async fn count_outbox_tasks(&self, status: TaskStatus) -> Result<i64>;

    /// Deletes `done` tasks completed before `older_than`.
    async fn purge_done_tasks(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// A unit of work. Dropping it without [`StoreTx::commit`] rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Insert-or-detect for the (principal, key) pair.
    async fn try_start_idempotency(
        &mut self,
        principal_id: &str,
        key: &IdempotencyKey,
        request_fingerprint: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StartAttempt>;

    /// started → completed for a record this transaction started.
    async fn complete_idempotency(
        &mut self,
        principal_id: &str,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Fails with `Duplicate` when the email is already subscribed.
    async fn insert_subscriber(&mut self, subscriber: &Subscriber) -> Result<()>;

    async fn insert_subscription_token(&mut self, subscriber_id: Uuid, token: &str) -> Result<()>;

    async fn find_subscriber_id_by_token(&mut self, token: &str) -> Result<Option<Uuid>>;

    /// pending → confirmed. Returns the subscriber, or `None` if it does not exist.
    async fn confirm_subscriber(&mut self, subscriber_id: Uuid) -> Result<Option<Subscriber>>;

    async fn list_confirmed_subscribers(&mut self) -> Result<Vec<Subscriber>>;

    async fn insert_newsletter_issue(&mut self, issue: &NewsletterIssue) -> Result<()>;

    async fn insert_outbox_task(&mut self, task: &OutboxTask) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
