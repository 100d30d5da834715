use async_trait::async_trait;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::error::{AppError, Result};
use crate::idempotency::storage::status_code_column;
use crate::idempotency::{HeaderPair, IdempotencyKey, IdempotencyRecord, StartAttempt, StoredResponse};
use crate::models::{NewsletterIssue, OutboxTask, Subscriber, TaskStatus, CLAIM_EXPIRED};

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// An open PostgreSQL transaction. sqlx rolls it back on drop.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

/// Name hashed into the advisory lock guarding one (principal, key) pair.
fn advisory_lock_name(principal_id: &str, key: &IdempotencyKey) -> String {
    format!("idempotency:{}:{}", principal_id, key)
}

fn map_unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            AppError::Duplicate(message())
        }
        _ => AppError::StoreUnavailable(err),
    }
}

async fn load_idempotency_record(
    conn: &mut PgConnection,
    principal_id: &str,
    key: &IdempotencyKey,
) -> Result<Option<IdempotencyRecord>> {
    let record = sqlx::query_as::<_, IdempotencyRecord>(
        r#"
        SELECT principal_id, idempotency_key, status, request_fingerprint, response_status_code, response_body, created_at, completed_at
        FROM idempotency_records
        WHERE principal_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(principal_id)
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut record) = record else {
        return Ok(None);
    };

    record.response_headers = sqlx::query_as::<_, HeaderPair>(
        r#"
        SELECT name, value
        FROM idempotency_headers
        WHERE principal_id = $1 AND idempotency_key = $2
        ORDER BY position
        "#,
    )
    .bind(principal_id)
    .bind(key.as_str())
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(record))
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn find_idempotency_record(
        &self,
        principal_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.pool.acquire().await?;
        load_idempotency_record(&mut conn, principal_id, key).await
    }

    async fn claim_outbox_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxTask>> {
        // SET expressions see the pre-update row, so `status = 'in_flight'`
        // picks out reclaimed tasks.
        let rows = sqlx::query_as::<_, OutboxTask>(
            r#"
            UPDATE outbox_tasks
            SET status = 'in_flight',
                claimed_at = $2,
                claim_token = $4,
                attempt_count = CASE WHEN status = 'in_flight' THEN attempt_count + 1 ELSE attempt_count END,
                last_error = CASE WHEN status = 'in_flight' THEN $5 ELSE last_error END
            WHERE task_id IN (
                SELECT task_id
                FROM outbox_tasks
                WHERE (status = 'pending' AND available_at <= $2)
                   OR (status = 'in_flight' AND claimed_at < $3)
                ORDER BY available_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING task_id, kind, payload, status, attempt_count, available_at, claimed_at, claim_token, last_error, created_at, completed_at
            "#,
        )
        .bind(limit)
        .bind(now)
        .bind(reclaim_before)
        .bind(Uuid::new_v4())
        .bind(CLAIM_EXPIRED)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn complete_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_tasks
            SET status = 'done', attempt_count = $3, completed_at = $4, claimed_at = NULL, claim_token = NULL
            WHERE task_id = $1 AND status = 'in_flight' AND claim_token = $2
            "#,
        )
        .bind(task_id)
        .bind(claim_token)
        .bind(attempt_count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn retry_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_tasks
            SET status = 'pending', attempt_count = $3, available_at = $4, last_error = $5, claimed_at = NULL, claim_token = NULL
            WHERE task_id = $1 AND status = 'in_flight' AND claim_token = $2
            "#,
        )
        .bind(task_id)
        .bind(claim_token)
        .bind(attempt_count)
        .bind(available_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_tasks
            SET status = 'failed', attempt_count = $3, last_error = $4, completed_at = $5, claimed_at = NULL, claim_token = NULL
            WHERE task_id = $1 AND status = 'in_flight' AND claim_token = $2
            "#,
        )
        .bind(task_id)
        .bind(claim_token)
        .bind(attempt_count)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_outbox_task(&self, task_id: Uuid) -> Result<Option<OutboxTask>> {
        let row = sqlx::query_as::<_, OutboxTask>(
            r#"
            SELECT task_id, kind, payload, status, attempt_count, available_at, claimed_at, claim_token, last_error, created_at, completed_at
            FROM outbox_tasks
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_outbox_tasks(&self, status: TaskStatus, limit: i64) -> Result<Vec<OutboxTask>> {
        let rows = sqlx::query_as::<_, OutboxTask>(
            r#"
            SELECT task_id, kind, payload, status, attempt_count, available_at, claimed_at, claim_token, last_error, created_at, completed_at
            FROM outbox_tasks
            WHERE status = $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_outbox_tasks(&self, status: TaskStatus) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM outbox_tasks WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn purge_done_tasks(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_tasks
            WHERE status = 'done' AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn try_start_idempotency(
        &mut self,
        principal_id: &str,
        key: &IdempotencyKey,
        request_fingerprint: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StartAttempt> {
        // Held until this transaction ends, so a concurrent duplicate sees it
        // even before the started row is visible.
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(advisory_lock_name(principal_id, key))
            .fetch_one(&mut *self.tx)
            .await?;

        if !locked {
            return Ok(StartAttempt::Locked);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (principal_id, idempotency_key, status, request_fingerprint, created_at)
            VALUES ($1, $2, 'started', $3, $4)
            ON CONFLICT (principal_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(principal_id)
        .bind(key.as_str())
        .bind(request_fingerprint)
        .bind(now)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(StartAttempt::Started);
        }

        let taken_over = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET request_fingerprint = $3, created_at = $4
            WHERE principal_id = $1 AND idempotency_key = $2
              AND status = 'started' AND created_at < $5
            "#,
        )
        .bind(principal_id)
        .bind(key.as_str())
        .bind(request_fingerprint)
        .bind(now)
        .bind(stale_before)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if taken_over == 1 {
            warn!(principal_id, key = %key, "Took over abandoned idempotency record");
            return Ok(StartAttempt::Started);
        }

        let existing = load_idempotency_record(&mut self.tx, principal_id, key)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow!("idempotency record for key '{}' vanished", key))
            })?;

        Ok(StartAttempt::Existing(existing))
    }

    async fn complete_idempotency(
        &mut self,
        principal_id: &str,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'completed', response_status_code = $3, response_body = $4, completed_at = $5
            WHERE principal_id = $1 AND idempotency_key = $2 AND status = 'started'
            "#,
        )
        .bind(principal_id)
        .bind(key.as_str())
        .bind(status_code_column(response.status_code)?)
        .bind(&response.body)
        .bind(now)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if updated != 1 {
            return Err(AppError::Internal(anyhow!(
                "no started idempotency record for key '{}'",
                key
            )));
        }

        for (position, header) in response.headers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO idempotency_headers (principal_id, idempotency_key, position, name, value)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(principal_id)
            .bind(key.as_str())
            .bind(position as i32)
            .bind(&header.name)
            .bind(&header.value)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn insert_subscriber(&mut self, subscriber: &Subscriber) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, email, name, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(subscriber.id)
        .bind(&subscriber.email)
        .bind(&subscriber.name)
        .bind(subscriber.status)
        .bind(subscriber.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            map_unique_violation(e, || format!("'{}' is already subscribed", subscriber.email))
        })?;

        Ok(())
    }

    async fn insert_subscription_token(&mut self, subscriber_id: Uuid, token: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_tokens (subscription_token, subscriber_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(token)
        .bind(subscriber_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn find_subscriber_id_by_token(&mut self, token: &str) -> Result<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT subscriber_id FROM subscription_tokens WHERE subscription_token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| r.0))
    }

    async fn confirm_subscriber(&mut self, subscriber_id: Uuid) -> Result<Option<Subscriber>> {
        let confirmed = sqlx::query_as::<_, Subscriber>(
            r#"
            UPDATE subscriptions
            SET status = 'confirmed'
            WHERE id = $1 AND status = 'pending'
            RETURNING id, email, name, status, created_at
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        if confirmed.is_some() {
            return Ok(confirmed);
        }

        let existing = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT id, email, name, status, created_at
            FROM subscriptions
            WHERE id = $1
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(existing)
    }

    async fn list_confirmed_subscribers(&mut self) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT id, email, name, status, created_at
            FROM subscriptions
            WHERE status = 'confirmed'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows)
    }

    async fn insert_newsletter_issue(&mut self, issue: &NewsletterIssue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO newsletter_issues (id, title, text_content, html_content, published_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(issue.id)
        .bind(&issue.title)
        .bind(&issue.text_content)
        .bind(&issue.html_content)
        .bind(issue.published_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_outbox_task(&mut self, task: &OutboxTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_tasks (task_id, kind, payload, status, attempt_count, available_at, claimed_at, last_error, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.task_id)
        .bind(task.kind)
        .bind(&task.payload)
        .bind(task.status)
        .bind(task.attempt_count)
        .bind(task.available_at)
        .bind(task.claimed_at)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
