use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::repositories::{Store, StoreTx};
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Started,
    Completed,
}

/// One response header, kept in the order it was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HeaderPair {
    pub name: String,
    pub value: Vec<u8>,
}

impl HeaderPair {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A finalized response as handed to the transport layer and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub headers: Vec<HeaderPair>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status_code: u16, headers: Vec<HeaderPair>, body: Vec<u8>) -> Self {
        Self {
            status_code,
            headers,
            body,
        }
    }

    /// Serializes `value` as a JSON body.
    pub fn json<T: Serialize>(status_code: u16, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(
            status_code,
            vec![HeaderPair::new("content-type", "application/json")],
            body,
        ))
    }

    /// First header value with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }
}

/// Stored idempotency record, keyed by (principal_id, idempotency_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub principal_id: String,
    pub idempotency_key: String,
    pub status: IdempotencyStatus,
    pub request_fingerprint: String,
    pub response_status_code: Option<i16>,
    pub response_body: Option<Vec<u8>>,
    #[sqlx(skip)]
    pub response_headers: Vec<HeaderPair>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn started(
        principal_id: &str,
        key: &IdempotencyKey,
        request_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            idempotency_key: key.as_str().to_string(),
            status: IdempotencyStatus::Started,
            request_fingerprint: request_fingerprint.to_string(),
            response_status_code: None,
            response_body: None,
            response_headers: Vec::new(),
            created_at: now,
            completed_at: None,
        }
    }

    /// Moves the record to `completed`, capturing the response.
    pub fn complete_with(&mut self, response: &StoredResponse, now: DateTime<Utc>) -> Result<()> {
        if self.status == IdempotencyStatus::Completed {
            return Err(AppError::Internal(anyhow!(
                "idempotency record for key '{}' is already completed",
                self.idempotency_key
            )));
        }
        self.status = IdempotencyStatus::Completed;
        self.response_status_code = Some(status_code_column(response.status_code)?);
        self.response_body = Some(response.body.clone());
        self.response_headers = response.headers.clone();
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    /// A `started` record older than `stale_before` was abandoned by its owner.
    pub fn is_abandoned(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Started && self.created_at < stale_before
    }

    /// The stored response, present only once completed.
    pub fn response(&self) -> Option<StoredResponse> {
        if !self.is_completed() {
            return None;
        }
        let status_code = u16::try_from(self.response_status_code?).ok()?;
        Some(StoredResponse::new(
            status_code,
            self.response_headers.clone(),
            self.response_body.clone()?,
        ))
    }
}

/// Converts an HTTP status code into its SMALLINT column value.
pub(crate) fn status_code_column(status_code: u16) -> Result<i16> {
    i16::try_from(status_code).map_err(|_| {
        AppError::Internal(anyhow!("status code {} does not fit the schema", status_code))
    })
}

/// Result of the store's atomic insert-or-detect primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum StartAttempt {
    /// A `started` row now belongs to the calling transaction.
    Started,
    /// Another open transaction is executing this key.
    Locked,
    /// A committed record already exists.
    Existing(IdempotencyRecord),
}

/// What the caller of [`IdempotencyStore::begin`] must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Execute the business handler.
    Fresh,
    /// A duplicate is executing; do not run the handler.
    InProgress,
    /// Replay this response instead of executing.
    Completed(StoredResponse),
}

/// Save/replay protocol for idempotent requests.
pub struct IdempotencyStore {
    store: Arc<dyn Store>,
    stale_after: Duration,
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn Store>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Reads a committed record outside any transaction.
    pub async fn lookup(
        &self,
        principal_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>> {
        self.store.find_idempotency_record(principal_id, key).await
    }

    /// Atomically claims the key inside `tx`, or reports who owns it.
    pub async fn begin(
        &self,
        tx: &mut dyn StoreTx,
        principal_id: &str,
        key: &IdempotencyKey,
        request_fingerprint: &str,
    ) -> Result<BeginOutcome> {
        let now = Utc::now();
        let attempt = tx
            .try_start_idempotency(principal_id, key, request_fingerprint, now, now - self.stale_after)
            .await?;

        match attempt {
            StartAttempt::Started => {
                debug!(principal_id, key = %key, "Idempotency key claimed");
                Ok(BeginOutcome::Fresh)
            }
            StartAttempt::Locked => Ok(BeginOutcome::InProgress),
            StartAttempt::Existing(record) => Self::classify(record, request_fingerprint),
        }
    }

    /// Interprets a committed record for a new attempt carrying `request_fingerprint`.
    pub fn classify(record: IdempotencyRecord, request_fingerprint: &str) -> Result<BeginOutcome> {
        if record.request_fingerprint != request_fingerprint {
            warn!(
                principal_id = %record.principal_id,
                key = %record.idempotency_key,
                "Idempotency key reused with a different request"
            );
            return Err(AppError::KeyReused(
                "Idempotency key reused with different request parameters".to_string(),
            ));
        }

        match record.status {
            IdempotencyStatus::Started => Ok(BeginOutcome::InProgress),
            IdempotencyStatus::Completed => record
                .response()
                .map(BeginOutcome::Completed)
                .ok_or_else(|| {
                    AppError::Internal(anyhow!(
                        "completed idempotency record for key '{}' has no response",
                        record.idempotency_key
                    ))
                }),
        }
    }

    /// Records the final response in the same transaction as the business write.
    pub async fn complete(
        &self,
        tx: &mut dyn StoreTx,
        principal_id: &str,
        key: &IdempotencyKey,
        response: &StoredResponse,
    ) -> Result<()> {
        tx.complete_idempotency(principal_id, key, response, Utc::now())
            .await
    }
}
