use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// `last_error` of a task whose previous claim timed out.
pub const CLAIM_EXPIRED: &str = "claim expired";

/// Delivery state of an outbox task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `available_at` to pass.
    Pending,
    /// Claimed by exactly one dispatcher.
    InFlight,
    /// Side effect executed.
    Done,
    /// Retry ceiling reached. Kept for inspection, never purged.
    Failed,
}

/// The side effect a task stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SendConfirmationEmail,
    SendNewsletterIssue,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendConfirmationEmail => "send_confirmation_email",
            TaskKind::SendNewsletterIssue => "send_newsletter_issue",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of an email side effect, built per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// A row of the transactional outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OutboxTask {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Fencing token of the current claim. Result writes must present it.
    pub claim_token: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxTask {
    /// Creates a pending task that is immediately available.
    pub fn pending(kind: TaskKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            kind,
            payload,
            status: TaskStatus::Pending,
            attempt_count: 0,
            available_at: now,
            claim_token: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Whether a dispatcher may claim the task at `now`.
    ///
    /// In-flight tasks whose claim predates `reclaim_before` belonged to a
    /// worker that stopped without reporting back.
    pub fn is_claimable(&self, now: DateTime<Utc>, reclaim_before: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => self.available_at <= now,
            TaskStatus::InFlight => self.claimed_at.map_or(true, |at| at < reclaim_before),
            TaskStatus::Done | TaskStatus::Failed => false,
        }
    }
}
