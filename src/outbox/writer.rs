use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{EmailPayload, OutboxTask, TaskKind};
use crate::observability::get_metrics;
use crate::repositories::StoreTx;

/// Records side effects inside the caller's transaction.
///
/// A task becomes visible to dispatchers only when the enclosing transaction
/// commits, and vanishes with it on rollback.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    pub fn new() -> Self {
        Self
    }

    pub async fn enqueue(
        &self,
        tx: &mut dyn StoreTx,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let task = OutboxTask::pending(kind, payload);
        tx.insert_outbox_task(&task).await?;

        get_metrics().record_task_enqueued(kind.as_str());
        debug!(task_id = %task.task_id, kind = %kind, "Outbox task enqueued");
        Ok(task.task_id)
    }

    pub async fn enqueue_email(
        &self,
        tx: &mut dyn StoreTx,
        kind: TaskKind,
        email: &EmailPayload,
    ) -> Result<Uuid> {
        let payload = serde_json::to_value(email)?;
        self.enqueue(tx, kind, payload).await
    }
}
