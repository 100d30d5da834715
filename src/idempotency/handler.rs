use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::storage::{BeginOutcome, IdempotencyStore, StoredResponse};
use crate::observability::{get_metrics, LatencyTimer};
use crate::repositories::{Store, StoreTx};
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters for requests passing through the coordinator.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub fresh_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub in_progress_rejections: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fresh(&self) {
        self.fresh_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_progress(&self) {
        self.in_progress_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            fresh_requests: self.fresh_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            in_progress_rejections: self.in_progress_rejections.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub fresh_requests: u64,
    pub replayed_requests: u64,
    pub in_progress_rejections: u64,
    pub failed_requests: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// A side-effecting operation that runs inside the coordinator's transaction.
///
/// Everything written through `tx` (business rows, outbox tasks) commits
/// together with the idempotency record, or not at all.
#[async_trait]
pub trait TransactionalHandler: Send + Sync {
    /// Label used in logs and metrics.
    fn operation(&self) -> &'static str;

    /// Digest of the request parameters, compared on replay.
    fn fingerprint(&self) -> String;

    async fn handle(&self, tx: &mut dyn StoreTx) -> Result<StoredResponse>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub stale_after: Duration,
    pub retry_after_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(10),
            retry_after_secs: 1,
        }
    }
}

impl From<&IdempotencySettings> for CoordinatorConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            stale_after: Duration::seconds(settings.stale_after_secs),
            retry_after_secs: settings.retry_after_secs,
        }
    }
}

/// The response to send, and whether it was replayed from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatedResponse {
    pub response: StoredResponse,
    pub replayed: bool,
}

/// Runs handlers at most once per (principal, key) and replays their responses.
pub struct RequestCoordinator {
    store: Arc<dyn Store>,
    idempotency: IdempotencyStore,
    config: CoordinatorConfig,
    metrics: Arc<IdempotencyMetrics>,
}

impl RequestCoordinator {
    pub fn new(store: Arc<dyn Store>, config: CoordinatorConfig) -> Self {
        let idempotency = IdempotencyStore::new(Arc::clone(&store), config.stale_after);
        Self {
            store,
            idempotency,
            config,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Executes `handler` for `principal_id`, deduplicating on `raw_key` when present.
    pub async fn execute(
        &self,
        principal_id: &str,
        raw_key: Option<&str>,
        handler: &dyn TransactionalHandler,
    ) -> Result<CoordinatedResponse> {
        let timer = LatencyTimer::new();
        self.metrics.record_request();

        let result = match raw_key {
            None => self.execute_unkeyed(handler).await,
            Some(raw) => match IdempotencyKey::parse(raw) {
                Ok(key) => self.execute_keyed(principal_id, &key, handler).await,
                Err(e) => Err(e),
            },
        };

        get_metrics().record_request_latency(handler.operation(), timer.elapsed_ms());
        if let Err(e) = &result {
            if !matches!(e, AppError::Conflict { .. }) {
                self.metrics.record_failed();
                get_metrics().record_idempotency_outcome(handler.operation(), "failed");
            }
        }
        result
    }

    async fn execute_unkeyed(&self, handler: &dyn TransactionalHandler) -> Result<CoordinatedResponse> {
        debug!(operation = handler.operation(), "No idempotency key, executing without dedup");
        get_metrics().record_idempotency_outcome(handler.operation(), "unkeyed");

        let mut tx = self.store.begin().await?;
        match handler.handle(tx.as_mut()).await {
            Ok(response) => {
                tx.commit().await?;
                Ok(CoordinatedResponse {
                    response,
                    replayed: false,
                })
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn execute_keyed(
        &self,
        principal_id: &str,
        key: &IdempotencyKey,
        handler: &dyn TransactionalHandler,
    ) -> Result<CoordinatedResponse> {
        let operation = handler.operation();
        let fingerprint = handler.fingerprint();

        if let Some(record) = self.idempotency.lookup(principal_id, key).await? {
            if record.is_completed() {
                if let BeginOutcome::Completed(response) =
                    IdempotencyStore::classify(record, &fingerprint)?
                {
                    return Ok(self.replay(operation, principal_id, key, response));
                }
            }
        }

        let mut tx = self.store.begin().await?;
        let outcome = match self
            .idempotency
            .begin(tx.as_mut(), principal_id, key, &fingerprint)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };

        match outcome {
            BeginOutcome::InProgress => {
                rollback_quietly(tx).await;
                self.metrics.record_in_progress();
                get_metrics().record_idempotency_outcome(operation, "in_progress");
                info!(operation, principal_id, key = %key, "Duplicate request while original is in progress");
                Err(AppError::Conflict {
                    message: "A request with this idempotency key is already in progress".to_string(),
                    retry_after_secs: self.config.retry_after_secs,
                })
            }
            BeginOutcome::Completed(response) => {
                rollback_quietly(tx).await;
                Ok(self.replay(operation, principal_id, key, response))
            }
            BeginOutcome::Fresh => {
                let response = match self.run_fresh(tx.as_mut(), principal_id, key, handler).await {
                    Ok(response) => response,
                    Err(e) => {
                        rollback_quietly(tx).await;
                        warn!(operation, principal_id, key = %key, error = %e, "Idempotent request failed, rolled back");
                        return Err(e);
                    }
                };
                tx.commit().await?;

                self.metrics.record_fresh();
                get_metrics().record_idempotency_outcome(operation, "fresh");
                info!(operation, principal_id, key = %key, status = response.status_code, "Idempotent request completed");
                Ok(CoordinatedResponse {
                    response,
                    replayed: false,
                })
            }
        }
    }

    async fn run_fresh(
        &self,
        tx: &mut dyn StoreTx,
        principal_id: &str,
        key: &IdempotencyKey,
        handler: &dyn TransactionalHandler,
    ) -> Result<StoredResponse> {
        let response = handler.handle(&mut *tx).await?;
        self.idempotency.complete(tx, principal_id, key, &response).await?;
        Ok(response)
    }

    fn replay(
        &self,
        operation: &str,
        principal_id: &str,
        key: &IdempotencyKey,
        response: StoredResponse,
    ) -> CoordinatedResponse {
        self.metrics.record_replayed();
        get_metrics().record_idempotency_outcome(operation, "replayed");
        debug!(operation, principal_id, key = %key, "Replaying stored response");
        CoordinatedResponse {
            response,
            replayed: true,
        }
    }
}

async fn rollback_quietly(tx: Box<dyn StoreTx>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed; transaction discarded");
    }
}
