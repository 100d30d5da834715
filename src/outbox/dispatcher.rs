use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxSettings;
use crate::error::{AppError, Result};
use crate::models::{EmailPayload, OutboxTask, TaskKind, TaskStatus, CLAIM_EXPIRED};
use crate::observability::{get_metrics, mask_email, LatencyTimer};
use crate::outbox::sender::EmailSender;
use crate::repositories::Store;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: std::time::Duration,
    pub batch_size: i64,
    /// Total executions allowed per task, the first one included.
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// An in-flight claim older than this is handed to another worker.
    pub claim_timeout: Duration,
    pub send_timeout: std::time::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(1),
            batch_size: 20,
            max_attempts: 8,
            base_backoff: Duration::seconds(2),
            max_backoff: Duration::minutes(10),
            claim_timeout: Duration::minutes(5),
            send_timeout: std::time::Duration::from_secs(10),
        }
    }
}

impl From<&OutboxSettings> for DispatcherConfig {
    fn from(settings: &OutboxSettings) -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(settings.poll_interval_ms),
            batch_size: settings.batch_size,
            max_attempts: settings.max_attempts,
            base_backoff: Duration::milliseconds(settings.base_backoff_ms),
            max_backoff: Duration::milliseconds(settings.max_backoff_ms),
            claim_timeout: Duration::seconds(settings.claim_timeout_secs),
            send_timeout: std::time::Duration::from_secs(settings.send_timeout_secs),
        }
    }
}

impl DispatcherConfig {
    /// Rejects settings under which a claim can expire while its batch is
    /// still being sent, which would hand tail tasks to a second worker.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 1 {
            return Err(invalid_config("outbox batch_size must be at least 1"));
        }
        if self.max_attempts < 1 {
            return Err(invalid_config("outbox max_attempts must be at least 1"));
        }

        let claim_timeout = self
            .claim_timeout
            .to_std()
            .map_err(|_| invalid_config("outbox claim_timeout must be positive"))?;
        let batch = u32::try_from(self.batch_size).unwrap_or(u32::MAX);
        let worst_case = self.send_timeout.saturating_mul(batch);
        if worst_case >= claim_timeout {
            return Err(invalid_config(&format!(
                "outbox batch_size * send_timeout ({}s) must stay below claim_timeout ({}s)",
                worst_case.as_secs(),
                claim_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

fn invalid_config(message: &str) -> AppError {
    AppError::Config(config::ConfigError::Message(message.to_string()))
}

/// Outcome counts of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Claims committed outbox tasks and executes them with bounded retries.
///
/// Delivery is at-least-once: a worker that dies between the send and the
/// status update leaves the task in flight, and it is re-sent once the claim
/// times out.
pub struct OutboxDispatcher {
    store: Arc<dyn Store>,
    sender: Arc<dyn EmailSender>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn EmailSender>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            sender,
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Delay before the next try after `attempts` failed executions.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 32) as u32;
        let base_ms = self.config.base_backoff.num_milliseconds();
        let delay_ms = base_ms.saturating_mul(2i64.saturating_pow(exponent));
        Duration::milliseconds(delay_ms.min(self.config.max_backoff.num_milliseconds()))
    }

    /// Runs one cycle against the wall clock. Results are stamped when they
    /// are recorded, not when the batch was claimed.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        self.cycle(Utc::now(), &Utc::now).await
    }

    /// Runs a single claim-and-execute cycle with the clock frozen at `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        self.cycle(now, &move || now).await
    }

    async fn cycle(
        &self,
        now: DateTime<Utc>,
        clock: &(dyn Fn() -> DateTime<Utc> + Sync),
    ) -> Result<DispatchReport> {
        let reclaim_before = now - self.config.claim_timeout;
        let tasks = self
            .store
            .claim_outbox_tasks(self.config.batch_size, now, reclaim_before)
            .await?;

        let mut report = DispatchReport {
            claimed: tasks.len(),
            ..DispatchReport::default()
        };

        for task in tasks {
            self.process(task, clock, &mut report).await;
        }

        if report.claimed > 0 {
            debug!(?report, "Dispatch cycle finished");
        }
        Ok(report)
    }

    async fn process(
        &self,
        task: OutboxTask,
        clock: &(dyn Fn() -> DateTime<Utc> + Sync),
        report: &mut DispatchReport,
    ) {
        let Some(claim_token) = task.claim_token else {
            error!(task_id = %task.task_id, "Claimed outbox task has no claim token");
            return;
        };

        // Every allowed execution was abandoned by a worker that never reported back.
        if task.attempt_count >= self.config.max_attempts {
            let last_error = task.last_error.as_deref().unwrap_or(CLAIM_EXPIRED);
            let updated = self
                .exhaust(&task, claim_token, task.attempt_count, last_error, clock(), report)
                .await;
            self.log_update(&task, updated);
            return;
        }

        let attempts = task.attempt_count + 1;
        let kind = task.kind;

        let timer = LatencyTimer::new();
        let outcome = self.execute(&task).await;
        get_metrics().record_send_latency(timer.elapsed_ms());
        get_metrics().record_task_dispatched(kind.as_str(), outcome.is_ok());

        let updated = match outcome {
            Ok(()) => {
                report.succeeded += 1;
                info!(task_id = %task.task_id, kind = %kind, attempts, "Outbox task delivered");
                self.store
                    .complete_outbox_task(task.task_id, claim_token, attempts, clock())
                    .await
            }
            Err(e) if attempts < self.config.max_attempts && !is_permanent(&e) => {
                report.retried += 1;
                let available_at = clock() + self.backoff_for(attempts);
                warn!(
                    task_id = %task.task_id,
                    kind = %kind,
                    attempts,
                    retry_at = %available_at,
                    error = %e,
                    "Outbox task failed, scheduled for retry"
                );
                self.store
                    .retry_outbox_task(task.task_id, claim_token, attempts, available_at, &e.to_string())
                    .await
            }
            Err(e) => {
                self.exhaust(&task, claim_token, attempts, &e.to_string(), clock(), report)
                    .await
            }
        };

        self.log_update(&task, updated);
    }

    async fn exhaust(
        &self,
        task: &OutboxTask,
        claim_token: Uuid,
        attempts: i32,
        last_error: &str,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<bool> {
        report.failed += 1;
        get_metrics().record_task_exhausted(task.kind.as_str());
        let exhausted = AppError::TaskExhausted {
            task_id: task.task_id,
            attempts,
        };
        error!(kind = %task.kind, last_error, "{}", exhausted);
        self.store
            .fail_outbox_task(task.task_id, claim_token, attempts, last_error, now)
            .await
    }

    fn log_update(&self, task: &OutboxTask, updated: Result<bool>) {
        match updated {
            Ok(true) => {}
            Ok(false) => warn!(task_id = %task.task_id, "Outbox task was reclaimed before its result was recorded"),
            // The claim times out and another cycle re-executes the task.
            Err(e) => error!(task_id = %task.task_id, error = %e, "Failed to record outbox task result"),
        }
    }

    async fn execute(&self, task: &OutboxTask) -> Result<()> {
        let email: EmailPayload = serde_json::from_value(task.payload.clone())?;
        match task.kind {
            TaskKind::SendConfirmationEmail | TaskKind::SendNewsletterIssue => {
                debug!(task_id = %task.task_id, recipient = %mask_email(&email.recipient), "Executing email task");
            }
        }

        let send = self.sender.send(
            &email.recipient,
            &email.subject,
            &email.text_body,
            &email.html_body,
        );
        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(AppError::SendFailure(format!(
                "send timed out after {}ms",
                self.config.send_timeout.as_millis()
            ))),
        }
    }

    /// Spawns the polling loop. It stops when `shutdown` flips to true or its sender is dropped.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                batch_size = self.config.batch_size,
                max_attempts = self.config.max_attempts,
                "Outbox dispatcher started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.claimed > 0 => info!(
                                claimed = report.claimed,
                                succeeded = report.succeeded,
                                retried = report.retried,
                                failed = report.failed,
                                "Outbox dispatch cycle"
                            ),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Outbox dispatch cycle failed"),
                        }
                        if let Ok(pending) = self.store.count_outbox_tasks(TaskStatus::Pending).await {
                            get_metrics().set_pending_tasks(pending);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Outbox dispatcher stopped");
        })
    }
}

/// Failures that no retry can fix.
fn is_permanent(error: &AppError) -> bool {
    matches!(error, AppError::Serialization(_))
}
