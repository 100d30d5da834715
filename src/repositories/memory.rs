//! In-process store with the same transactional semantics as PostgreSQL.
//!
//! Writes are buffered in the transaction and applied under the store mutex
//! on commit, so an uncommitted write is invisible to everyone else and a
//! rolled-back transaction leaves no trace. Idempotency keys being executed
//! are tracked in a lock set, mirroring the advisory locks of [`super::PgStore`].

use async_trait::async_trait;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::error::{AppError, Result};
use crate::idempotency::{IdempotencyKey, IdempotencyRecord, StartAttempt, StoredResponse};
use crate::models::{
    NewsletterIssue, OutboxTask, Subscriber, SubscriberStatus, TaskStatus, CLAIM_EXPIRED,
};

type KeyId = (String, String);

/// One-shot failure to inject into the next matching store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Begin,
    CompleteIdempotency,
    Commit,
    ClaimOutbox,
}

#[derive(Default)]
struct MemoryState {
    subscribers: HashMap<Uuid, Subscriber>,
    tokens: HashMap<String, Uuid>,
    issues: HashMap<Uuid, NewsletterIssue>,
    idempotency: HashMap<KeyId, IdempotencyRecord>,
    outbox: HashMap<Uuid, OutboxTask>,
    key_locks: HashSet<KeyId>,
    faults: Vec<Fault>,
}

impl MemoryState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(index) => {
                self.faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn email_taken(&self, email: &str) -> bool {
        self.subscribers.values().any(|s| s.email == email)
    }
}

fn injected(fault: Fault) -> AppError {
    warn!(?fault, "Injected store fault");
    AppError::StoreUnavailable(sqlx::Error::PoolTimedOut)
}

fn lock_state(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| AppError::Internal(anyhow!("in-memory store mutex poisoned")))
}

/// Store kept entirely in process memory. Cloning shares the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next operation of the given kind fail with `StoreUnavailable`.
    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(fault);
        }
    }

    /// Writes a committed record directly, bypassing the begin protocol.
    pub fn seed_idempotency_record(&self, record: IdempotencyRecord) {
        if let Ok(mut state) = self.state.lock() {
            let id = (record.principal_id.clone(), record.idempotency_key.clone());
            state.idempotency.insert(id, record);
        }
    }

    /// Committed subscribers, oldest first.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        let mut subscribers: Vec<Subscriber> = self
            .state
            .lock()
            .map(|s| s.subscribers.values().cloned().collect())
            .unwrap_or_default();
        subscribers.sort_by_key(|s| s.created_at);
        subscribers
    }

    /// Committed outbox tasks, oldest first.
    pub fn outbox_tasks(&self) -> Vec<OutboxTask> {
        let mut tasks: Vec<OutboxTask> = self
            .state
            .lock()
            .map(|s| s.outbox.values().cloned().collect())
            .unwrap_or_default();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Committed newsletter issues.
    pub fn newsletter_issues(&self) -> Vec<NewsletterIssue> {
        self.state
            .lock()
            .map(|s| s.issues.values().cloned().collect())
            .unwrap_or_default()
    }

    fn update_in_flight<F>(&self, task_id: Uuid, claim_token: Uuid, update: F) -> Result<bool>
    where
        F: FnOnce(&mut OutboxTask),
    {
        let mut state = lock_state(&self.state)?;
        match state.outbox.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::InFlight && task.claim_token == Some(claim_token) =>
            {
                update(task);
                task.claimed_at = None;
                task.claim_token = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let mut state = lock_state(&self.state)?;
        if state.take_fault(Fault::Begin) {
            return Err(injected(Fault::Begin));
        }
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            writes: Vec::new(),
            held_keys: Vec::new(),
            open: true,
        }))
    }

    async fn find_idempotency_record(
        &self,
        principal_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>> {
        let state = lock_state(&self.state)?;
        let id = (principal_id.to_string(), key.as_str().to_string());
        Ok(state.idempotency.get(&id).cloned())
    }

    async fn claim_outbox_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxTask>> {
        let mut state = lock_state(&self.state)?;
        if state.take_fault(Fault::ClaimOutbox) {
            return Err(injected(Fault::ClaimOutbox));
        }

        let mut claimable: Vec<(DateTime<Utc>, Uuid)> = state
            .outbox
            .values()
            .filter(|t| t.is_claimable(now, reclaim_before))
            .map(|t| (t.available_at, t.task_id))
            .collect();
        claimable.sort();
        claimable.truncate(usize::try_from(limit).unwrap_or(0));

        let claim_token = Uuid::new_v4();
        let mut claimed = Vec::with_capacity(claimable.len());
        for (_, task_id) in claimable {
            if let Some(task) = state.outbox.get_mut(&task_id) {
                if task.status == TaskStatus::InFlight {
                    task.attempt_count += 1;
                    task.last_error = Some(CLAIM_EXPIRED.to_string());
                }
                task.status = TaskStatus::InFlight;
                task.claimed_at = Some(now);
                task.claim_token = Some(claim_token);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_in_flight(task_id, claim_token, |task| {
            task.status = TaskStatus::Done;
            task.attempt_count = attempt_count;
            task.completed_at = Some(now);
        })
    }

    async fn retry_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool> {
        self.update_in_flight(task_id, claim_token, |task| {
            task.status = TaskStatus::Pending;
            task.attempt_count = attempt_count;
            task.available_at = available_at;
            task.last_error = Some(last_error.to_string());
        })
    }

    async fn fail_outbox_task(
        &self,
        task_id: Uuid,
        claim_token: Uuid,
        attempt_count: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_in_flight(task_id, claim_token, |task| {
            task.status = TaskStatus::Failed;
            task.attempt_count = attempt_count;
            task.last_error = Some(last_error.to_string());
            task.completed_at = Some(now);
        })
    }

    async fn find_outbox_task(&self, task_id: Uuid) -> Result<Option<OutboxTask>> {
        let state = lock_state(&self.state)?;
        Ok(state.outbox.get(&task_id).cloned())
    }

    async fn list_outbox_tasks(&self, status: TaskStatus, limit: i64) -> Result<Vec<OutboxTask>> {
        let state = lock_state(&self.state)?;
        let mut tasks: Vec<OutboxTask> = state
            .outbox
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(tasks)
    }

    async fn count_outbox_tasks(&self, status: TaskStatus) -> Result<i64> {
        let state = lock_state(&self.state)?;
        Ok(state.outbox.values().filter(|t| t.status == status).count() as i64)
    }

    async fn purge_done_tasks(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = lock_state(&self.state)?;
        let before = state.outbox.len();
        state.outbox.retain(|_, t| {
            !(t.status == TaskStatus::Done && t.completed_at.map_or(false, |at| at < older_than))
        });
        Ok((before - state.outbox.len()) as u64)
    }
}

enum Write {
    Subscriber(Subscriber),
    Token(String, Uuid),
    Confirm(Uuid),
    Issue(NewsletterIssue),
    Idempotency(IdempotencyRecord),
    Outbox(OutboxTask),
}

/// Buffered unit of work over an [`InMemoryStore`].
pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    writes: Vec<Write>,
    held_keys: Vec<KeyId>,
    open: bool,
}

impl MemoryTx {
    fn release_keys(&mut self, state: &mut MemoryState) {
        for id in self.held_keys.drain(..) {
            state.key_locks.remove(&id);
        }
        self.open = false;
    }

    fn pending_subscriber(&self, id: Uuid) -> Option<&Subscriber> {
        self.writes.iter().find_map(|w| match w {
            Write::Subscriber(s) if s.id == id => Some(s),
            _ => None,
        })
    }

    fn pending_confirmation(&self, id: Uuid) -> bool {
        self.writes
            .iter()
            .any(|w| matches!(w, Write::Confirm(confirmed) if *confirmed == id))
    }

    fn pending_record_mut(&mut self, id: &KeyId) -> Option<&mut IdempotencyRecord> {
        self.writes.iter_mut().find_map(|w| match w {
            Write::Idempotency(r)
                if r.principal_id == id.0 && r.idempotency_key == id.1 =>
            {
                Some(r)
            }
            _ => None,
        })
    }

    fn apply(state: &mut MemoryState, write: Write) {
        match write {
            Write::Subscriber(subscriber) => {
                state.subscribers.insert(subscriber.id, subscriber);
            }
            Write::Token(token, subscriber_id) => {
                state.tokens.insert(token, subscriber_id);
            }
            Write::Confirm(id) => {
                if let Some(subscriber) = state.subscribers.get_mut(&id) {
                    subscriber.status = SubscriberStatus::Confirmed;
                }
            }
            Write::Issue(issue) => {
                state.issues.insert(issue.id, issue);
            }
            Write::Idempotency(record) => {
                let id = (record.principal_id.clone(), record.idempotency_key.clone());
                state.idempotency.insert(id, record);
            }
            Write::Outbox(task) => {
                state.outbox.insert(task.task_id, task);
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let state = Arc::clone(&self.state);
        if let Ok(mut guard) = state.lock() {
            self.release_keys(&mut guard);
        };
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn try_start_idempotency(
        &mut self,
        principal_id: &str,
        key: &IdempotencyKey,
        request_fingerprint: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StartAttempt> {
        let id: KeyId = (principal_id.to_string(), key.as_str().to_string());

        if self.held_keys.contains(&id) {
            let record = self.pending_record_mut(&id).map(|r| r.clone()).ok_or_else(|| {
                AppError::Internal(anyhow!("held key '{}' has no pending record", key))
            })?;
            return Ok(StartAttempt::Existing(record));
        }

        let state_handle = Arc::clone(&self.state);
        let mut state = lock_state(&state_handle)?;
        if state.key_locks.contains(&id) {
            return Ok(StartAttempt::Locked);
        }

        match state.idempotency.get(&id) {
            Some(existing) if !existing.is_abandoned(stale_before) => {
                return Ok(StartAttempt::Existing(existing.clone()));
            }
            Some(_) => warn!(principal_id, key = %key, "Took over abandoned idempotency record"),
            None => {}
        }

        state.key_locks.insert(id.clone());
        self.held_keys.push(id);
        self.writes.push(Write::Idempotency(IdempotencyRecord::started(
            principal_id,
            key,
            request_fingerprint,
            now,
        )));
        Ok(StartAttempt::Started)
    }

    async fn complete_idempotency(
        &mut self,
        principal_id: &str,
        key: &IdempotencyKey,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut state = lock_state(&self.state)?;
            if state.take_fault(Fault::CompleteIdempotency) {
                return Err(injected(Fault::CompleteIdempotency));
            }
        }

        let id: KeyId = (principal_id.to_string(), key.as_str().to_string());
        let record = self.pending_record_mut(&id).ok_or_else(|| {
            AppError::Internal(anyhow!("no started idempotency record for key '{}'", key))
        })?;
        record.complete_with(response, now)
    }

    async fn insert_subscriber(&mut self, subscriber: &Subscriber) -> Result<()> {
        let taken_here = self
            .writes
            .iter()
            .any(|w| matches!(w, Write::Subscriber(s) if s.email == subscriber.email));
        let taken = taken_here || lock_state(&self.state)?.email_taken(&subscriber.email);
        if taken {
            return Err(AppError::Duplicate(format!(
                "'{}' is already subscribed",
                subscriber.email
            )));
        }
        self.writes.push(Write::Subscriber(subscriber.clone()));
        Ok(())
    }

    async fn insert_subscription_token(&mut self, subscriber_id: Uuid, token: &str) -> Result<()> {
        self.writes.push(Write::Token(token.to_string(), subscriber_id));
        Ok(())
    }

    async fn find_subscriber_id_by_token(&mut self, token: &str) -> Result<Option<Uuid>> {
        let pending = self.writes.iter().find_map(|w| match w {
            Write::Token(t, id) if t == token => Some(*id),
            _ => None,
        });
        if pending.is_some() {
            return Ok(pending);
        }
        Ok(lock_state(&self.state)?.tokens.get(token).copied())
    }

    async fn confirm_subscriber(&mut self, subscriber_id: Uuid) -> Result<Option<Subscriber>> {
        let current = match self.pending_subscriber(subscriber_id) {
            Some(subscriber) => Some(subscriber.clone()),
            None => lock_state(&self.state)?.subscribers.get(&subscriber_id).cloned(),
        };

        let Some(mut subscriber) = current else {
            return Ok(None);
        };

        if subscriber.status == SubscriberStatus::Pending && !self.pending_confirmation(subscriber_id) {
            match self.writes.iter_mut().find_map(|w| match w {
                Write::Subscriber(s) if s.id == subscriber_id => Some(s),
                _ => None,
            }) {
                Some(pending) => pending.status = SubscriberStatus::Confirmed,
                None => self.writes.push(Write::Confirm(subscriber_id)),
            }
        }
        subscriber.status = SubscriberStatus::Confirmed;
        Ok(Some(subscriber))
    }

    async fn list_confirmed_subscribers(&mut self) -> Result<Vec<Subscriber>> {
        let mut subscribers: Vec<Subscriber> = lock_state(&self.state)?
            .subscribers
            .values()
            .cloned()
            .collect();
        for write in &self.writes {
            if let Write::Subscriber(s) = write {
                subscribers.push(s.clone());
            }
        }
        for subscriber in subscribers.iter_mut() {
            if self.pending_confirmation(subscriber.id) {
                subscriber.status = SubscriberStatus::Confirmed;
            }
        }
        subscribers.retain(|s| s.is_confirmed());
        subscribers.sort_by_key(|s| s.created_at);
        Ok(subscribers)
    }

    async fn insert_newsletter_issue(&mut self, issue: &NewsletterIssue) -> Result<()> {
        self.writes.push(Write::Issue(issue.clone()));
        Ok(())
    }

    async fn insert_outbox_task(&mut self, task: &OutboxTask) -> Result<()> {
        self.writes.push(Write::Outbox(task.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let state_handle = Arc::clone(&this.state);
        let mut state = lock_state(&state_handle)?;

        if state.take_fault(Fault::Commit) {
            this.release_keys(&mut state);
            return Err(injected(Fault::Commit));
        }

        // Another transaction may have committed the same email since our insert.
        let conflict = this.writes.iter().find_map(|w| match w {
            Write::Subscriber(s) if state.email_taken(&s.email) => Some(s.email.clone()),
            _ => None,
        });
        if let Some(email) = conflict {
            this.release_keys(&mut state);
            return Err(AppError::Duplicate(format!("'{}' is already subscribed", email)));
        }

        for write in std::mem::take(&mut this.writes) {
            Self::apply(&mut state, write);
        }
        this.release_keys(&mut state);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let state_handle = Arc::clone(&this.state);
        let mut state = lock_state(&state_handle)?;
        this.writes.clear();
        this.release_keys(&mut state);
        Ok(())
    }
}
