//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::mailboxes::model::{Mailbox, Subscription};
use crate::pipeline::rules::AutoReplyRule;
use crate::pipeline::types::{Message, MessageStatus};
use crate::scheduler::jobs::ScheduledJob;
use crate::sla::BreachKind;
use crate::tasks::model::Task;
use crate::threads::model::{Priority, Thread};

/// Backend-agnostic database trait covering mailboxes, threads, messages,
/// tasks, rules and scheduled jobs.
///
/// Two uniqueness keys are enforced by every backend: the provider message id
/// and `(mailbox_id, conversation_id)` for threads.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    /// Insert or update a mailbox's configuration. Never touches the
    /// watermark, subscription or lease of an existing row.
    async fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError>;

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError>;

    async fn list_active_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError>;

    async fn find_mailbox_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Mailbox>, DatabaseError>;

    /// Advance the incremental-ingestion watermark. Never moves it backwards.
    async fn update_sync_watermark(
        &self,
        mailbox_id: Uuid,
        watermark: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_subscription(
        &self,
        mailbox_id: Uuid,
        subscription: Option<&Subscription>,
    ) -> Result<(), DatabaseError>;

    async fn deactivate_mailbox(&self, mailbox_id: Uuid) -> Result<(), DatabaseError>;

    /// Take the per-mailbox sync lease if it is free or expired.
    async fn try_acquire_sync_lease(
        &self,
        mailbox_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn release_sync_lease(&self, mailbox_id: Uuid, holder: Uuid)
    -> Result<(), DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Insert a thread. Returns `false` when a thread for the same
    /// `(mailbox_id, conversation_id)` already exists.
    async fn insert_thread(&self, thread: &Thread) -> Result<bool, DatabaseError>;

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError>;

    async fn find_thread(
        &self,
        mailbox_id: Uuid,
        conversation_id: &str,
    ) -> Result<Option<Thread>, DatabaseError>;

    /// Persist the mutable fields of a thread. Breach flags are only ever
    /// raised here, never cleared.
    async fn update_thread(&self, thread: &Thread) -> Result<(), DatabaseError>;

    /// Non-terminal threads with at least one deadline whose breach flag is
    /// still unset.
    async fn list_sla_candidates(&self) -> Result<Vec<Thread>, DatabaseError>;

    /// Flip a breach flag false → true and raise priority. Returns `false`
    /// if the flag was already set.
    async fn mark_sla_breach(
        &self,
        thread_id: Uuid,
        kind: BreachKind,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn message_exists(&self, provider_message_id: &str) -> Result<bool, DatabaseError>;

    /// Insert a message. Returns `false` if the provider id is already stored.
    async fn insert_message(&self, message: &Message) -> Result<bool, DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    async fn list_thread_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    async fn latest_inbound_message(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Message>, DatabaseError>;

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        approved_by: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn list_thread_tasks(&self, thread_id: Uuid) -> Result<Vec<Task>, DatabaseError>;

    /// Mark a task completed. Returns `false` if it was already completed.
    async fn complete_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &AutoReplyRule) -> Result<(), DatabaseError>;

    /// Active rules for a mailbox ordered by `(priority, created_at, id)`.
    async fn list_active_rules(&self, mailbox_id: Uuid)
    -> Result<Vec<AutoReplyRule>, DatabaseError>;

    // ── Scheduled jobs ──────────────────────────────────────────────

    /// Insert a job. Returns `false` if a job with the same dedup key exists.
    async fn enqueue_job(&self, job: &ScheduledJob) -> Result<bool, DatabaseError>;

    /// Insert a job, or return a completed/failed job with the same dedup
    /// key to pending at `job.fire_at` with attempts reset. Returns `false`
    /// only when a pending or running job already covers the key.
    async fn enqueue_or_rearm_job(&self, job: &ScheduledJob) -> Result<bool, DatabaseError>;

    async fn get_job_by_key(&self, dedup_key: &str)
    -> Result<Option<ScheduledJob>, DatabaseError>;

    /// Pending jobs with `fire_at <= now`, oldest first.
    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Move a job pending → running. Returns `false` if another runner won.
    async fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Put a failed job back to pending for another attempt at `fire_at`.
    async fn reschedule_job(
        &self,
        id: Uuid,
        fire_at: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<(), DatabaseError>;

    async fn fail_job(&self, id: Uuid, attempts: u32, error: &str) -> Result<(), DatabaseError>;

    /// Return jobs stuck in `running` since before `stale_before` to pending.
    async fn requeue_stale_jobs(&self, stale_before: DateTime<Utc>)
    -> Result<u64, DatabaseError>;
}
