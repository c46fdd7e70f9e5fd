//! Durable one-off jobs.
//!
//! Delayed triggers (follow-ups, subscription renewals, push processing) are
//! written to the store with a fire time and a dedup key, so registering the
//! same trigger twice is a no-op and nothing is lost across restarts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Send a follow-up on a thread, unless it went terminal or the
    /// follow-up was superseded.
    FollowUp { thread_id: Uuid, due_at: DateTime<Utc> },
    /// Renew (or re-create) a mailbox's webhook subscription.
    RenewSubscription {
        mailbox_id: Uuid,
        subscription_id: String,
    },
    /// Fetch and process a single provider message.
    ProcessMessage { mailbox_id: Uuid, message_id: String },
    /// Pull-sync a mailbox from its watermark.
    SyncMailbox { mailbox_id: Uuid },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FollowUp { .. } => "follow_up",
            Self::RenewSubscription { .. } => "renew_subscription",
            Self::ProcessMessage { .. } => "process_message",
            Self::SyncMailbox { .. } => "sync_mailbox",
        }
    }

    /// Key that makes registering the same trigger idempotent.
    pub fn dedup_key(&self, fire_at: DateTime<Utc>) -> String {
        match self {
            Self::FollowUp { thread_id, due_at } => {
                format!("follow_up:{thread_id}:{}", due_at.timestamp())
            }
            Self::RenewSubscription {
                mailbox_id,
                subscription_id,
            } => format!("renew:{mailbox_id}:{subscription_id}:{}", fire_at.timestamp()),
            Self::ProcessMessage {
                mailbox_id,
                message_id,
            } => format!("message:{mailbox_id}:{message_id}"),
            Self::SyncMailbox { mailbox_id } => {
                format!("sync:{mailbox_id}:{}", fire_at.timestamp())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// A persisted one-off job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub fire_at: DateTime<Utc>,
    pub dedup_key: String,
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(kind: JobKind, fire_at: DateTime<Utc>) -> Self {
        let dedup_key = kind.dedup_key(fire_at);
        Self {
            id: Uuid::new_v4(),
            kind,
            fire_at,
            dedup_key,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Registers one-off triggers in the store.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<dyn Database>,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Register `kind` to fire at `fire_at`. Returns `false` when an
    /// identical trigger is already registered.
    pub async fn schedule_once(
        &self,
        kind: JobKind,
        fire_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let job = ScheduledJob::new(kind, fire_at);
        let inserted = self.db.enqueue_job(&job).await?;
        debug!(
            job = %job.id,
            kind = job.kind.label(),
            fire_at = %job.fire_at,
            inserted,
            "One-off job registered"
        );
        Ok(inserted)
    }

    /// Like [`schedule_once`](Self::schedule_once), but a finished job with
    /// the same key is re-armed. Used where the caller needs a guarantee
    /// that the work runs again. Returns `false` only when a pending or
    /// running job already covers it.
    pub async fn schedule_retry(
        &self,
        kind: JobKind,
        fire_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let job = ScheduledJob::new(kind, fire_at);
        let armed = self.db.enqueue_or_rearm_job(&job).await?;
        debug!(
            key = %job.dedup_key,
            kind = job.kind.label(),
            fire_at = %job.fire_at,
            armed,
            "Retry job registered"
        );
        Ok(armed)
    }
}
