//! Polling runner for durable one-off jobs.
//!
//! Each poll claims due jobs, hands them to a [`JobHandler`], and applies
//! the retry policy to failures: retryable errors are rescheduled at
//! `now + delay`, anything else (or an exhausted policy) fails the job and
//! raises an operational alert.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::gateways::{NotificationSink, OperationalAlert};
use crate::scheduler::jobs::ScheduledJob;
use crate::scheduler::retry::RetryPolicy;
use crate::store::Database;

/// Executes one job. Handlers must be idempotent: a job may run again after
/// a crash or a retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), Error>;
}

/// Counts for one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerReport {
    pub requeued: u64,
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

pub struct JobRunner {
    store: Arc<dyn Database>,
    handler: Arc<dyn JobHandler>,
    notifier: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
    batch: usize,
    stale_after: chrono::Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn Database>,
        handler: Arc<dyn JobHandler>,
        notifier: Arc<dyn NotificationSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            handler,
            notifier,
            retry,
            batch: 32,
            stale_after: chrono::Duration::minutes(30),
        }
    }

    /// Builder: max jobs claimed per poll.
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Builder: running jobs older than this are returned to pending.
    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run every job due at `now`.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<RunnerReport, Error> {
        let mut report = RunnerReport {
            requeued: self.store.requeue_stale_jobs(now - self.stale_after).await?,
            ..Default::default()
        };
        if report.requeued > 0 {
            warn!(count = report.requeued, "Requeued abandoned jobs");
        }

        let due = self.store.list_due_jobs(now, self.batch).await?;
        for job in due {
            if !self.store.claim_job(job.id, now).await? {
                debug!(job = %job.id, "Job claimed by another runner");
                continue;
            }
            report.claimed += 1;

            match self.handler.handle(&job, now).await {
                Ok(()) => {
                    self.store.complete_job(job.id, now).await?;
                    report.completed += 1;
                    debug!(job = %job.id, kind = job.kind.label(), "Job completed");
                }
                Err(e) => {
                    if self.record_failure(&job, &e, now).await? {
                        report.rescheduled += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                rescheduled = report.rescheduled,
                failed = report.failed,
                "Job poll complete"
            );
        }
        Ok(report)
    }

    /// Returns `true` when the job was rescheduled.
    async fn record_failure(
        &self,
        job: &ScheduledJob,
        err: &Error,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let attempts = job.attempts + 1;
        let message = err.to_string();

        if let Some(delay) = self.retry.next_delay(attempts, err) {
            let step = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let fire_at = now + step;
            warn!(
                job = %job.id,
                kind = job.kind.label(),
                attempt = attempts,
                max_attempts = self.retry.max_attempts(),
                retry_at = %fire_at,
                error = %message,
                "Job failed, rescheduled"
            );
            self.store
                .reschedule_job(job.id, fire_at, attempts, &message)
                .await?;
            return Ok(true);
        }

        error!(
            job = %job.id,
            kind = job.kind.label(),
            attempts,
            error = %message,
            "Job failed permanently"
        );
        self.store.fail_job(job.id, attempts, &message).await?;
        let alert = OperationalAlert {
            job: format!("{}:{}", job.kind.label(), job.dedup_key),
            error: message,
            attempts,
            auth_failure: err.is_auth(),
            at: now,
        };
        if let Err(e) = self.notifier.operational_alert(&alert).await {
            warn!(job = %job.id, error = %e, "Operational alert delivery failed");
        }
        Ok(false)
    }
}

/// Spawn the polling loop. Returns a `JoinHandle` and shutdown flag.
pub fn spawn_job_runner(
    runner: Arc<JobRunner>,
    poll_interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(poll_secs = poll_interval.as_secs(), "Job runner started");
        let mut tick = tokio::time::interval(poll_interval);
        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Job runner shutting down");
                return;
            }
            if let Err(e) = runner.run_due(Utc::now()).await {
                error!(error = %e, "Job poll failed");
            }
        }
    });

    (handle, shutdown_flag)
}
