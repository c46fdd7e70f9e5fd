//! Periodic SLA scan.
//!
//! Breach flags are flipped by a conditional update in the store, so only
//! the scan that wins the flip creates the escalation task. Re-running a
//! scan, or two scans racing, never escalates the same breach twice.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::gateways::EscalationEvent;
use crate::pipeline::context::{PipelineDeps, RunContext};
use crate::sla::BreachKind;
use crate::tasks::model::{Task, TaskType};
use crate::threads::model::{Priority, Thread};

/// Summary of one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlaScanReport {
    pub scanned: usize,
    pub first_response_breaches: usize,
    pub resolution_breaches: usize,
    /// Escalation tasks created by this scan.
    pub escalations: Vec<Uuid>,
    /// `(thread_id, error)` for threads that could not be processed.
    pub errors: Vec<(Uuid, String)>,
}

pub struct SlaTracker {
    deps: PipelineDeps,
}

impl SlaTracker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Check every open thread with an unbreached deadline against `ctx.now`.
    pub async fn scan(&self, ctx: &RunContext) -> Result<SlaScanReport, Error> {
        let candidates = self.deps.store.list_sla_candidates().await?;
        let mut report = SlaScanReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for thread in &candidates {
            for (kind, deadline) in due_breaches(thread, ctx.now) {
                match self.escalate(ctx, thread, kind, deadline).await {
                    Ok(Some(task_id)) => {
                        match kind {
                            BreachKind::FirstResponse => report.first_response_breaches += 1,
                            BreachKind::Resolution => report.resolution_breaches += 1,
                        }
                        report.escalations.push(task_id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(thread = %thread.id, breach = kind.as_str(), error = %e, "SLA escalation failed");
                        report.errors.push((thread.id, e.to_string()));
                    }
                }
            }
        }

        info!(
            run = %ctx.run_id,
            scanned = report.scanned,
            first_response = report.first_response_breaches,
            resolution = report.resolution_breaches,
            errors = report.errors.len(),
            "SLA scan complete"
        );
        Ok(report)
    }

    /// Flip the breach flag and, if this call flipped it, create the task.
    async fn escalate(
        &self,
        ctx: &RunContext,
        thread: &Thread,
        kind: BreachKind,
        deadline: DateTime<Utc>,
    ) -> Result<Option<Uuid>, Error> {
        let flipped = self
            .deps
            .store
            .mark_sla_breach(thread.id, kind, Priority::HIGHEST, ctx.now)
            .await?;
        if !flipped {
            return Ok(None);
        }

        let title = match kind {
            BreachKind::FirstResponse => format!("First response overdue: {}", thread.subject),
            BreachKind::Resolution => format!("Resolution overdue: {}", thread.subject),
        };
        let task = Task::new(
            thread.id,
            TaskType::Escalate,
            title,
            ctx.now + self.deps.config.escalation_due,
            ctx.now,
        )
        .with_description(format!(
            "{} deadline {} passed",
            kind.as_str(),
            deadline.to_rfc3339()
        ))
        .with_priority(Priority::HIGHEST)
        .with_assignee(thread.assigned_to.clone());
        self.deps.store.insert_task(&task).await?;

        info!(
            thread = %thread.id,
            breach = kind.as_str(),
            deadline = %deadline,
            task = %task.id,
            "SLA breached, escalated"
        );

        let event = EscalationEvent {
            thread_id: thread.id,
            mailbox_id: thread.mailbox_id,
            task_id: task.id,
            urgency: Priority::HIGHEST,
            reason: kind,
            deadline,
        };
        if let Err(e) = self.deps.notifier.escalation(&event).await {
            warn!(thread = %thread.id, error = %e, "Escalation notification failed");
        }
        Ok(Some(task.id))
    }
}

/// Deadlines of `thread` that have passed without being met or flagged.
fn due_breaches(thread: &Thread, now: DateTime<Utc>) -> Vec<(BreachKind, DateTime<Utc>)> {
    let mut due = Vec::new();
    if let Some(deadline) = thread.first_response_deadline {
        if now > deadline && thread.first_response_at.is_none() && !thread.first_response_breached
        {
            due.push((BreachKind::FirstResponse, deadline));
        }
    }
    if let Some(deadline) = thread.resolution_deadline {
        if now > deadline && thread.resolved_at.is_none() && !thread.resolution_breached {
            due.push((BreachKind::Resolution, deadline));
        }
    }
    due
}
