//! Follow-up firing.
//!
//! A follow-up job carries the `due_at` it was registered with. The thread's
//! `next_follow_up_at` must still equal it when the job fires; anything else
//! (reopened, rescheduled, resolved) makes the job a stale no-op.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Error;
use crate::gateways::with_timeout;
use crate::pipeline::actions::reply_context;
use crate::pipeline::context::{PipelineDeps, RunContext};
use crate::pipeline::types::{Message, MessageStatus};
use crate::threads::model::Thread;
use crate::threads::state::ThreadStatus;

/// Result of firing a follow-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpOutcome {
    Drafted { message_id: Uuid },
    Stale { reason: &'static str },
}

pub struct FollowUpRunner {
    deps: PipelineDeps,
}

impl FollowUpRunner {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Draft a follow-up on `thread_id` if it is still due at `due_at`.
    pub async fn fire(
        &self,
        ctx: &RunContext,
        thread_id: Uuid,
        due_at: DateTime<Utc>,
    ) -> Result<FollowUpOutcome, Error> {
        let Some(mut thread) = self.deps.store.get_thread(thread_id).await? else {
            return Ok(stale(thread_id, "thread missing"));
        };
        if let Some(reason) = staleness(&thread, due_at) {
            return Ok(stale(thread_id, reason));
        }
        let Some(latest) = self.deps.store.latest_inbound_message(thread_id).await? else {
            return Ok(stale(thread_id, "no inbound message"));
        };
        let Some(mailbox) = self.deps.store.get_mailbox(thread.mailbox_id).await? else {
            return Ok(stale(thread_id, "mailbox missing"));
        };

        let mut context = reply_context(&mailbox, &thread, &latest);
        context.is_follow_up = true;
        let timeout = self.deps.config.gateway_timeout;
        let body = with_timeout(
            "classifier",
            timeout,
            self.deps.classifier.generate_reply(&context),
        )
        .await?;
        let draft = with_timeout(
            "mail",
            timeout,
            self.deps.mail.create_reply_draft(
                &mailbox.provider_account,
                &latest.provider_message_id,
                &body,
            ),
        )
        .await?;

        let outbound = Message::outbound(
            &latest,
            draft.id,
            &mailbox.address,
            body,
            MessageStatus::DraftCreated,
            ctx.now,
        );
        self.deps.store.insert_message(&outbound).await?;

        thread.follow_up_count += 1;
        thread.next_follow_up_at = None;
        thread.transition_to(ThreadStatus::DraftPending, ctx.now)?;
        self.deps.store.update_thread(&thread).await?;

        info!(
            thread = %thread.id,
            follow_ups = thread.follow_up_count,
            draft = %outbound.id,
            "Follow-up drafted"
        );
        Ok(FollowUpOutcome::Drafted {
            message_id: outbound.id,
        })
    }
}

fn staleness(thread: &Thread, due_at: DateTime<Utc>) -> Option<&'static str> {
    if thread.is_terminal() {
        return Some("thread is terminal");
    }
    match thread.next_follow_up_at {
        None => Some("follow-up cleared"),
        // Stored timestamps carry microsecond precision.
        Some(at) if at.timestamp_micros() != due_at.timestamp_micros() => {
            Some("follow-up rescheduled")
        }
        Some(_) => None,
    }
}

fn stale(thread_id: Uuid, reason: &'static str) -> FollowUpOutcome {
    debug!(thread = %thread_id, reason, "Stale follow-up ignored");
    FollowUpOutcome::Stale { reason }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Duration;

    use super::*;
    use crate::pipeline::context::RunKind;
    use crate::pipeline::ingest::Ingestor;
    use crate::pipeline::rules::RulesEngine;
    use crate::testing::{Harness, provider_message};
    use crate::threads::ThreadService;

    /// Ingest one message and put its thread into FollowUpScheduled.
    async fn scheduled_thread(h: &Harness) -> (Thread, DateTime<Utc>) {
        let mailbox = h.mailbox(|_| {}).await;
        let ctx = RunContext::new(RunKind::Manual);
        let ingestor = Ingestor::new(h.deps());
        ingestor
            .process_message(
                &ctx,
                &mailbox,
                &RulesEngine::new(vec![]),
                &provider_message("m1", "C1", "Where is my order?", ctx.now),
            )
            .await;
        let mut thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        let due = ctx.now + Duration::hours(48);
        thread.schedule_follow_up(due, ctx.now).unwrap();
        h.store.update_thread(&thread).await.unwrap();
        (thread, due)
    }

    #[tokio::test]
    async fn due_follow_up_creates_draft() {
        let h = Harness::new().await;
        let (thread, due) = scheduled_thread(&h).await;

        let runner = FollowUpRunner::new(h.deps());
        let outcome = runner
            .fire(&RunContext::at(RunKind::FollowUp, due), thread.id, due)
            .await
            .unwrap();
        assert!(matches!(outcome, FollowUpOutcome::Drafted { .. }));

        let thread = h.store.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::DraftPending);
        assert_eq!(thread.follow_up_count, 1);
        assert!(thread.next_follow_up_at.is_none());

        let drafts = h.mail.drafts.lock().unwrap().clone();
        assert_eq!(drafts, vec![("m1".to_string(), "Generated reply".to_string())]);
        let contexts = h.classifier.replies.lock().unwrap().clone();
        assert!(contexts[0].is_follow_up);
    }

    #[tokio::test]
    async fn resolved_thread_is_not_followed_up() {
        let h = Harness::new().await;
        let (thread, due) = scheduled_thread(&h).await;
        ThreadService::new(h.deps())
            .resolve(&RunContext::new(RunKind::Manual), thread.id)
            .await
            .unwrap();

        let runner = FollowUpRunner::new(h.deps());
        let outcome = runner
            .fire(&RunContext::at(RunKind::FollowUp, due), thread.id, due)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FollowUpOutcome::Stale {
                reason: "thread is terminal"
            }
        );
        assert!(h.mail.drafts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rescheduled_follow_up_ignores_old_job() {
        let h = Harness::new().await;
        let (mut thread, due) = scheduled_thread(&h).await;
        thread.next_follow_up_at = Some(due + Duration::hours(1));
        h.store.update_thread(&thread).await.unwrap();

        let outcome = FollowUpRunner::new(h.deps())
            .fire(&RunContext::at(RunKind::FollowUp, due), thread.id, due)
            .await
            .unwrap();
        assert!(matches!(outcome, FollowUpOutcome::Stale { .. }));
    }

    #[tokio::test]
    async fn customer_reply_makes_follow_up_stale() {
        let h = Harness::new().await;
        let (thread, due) = scheduled_thread(&h).await;
        let mailbox = h.store.get_mailbox(thread.mailbox_id).await.unwrap().unwrap();
        Ingestor::new(h.deps())
            .process_message(
                &RunContext::new(RunKind::Manual),
                &mailbox,
                &RulesEngine::new(vec![]),
                &provider_message("m2", "C1", "RE: Where is my order?", Utc::now()),
            )
            .await;

        let outcome = FollowUpRunner::new(h.deps())
            .fire(&RunContext::at(RunKind::FollowUp, due), thread.id, due)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FollowUpOutcome::Stale {
                reason: "follow-up cleared"
            }
        );
    }

    #[tokio::test]
    async fn unknown_thread_is_stale() {
        let h = Harness::new().await;
        let outcome = FollowUpRunner::new(h.deps())
            .fire(&RunContext::new(RunKind::FollowUp), Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, FollowUpOutcome::Stale { .. }));
    }

    #[tokio::test]
    async fn reply_generation_failure_propagates() {
        let h = Harness::new().await;
        let (thread, due) = scheduled_thread(&h).await;
        h.classifier.fail_replies.store(true, Ordering::SeqCst);

        let err = FollowUpRunner::new(h.deps())
            .fire(&RunContext::at(RunKind::FollowUp, due), thread.id, due)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let thread = h.store.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::FollowUpScheduled);
    }
}
