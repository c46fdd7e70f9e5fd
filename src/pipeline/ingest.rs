//! Ingestion: pull sync, push processing, dedup and thread correlation.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, PipelineError};
use crate::gateways::{ProviderMessage, with_timeout};
use crate::mailboxes::model::Mailbox;
use crate::pipeline::actions::ActionDispatcher;
use crate::pipeline::context::{PipelineDeps, RunContext};
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{ItemOutcome, Message, ProcessedMessage, SkipReason, SyncReport};
use crate::scheduler::jobs::JobKind;
use crate::tasks::model::{Task, TaskType};
use crate::threads::model::{Priority, Thread};

/// Turns provider messages into stored messages on correlated threads.
pub struct Ingestor {
    deps: PipelineDeps,
    actions: ActionDispatcher,
}

impl Ingestor {
    pub fn new(deps: PipelineDeps) -> Self {
        let actions = ActionDispatcher::new(deps.clone());
        Self { deps, actions }
    }

    /// Pull-sync one mailbox from its watermark.
    ///
    /// Guarded by the mailbox lease; a run that cannot take it returns a
    /// `lease_busy` report without fetching. Listing failures propagate so
    /// the caller's retry policy applies. Per-message failures do not.
    pub async fn sync_mailbox(
        &self,
        ctx: &RunContext,
        mailbox_id: Uuid,
    ) -> Result<SyncReport, Error> {
        let until = ctx.now + self.deps.config.lease_duration;
        let acquired = self
            .deps
            .store
            .try_acquire_sync_lease(mailbox_id, ctx.run_id, ctx.now, until)
            .await?;
        if !acquired {
            info!(mailbox = %mailbox_id, run = %ctx.run_id, "Sync skipped, lease held by another run");
            return Ok(SyncReport::busy(mailbox_id));
        }

        let result = self.sync_locked(ctx, mailbox_id).await;

        if let Err(e) = self
            .deps
            .store
            .release_sync_lease(mailbox_id, ctx.run_id)
            .await
        {
            warn!(mailbox = %mailbox_id, error = %e, "Failed to release sync lease");
        }
        result
    }

    async fn sync_locked(&self, ctx: &RunContext, mailbox_id: Uuid) -> Result<SyncReport, Error> {
        let mailbox = self
            .deps
            .store
            .get_mailbox(mailbox_id)
            .await?
            .ok_or(PipelineError::MailboxNotFound(mailbox_id))?;

        let mut report = SyncReport::new(mailbox_id);
        if !mailbox.is_active || mailbox.provider_account.is_empty() {
            debug!(mailbox = %mailbox_id, "Mailbox inactive or unlinked, nothing to sync");
            return Ok(report);
        }

        let since = mailbox
            .last_sync_at
            .unwrap_or(ctx.now - self.deps.config.initial_lookback);
        let mut messages = with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps.mail.list_messages(
                &mailbox.provider_account,
                since,
                self.deps.config.batch_size,
            ),
        )
        .await?;
        messages.sort_by_key(|m| m.received_at);
        report.fetched = messages.len();

        let rules = self.load_rules(&mailbox).await?;

        for provider in &messages {
            let outcome = self.process_message(ctx, &mailbox, &rules, provider).await;
            if let ItemOutcome::Failed { error, .. } = &outcome {
                warn!(
                    mailbox = %mailbox.id,
                    message = %provider.id,
                    error = %error,
                    "Message failed, queued for retry"
                );
                self.deps
                    .jobs
                    .schedule_retry(
                        JobKind::ProcessMessage {
                            mailbox_id: mailbox.id,
                            message_id: provider.id.clone(),
                        },
                        ctx.now,
                    )
                    .await?;
            }
            report.record(&outcome);
        }

        // Every failed message now has a pending retry job, so the watermark
        // can move past them.
        if let Some(newest) = messages.iter().map(|m| m.received_at).max() {
            self.deps
                .store
                .update_sync_watermark(mailbox.id, newest)
                .await?;
            report.watermark = Some(newest);
        }

        info!(
            mailbox = %mailbox.label(),
            run = %ctx.run_id,
            fetched = report.fetched,
            processed = report.processed_count,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Mailbox sync complete"
        );
        Ok(report)
    }

    /// Process one message named by a push notification (or a retry job).
    ///
    /// A missing mailbox or message is a soft miss, and so is a deactivated
    /// mailbox. Runs under the same mailbox lease as pull sync; a held lease
    /// yields [`PipelineError::MailboxBusy`] so the job backs off. Processing
    /// failures are returned as errors so the job runner can retry.
    pub async fn process_pushed(
        &self,
        ctx: &RunContext,
        mailbox_id: Uuid,
        message_id: &str,
    ) -> Result<ItemOutcome, Error> {
        let Some(mailbox) = self.deps.store.get_mailbox(mailbox_id).await? else {
            debug!(mailbox = %mailbox_id, "Push for unknown mailbox ignored");
            return Ok(skipped(message_id, SkipReason::NotFound));
        };
        if !mailbox.is_active {
            debug!(mailbox = %mailbox_id, message = message_id, "Push for inactive mailbox ignored");
            return Ok(skipped(message_id, SkipReason::Inactive));
        }

        let until = ctx.now + self.deps.config.lease_duration;
        let acquired = self
            .deps
            .store
            .try_acquire_sync_lease(mailbox_id, ctx.run_id, ctx.now, until)
            .await?;
        if !acquired {
            info!(mailbox = %mailbox_id, message = message_id, "Push deferred, lease held by another run");
            return Err(PipelineError::MailboxBusy(mailbox_id).into());
        }

        let result = self.process_pushed_locked(ctx, &mailbox, message_id).await;

        if let Err(e) = self
            .deps
            .store
            .release_sync_lease(mailbox_id, ctx.run_id)
            .await
        {
            warn!(mailbox = %mailbox_id, error = %e, "Failed to release sync lease");
        }
        result
    }

    async fn process_pushed_locked(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        message_id: &str,
    ) -> Result<ItemOutcome, Error> {
        if self.deps.store.message_exists(message_id).await? {
            return Ok(skipped(message_id, SkipReason::Duplicate));
        }

        let fetched = with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps
                .mail
                .get_message(&mailbox.provider_account, message_id),
        )
        .await?;
        let Some(provider) = fetched else {
            debug!(mailbox = %mailbox.id, message = message_id, "Pushed message no longer exists");
            return Ok(skipped(message_id, SkipReason::NotFound));
        };

        let rules = self.load_rules(mailbox).await?;
        self.try_process(ctx, mailbox, &rules, &provider).await
    }

    /// Process one provider message, folding any failure into the outcome.
    pub async fn process_message(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        rules: &RulesEngine,
        provider: &ProviderMessage,
    ) -> ItemOutcome {
        match self.try_process(ctx, mailbox, rules, provider).await {
            Ok(outcome) => outcome,
            Err(e) => ItemOutcome::Failed {
                provider_message_id: provider.id.clone(),
                error: e.to_string(),
            },
        }
    }

    async fn load_rules(&self, mailbox: &Mailbox) -> Result<RulesEngine, Error> {
        let rules = self.deps.store.list_active_rules(mailbox.id).await?;
        let engine = RulesEngine::new(rules);
        if !engine.skipped().is_empty() {
            warn!(
                mailbox = %mailbox.id,
                skipped = engine.skipped().len(),
                "Some rules have malformed patterns and were skipped"
            );
        }
        Ok(engine)
    }

    async fn try_process(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        rules: &RulesEngine,
        provider: &ProviderMessage,
    ) -> Result<ItemOutcome, Error> {
        if self.deps.store.message_exists(&provider.id).await? {
            return Ok(skipped(&provider.id, SkipReason::Duplicate));
        }
        validate(provider)?;

        let (mut thread, new_thread) = self.correlate(ctx, mailbox, provider).await?;

        let message = Message::inbound(provider, mailbox.id, thread.id, ctx.now);
        if !self.deps.store.insert_message(&message).await? {
            // Lost a race with a concurrent run that stored it first.
            return Ok(skipped(&provider.id, SkipReason::Duplicate));
        }

        let reopened = thread.record_inbound(provider.received_at, ctx.now);
        if reopened {
            info!(thread = %thread.id, "Thread reopened by customer reply");
        }

        self.classify(ctx, mailbox, &mut thread, provider).await;
        if new_thread {
            self.extract_entities(&mut thread, provider).await;
        }
        self.deps.store.update_thread(&thread).await?;

        if let Err(e) = with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps
                .mail
                .mark_read(&mailbox.provider_account, &provider.id),
        )
        .await
        {
            debug!(message = %provider.id, error = %e, "mark_read failed");
        }

        let mut processed = ProcessedMessage {
            message_id: message.id,
            thread_id: thread.id,
            new_thread,
            reopened,
            classification: Some(thread.classification),
            rule_id: None,
            action: None,
            action_error: None,
        };

        if mailbox.auto_reply_enabled && !thread.is_terminal() {
            if let Some(rule) = rules.select(&thread, &message) {
                processed.rule_id = Some(rule.id);
                processed.action = Some(rule.action.label());

                let snapshot = thread.clone();
                match self
                    .actions
                    .dispatch(ctx, mailbox, &mut thread, &message, rule)
                    .await
                {
                    Ok(effect) => {
                        debug!(thread = %thread.id, effect = ?effect, "Action dispatched");
                    }
                    Err(e) => {
                        thread = snapshot;
                        warn!(
                            thread = %thread.id,
                            rule = %rule.name,
                            error = %e,
                            "Rule action failed, handing thread to a human"
                        );
                        let task = Task::new(
                            thread.id,
                            TaskType::ReviewDraft,
                            format!("Review: {}", thread.subject),
                            ctx.now + self.deps.config.default_task_due,
                            ctx.now,
                        )
                        .with_description(format!(
                            "Automatic action '{}' of rule '{}' failed: {e}",
                            rule.action.label(),
                            rule.name
                        ))
                        .with_priority(thread.priority);
                        self.deps.store.insert_task(&task).await?;
                        processed.action_error = Some(e.to_string());
                    }
                }
                thread.updated_at = ctx.now;
                self.deps.store.update_thread(&thread).await?;
            }
        }

        Ok(ItemOutcome::Processed(processed))
    }

    /// Find the thread for this conversation or create it.
    async fn correlate(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        provider: &ProviderMessage,
    ) -> Result<(Thread, bool), Error> {
        let conversation = provider.conversation_key();
        if let Some(thread) = self
            .deps
            .store
            .find_thread(mailbox.id, conversation)
            .await?
        {
            return Ok((thread, false));
        }

        let priority = if provider.is_high_importance() {
            Priority::High
        } else {
            Priority::Normal
        };
        let thread = Thread::new(
            mailbox.id,
            conversation,
            provider.subject.clone(),
            provider.from_address.clone(),
            &mailbox.sla,
            ctx.now,
        )
        .with_from_name(provider.from_name.clone())
        .with_priority(priority);

        if self.deps.store.insert_thread(&thread).await? {
            info!(
                thread = %thread.id,
                mailbox = %mailbox.id,
                conversation,
                "Thread created"
            );
            return Ok((thread, true));
        }

        // Another run created it between our lookup and insert.
        let existing = self
            .deps
            .store
            .find_thread(mailbox.id, conversation)
            .await?
            .ok_or_else(|| PipelineError::MalformedMessage {
                id: provider.id.clone(),
                reason: format!("thread for conversation {conversation} vanished"),
            })?;
        Ok((existing, false))
    }

    async fn classify(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        thread: &mut Thread,
        provider: &ProviderMessage,
    ) {
        thread.begin_classification(ctx.now);
        let result = with_timeout(
            "classifier",
            self.deps.config.gateway_timeout,
            self.deps.classifier.classify(
                &provider.subject,
                &provider.body,
                mailbox.tenant_context.as_deref(),
            ),
        )
        .await;

        match result {
            Ok(result) => thread.apply_classification(&result, ctx.now),
            Err(e) => {
                warn!(
                    thread = %thread.id,
                    message = %provider.id,
                    error = %e,
                    "Classification failed, routing thread to review"
                );
                thread.apply_classification_failure(ctx.now);
            }
        }
    }

    async fn extract_entities(&self, thread: &mut Thread, provider: &ProviderMessage) {
        let result = with_timeout(
            "classifier",
            self.deps.config.gateway_timeout,
            self.deps
                .classifier
                .extract_entities(&provider.subject, &provider.body),
        )
        .await;
        match result {
            Ok(entities) if !entities.is_empty() => {
                thread.entities = Some(serde_json::Value::Object(entities));
            }
            Ok(_) => {}
            Err(e) => debug!(thread = %thread.id, error = %e, "Entity extraction failed"),
        }
    }
}

fn skipped(message_id: &str, reason: SkipReason) -> ItemOutcome {
    ItemOutcome::Skipped {
        provider_message_id: message_id.to_string(),
        reason,
    }
}

fn validate(provider: &ProviderMessage) -> Result<(), PipelineError> {
    let reason = if provider.id.trim().is_empty() {
        "missing message id"
    } else if provider.from_address.trim().is_empty() {
        "missing sender address"
    } else {
        return Ok(());
    };
    Err(PipelineError::MalformedMessage {
        id: provider.id.clone(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::gateways::ClassificationResult;
    use crate::mailboxes::model::SlaPolicy;
    use crate::pipeline::context::RunKind;
    use crate::pipeline::rules::{AutoReplyRule, ReplyMode, RuleAction};
    use crate::pipeline::types::MessageStatus;
    use crate::scheduler::jobs::{JobStatus, ScheduledJob};
    use crate::store::{Database, LibSqlBackend};
    use crate::tasks::model::TaskType;
    use crate::testing::{Harness, classification, provider_message};
    use crate::threads::model::Classification;
    use crate::threads::state::ThreadStatus;

    fn ctx() -> RunContext {
        RunContext::new(RunKind::PullSync)
    }

    #[tokio::test]
    async fn conversations_correlate_into_threads() {
        let h = Harness::new().await;
        let mailbox = h
            .mailbox(|m| {
                m.sla = SlaPolicy {
                    first_response_hours: Some(4),
                    resolution_hours: None,
                }
            })
            .await;
        let now = Utc::now();
        h.mail.push(provider_message("m1", "C1", "Hello", now - Duration::minutes(3)));
        h.mail.push(provider_message("m2", "C1", "RE: Hello", now - Duration::minutes(2)));
        h.mail.push(provider_message("m3", "C2", "Other", now - Duration::minutes(1)));

        let ingestor = Ingestor::new(h.deps());
        let ctx = ctx();
        let report = ingestor.sync_mailbox(&ctx, mailbox.id).await.unwrap();
        assert_eq!(report.processed_count, 3);
        assert!(report.errors.is_empty());

        let c1 = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        let c2 = h.store.find_thread(mailbox.id, "C2").await.unwrap().unwrap();
        assert_ne!(c1.id, c2.id);
        assert_eq!(h.store.list_thread_messages(c1.id).await.unwrap().len(), 2);
        assert_eq!(c1.message_count, 2);
        assert_eq!(
            c1.first_response_deadline.map(|d| d.timestamp()),
            Some((ctx.now + Duration::hours(4)).timestamp())
        );
        assert!(c1.resolution_deadline.is_none());
    }

    #[tokio::test]
    async fn reprocessing_is_a_noop() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let p = provider_message("m1", "C1", "Hello", Utc::now());
        let rules = RulesEngine::new(vec![]);
        let ingestor = Ingestor::new(h.deps());

        let first = ingestor.process_message(&ctx(), &mailbox, &rules, &p).await;
        assert!(matches!(first, ItemOutcome::Processed(_)));
        let second = ingestor.process_message(&ctx(), &mailbox, &rules, &p).await;
        assert!(matches!(
            second,
            ItemOutcome::Skipped {
                reason: SkipReason::Duplicate,
                ..
            }
        ));
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn complaint_goes_to_assignment() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.classifier.set(ClassificationResult {
            classification: Classification::Complaint,
            confidence: 99,
            priority: Priority::Normal,
            requires_review: true,
            reasoning: None,
        });
        let p = provider_message("m1", "C1", "Terrible service", Utc::now());
        let ingestor = Ingestor::new(h.deps());
        ingestor
            .process_message(&ctx(), &mailbox, &RulesEngine::new(vec![]), &p)
            .await;
        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::AwaitingAssignment);
        assert_eq!(thread.classification, Classification::Complaint);
    }

    #[tokio::test]
    async fn classifier_outage_fails_safe() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.classifier.fail.store(true, Ordering::SeqCst);
        let p = provider_message("m1", "C1", "Hello", Utc::now());
        let outcome = Ingestor::new(h.deps())
            .process_message(&ctx(), &mailbox, &RulesEngine::new(vec![]), &p)
            .await;
        assert!(matches!(outcome, ItemOutcome::Processed(_)));
        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::AwaitingAssignment);
        assert_eq!(thread.classification, Classification::Unclassified);
        assert!(thread.requires_review);
    }

    #[tokio::test]
    async fn customer_reply_reopens_waiting_thread() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let ingestor = Ingestor::new(h.deps());
        let rules = RulesEngine::new(vec![]);
        ingestor
            .process_message(
                &ctx(),
                &mailbox,
                &rules,
                &provider_message("m1", "C1", "Hello", Utc::now()),
            )
            .await;
        let mut thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        thread.status = ThreadStatus::FollowUpScheduled;
        thread.next_follow_up_at = Some(Utc::now() + Duration::hours(1));
        h.store.update_thread(&thread).await.unwrap();

        let outcome = ingestor
            .process_message(
                &ctx(),
                &mailbox,
                &rules,
                &provider_message("m2", "C1", "RE: Hello", Utc::now()),
            )
            .await;
        match outcome {
            ItemOutcome::Processed(p) => assert!(p.reopened),
            other => panic!("unexpected outcome {other:?}"),
        }
        let thread = h.store.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::InProgress);
        assert!(thread.next_follow_up_at.is_none());
    }

    #[tokio::test]
    async fn one_bad_message_does_not_block_the_batch() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let now = Utc::now();
        let mut bad = provider_message("bad", "C0", "?", now - Duration::minutes(2));
        bad.from_address = String::new();
        h.mail.push(bad);
        h.mail.push(provider_message("good", "C1", "Hello", now - Duration::minutes(1)));

        let report = Ingestor::new(h.deps())
            .sync_mailbox(&ctx(), mailbox.id)
            .await
            .unwrap();
        assert_eq!(report.processed_count, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].provider_message_id, "bad");

        let key = JobKind::ProcessMessage {
            mailbox_id: mailbox.id,
            message_id: "bad".into(),
        }
        .dedup_key(now);
        assert!(h.store.get_job_by_key(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_message_rearms_finished_retry_job() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let now = Utc::now();
        let kind = JobKind::ProcessMessage {
            mailbox_id: mailbox.id,
            message_id: "bad".into(),
        };
        // An earlier retry for the same message already ran to completion.
        let earlier = ScheduledJob::new(kind.clone(), now - Duration::hours(1));
        h.store.enqueue_job(&earlier).await.unwrap();
        h.store.claim_job(earlier.id, now).await.unwrap();
        h.store.complete_job(earlier.id, now).await.unwrap();

        let mut bad = provider_message("bad", "C0", "?", now - Duration::minutes(2));
        bad.from_address = String::new();
        h.mail.push(bad);
        h.mail.push(provider_message("good", "C1", "Hello", now - Duration::minutes(1)));

        let ctx = ctx();
        let report = Ingestor::new(h.deps())
            .sync_mailbox(&ctx, mailbox.id)
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.watermark.is_some());

        let job = h.store.get_job_by_key(&earlier.dedup_key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        let due = h.store.list_due_jobs(ctx.now, 10).await.unwrap();
        assert!(due.iter().any(|j| j.kind == kind));
    }

    #[tokio::test]
    async fn watermark_advances_to_newest_message() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let newest = Utc::now() - Duration::minutes(1);
        // Provider returns newest first; sync must still process oldest first.
        h.mail.push(provider_message("m2", "C1", "RE: a", newest));
        h.mail.push(provider_message("m1", "C1", "a", newest - Duration::minutes(5)));

        let report = Ingestor::new(h.deps())
            .sync_mailbox(&ctx(), mailbox.id)
            .await
            .unwrap();
        assert_eq!(
            report.watermark.map(|w| w.timestamp_micros()),
            Some(newest.timestamp_micros())
        );
        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_eq!(thread.subject, "a");

        // An empty follow-up sync keeps the watermark.
        let again = Ingestor::new(h.deps())
            .sync_mailbox(&ctx(), mailbox.id)
            .await
            .unwrap();
        assert_eq!(again.processed_count, 0);
        let stored = h.store.get_mailbox(mailbox.id).await.unwrap().unwrap();
        assert_eq!(
            stored.last_sync_at.map(|w| w.timestamp_micros()),
            Some(newest.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn busy_lease_skips_sync() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let now = Utc::now();
        h.store
            .try_acquire_sync_lease(mailbox.id, Uuid::new_v4(), now, now + Duration::minutes(5))
            .await
            .unwrap();
        h.mail.push(provider_message("m1", "C1", "Hello", now));

        let report = Ingestor::new(h.deps())
            .sync_mailbox(&ctx(), mailbox.id)
            .await
            .unwrap();
        assert!(report.lease_busy);
        assert_eq!(h.mail.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listing_failure_propagates_and_releases_lease() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.mail.fail_list.store(true, Ordering::SeqCst);
        let ingestor = Ingestor::new(h.deps());
        let err = ingestor.sync_mailbox(&ctx(), mailbox.id).await.unwrap_err();
        assert!(err.is_retryable());

        h.mail.fail_list.store(false, Ordering::SeqCst);
        let report = ingestor.sync_mailbox(&ctx(), mailbox.id).await.unwrap();
        assert!(!report.lease_busy);
    }

    #[tokio::test]
    async fn pushed_message_that_vanished_is_soft_miss() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let outcome = Ingestor::new(h.deps())
            .process_pushed(&RunContext::new(RunKind::Push), mailbox.id, "gone")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ItemOutcome::Skipped {
                reason: SkipReason::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn pushed_message_is_processed() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.mail.push(provider_message("m1", "C1", "Hello", Utc::now()));
        let outcome = Ingestor::new(h.deps())
            .process_pushed(&RunContext::new(RunKind::Push), mailbox.id, "m1")
            .await
            .unwrap();
        assert!(matches!(outcome, ItemOutcome::Processed(_)));
        assert!(h.mail.marked_read.lock().unwrap().contains(&"m1".to_string()));
    }

    #[tokio::test]
    async fn push_for_inactive_mailbox_is_ignored() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|m| m.is_active = false).await;
        h.mail.push(provider_message("m1", "C1", "Hello", Utc::now()));
        h.store
            .upsert_rule(&AutoReplyRule::new(
                mailbox.id,
                "send",
                1,
                RuleAction::SendImmediately {
                    reply: ReplyMode::Template { text: "ok".into() },
                },
            ))
            .await
            .unwrap();

        let outcome = Ingestor::new(h.deps())
            .process_pushed(&RunContext::new(RunKind::Push), mailbox.id, "m1")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ItemOutcome::Skipped {
                reason: SkipReason::Inactive,
                ..
            }
        ));
        assert!(h.mail.sent.lock().unwrap().is_empty());
        assert!(h.mail.drafts.lock().unwrap().is_empty());
        assert!(!h.store.message_exists("m1").await.unwrap());
    }

    #[tokio::test]
    async fn push_waits_for_mailbox_lease() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.mail.push(provider_message("m1", "C1", "Hello", Utc::now()));
        let now = Utc::now();
        let other = Uuid::new_v4();
        h.store
            .try_acquire_sync_lease(mailbox.id, other, now, now + Duration::minutes(5))
            .await
            .unwrap();

        let ingestor = Ingestor::new(h.deps());
        let err = ingestor
            .process_pushed(&RunContext::new(RunKind::Push), mailbox.id, "m1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pipeline(PipelineError::MailboxBusy(id)) if id == mailbox.id
        ));
        assert!(err.is_retryable());
        assert!(!h.store.message_exists("m1").await.unwrap());

        h.store.release_sync_lease(mailbox.id, other).await.unwrap();
        let outcome = ingestor
            .process_pushed(&RunContext::new(RunKind::Push), mailbox.id, "m1")
            .await
            .unwrap();
        assert!(matches!(outcome, ItemOutcome::Processed(_)));

        // The push released its lease, so a sync can run straight after.
        let report = ingestor.sync_mailbox(&ctx(), mailbox.id).await.unwrap();
        assert!(!report.lease_busy);
    }

    #[tokio::test]
    async fn draft_rule_creates_draft_and_follow_up() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.classifier
            .set(classification(Classification::TechnicalSupport, false));
        let rule = AutoReplyRule::new(
            mailbox.id,
            "support ack",
            1,
            RuleAction::CreateDraft {
                reply: ReplyMode::Template {
                    text: "Hi {sender_name}".into(),
                },
            },
        )
        .for_classifications(&[Classification::TechnicalSupport])
        .with_follow_up(48);
        let rules = RulesEngine::new(vec![rule.clone()]);
        let ctx = ctx();

        let outcome = Ingestor::new(h.deps())
            .process_message(
                &ctx,
                &mailbox,
                &rules,
                &provider_message("m1", "C1", "Login broken", Utc::now()),
            )
            .await;
        let processed = match outcome {
            ItemOutcome::Processed(p) => p,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(processed.rule_id, Some(rule.id));
        assert_eq!(processed.action, Some("create_draft"));

        let thread = h.store.get_thread(processed.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::FollowUpScheduled);
        let due = ctx.now + Duration::hours(48);
        assert_eq!(
            thread.next_follow_up_at.map(|d| d.timestamp_micros()),
            Some(due.timestamp_micros())
        );

        let drafts = h.mail.drafts.lock().unwrap().clone();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].0, "m1");
        let messages = h.store.list_thread_messages(thread.id).await.unwrap();
        assert!(messages.iter().any(|m| m.status == MessageStatus::DraftCreated));

        let key = JobKind::FollowUp {
            thread_id: thread.id,
            due_at: due,
        }
        .dedup_key(due);
        assert!(h.store.get_job_by_key(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn draft_mode_overrides_send_immediately() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|m| m.draft_mode_default = true).await;
        let rule = AutoReplyRule::new(
            mailbox.id,
            "send",
            1,
            RuleAction::SendImmediately {
                reply: ReplyMode::Template { text: "ok".into() },
            },
        );
        Ingestor::new(h.deps())
            .process_message(
                &ctx(),
                &mailbox,
                &RulesEngine::new(vec![rule]),
                &provider_message("m1", "C1", "Hello", Utc::now()),
            )
            .await;
        assert!(h.mail.sent.lock().unwrap().is_empty());
        assert_eq!(h.mail.drafts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_immediately_stamps_first_response() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|m| m.draft_mode_default = false).await;
        let rule = AutoReplyRule::new(
            mailbox.id,
            "send",
            1,
            RuleAction::SendImmediately {
                reply: ReplyMode::AiGenerated { instructions: None },
            },
        );
        Ingestor::new(h.deps())
            .process_message(
                &ctx(),
                &mailbox,
                &RulesEngine::new(vec![rule]),
                &provider_message("m1", "C1", "Hello", Utc::now()),
            )
            .await;
        assert_eq!(h.mail.sent.lock().unwrap().len(), 1);
        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::AwaitingCustomerReply);
        assert!(thread.first_response_at.is_some());
    }

    #[tokio::test]
    async fn sent_reply_survives_follow_up_failure() {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let h = Harness {
            store: Arc::clone(&backend) as Arc<dyn Database>,
            ..Harness::new().await
        };
        let mailbox = h.mailbox(|m| m.draft_mode_default = false).await;
        let rule = AutoReplyRule::new(
            mailbox.id,
            "send",
            1,
            RuleAction::SendImmediately {
                reply: ReplyMode::Template { text: "ok".into() },
            },
        )
        .with_follow_up(24);
        backend.execute_raw("DROP TABLE scheduled_jobs").await.unwrap();

        let outcome = Ingestor::new(h.deps())
            .process_message(
                &ctx(),
                &mailbox,
                &RulesEngine::new(vec![rule]),
                &provider_message("m1", "C1", "Hello", Utc::now()),
            )
            .await;
        let processed = match outcome {
            ItemOutcome::Processed(p) => p,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert!(processed.action_error.is_none());
        assert_eq!(h.mail.sent.lock().unwrap().len(), 1);

        let thread = h.store.get_thread(processed.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::AwaitingCustomerReply);
        assert!(thread.first_response_at.is_some());
        assert!(thread.next_follow_up_at.is_none());
        assert!(h
            .store
            .list_thread_tasks(thread.id)
            .await
            .unwrap()
            .iter()
            .all(|t| t.task_type != TaskType::ReviewDraft));
    }

    #[tokio::test]
    async fn failed_action_creates_review_task() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.mail.fail_drafts.store(true, Ordering::SeqCst);
        let rule = AutoReplyRule::new(
            mailbox.id,
            "draft",
            1,
            RuleAction::CreateDraft {
                reply: ReplyMode::Template { text: "ok".into() },
            },
        );
        let outcome = Ingestor::new(h.deps())
            .process_message(
                &ctx(),
                &mailbox,
                &RulesEngine::new(vec![rule]),
                &provider_message("m1", "C1", "Hello", Utc::now()),
            )
            .await;
        let processed = match outcome {
            ItemOutcome::Processed(p) => p,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert!(processed.action_error.is_some());
        let tasks = h.store.list_thread_tasks(processed.thread_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::ReviewDraft);
        let thread = h.store.get_thread(processed.thread_id).await.unwrap().unwrap();
        assert_ne!(thread.status, ThreadStatus::DraftPending);
    }

    #[tokio::test]
    async fn rules_are_skipped_when_auto_reply_disabled() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|m| m.auto_reply_enabled = false).await;
        let rule = AutoReplyRule::new(mailbox.id, "handled", 1, RuleAction::MarkAsHandled);
        Ingestor::new(h.deps())
            .process_message(
                &ctx(),
                &mailbox,
                &RulesEngine::new(vec![rule]),
                &provider_message("m1", "C1", "Hello", Utc::now()),
            )
            .await;
        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_ne!(thread.status, ThreadStatus::Closed);
    }

    #[tokio::test]
    async fn high_importance_starts_high_priority() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.classifier
            .set(classification(Classification::BillingInquiry, false));
        let mut p = provider_message("m1", "C1", "Hello", Utc::now());
        p.importance = Some("high".into());
        Ingestor::new(h.deps())
            .process_message(&ctx(), &mailbox, &RulesEngine::new(vec![]), &p)
            .await;
        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_eq!(thread.priority, Priority::High);
    }
}
