//! Wiring: the pipeline components, the job handler table, and the
//! recurring background tasks.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, Error};
use crate::gateways::OperationalAlert;
use crate::mailboxes::{Mailbox, SubscriptionConfig, SubscriptionManager};
use crate::pipeline::context::{PipelineDeps, RunContext, RunKind};
use crate::pipeline::followup::FollowUpRunner;
use crate::pipeline::ingest::Ingestor;
use crate::pipeline::rules::AutoReplyRule;
use crate::pipeline::types::SyncReport;
use crate::scheduler::jobs::{JobKind, ScheduledJob};
use crate::scheduler::recurring::{RecurringSchedule, spawn_recurring};
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::runner::{JobHandler, JobRunner, spawn_job_runner};
use crate::sla::SlaTracker;
use crate::store::Database;

/// All pipeline components over one set of dependencies.
pub struct Runtime {
    deps: PipelineDeps,
    ingestor: Ingestor,
    sla: SlaTracker,
    followups: FollowUpRunner,
    subscriptions: SubscriptionManager,
    retry: RetryPolicy,
}

impl Runtime {
    pub fn new(deps: PipelineDeps, subscriptions: SubscriptionConfig, retry: RetryPolicy) -> Self {
        Self {
            ingestor: Ingestor::new(deps.clone()),
            sla: SlaTracker::new(deps.clone()),
            followups: FollowUpRunner::new(deps.clone()),
            subscriptions: SubscriptionManager::new(deps.clone(), subscriptions),
            deps,
            retry,
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// Pull-sync every active, linked mailbox. Mailboxes run concurrently,
    /// each with its own retries; one failing mailbox never holds up the rest.
    pub async fn sync_all(&self) -> Result<Vec<SyncReport>, Error> {
        let mailboxes: Vec<Mailbox> = self
            .deps
            .store
            .list_active_mailboxes()
            .await?
            .into_iter()
            .filter(|m| !m.provider_account.is_empty())
            .collect();

        let reports: Vec<SyncReport> = futures::stream::iter(mailboxes)
            .map(|mailbox| async move {
                let label = format!("sync:{}", mailbox.address);
                self.retried(&label, || {
                    let ctx = RunContext::new(RunKind::PullSync);
                    async move { self.ingestor.sync_mailbox(&ctx, mailbox.id).await }
                })
                .await
            })
            .buffer_unordered(self.deps.config.max_parallel_syncs.max(1))
            .filter_map(|report| async move { report })
            .collect()
            .await;

        let processed: usize = reports.iter().map(|r| r.processed_count).sum();
        info!(mailboxes = reports.len(), processed, "Sync run complete");
        Ok(reports)
    }

    /// One SLA scan with retries.
    pub async fn scan_sla(&self) {
        self.retried("sla_scan", || {
            let ctx = RunContext::new(RunKind::SlaScan);
            async move { self.sla.scan(&ctx).await }
        })
        .await;
    }

    /// One subscription sweep with retries.
    pub async fn sweep_subscriptions(&self) {
        self.retried("subscription_sweep", || {
            let ctx = RunContext::new(RunKind::Renewal);
            async move { self.subscriptions.sweep(&ctx).await }
        })
        .await;
    }

    /// Run `op` under the retry policy; on final failure raise an alert.
    async fn retried<T, F, Fut>(&self, label: &str, op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match self.retry.run(label, op).await {
            Ok(value) => Some(value),
            Err((err, attempts)) => {
                error!(run = label, attempts, error = %err, "Run failed permanently");
                let alert = OperationalAlert {
                    job: label.to_string(),
                    error: err.to_string(),
                    attempts,
                    auth_failure: err.is_auth(),
                    at: Utc::now(),
                };
                if let Err(e) = self.deps.notifier.operational_alert(&alert).await {
                    warn!(run = label, error = %e, "Operational alert delivery failed");
                }
                None
            }
        }
    }

    /// Start the recurring triggers and the job runner.
    pub fn start(self: &Arc<Self>, config: &SchedulerConfig) -> Result<BackgroundTasks, Error> {
        let mut tasks = BackgroundTasks::default();

        let rt = Arc::clone(self);
        tasks.push(
            "mailbox_sync",
            spawn_recurring(
                "mailbox_sync",
                RecurringSchedule::from_config(config.sync_interval, None)?,
                move || {
                    let rt = Arc::clone(&rt);
                    async move {
                        if let Err(e) = rt.sync_all().await {
                            error!(error = %e, "Sync run failed");
                        }
                    }
                },
            ),
        );

        let rt = Arc::clone(self);
        tasks.push(
            "sla_scan",
            spawn_recurring(
                "sla_scan",
                RecurringSchedule::from_config(
                    config.sla_scan_interval,
                    config.sla_scan_cron.as_deref(),
                )?,
                move || {
                    let rt = Arc::clone(&rt);
                    async move { rt.scan_sla().await }
                },
            ),
        );

        let rt = Arc::clone(self);
        tasks.push(
            "subscription_sweep",
            spawn_recurring(
                "subscription_sweep",
                RecurringSchedule::from_config(config.renewal_sweep_interval, None)?,
                move || {
                    let rt = Arc::clone(&rt);
                    async move { rt.sweep_subscriptions().await }
                },
            ),
        );

        let runner = JobRunner::new(
            Arc::clone(&self.deps.store),
            Arc::clone(self) as Arc<dyn JobHandler>,
            Arc::clone(&self.deps.notifier),
            self.retry.clone(),
        )
        .with_batch(config.job_batch)
        .with_stale_after(config.stale_job_after);
        tasks.push(
            "job_runner",
            spawn_job_runner(Arc::new(runner), config.job_poll_interval),
        );

        Ok(tasks)
    }
}

#[async_trait]
impl JobHandler for Runtime {
    async fn handle(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), Error> {
        match &job.kind {
            JobKind::FollowUp { thread_id, due_at } => {
                let ctx = RunContext::at(RunKind::FollowUp, now);
                self.followups.fire(&ctx, *thread_id, *due_at).await?;
            }
            JobKind::RenewSubscription {
                mailbox_id,
                subscription_id,
            } => {
                let ctx = RunContext::at(RunKind::Renewal, now);
                self.subscriptions
                    .renew(&ctx, *mailbox_id, subscription_id)
                    .await?;
            }
            JobKind::ProcessMessage {
                mailbox_id,
                message_id,
            } => {
                let ctx = RunContext::at(RunKind::Push, now);
                self.ingestor
                    .process_pushed(&ctx, *mailbox_id, message_id)
                    .await?;
            }
            JobKind::SyncMailbox { mailbox_id } => {
                let ctx = RunContext::at(RunKind::PullSync, now);
                self.ingestor.sync_mailbox(&ctx, *mailbox_id).await?;
            }
        }
        Ok(())
    }
}

/// Handles of the spawned background loops.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Vec<(&'static str, JoinHandle<()>, Arc<AtomicBool>)>,
}

impl BackgroundTasks {
    fn push(&mut self, name: &'static str, (handle, flag): (JoinHandle<()>, Arc<AtomicBool>)) {
        self.tasks.push((name, handle, flag));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _, _)| *name).collect()
    }

    /// Signal every loop to stop after its current run. Loops notice the
    /// flag on their next tick, so long intervals are aborted instead.
    pub async fn shutdown(self) {
        for (_, _, flag) in &self.tasks {
            flag.store(true, Ordering::Relaxed);
        }
        for (name, handle, _) in self.tasks {
            handle.abort();
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
    }
}

// ── Seed configuration ─────────────────────────────────────────────

/// Mailboxes and rules created by configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub mailboxes: Vec<Mailbox>,
    #[serde(default)]
    pub rules: Vec<AutoReplyRule>,
}

impl Seed {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(format!("seed file: {e}")))
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    /// Upsert everything. Rules naming an unknown mailbox are rejected.
    pub async fn apply(&self, store: &dyn Database) -> Result<(), Error> {
        for mailbox in &self.mailboxes {
            store.upsert_mailbox(mailbox).await?;
        }
        for rule in &self.rules {
            if store.get_mailbox(rule.mailbox_id).await?.is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("rules[{}].mailbox_id", rule.name),
                    message: format!("unknown mailbox {}", rule.mailbox_id),
                }
                .into());
            }
            store.upsert_rule(rule).await?;
        }
        info!(
            mailboxes = self.mailboxes.len(),
            rules = self.rules.len(),
            "Seed configuration applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::scheduler::jobs::{JobQueue, JobStatus};
    use crate::testing::{Harness, provider_message};
    use crate::threads::ThreadStatus;

    fn runtime(h: &Harness, retry: RetryPolicy) -> Runtime {
        Runtime::new(h.deps(), SubscriptionConfig::default(), retry)
    }

    #[tokio::test]
    async fn sync_all_covers_every_linked_mailbox() {
        let h = Harness::new().await;
        let a = h.mailbox(|_| {}).await;
        let b = h.mailbox(|_| {}).await;
        h.mailbox(|m| m.provider_account.clear()).await;
        h.mailbox(|m| m.is_active = false).await;
        h.mail
            .push(provider_message("m1", "C1", "Hello", Utc::now()));

        let reports = runtime(&h, RetryPolicy::none()).sync_all().await.unwrap();
        let mut synced: Vec<Uuid> = reports.iter().map(|r| r.mailbox_id).collect();
        synced.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(synced, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_sync_failure_raises_alert() {
        let h = Harness::new().await;
        h.mailbox(|_| {}).await;
        h.mail.fail_list.store(true, AtomicOrdering::SeqCst);

        let rt = runtime(&h, RetryPolicy::new(vec![Duration::from_secs(1)]));
        let reports = rt.sync_all().await.unwrap();
        assert!(reports.is_empty());
        assert_eq!(h.mail.list_calls.load(AtomicOrdering::SeqCst), 2);

        let alerts = h.notifier.alerts.lock().unwrap().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].attempts, 2);
        assert!(alerts[0].job.starts_with("sync:"));
    }

    #[tokio::test]
    async fn process_message_job_ingests_pushed_message() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        h.mail
            .push(provider_message("m1", "C1", "Hello", Utc::now()));
        let rt = Arc::new(runtime(&h, RetryPolicy::none()));

        let now = Utc::now();
        JobQueue::new(Arc::clone(&h.store))
            .schedule_once(
                JobKind::ProcessMessage {
                    mailbox_id: mailbox.id,
                    message_id: "m1".into(),
                },
                now,
            )
            .await
            .unwrap();
        let runner = JobRunner::new(
            Arc::clone(&h.store),
            rt.clone(),
            h.notifier.clone(),
            RetryPolicy::none(),
        );
        assert_eq!(runner.run_due(now).await.unwrap().completed, 1);

        let thread = h.store.find_thread(mailbox.id, "C1").await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::AwaitingClassification);
    }

    #[tokio::test]
    async fn malformed_pushed_message_fails_without_retry() {
        let h = Harness::new().await;
        let mailbox = h.mailbox(|_| {}).await;
        let mut bad = provider_message("m1", "C1", "Hello", Utc::now());
        bad.from_address.clear();
        h.mail.push(bad);
        let rt = Arc::new(runtime(&h, RetryPolicy::default()));

        let now = Utc::now();
        let kind = JobKind::ProcessMessage {
            mailbox_id: mailbox.id,
            message_id: "m1".into(),
        };
        JobQueue::new(Arc::clone(&h.store))
            .schedule_once(kind.clone(), now)
            .await
            .unwrap();

        let runner = JobRunner::new(
            Arc::clone(&h.store),
            rt,
            h.notifier.clone(),
            RetryPolicy::default(),
        );
        assert_eq!(runner.run_due(now).await.unwrap().failed, 1);
        let job = h
            .store
            .get_job_by_key(&kind.dedup_key(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.notifier.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_follow_up_job_completes_quietly() {
        let h = Harness::new().await;
        let rt = Arc::new(runtime(&h, RetryPolicy::default()));
        let now = Utc::now();
        JobQueue::new(Arc::clone(&h.store))
            .schedule_once(
                JobKind::FollowUp {
                    thread_id: Uuid::new_v4(),
                    due_at: now,
                },
                now,
            )
            .await
            .unwrap();

        let runner = JobRunner::new(
            Arc::clone(&h.store),
            rt,
            h.notifier.clone(),
            RetryPolicy::default(),
        );
        assert_eq!(runner.run_due(now).await.unwrap().completed, 1);
        assert!(h.mail.drafts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn seed_upserts_mailboxes_and_rules() {
        let h = Harness::new().await;
        let mailbox_id = Uuid::new_v4();
        let raw = format!(
            r#"{{
                "mailboxes": [{{
                    "id": "{mailbox_id}",
                    "address": "billing@example.com",
                    "provider_account": "billing@example.com",
                    "sla": {{ "first_response_hours": 8 }}
                }}],
                "rules": [{{
                    "id": "{rule_id}",
                    "mailbox_id": "{mailbox_id}",
                    "name": "ack",
                    "priority": 1,
                    "action": "create_draft",
                    "reply": {{ "mode": "template", "text": "Thanks!" }}
                }}]
            }}"#,
            rule_id = Uuid::new_v4(),
        );
        let seed = Seed::from_json(&raw).unwrap();
        seed.apply(h.store.as_ref()).await.unwrap();

        let mailbox = h.store.get_mailbox(mailbox_id).await.unwrap().unwrap();
        assert!(mailbox.draft_mode_default);
        assert_eq!(mailbox.sla.first_response_hours, Some(8));
        assert_eq!(h.store.list_active_rules(mailbox_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seed_rule_for_unknown_mailbox_is_rejected() {
        let h = Harness::new().await;
        let rule = AutoReplyRule::new(
            Uuid::new_v4(),
            "orphan",
            1,
            crate::pipeline::rules::RuleAction::MarkAsHandled,
        );
        let seed = Seed {
            mailboxes: vec![],
            rules: vec![rule],
        };
        let err = seed.apply(h.store.as_ref()).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn background_tasks_stop_on_shutdown() {
        let h = Harness::new().await;
        let rt = Arc::new(runtime(&h, RetryPolicy::none()));
        let config = SchedulerConfig {
            sync_interval: Duration::from_secs(3600),
            sla_scan_interval: Duration::from_secs(3600),
            renewal_sweep_interval: Duration::from_secs(3600),
            job_poll_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let tasks = rt.start(&config).unwrap();
        assert_eq!(
            tasks.names(),
            vec!["mailbox_sync", "sla_scan", "subscription_sweep", "job_runner"]
        );
        tasks.shutdown().await;
    }
}
