//! Per-run context and the collaborators every pipeline call receives.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::gateways::{ClassificationGateway, MailGateway, NotificationSink};
use crate::scheduler::jobs::JobQueue;
use crate::store::Database;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    PullSync,
    Push,
    SlaScan,
    FollowUp,
    Renewal,
    Manual,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullSync => "pull_sync",
            Self::Push => "push",
            Self::SlaScan => "sla_scan",
            Self::FollowUp => "follow_up",
            Self::Renewal => "renewal",
            Self::Manual => "manual",
        }
    }
}

/// Unit of work for one sync, scan or job firing.
///
/// Carries the run's clock so every timestamp written in one run agrees,
/// and so tests can pin time.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(kind: RunKind) -> Self {
        Self::at(kind, Utc::now())
    }

    pub fn at(kind: RunKind, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind,
            now,
        }
    }
}

/// Shared collaborators, cloned cheaply into each component.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn Database>,
    pub mail: Arc<dyn MailGateway>,
    pub classifier: Arc<dyn ClassificationGateway>,
    pub notifier: Arc<dyn NotificationSink>,
    pub jobs: JobQueue,
    pub config: PipelineConfig,
}

impl PipelineDeps {
    pub fn new(
        store: Arc<dyn Database>,
        mail: Arc<dyn MailGateway>,
        classifier: Arc<dyn ClassificationGateway>,
        notifier: Arc<dyn NotificationSink>,
        config: PipelineConfig,
    ) -> Self {
        let jobs = JobQueue::new(Arc::clone(&store));
        Self {
            store,
            mail,
            classifier,
            notifier,
            jobs,
            config,
        }
    }
}
