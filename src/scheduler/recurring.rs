//! Recurring background triggers: fixed interval or cron expression.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::SchedulerError;

/// When a recurring trigger fires.
#[derive(Debug, Clone)]
pub enum RecurringSchedule {
    Every(Duration),
    /// Seconds-first cron expression, e.g. `0 */15 * * * *`.
    Cron(Box<cron::Schedule>),
}

impl RecurringSchedule {
    /// Parse a cron expression.
    pub fn cron(expr: &str) -> Result<Self, SchedulerError> {
        let schedule =
            cron::Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidSchedule {
                schedule: expr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// A cron expression when one is configured, otherwise the interval.
    pub fn from_config(interval: Duration, cron: Option<&str>) -> Result<Self, SchedulerError> {
        match cron {
            Some(expr) if !expr.trim().is_empty() => Self::cron(expr.trim()),
            _ if interval.is_zero() => Err(SchedulerError::InvalidSchedule {
                schedule: "0s".into(),
                reason: "interval must be positive".into(),
            }),
            _ => Ok(Self::Every(interval)),
        }
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Spawn a task that calls `run` on `schedule` until the returned flag is set.
///
/// Interval schedules fire once immediately; cron schedules wait for their
/// first slot.
pub fn spawn_recurring<F, Fut>(
    name: &'static str,
    schedule: RecurringSchedule,
    run: F,
) -> (JoinHandle<()>, Arc<AtomicBool>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        match schedule {
            RecurringSchedule::Every(interval) => {
                info!(task = name, every_secs = interval.as_secs(), "Recurring task started");
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    run().await;
                }
            }
            RecurringSchedule::Cron(schedule) => {
                info!(task = name, "Recurring task started on cron schedule");
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        warn!(task = name, "Cron schedule has no future fire times");
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    run().await;
                }
            }
        }
        info!(task = name, "Recurring task shutting down");
    });

    (handle, shutdown_flag)
}
