//! Background scheduling: recurring triggers, durable one-off jobs and the
//! retry policy both share.

pub mod jobs;
pub mod recurring;
pub mod retry;
pub mod runner;

pub use jobs::{JobKind, JobQueue, JobStatus, ScheduledJob};
pub use recurring::{RecurringSchedule, spawn_recurring};
pub use retry::RetryPolicy;
pub use runner::{JobHandler, JobRunner, RunnerReport, spawn_job_runner};
