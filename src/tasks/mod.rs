//! Follow-up and escalation tasks.

pub mod model;

pub use model::{Task, TaskStatus, TaskType};
