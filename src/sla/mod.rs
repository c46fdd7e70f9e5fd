//! SLA deadline tracking and breach escalation.

pub mod tracker;

pub use tracker::{SlaScanReport, SlaTracker};

use serde::{Deserialize, Serialize};

/// Which SLA deadline was missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    FirstResponse,
    Resolution,
}

impl BreachKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstResponse => "first_response",
            Self::Resolution => "resolution",
        }
    }
}
