//! Thread state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::gateways::classifier::ClassificationResult;
use crate::threads::model::{Classification, Thread};

/// Lifecycle status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// First message stored, nothing else done yet.
    New,
    /// Classification requested or classified but not yet triaged.
    AwaitingClassification,
    /// Needs a human owner.
    AwaitingAssignment,
    Assigned,
    InProgress,
    /// A reply draft is waiting for approval.
    DraftPending,
    AwaitingCustomerReply,
    FollowUpScheduled,
    Resolved,
    Closed,
    Spam,
}

impl ThreadStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ThreadStatus) -> bool {
        use ThreadStatus::*;

        match (self, target) {
            (_, New) => false,
            (Resolved, Closed) => true,
            (from, _) if from.is_terminal() => false,
            (New, AwaitingClassification | AwaitingAssignment | Closed | Spam) => true,
            (New, _) => false,
            // Classification is only ever requested once, from New.
            (_, AwaitingClassification) => false,
            _ => true,
        }
    }

    /// Resolved, Closed and Spam accept no further automation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed | Self::Spam)
    }

    /// States in which classification may still decide the status.
    pub fn is_untriaged(&self) -> bool {
        matches!(self, Self::New | Self::AwaitingClassification)
    }

    /// States where the next move belongs to the customer.
    pub fn is_waiting_on_customer(&self) -> bool {
        matches!(self, Self::AwaitingCustomerReply | Self::FollowUpScheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::AwaitingClassification => "awaiting_classification",
            Self::AwaitingAssignment => "awaiting_assignment",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::DraftPending => "draft_pending",
            Self::AwaitingCustomerReply => "awaiting_customer_reply",
            Self::FollowUpScheduled => "follow_up_scheduled",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::Spam => "spam",
        }
    }

    /// Parse a status string from the DB.
    pub fn from_db(s: &str) -> Option<Self> {
        Some(match s {
            "new" => Self::New,
            "awaiting_classification" => Self::AwaitingClassification,
            "awaiting_assignment" => Self::AwaitingAssignment,
            "assigned" => Self::Assigned,
            "in_progress" => Self::InProgress,
            "draft_pending" => Self::DraftPending,
            "awaiting_customer_reply" => Self::AwaitingCustomerReply,
            "follow_up_scheduled" => Self::FollowUpScheduled,
            "resolved" => Self::Resolved,
            "closed" => Self::Closed,
            "spam" => Self::Spam,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Transitions ─────────────────────────────────────────────────────

impl Thread {
    /// Move to `target`, rejecting transitions the state machine forbids.
    pub fn transition_to(
        &mut self,
        target: ThreadStatus,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(target) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        debug!(thread = %self.id, from = %self.status, to = %target, "Thread transition");
        self.status = target;
        self.updated_at = now;
        if target == ThreadStatus::Resolved {
            self.resolved_at = Some(now);
        }
        if target.is_terminal() {
            self.next_follow_up_at = None;
        }
        Ok(())
    }

    /// Record that classification has been requested for a fresh thread.
    pub fn begin_classification(&mut self, now: DateTime<Utc>) {
        if self.status == ThreadStatus::New {
            self.status = ThreadStatus::AwaitingClassification;
            self.updated_at = now;
        }
    }

    /// Apply a classification result.
    ///
    /// Status is only decided while the thread is untriaged. Established
    /// threads get refreshed metadata and a priority that can only go up.
    pub fn apply_classification(&mut self, result: &ClassificationResult, now: DateTime<Utc>) {
        self.classification = result.classification;
        self.confidence = result.confidence.min(100);
        self.requires_review = result.requires_review || result.classification.forces_review();
        self.classification_reasoning = result.reasoning.clone();
        self.updated_at = now;

        if !self.status.is_untriaged() {
            self.raise_priority(result.priority);
            return;
        }

        self.priority = self.priority.max(result.priority);
        self.status = if self.requires_review {
            ThreadStatus::AwaitingAssignment
        } else if result.classification.auto_closes() {
            ThreadStatus::Closed
        } else {
            ThreadStatus::AwaitingClassification
        };
    }

    /// Fail-safe when the classifier could not produce a result.
    pub fn apply_classification_failure(&mut self, now: DateTime<Utc>) {
        self.requires_review = true;
        self.updated_at = now;
        if self.status.is_untriaged() {
            self.classification = Classification::Unclassified;
            self.confidence = 0;
            self.status = ThreadStatus::AwaitingAssignment;
        }
    }

    /// A new inbound message arrived on this thread. Returns `true` when the
    /// thread was reopened.
    pub fn record_inbound(&mut self, received_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.message_count += 1;
        self.last_message_at = self.last_message_at.max(received_at);
        self.updated_at = now;
        if self.status.is_waiting_on_customer() {
            self.status = ThreadStatus::InProgress;
            // The customer answered; a pending nudge is now stale.
            self.next_follow_up_at = None;
            return true;
        }
        false
    }

    /// An outbound reply left the mailbox (direct send or approved draft).
    pub fn record_outbound_sent(&mut self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        self.transition_to(ThreadStatus::AwaitingCustomerReply, now)?;
        if self.first_response_at.is_none() {
            self.first_response_at = Some(now);
        }
        Ok(())
    }

    /// Assign the thread to a person (or queue).
    pub fn assign(
        &mut self,
        assignee: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.transition_to(ThreadStatus::Assigned, now)?;
        self.assigned_to = Some(assignee.into());
        Ok(())
    }

    /// Schedule a follow-up nudge at `at`.
    pub fn schedule_follow_up(
        &mut self,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.transition_to(ThreadStatus::FollowUpScheduled, now)?;
        self.next_follow_up_at = Some(at);
        Ok(())
    }
}
