//! Task data model: human-facing work items tied to a thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::threads::model::Priority;

/// The kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Chase the customer or finish the work a rule started.
    FollowUp,
    /// SLA breach escalation.
    Escalate,
    /// Automation failed; a human must review and reply.
    ReviewDraft,
    SendReply,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FollowUp => "follow_up",
            Self::Escalate => "escalate",
            Self::ReviewDraft => "review_draft",
            Self::SendReply => "send_reply",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        Some(match s {
            "follow_up" => Self::FollowUp,
            "escalate" => Self::Escalate,
            "review_draft" => Self::ReviewDraft,
            "send_reply" => Self::SendReply,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            _ => return None,
        })
    }
}

/// A follow-up or escalation work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub task_type: TaskType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub due_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        thread_id: Uuid,
        task_type: TaskType,
        title: impl Into<String>,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            task_type,
            title: title.into(),
            description: None,
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            due_at,
            assigned_to: None,
            completed_at: None,
            created_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set assignee.
    pub fn with_assignee(mut self, assignee: Option<String>) -> Self {
        self.assigned_to = assignee;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status != TaskStatus::Completed
    }
}
