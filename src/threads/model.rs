//! Thread data model: one stateful conversation per (mailbox, conversation id).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mailboxes::model::SlaPolicy;
use crate::threads::state::ThreadStatus;

/// Category assigned by the classification gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    TechnicalSupport,
    BillingInquiry,
    AccountIssue,
    FeatureRequest,
    BugReport,
    QuoteRequest,
    DemoRequest,
    PricingInquiry,
    PartnershipInquiry,
    ContractQuestion,
    ComplianceQuery,
    DocumentRequest,
    JobApplication,
    Complaint,
    Legal,
    Escalation,
    AutoReply,
    OutOfOffice,
    Spam,
    Unclassified,
}

impl Classification {
    pub const ALL: [Classification; 20] = [
        Self::TechnicalSupport,
        Self::BillingInquiry,
        Self::AccountIssue,
        Self::FeatureRequest,
        Self::BugReport,
        Self::QuoteRequest,
        Self::DemoRequest,
        Self::PricingInquiry,
        Self::PartnershipInquiry,
        Self::ContractQuestion,
        Self::ComplianceQuery,
        Self::DocumentRequest,
        Self::JobApplication,
        Self::Complaint,
        Self::Legal,
        Self::Escalation,
        Self::AutoReply,
        Self::OutOfOffice,
        Self::Spam,
        Self::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechnicalSupport => "technical_support",
            Self::BillingInquiry => "billing_inquiry",
            Self::AccountIssue => "account_issue",
            Self::FeatureRequest => "feature_request",
            Self::BugReport => "bug_report",
            Self::QuoteRequest => "quote_request",
            Self::DemoRequest => "demo_request",
            Self::PricingInquiry => "pricing_inquiry",
            Self::PartnershipInquiry => "partnership_inquiry",
            Self::ContractQuestion => "contract_question",
            Self::ComplianceQuery => "compliance_query",
            Self::DocumentRequest => "document_request",
            Self::JobApplication => "job_application",
            Self::Complaint => "complaint",
            Self::Legal => "legal",
            Self::Escalation => "escalation",
            Self::AutoReply => "auto_reply",
            Self::OutOfOffice => "out_of_office",
            Self::Spam => "spam",
            Self::Unclassified => "unclassified",
        }
    }

    /// Lenient parse: accepts `snake_case`, `PascalCase` and spaced labels.
    /// Anything unrecognised is `Unclassified`.
    pub fn from_label(label: &str) -> Self {
        let normalized: String = label
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().replace('_', "") == normalized)
            .unwrap_or(Self::Unclassified)
    }

    /// Categories that always need a human, whatever the confidence.
    pub fn forces_review(&self) -> bool {
        matches!(self, Self::Complaint | Self::Legal | Self::Escalation)
    }

    /// Categories that close the thread without any reply.
    pub fn auto_closes(&self) -> bool {
        matches!(self, Self::Spam | Self::AutoReply | Self::OutOfOffice)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency tier. Ordered: `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Highest urgency tier; SLA breaches escalate to this.
    pub const HIGHEST: Priority = Priority::Urgent;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" | "critical" => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    /// Provider conversation id (falls back to the first message id).
    pub conversation_id: String,
    pub subject: String,
    pub from_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub status: ThreadStatus,
    pub classification: Classification,
    /// Classifier confidence, 0–100.
    pub confidence: u8,
    pub requires_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_reasoning: Option<String>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_response_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_response_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub first_response_breached: bool,
    pub resolution_breached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub follow_up_count: u32,
    pub message_count: u32,
    pub last_message_at: DateTime<Utc>,
    /// Entities extracted from the first message (order numbers, dates, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// Create a new thread, seeding SLA deadlines from the mailbox policy.
    pub fn new(
        mailbox_id: Uuid,
        conversation_id: impl Into<String>,
        subject: impl Into<String>,
        from_address: impl Into<String>,
        sla: &SlaPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            conversation_id: conversation_id.into(),
            subject: subject.into(),
            from_address: from_address.into(),
            from_name: None,
            status: ThreadStatus::New,
            classification: Classification::Unclassified,
            confidence: 0,
            requires_review: false,
            classification_reasoning: None,
            priority: Priority::Normal,
            assigned_to: None,
            first_response_deadline: sla
                .first_response_hours
                .map(|h| now + Duration::hours(i64::from(h))),
            resolution_deadline: sla
                .resolution_hours
                .map(|h| now + Duration::hours(i64::from(h))),
            first_response_at: None,
            resolved_at: None,
            first_response_breached: false,
            resolution_breached: false,
            next_follow_up_at: None,
            follow_up_count: 0,
            message_count: 0,
            last_message_at: now,
            entities: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set sender display name.
    pub fn with_from_name(mut self, name: Option<String>) -> Self {
        self.from_name = name;
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Raise priority to at least `floor`. Never lowers it.
    pub fn raise_priority(&mut self, floor: Priority) {
        self.priority = self.priority.max(floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_labels_parse_leniently() {
        assert_eq!(
            Classification::from_label("TechnicalSupport"),
            Classification::TechnicalSupport
        );
        assert_eq!(
            Classification::from_label("out_of_office"),
            Classification::OutOfOffice
        );
        assert_eq!(
            Classification::from_label("Billing Inquiry"),
            Classification::BillingInquiry
        );
        assert_eq!(
            Classification::from_label("weather report"),
            Classification::Unclassified
        );
    }

    #[test]
    fn priority_is_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Urgent);
        assert_eq!(Priority::HIGHEST, Priority::Urgent);
        assert_eq!(Priority::from_label("Critical"), Priority::Urgent);
        assert_eq!(Priority::from_label("???"), Priority::Normal);
    }

    #[test]
    fn new_thread_seeds_deadlines_from_policy() {
        let now = Utc::now();
        let sla = SlaPolicy {
            first_response_hours: Some(4),
            resolution_hours: Some(48),
        };
        let thread = Thread::new(Uuid::new_v4(), "conv-1", "Hello", "a@b.com", &sla, now);
        assert_eq!(thread.status, ThreadStatus::New);
        assert_eq!(thread.first_response_deadline, Some(now + Duration::hours(4)));
        assert_eq!(thread.resolution_deadline, Some(now + Duration::hours(48)));
        assert!(!thread.first_response_breached);
    }

    #[test]
    fn no_policy_means_no_deadlines() {
        let thread = Thread::new(
            Uuid::new_v4(),
            "conv-1",
            "Hello",
            "a@b.com",
            &SlaPolicy {
                first_response_hours: None,
                resolution_hours: None,
            },
            Utc::now(),
        );
        assert!(thread.first_response_deadline.is_none());
        assert!(thread.resolution_deadline.is_none());
    }

    #[test]
    fn raise_priority_never_lowers() {
        let mut thread = Thread::new(
            Uuid::new_v4(),
            "c",
            "s",
            "f",
            &SlaPolicy::default(),
            Utc::now(),
        )
        .with_priority(Priority::Urgent);
        thread.raise_priority(Priority::High);
        assert_eq!(thread.priority, Priority::Urgent);
    }
}
