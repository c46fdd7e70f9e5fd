//! Core pipeline types: stored messages and per-item / per-run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateways::mail::ProviderMessage;
use crate::threads::model::Classification;

/// Direction of a stored message relative to the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    DraftCreated,
    Sent,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::DraftCreated => "draft_created",
            Self::Sent => "sent",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "draft_created" => Some(Self::DraftCreated),
            "sent" => Some(Self::Sent),
            _ => None,
        }
    }
}

/// A persisted message. The provider message id is the idempotence key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub mailbox_id: Uuid,
    /// Provider id for inbound mail, draft id for drafts.
    pub provider_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_message_id: Option<String>,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    pub from_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub body_preview: String,
    pub body: String,
    pub body_is_html: bool,
    pub received_at: DateTime<Utc>,
    /// For outbound messages: provider id of the message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Rule that produced an outbound message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const PREVIEW_CHARS: usize = 255;

impl Message {
    /// Build an inbound message from a provider payload.
    pub fn inbound(
        provider: &ProviderMessage,
        mailbox_id: Uuid,
        thread_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        let preview = if provider.body_preview.is_empty() {
            preview_of(&provider.body)
        } else {
            provider.body_preview.clone()
        };
        Self {
            id: Uuid::new_v4(),
            thread_id,
            mailbox_id,
            provider_message_id: provider.id.clone(),
            internet_message_id: provider.internet_message_id.clone(),
            direction: MessageDirection::Inbound,
            status: MessageStatus::Received,
            from_address: provider.from_address.clone(),
            from_name: provider.from_name.clone(),
            to_addresses: provider.to_addresses.clone(),
            subject: provider.subject.clone(),
            body_preview: preview,
            body: provider.body.clone(),
            body_is_html: provider.body_is_html,
            received_at: provider.received_at,
            in_reply_to: None,
            rule_id: None,
            approved_by: None,
            sent_at: None,
            created_at: now,
        }
    }

    /// Build an outbound reply (draft or sent) answering `original`.
    pub fn outbound(
        original: &Message,
        provider_message_id: impl Into<String>,
        from_address: impl Into<String>,
        body: impl Into<String>,
        status: MessageStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let body = body.into();
        let subject = if original.subject.to_ascii_lowercase().starts_with("re:") {
            original.subject.clone()
        } else {
            format!("RE: {}", original.subject)
        };
        Self {
            id: Uuid::new_v4(),
            thread_id: original.thread_id,
            mailbox_id: original.mailbox_id,
            provider_message_id: provider_message_id.into(),
            internet_message_id: None,
            direction: MessageDirection::Outbound,
            status,
            from_address: from_address.into(),
            from_name: None,
            to_addresses: vec![original.from_address.clone()],
            subject,
            body_preview: preview_of(&body),
            body,
            body_is_html: true,
            received_at: now,
            in_reply_to: Some(original.provider_message_id.clone()),
            rule_id: None,
            approved_by: None,
            sent_at: (status == MessageStatus::Sent).then_some(now),
            created_at: now,
        }
    }

    /// Builder: record the rule that produced this message.
    pub fn with_rule(mut self, rule_id: Option<Uuid>) -> Self {
        self.rule_id = rule_id;
        self
    }

    pub fn is_draft(&self) -> bool {
        self.direction == MessageDirection::Outbound && self.status == MessageStatus::DraftCreated
    }
}

fn preview_of(body: &str) -> String {
    body.chars().take(PREVIEW_CHARS).collect()
}

// ── Results ─────────────────────────────────────────────────────────

/// Why an item was skipped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Provider id already stored.
    Duplicate,
    /// Named message no longer exists at the provider.
    NotFound,
    /// Mailbox is deactivated.
    Inactive,
}

/// What happened to a processed message.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedMessage {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub new_thread: bool,
    pub reopened: bool,
    pub classification: Option<Classification>,
    pub rule_id: Option<Uuid>,
    pub action: Option<&'static str>,
    /// Set when the matched rule's action failed and was handed to a human.
    pub action_error: Option<String>,
}

/// Per-item result, aggregated by the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Processed(ProcessedMessage),
    Skipped {
        provider_message_id: String,
        reason: SkipReason,
    },
    Failed {
        provider_message_id: String,
        error: String,
    },
}

/// A single item that failed within a run.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub provider_message_id: String,
    pub error: String,
}

/// Aggregated result of one mailbox sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub mailbox_id: Uuid,
    pub fetched: usize,
    pub processed_count: usize,
    pub skipped: usize,
    pub errors: Vec<ItemError>,
    /// Another run holds the mailbox lease; nothing was fetched.
    pub lease_busy: bool,
    pub watermark: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn new(mailbox_id: Uuid) -> Self {
        Self {
            mailbox_id,
            ..Default::default()
        }
    }

    pub fn busy(mailbox_id: Uuid) -> Self {
        Self {
            mailbox_id,
            lease_busy: true,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Processed(_) => self.processed_count += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Failed {
                provider_message_id,
                error,
            } => self.errors.push(ItemError {
                provider_message_id: provider_message_id.clone(),
                error: error.clone(),
            }),
        }
    }
}
