//! Mailbox data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SLA targets applied to threads when they are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaPolicy {
    /// Hours until a first response is due. `None` disables the check.
    #[serde(default)]
    pub first_response_hours: Option<u32>,
    /// Hours until the thread should be resolved.
    #[serde(default)]
    pub resolution_hours: Option<u32>,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            first_response_hours: Some(24),
            resolution_hours: Some(72),
        }
    }
}

/// Provider webhook registration for push notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Provider-side subscription id.
    pub id: String,
    pub expires_at: DateTime<Utc>,
    /// Shared secret echoed back on each notification.
    pub client_state: String,
}

impl Subscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A monitored mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: Uuid,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Provider account reference (Graph user id or UPN).
    pub provider_account: String,
    /// Brand / tenant hint passed to the classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_context: Option<String>,
    #[serde(default)]
    pub sla: SlaPolicy,
    #[serde(default = "default_true")]
    pub auto_reply_enabled: bool,
    /// When set, replies are always drafted for approval, never sent directly.
    #[serde(default = "default_true")]
    pub draft_mode_default: bool,
    /// Register a provider webhook instead of relying on polling alone.
    #[serde(default)]
    pub push_enabled: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Incremental ingestion watermark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Mailbox {
    /// Create an active mailbox with default SLA policy and draft mode on.
    pub fn new(address: impl Into<String>, provider_account: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            display_name: None,
            provider_account: provider_account.into(),
            tenant_context: None,
            sla: SlaPolicy::default(),
            auto_reply_enabled: true,
            draft_mode_default: true,
            push_enabled: false,
            is_active: true,
            last_sync_at: None,
            subscription: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set SLA policy.
    pub fn with_sla(mut self, sla: SlaPolicy) -> Self {
        self.sla = sla;
        self
    }

    /// Builder: allow rules to send replies without approval.
    pub fn with_draft_mode(mut self, draft_mode_default: bool) -> Self {
        self.draft_mode_default = draft_mode_default;
        self
    }

    /// Builder: enable push notifications.
    pub fn with_push(mut self, push_enabled: bool) -> Self {
        self.push_enabled = push_enabled;
        self
    }

    /// Human-readable name for reply templates.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}
