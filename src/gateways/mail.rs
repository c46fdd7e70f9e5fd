//! Mail provider primitives consumed by the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::mailboxes::model::Subscription;

/// A message as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub internet_message_id: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub body_preview: String,
    pub body: String,
    #[serde(default)]
    pub body_is_html: bool,
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// Provider importance flag (`low` / `normal` / `high`).
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
}

impl ProviderMessage {
    /// Conversation key used for thread correlation.
    pub fn conversation_key(&self) -> &str {
        match self.conversation_id.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => &self.id,
        }
    }

    pub fn is_high_importance(&self) -> bool {
        self.importance
            .as_deref()
            .is_some_and(|i| i.eq_ignore_ascii_case("high"))
    }
}

/// A reply draft created at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
}

/// Fetch / send / draft / subscribe primitives over a mail provider.
///
/// `account` is the mailbox's provider account reference.
#[async_trait]
pub trait MailGateway: Send + Sync {
    /// Messages received at or after `since`, oldest first, at most `top`.
    async fn list_messages(
        &self,
        account: &str,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<Vec<ProviderMessage>, GatewayError>;

    /// A single message; `None` if the provider no longer has it.
    async fn get_message(
        &self,
        account: &str,
        id: &str,
    ) -> Result<Option<ProviderMessage>, GatewayError>;

    async fn create_reply_draft(
        &self,
        account: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Result<Draft, GatewayError>;

    async fn send_draft(&self, account: &str, draft_id: &str) -> Result<(), GatewayError>;

    async fn send_reply(
        &self,
        account: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Result<(), GatewayError>;

    async fn mark_read(&self, account: &str, id: &str) -> Result<(), GatewayError>;

    async fn create_subscription(
        &self,
        account: &str,
        notification_url: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Subscription, GatewayError>;

    /// Extend a subscription; returns the new expiry granted by the provider.
    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, GatewayError>;

    /// Delete a subscription. Already-gone subscriptions are not an error.
    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), GatewayError>;
}
