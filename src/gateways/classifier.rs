//! Classification / reply-generation collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::threads::model::{Classification, Priority};

/// Result of classifying one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub classification: Classification,
    /// 0–100.
    pub confidence: u8,
    pub priority: Priority,
    pub requires_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Everything the reply generator gets to see about a thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplyContext {
    pub mailbox: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_context: Option<String>,
    pub subject: String,
    pub sender_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Body of the most recent inbound message.
    pub latest_body: String,
    pub classification: Option<Classification>,
    /// Extra instructions from the matched rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub is_follow_up: bool,
    pub follow_up_count: u32,
}

/// Extracted entities: order numbers, dates, amounts, names.
pub type Entities = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait ClassificationGateway: Send + Sync {
    async fn classify(
        &self,
        subject: &str,
        body: &str,
        tenant_context: Option<&str>,
    ) -> Result<ClassificationResult, GatewayError>;

    async fn generate_reply(&self, context: &ReplyContext) -> Result<String, GatewayError>;

    async fn extract_entities(&self, subject: &str, body: &str) -> Result<Entities, GatewayError>;
}
