//! LLM-backed classification, reply generation and entity extraction.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{GatewayError, LlmError};
use crate::gateways::classifier::{
    ClassificationGateway, ClassificationResult, Entities, ReplyContext,
};
use crate::llm::TextCompleter;
use crate::threads::model::{Classification, Priority};

/// Bodies longer than this are cut before prompting.
const MAX_BODY_CHARS: usize = 6_000;

const CLASSIFY_SYSTEM: &str = "You triage inbound email for a customer operations team. \
Respond with a single JSON object and nothing else.";

const REPLY_SYSTEM: &str = "You write professional, concise customer service replies. \
Write the reply body only. Do not add a greeting line or signature.";

const ENTITIES_SYSTEM: &str = "You extract structured facts from email. \
Respond with a single JSON object and nothing else.";

/// Raw classifier output. Everything is optional so a sloppy answer still
/// yields a result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClassification {
    classification: Option<String>,
    confidence: Option<serde_json::Value>,
    priority: Option<String>,
    #[serde(default, alias = "requires_review", alias = "requiresHumanReview")]
    requires_review: Option<bool>,
    reasoning: Option<String>,
}

/// [`ClassificationGateway`] implemented with prompts over a [`TextCompleter`].
pub struct LlmClassifier {
    llm: Arc<dyn TextCompleter>,
    max_tokens: u64,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn TextCompleter>) -> Self {
        Self {
            llm,
            max_tokens: 1024,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn classify_prompt(subject: &str, body: &str, tenant_context: Option<&str>) -> String {
        let labels: Vec<&str> = Classification::ALL.iter().map(|c| c.as_str()).collect();
        let mut prompt = String::new();
        if let Some(ctx) = tenant_context {
            prompt.push_str(&format!("Organisation context: {ctx}\n\n"));
        }
        prompt.push_str(&format!(
            "Classify this email.\n\nSubject: {subject}\n\nBody:\n{}\n\n\
             Allowed classifications: {}\n\
             Priorities: low, normal, high, urgent\n\n\
             Answer with JSON shaped like:\n\
             {{\"classification\": \"technical_support\", \"confidence\": 85, \
             \"priority\": \"normal\", \"requiresReview\": false, \
             \"reasoning\": \"short reason\"}}",
            truncate(body, MAX_BODY_CHARS),
            labels.join(", ")
        ));
        prompt
    }

    fn reply_prompt(ctx: &ReplyContext) -> String {
        let mut prompt = format!("Mailbox: {}\n", ctx.mailbox);
        if let Some(tenant) = &ctx.tenant_context {
            prompt.push_str(&format!("Organisation context: {tenant}\n"));
        }
        if let Some(classification) = ctx.classification {
            prompt.push_str(&format!("Category: {classification}\n"));
        }
        let sender = ctx.sender_name.as_deref().unwrap_or(&ctx.sender_address);
        prompt.push_str(&format!(
            "From: {sender}\nSubject: {}\n\nLatest message:\n{}\n\n",
            ctx.subject,
            truncate(&ctx.latest_body, MAX_BODY_CHARS)
        ));
        if ctx.is_follow_up {
            prompt.push_str(&format!(
                "The customer has not replied yet. Write polite follow-up number {} \
                 checking whether they still need help.\n",
                ctx.follow_up_count + 1
            ));
        } else {
            prompt.push_str("Write a reply to the latest message.\n");
        }
        if let Some(instructions) = &ctx.instructions {
            prompt.push_str(&format!("Additional instructions: {instructions}\n"));
        }
        prompt
    }
}

#[async_trait]
impl ClassificationGateway for LlmClassifier {
    async fn classify(
        &self,
        subject: &str,
        body: &str,
        tenant_context: Option<&str>,
    ) -> Result<ClassificationResult, GatewayError> {
        let prompt = Self::classify_prompt(subject, body, tenant_context);
        let response = self
            .llm
            .complete(CLASSIFY_SYSTEM, &prompt, self.max_tokens)
            .await?;
        let result = parse_classification(&response)?;
        debug!(
            classification = %result.classification,
            confidence = result.confidence,
            priority = %result.priority,
            "Message classified"
        );
        Ok(result)
    }

    async fn generate_reply(&self, context: &ReplyContext) -> Result<String, GatewayError> {
        let prompt = Self::reply_prompt(context);
        let reply = self
            .llm
            .complete(REPLY_SYSTEM, &prompt, self.max_tokens)
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty reply".into(),
            }
            .into());
        }
        Ok(reply.to_string())
    }

    async fn extract_entities(&self, subject: &str, body: &str) -> Result<Entities, GatewayError> {
        let prompt = format!(
            "Extract the important facts from this email: order or ticket numbers, \
             dates, amounts, product names, people and companies.\n\n\
             Subject: {subject}\n\nBody:\n{}\n\n\
             Answer with a flat JSON object of the facts you found, or {{}} if none.",
            truncate(body, MAX_BODY_CHARS)
        );
        let response = self
            .llm
            .complete(ENTITIES_SYSTEM, &prompt, self.max_tokens)
            .await?;
        let json = extract_json_object(&response).ok_or_else(|| LlmError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: "no JSON object in entity response".into(),
        })?;
        let value: serde_json::Value = serde_json::from_str(&json).map_err(LlmError::from)?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => {
                warn!(kind = ?other, "Entity extraction returned a non-object");
                Ok(Entities::new())
            }
        }
    }
}

/// Parse a classifier answer into a [`ClassificationResult`].
///
/// Unknown labels fall back to `Unclassified`/`Normal`, missing confidence
/// to 50, and confidence is clamped to 0–100.
fn parse_classification(response: &str) -> Result<ClassificationResult, LlmError> {
    let json = extract_json_object(response).ok_or_else(|| LlmError::InvalidResponse {
        provider: "classifier".into(),
        reason: "no JSON object in classification response".into(),
    })?;
    let raw: RawClassification = serde_json::from_str(&json)?;

    let classification = raw
        .classification
        .as_deref()
        .map(Classification::from_label)
        .unwrap_or(Classification::Unclassified);

    let confidence = match raw.confidence {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(50.0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(50.0),
        _ => 50.0,
    };
    // Some models answer on a 0–1 scale.
    let confidence = if confidence > 0.0 && confidence <= 1.0 {
        confidence * 100.0
    } else {
        confidence
    };

    Ok(ClassificationResult {
        classification,
        confidence: confidence.round().clamp(0.0, 100.0) as u8,
        priority: raw
            .priority
            .as_deref()
            .map(Priority::from_label)
            .unwrap_or_default(),
        requires_review: raw.requires_review.unwrap_or(false) || classification.forces_review(),
        reasoning: raw.reasoning.filter(|r| !r.trim().is_empty()),
    })
}

/// Pull the first JSON object out of free-form model output.
fn extract_json_object(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| trimmed[start..=end].to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
