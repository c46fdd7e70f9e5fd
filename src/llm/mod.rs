//! LLM integration for inbox-ops.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! The pipeline only needs "system prompt + user prompt in, text out", so
//! the provider surface is the small [`TextCompleter`] trait. [`LlmClassifier`]
//! builds the classification gateway on top of it.

pub mod classifier;

pub use classifier::LlmClassifier;

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::ExposeSecret;

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }

    fn key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Read `INBOX_OPS_LLM_BACKEND`, `INBOX_OPS_LLM_MODEL` and the backend's
    /// API key. Returns `None` when no key is configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let backend = match std::env::var("INBOX_OPS_LLM_BACKEND") {
            Ok(label) => LlmBackend::from_label(&label).ok_or_else(|| ConfigError::InvalidValue {
                key: "INBOX_OPS_LLM_BACKEND".into(),
                message: format!("unknown backend '{label}'"),
            })?,
            Err(_) => LlmBackend::Anthropic,
        };

        let Ok(api_key) = std::env::var(backend.key_var()) else {
            return Ok(None);
        };

        let model = std::env::var("INBOX_OPS_LLM_MODEL")
            .unwrap_or_else(|_| backend.default_model().to_string());

        Ok(Some(Self {
            backend,
            api_key: secrecy::SecretString::from(api_key),
            model,
        }))
    }
}

/// One-shot text completion.
#[async_trait]
pub trait TextCompleter: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u64,
    ) -> Result<String, LlmError>;
}

/// [`TextCompleter`] backed by a rig completion model.
pub struct RigCompleter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigCompleter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

#[async_trait]
impl<M> TextCompleter for RigCompleter<M>
where
    M: CompletionModel + Clone + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u64,
    ) -> Result<String, LlmError> {
        let agent = rig::agent::AgentBuilder::new(self.model.clone())
            .preamble(system)
            .max_tokens(max_tokens)
            .build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| map_prompt_error(self.provider, &e.to_string()))
    }
}

/// Sort a provider failure into the error taxonomy from its message.
fn map_prompt_error(provider: &str, message: &str) -> LlmError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        LlmError::RateLimited {
            provider: provider.to_string(),
        }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid x-api-key")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    }
}

/// Create a text completer from configuration.
pub fn create_completer(config: &LlmConfig) -> Result<Arc<dyn TextCompleter>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_completer(config),
        LlmBackend::OpenAi => create_openai_completer(config),
    }
}

fn create_anthropic_completer(config: &LlmConfig) -> Result<Arc<dyn TextCompleter>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigCompleter::new(model, &config.model, "anthropic")))
}

fn create_openai_completer(config: &LlmConfig) -> Result<Arc<dyn TextCompleter>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigCompleter::new(model, &config.model, "openai")))
}
