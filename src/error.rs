//! Error types for inbox-ops.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl Error {
    /// Whether a job that failed with this error should be retried by the
    /// backoff policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(e) => e.is_retryable(),
            Self::Llm(e) => e.is_retryable(),
            Self::Database(e) => matches!(e, DatabaseError::Pool(_) | DatabaseError::Query(_)),
            Self::Pipeline(e) => matches!(e, PipelineError::MailboxBusy(_)),
            Self::Config(_) | Self::Scheduler(_) => false,
        }
    }

    /// Whether this error means a credential is missing, expired or rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Gateway(GatewayError::Auth { .. }))
            || matches!(self, Self::Llm(LlmError::AuthFailed { .. }))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by external collaborators (mail provider, classifier,
/// notification delivery).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{service} transient failure: {reason}")]
    Transient { service: String, reason: String },

    #[error("{service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{service} authentication failed: {reason}")]
    Auth { service: String, reason: String },

    #[error("{service} resource not found: {what}")]
    NotFound { service: String, what: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

impl From<LlmError> for GatewayError {
    fn from(e: LlmError) -> Self {
        let service = "classifier".to_string();
        match e {
            LlmError::RequestFailed { reason, .. } => GatewayError::Transient { service, reason },
            LlmError::RateLimited { provider } => GatewayError::Transient {
                service,
                reason: format!("{provider} rate limited"),
            },
            LlmError::AuthFailed { provider } => GatewayError::Auth {
                service,
                reason: format!("{provider} rejected credentials"),
            },
            LlmError::InvalidResponse { reason, .. } => {
                GatewayError::InvalidResponse { service, reason }
            }
            LlmError::Json(e) => GatewayError::InvalidResponse {
                service,
                reason: e.to_string(),
            },
        }
    }
}

/// Pipeline processing errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox {0} not found")]
    MailboxNotFound(Uuid),

    #[error("Thread {0} not found")]
    ThreadNotFound(Uuid),

    #[error("Message {0} not found")]
    MessageNotFound(Uuid),

    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Invalid thread transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Malformed provider message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    #[error("Message {0} is not an outbound draft")]
    NotADraft(Uuid),

    #[error("Mailbox {0} is locked by another ingestion run")]
    MailboxBusy(Uuid),
}

/// Job scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid schedule {schedule}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
