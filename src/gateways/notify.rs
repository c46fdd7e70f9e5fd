//! Notification sink: delivers escalation events and operational alerts to
//! whatever surfaces them to humans.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::sla::BreachKind;
use crate::threads::model::Priority;

/// Emitted whenever the SLA tracker creates an escalation task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationEvent {
    pub thread_id: Uuid,
    pub mailbox_id: Uuid,
    pub task_id: Uuid,
    pub urgency: Priority,
    pub reason: BreachKind,
    pub deadline: DateTime<Utc>,
}

/// A job failed for good: retries exhausted or a non-retryable error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationalAlert {
    pub job: String,
    pub error: String,
    pub attempts: u32,
    /// Credential problem; someone has to fix configuration.
    pub auth_failure: bool,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn escalation(&self, event: &EscalationEvent) -> Result<(), GatewayError>;

    async fn operational_alert(&self, alert: &OperationalAlert) -> Result<(), GatewayError>;
}

/// Writes events to the log. Default sink when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn escalation(&self, event: &EscalationEvent) -> Result<(), GatewayError> {
        warn!(
            thread = %event.thread_id,
            mailbox = %event.mailbox_id,
            task = %event.task_id,
            urgency = %event.urgency,
            reason = event.reason.as_str(),
            deadline = %event.deadline,
            "SLA escalation"
        );
        Ok(())
    }

    async fn operational_alert(&self, alert: &OperationalAlert) -> Result<(), GatewayError> {
        error!(
            job = %alert.job,
            attempts = alert.attempts,
            auth_failure = alert.auth_failure,
            error = %alert.error,
            "Job failed permanently"
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WebhookPayload<'a> {
    Escalation(&'a EscalationEvent),
    OperationalAlert(&'a OperationalAlert),
}

/// POSTs each event as JSON to a configured URL.
pub struct WebhookNotificationSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::Transient {
                service: "notify".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = format!("webhook returned {status}");
        Err(if status.is_server_error() {
            GatewayError::Transient {
                service: "notify".into(),
                reason,
            }
        } else {
            GatewayError::InvalidResponse {
                service: "notify".into(),
                reason,
            }
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn escalation(&self, event: &EscalationEvent) -> Result<(), GatewayError> {
        self.post(&WebhookPayload::Escalation(event)).await
    }

    async fn operational_alert(&self, alert: &OperationalAlert) -> Result<(), GatewayError> {
        self.post(&WebhookPayload::OperationalAlert(alert)).await
    }
}
