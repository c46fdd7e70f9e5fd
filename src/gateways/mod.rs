//! External collaborators: mail provider, classifier, notification sink.

pub mod classifier;
pub mod graph;
pub mod mail;
pub mod notify;

pub use classifier::{ClassificationGateway, ClassificationResult, Entities, ReplyContext};
pub use graph::{GraphConfig, GraphMailGateway};
pub use mail::{Draft, MailGateway, ProviderMessage};
pub use notify::{
    EscalationEvent, LogNotificationSink, NotificationSink, OperationalAlert,
    WebhookNotificationSink,
};

use std::future::Future;
use std::time::Duration;

use crate::error::GatewayError;

/// Bound a gateway call so a stalled provider cannot hold up a run.
pub async fn with_timeout<T, F>(service: &str, after: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            service: service.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_call_times_out() {
        let result: Result<(), GatewayError> = with_timeout(
            "graph",
            Duration::from_millis(10),
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let result = with_timeout("graph", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
