//! End-to-end push path: a notification POSTed to the webhook server
//! becomes a durable job, and the job runner ingests the message into a
//! thread.
//!
//! Each test spins up an Axum server on a random port and talks to it over
//! real HTTP with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;

use inbox_ops::config::PipelineConfig;
use inbox_ops::error::GatewayError;
use inbox_ops::gateways::{
    ClassificationGateway, ClassificationResult, Draft, Entities, LogNotificationSink,
    MailGateway, ProviderMessage, ReplyContext,
};
use inbox_ops::mailboxes::{Mailbox, Subscription, SubscriptionConfig};
use inbox_ops::pipeline::PipelineDeps;
use inbox_ops::runtime::Runtime;
use inbox_ops::scheduler::{JobRunner, RetryPolicy};
use inbox_ops::store::{Database, LibSqlBackend};
use inbox_ops::threads::{Classification, Priority};
use inbox_ops::webhook::{WebhookState, webhook_routes};

const CLIENT_STATE: &str = "integration-state";

/// Provider stub that knows exactly one message.
struct StubMail {
    message: ProviderMessage,
}

#[async_trait]
impl MailGateway for StubMail {
    async fn list_messages(
        &self,
        _account: &str,
        _since: DateTime<Utc>,
        _top: usize,
    ) -> Result<Vec<ProviderMessage>, GatewayError> {
        Ok(vec![self.message.clone()])
    }

    async fn get_message(
        &self,
        _account: &str,
        id: &str,
    ) -> Result<Option<ProviderMessage>, GatewayError> {
        Ok((id == self.message.id).then(|| self.message.clone()))
    }

    async fn create_reply_draft(
        &self,
        _account: &str,
        _in_reply_to: &str,
        _body: &str,
    ) -> Result<Draft, GatewayError> {
        Ok(Draft {
            id: "draft-1".into(),
        })
    }

    async fn send_draft(&self, _account: &str, _draft_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn send_reply(
        &self,
        _account: &str,
        _in_reply_to: &str,
        _body: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn mark_read(&self, _account: &str, _id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn create_subscription(
        &self,
        _account: &str,
        _notification_url: &str,
        _expires_at: DateTime<Utc>,
    ) -> Result<Subscription, GatewayError> {
        unimplemented!("not used in webhook tests")
    }

    async fn renew_subscription(
        &self,
        _subscription_id: &str,
        _expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, GatewayError> {
        unimplemented!("not used in webhook tests")
    }

    async fn delete_subscription(&self, _subscription_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

struct StubClassifier;

#[async_trait]
impl ClassificationGateway for StubClassifier {
    async fn classify(
        &self,
        _subject: &str,
        _body: &str,
        _tenant_context: Option<&str>,
    ) -> Result<ClassificationResult, GatewayError> {
        Ok(ClassificationResult {
            classification: Classification::TechnicalSupport,
            confidence: 90,
            priority: Priority::Normal,
            requires_review: false,
            reasoning: None,
        })
    }

    async fn generate_reply(&self, _context: &ReplyContext) -> Result<String, GatewayError> {
        Ok("stub reply".into())
    }

    async fn extract_entities(&self, _subject: &str, _body: &str) -> Result<Entities, GatewayError> {
        Ok(Entities::new())
    }
}

fn provider_message(id: &str) -> ProviderMessage {
    ProviderMessage {
        id: id.into(),
        conversation_id: Some("conv-42".into()),
        internet_message_id: None,
        subject: "Where is order 1234?".into(),
        body_preview: String::new(),
        body: "It has not arrived yet.".into(),
        body_is_html: false,
        from_address: "buyer@example.com".into(),
        from_name: Some("Robin Buyer".into()),
        to_addresses: vec!["orders@example.com".into()],
        received_at: Utc::now(),
        importance: None,
        has_attachments: false,
    }
}

/// Store with one push-enabled mailbox holding subscription `sub-int`.
async fn seeded_store() -> (Arc<dyn Database>, Mailbox) {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Mailbox::new("orders@example.com", "orders@example.com").with_push(true);
    store.upsert_mailbox(&mailbox).await.unwrap();
    let subscription = Subscription {
        id: "sub-int".into(),
        expires_at: Utc::now() + chrono::Duration::days(2),
        client_state: CLIENT_STATE.into(),
    };
    store
        .set_subscription(mailbox.id, Some(&subscription))
        .await
        .unwrap();
    (store, mailbox)
}

/// Start the webhook server on a random port, return its base URL.
async fn start_server(store: Arc<dyn Database>) -> String {
    let app = webhook_routes(WebhookState::new(store));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

fn notification(client_state: &str, message_id: &str) -> serde_json::Value {
    serde_json::json!({
        "value": [{
            "subscriptionId": "sub-int",
            "clientState": client_state,
            "changeType": "created",
            "resourceData": { "id": message_id }
        }]
    })
}

#[tokio::test]
async fn pushed_message_becomes_thread() {
    let (store, mailbox) = seeded_store().await;
    let base = start_server(Arc::clone(&store)).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/webhooks/mail"))
        .json(&notification(CLIENT_STATE, "AAMk-42"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let deps = PipelineDeps::new(
        Arc::clone(&store),
        Arc::new(StubMail {
            message: provider_message("AAMk-42"),
        }),
        Arc::new(StubClassifier),
        Arc::new(LogNotificationSink),
        PipelineConfig::default(),
    );
    let runtime = Arc::new(Runtime::new(
        deps,
        SubscriptionConfig::default(),
        RetryPolicy::none(),
    ));
    let runner = JobRunner::new(
        Arc::clone(&store),
        runtime,
        Arc::new(LogNotificationSink),
        RetryPolicy::none(),
    );

    let report = runner.run_due(Utc::now()).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let thread = store
        .find_thread(mailbox.id, "conv-42")
        .await
        .unwrap()
        .expect("thread created");
    assert_eq!(thread.subject, "Where is order 1234?");
    assert_eq!(thread.classification, Classification::TechnicalSupport);
    assert!(store.message_exists("AAMk-42").await.unwrap());

    // A redelivered notification dedups at the job queue and the message store.
    let resp = reqwest::Client::new()
        .post(format!("{base}/webhooks/mail"))
        .json(&notification(CLIENT_STATE, "AAMk-42"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let report = runner.run_due(Utc::now()).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(store.list_thread_messages(thread.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn forged_notification_queues_nothing() {
    let (store, _) = seeded_store().await;
    let base = start_server(Arc::clone(&store)).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/webhooks/mail"))
        .json(&notification("guessed", "AAMk-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 0);
    assert!(store.list_due_jobs(Utc::now(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn validation_handshake_over_http() {
    let (store, _) = seeded_store().await;
    let base = start_server(store).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/webhooks/mail?validationToken=token-123"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "token-123");

    let health: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}
