//! Hand-written gateway doubles and fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::GatewayError;
use crate::gateways::{
    ClassificationGateway, ClassificationResult, Draft, Entities, EscalationEvent, MailGateway,
    NotificationSink, OperationalAlert, ProviderMessage, ReplyContext,
};
use crate::mailboxes::model::{Mailbox, Subscription};
use crate::pipeline::context::PipelineDeps;
use crate::store::{Database, LibSqlBackend};
use crate::threads::model::{Classification, Priority};

fn transient(service: &str) -> GatewayError {
    GatewayError::Transient {
        service: service.to_string(),
        reason: "503 Service Unavailable".to_string(),
    }
}

// ── Mail ────────────────────────────────────────────────────────────

/// In-memory mail provider that records every call.
#[derive(Default)]
pub struct MockMailGateway {
    pub inbox: Mutex<Vec<ProviderMessage>>,
    /// `(in_reply_to, body)` per created draft.
    pub drafts: Mutex<Vec<(String, String)>>,
    /// `(in_reply_to, body)` per direct reply.
    pub sent: Mutex<Vec<(String, String)>>,
    pub sent_drafts: Mutex<Vec<String>>,
    pub marked_read: Mutex<Vec<String>>,
    pub subscriptions: Mutex<Vec<Subscription>>,
    pub renewals: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub list_calls: AtomicUsize,
    pub fail_list: AtomicBool,
    pub fail_drafts: AtomicBool,
    pub renew_not_found: AtomicBool,
    pub fail_subscribe: AtomicBool,
}

impl MockMailGateway {
    pub fn push(&self, message: ProviderMessage) {
        self.inbox.lock().unwrap().push(message);
    }
}

#[async_trait]
impl MailGateway for MockMailGateway {
    async fn list_messages(
        &self,
        _account: &str,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<Vec<ProviderMessage>, GatewayError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(transient("mail"));
        }
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.received_at >= since)
            .take(top)
            .cloned()
            .collect())
    }

    async fn get_message(
        &self,
        _account: &str,
        id: &str,
    ) -> Result<Option<ProviderMessage>, GatewayError> {
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn create_reply_draft(
        &self,
        _account: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Result<Draft, GatewayError> {
        if self.fail_drafts.load(Ordering::SeqCst) {
            return Err(transient("mail"));
        }
        let mut drafts = self.drafts.lock().unwrap();
        drafts.push((in_reply_to.to_string(), body.to_string()));
        Ok(Draft {
            id: format!("draft-{}", drafts.len()),
        })
    }

    async fn send_draft(&self, _account: &str, draft_id: &str) -> Result<(), GatewayError> {
        self.sent_drafts.lock().unwrap().push(draft_id.to_string());
        Ok(())
    }

    async fn send_reply(
        &self,
        _account: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Result<(), GatewayError> {
        self.sent
            .lock()
            .unwrap()
            .push((in_reply_to.to_string(), body.to_string()));
        Ok(())
    }

    async fn mark_read(&self, _account: &str, id: &str) -> Result<(), GatewayError> {
        self.marked_read.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn create_subscription(
        &self,
        _account: &str,
        _notification_url: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Subscription, GatewayError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(transient("mail"));
        }
        let subscription = Subscription {
            id: format!("sub-{}", Uuid::new_v4()),
            expires_at,
            client_state: Uuid::new_v4().to_string(),
        };
        self.subscriptions.lock().unwrap().push(subscription.clone());
        Ok(subscription)
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, GatewayError> {
        if self.renew_not_found.load(Ordering::SeqCst) {
            return Err(GatewayError::NotFound {
                service: "mail".into(),
                what: format!("subscription {subscription_id}"),
            });
        }
        self.renewals
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(expires_at)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), GatewayError> {
        self.deleted
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Classifier returning a configurable result.
pub struct MockClassifier {
    pub result: Mutex<ClassificationResult>,
    pub reply: Mutex<String>,
    pub replies: Mutex<Vec<ReplyContext>>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub fail_replies: AtomicBool,
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self {
            result: Mutex::new(classification(Classification::TechnicalSupport, false)),
            reply: Mutex::new("Generated reply".to_string()),
            replies: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            fail_replies: AtomicBool::new(false),
        }
    }
}

impl MockClassifier {
    pub fn set(&self, result: ClassificationResult) {
        *self.result.lock().unwrap() = result;
    }
}

#[async_trait]
impl ClassificationGateway for MockClassifier {
    async fn classify(
        &self,
        _subject: &str,
        _body: &str,
        _tenant_context: Option<&str>,
    ) -> Result<ClassificationResult, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(transient("classifier"));
        }
        Ok(self.result.lock().unwrap().clone())
    }

    async fn generate_reply(&self, context: &ReplyContext) -> Result<String, GatewayError> {
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(transient("classifier"));
        }
        self.replies.lock().unwrap().push(context.clone());
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn extract_entities(&self, _subject: &str, _body: &str) -> Result<Entities, GatewayError> {
        let mut entities = Entities::new();
        entities.insert("source".into(), serde_json::Value::from("mock"));
        Ok(entities)
    }
}

// ── Notifications ───────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub escalations: Mutex<Vec<EscalationEvent>>,
    pub alerts: Mutex<Vec<OperationalAlert>>,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn escalation(&self, event: &EscalationEvent) -> Result<(), GatewayError> {
        self.escalations.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn operational_alert(&self, alert: &OperationalAlert) -> Result<(), GatewayError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn classification(classification: Classification, requires_review: bool) -> ClassificationResult {
    ClassificationResult {
        classification,
        confidence: 80,
        priority: Priority::Normal,
        requires_review,
        reasoning: None,
    }
}

pub fn provider_message(
    id: &str,
    conversation: &str,
    subject: &str,
    received_at: DateTime<Utc>,
) -> ProviderMessage {
    ProviderMessage {
        id: id.to_string(),
        conversation_id: Some(conversation.to_string()),
        internet_message_id: Some(format!("<{id}@example.com>")),
        subject: subject.to_string(),
        body_preview: String::new(),
        body: format!("Body of {subject}"),
        body_is_html: false,
        from_address: "customer@example.com".to_string(),
        from_name: Some("Casey Customer".to_string()),
        to_addresses: vec!["support@example.com".to_string()],
        received_at,
        importance: None,
        has_attachments: false,
    }
}

/// In-memory store plus recording gateways.
pub struct Harness {
    pub store: Arc<dyn Database>,
    pub mail: Arc<MockMailGateway>,
    pub classifier: Arc<MockClassifier>,
    pub notifier: Arc<RecordingNotifier>,
    pub config: PipelineConfig,
}

impl Harness {
    pub async fn new() -> Self {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self {
            store,
            mail: Arc::new(MockMailGateway::default()),
            classifier: Arc::new(MockClassifier::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            config: PipelineConfig::default(),
        }
    }

    pub fn deps(&self) -> PipelineDeps {
        PipelineDeps::new(
            Arc::clone(&self.store),
            self.mail.clone(),
            self.classifier.clone(),
            self.notifier.clone(),
            self.config.clone(),
        )
    }

    /// Store a mailbox after letting the test tweak it.
    pub async fn mailbox(&self, tweak: impl FnOnce(&mut Mailbox)) -> Mailbox {
        let mut mailbox = Mailbox::new(
            format!("support-{}@example.com", Uuid::new_v4().simple()),
            "support@example.com",
        );
        tweak(&mut mailbox);
        self.store.upsert_mailbox(&mailbox).await.unwrap();
        mailbox
    }
}
