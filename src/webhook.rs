//! HTTP surface: provider push notifications and a health check.
//!
//! Notifications are not processed inline. Each one becomes a durable
//! `ProcessMessage` job, so the provider gets a fast `202` and a crash
//! between receipt and processing loses nothing.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::scheduler::jobs::{JobKind, JobQueue};
use crate::store::Database;

#[derive(Clone)]
pub struct WebhookState {
    store: Arc<dyn Database>,
    jobs: JobQueue,
}

impl WebhookState {
    pub fn new(store: Arc<dyn Database>) -> Self {
        let jobs = JobQueue::new(Arc::clone(&store));
        Self { store, jobs }
    }
}

pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/mail", post(receive_notifications))
        .route("/health", get(health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-ops",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct ValidationQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationBatch {
    #[serde(default)]
    value: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    subscription_id: String,
    #[serde(default)]
    client_state: Option<String>,
    #[serde(default)]
    resource_data: Option<ResourceData>,
}

#[derive(Debug, Deserialize)]
struct ResourceData {
    id: String,
}

async fn receive_notifications(
    State(state): State<WebhookState>,
    Query(query): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    // Subscription handshake: echo the token back as plain text.
    if let Some(token) = query.validation_token {
        debug!("Subscription validation handshake");
        return (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], token).into_response();
    }

    let batch: NotificationBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            warn!(error = %e, "Undecodable notification payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid notification payload"})),
            )
                .into_response();
        }
    };

    let mut accepted = 0usize;
    for notification in &batch.value {
        match enqueue(&state, notification).await {
            Ok(true) => accepted += 1,
            Ok(false) => {}
            Err(e) => {
                // Let the provider redeliver.
                error!(subscription = %notification.subscription_id, error = %e, "Failed to queue notification");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "Failed to queue notification"})),
                )
                    .into_response();
            }
        }
    }

    info!(received = batch.value.len(), accepted, "Mail notifications queued");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": accepted})),
    )
        .into_response()
}

/// Queue one notification. Returns `false` when it was dropped.
async fn enqueue(state: &WebhookState, notification: &Notification) -> Result<bool, Error> {
    let Some(mailbox) = state
        .store
        .find_mailbox_by_subscription(&notification.subscription_id)
        .await?
    else {
        warn!(subscription = %notification.subscription_id, "Notification for unknown subscription dropped");
        return Ok(false);
    };
    if !mailbox.is_active {
        warn!(mailbox = %mailbox.id, "Notification for inactive mailbox dropped");
        return Ok(false);
    }

    let expected = mailbox.subscription.as_ref().map(|s| s.client_state.as_str());
    if expected.is_none() || notification.client_state.as_deref() != expected {
        warn!(mailbox = %mailbox.id, "Notification with mismatched client state dropped");
        return Ok(false);
    }

    let Some(resource) = &notification.resource_data else {
        warn!(mailbox = %mailbox.id, "Notification without resource data dropped");
        return Ok(false);
    };

    state
        .jobs
        .schedule_once(
            JobKind::ProcessMessage {
                mailbox_id: mailbox.id,
                message_id: resource.id.clone(),
            },
            Utc::now(),
        )
        .await?;
    Ok(true)
}
