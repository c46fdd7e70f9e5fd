//! Microsoft Graph mail gateway.
//!
//! App-only (client credentials) access to user mailboxes:
//! - `GET  /users/{account}/mailFolders/inbox/messages`: incremental listing
//! - `POST /users/{account}/messages/{id}/createReply`: reply drafts
//! - `POST /users/{account}/messages/{id}/send|reply`: sending
//! - `POST|PATCH|DELETE /subscriptions`: change notifications

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ConfigError, GatewayError};
use crate::gateways::mail::{Draft, MailGateway, ProviderMessage};
use crate::mailboxes::model::Subscription;

const SERVICE: &str = "graph";
const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Refresh the token this long before the provider says it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Credentials and endpoints for the Graph API.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub graph_base: String,
    pub login_base: String,
    pub request_timeout: Duration,
}

impl GraphConfig {
    /// Load from environment variables. Returns `None` when Graph is not
    /// configured at all.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(tenant_id) = std::env::var("GRAPH_TENANT_ID").ok() else {
            return Ok(None);
        };
        let client_id = std::env::var("GRAPH_CLIENT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("GRAPH_CLIENT_ID".into()))?;
        let client_secret = std::env::var("GRAPH_CLIENT_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("GRAPH_CLIENT_SECRET".into()))?;

        Ok(Some(Self {
            tenant_id,
            client_id,
            client_secret: SecretString::from(client_secret),
            graph_base: std::env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GRAPH_BASE.to_string()),
            login_base: std::env::var("GRAPH_LOGIN_URL")
                .unwrap_or_else(|_| DEFAULT_LOGIN_BASE.to_string()),
            request_timeout: Duration::from_secs(
                std::env::var("INBOX_OPS_GATEWAY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }))
    }
}

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

/// `MailGateway` over Microsoft Graph.
pub struct GraphMailGateway {
    config: GraphConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl GraphMailGateway {
    pub fn new(config: GraphConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Transient {
                service: SERVICE.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.graph_base.trim_end_matches('/'))
    }

    /// Get a bearer token, fetching a new one when the cached one is stale.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Utc::now()
        {
            return Ok(token.value.expose_secret().to_string());
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.login_base.trim_end_matches('/'),
            self.config.tenant_id
        );
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(e, self.config.request_timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Token endpoint answers 400 for bad credentials.
            let rejected = matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED);
            return Err(if rejected {
                GatewayError::Auth {
                    service: SERVICE.into(),
                    reason: format!("token request rejected ({status}): {body}"),
                }
            } else {
                map_status(status, &body)
            });
        }

        let token: TokenResponse = resp.json().await.map_err(decode_error)?;
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: SecretString::from(token.access_token),
            expires_at: Utc::now()
                + chrono::Duration::seconds(token.expires_in - TOKEN_REFRESH_MARGIN_SECS),
        });
        debug!("Graph access token refreshed");
        Ok(value)
    }

    /// Send an authenticated request and map non-success statuses.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        let token = self.access_token().await?;
        let mut req = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(e, self.config.request_timeout))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }
}

#[async_trait]
impl MailGateway for GraphMailGateway {
    async fn list_messages(
        &self,
        account: &str,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<Vec<ProviderMessage>, GatewayError> {
        let token = self.access_token().await?;
        let url = self.url(&format!("/users/{account}/mailFolders/inbox/messages"));
        let filter = format!(
            "receivedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("$top", top.to_string()),
                ("$orderby", "receivedDateTime asc".to_string()),
                ("$filter", filter),
            ])
            .send()
            .await
            .map_err(|e| transport_error(e, self.config.request_timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let page: GraphList<GraphMessage> = resp.json().await.map_err(decode_error)?;
        debug!(account, count = page.value.len(), "Listed Graph messages");
        page.value.into_iter().map(ProviderMessage::try_from).collect()
    }

    async fn get_message(
        &self,
        account: &str,
        id: &str,
    ) -> Result<Option<ProviderMessage>, GatewayError> {
        let url = self.url(&format!("/users/{account}/messages/{id}"));
        match self.request(Method::GET, &url, None).await {
            Ok(resp) => {
                let msg: GraphMessage = resp.json().await.map_err(decode_error)?;
                Ok(Some(ProviderMessage::try_from(msg)?))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_reply_draft(
        &self,
        account: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Result<Draft, GatewayError> {
        let url = self.url(&format!("/users/{account}/messages/{in_reply_to}/createReply"));
        let payload = json!({
            "message": { "body": { "contentType": "html", "content": body } }
        });
        let resp = self.request(Method::POST, &url, Some(payload)).await?;
        let draft: GraphId = resp.json().await.map_err(decode_error)?;
        Ok(Draft { id: draft.id })
    }

    async fn send_draft(&self, account: &str, draft_id: &str) -> Result<(), GatewayError> {
        let url = self.url(&format!("/users/{account}/messages/{draft_id}/send"));
        self.request(Method::POST, &url, None).await?;
        Ok(())
    }

    async fn send_reply(
        &self,
        account: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Result<(), GatewayError> {
        let url = self.url(&format!("/users/{account}/messages/{in_reply_to}/reply"));
        let payload = json!({
            "message": { "body": { "contentType": "html", "content": body } }
        });
        self.request(Method::POST, &url, Some(payload)).await?;
        Ok(())
    }

    async fn mark_read(&self, account: &str, id: &str) -> Result<(), GatewayError> {
        let url = self.url(&format!("/users/{account}/messages/{id}"));
        self.request(Method::PATCH, &url, Some(json!({ "isRead": true })))
            .await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        account: &str,
        notification_url: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Subscription, GatewayError> {
        let client_state = Uuid::new_v4().to_string();
        let payload = json!({
            "changeType": "created",
            "notificationUrl": notification_url,
            "resource": format!("/users/{account}/mailFolders/inbox/messages"),
            "expirationDateTime": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "clientState": client_state,
        });
        let resp = self
            .request(Method::POST, &self.url("/subscriptions"), Some(payload))
            .await?;
        let sub: GraphSubscription = resp.json().await.map_err(decode_error)?;
        info!(account, subscription = %sub.id, expires = %sub.expiration_date_time, "Graph subscription created");
        Ok(Subscription {
            id: sub.id,
            expires_at: sub.expiration_date_time,
            client_state: sub.client_state.unwrap_or(client_state),
        })
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, GatewayError> {
        let url = self.url(&format!("/subscriptions/{subscription_id}"));
        let payload = json!({
            "expirationDateTime": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let resp = self.request(Method::PATCH, &url, Some(payload)).await?;
        let sub: GraphSubscription = resp.json().await.map_err(decode_error)?;
        Ok(sub.expiration_date_time)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), GatewayError> {
        let url = self.url(&format!("/subscriptions/{subscription_id}"));
        match self.request(Method::DELETE, &url, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
struct GraphId {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSubscription {
    id: String,
    expiration_date_time: DateTime<Utc>,
    #[serde(default)]
    client_state: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body_preview: Option<String>,
    #[serde(default)]
    body: Option<GraphBody>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    internet_message_id: Option<String>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    importance: Option<String>,
    #[serde(default)]
    has_attachments: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl TryFrom<GraphMessage> for ProviderMessage {
    type Error = GatewayError;

    fn try_from(msg: GraphMessage) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| GatewayError::InvalidResponse {
            service: SERVICE.into(),
            reason: format!("message {}: {reason}", msg.id),
        };
        let received_at = msg
            .received_date_time
            .ok_or_else(|| invalid("missing receivedDateTime"))?;
        let from = msg
            .from
            .as_ref()
            .and_then(|f| f.email_address.address.clone())
            .ok_or_else(|| invalid("missing sender address"))?;
        let from_name = msg.from.as_ref().and_then(|f| f.email_address.name.clone());
        let (body, body_is_html) = match msg.body {
            Some(b) => (
                b.content.unwrap_or_default(),
                b.content_type
                    .is_some_and(|t| t.eq_ignore_ascii_case("html")),
            ),
            None => (String::new(), false),
        };

        Ok(ProviderMessage {
            id: msg.id,
            conversation_id: msg.conversation_id,
            internet_message_id: msg.internet_message_id,
            subject: msg.subject.unwrap_or_default(),
            body_preview: msg.body_preview.unwrap_or_default(),
            body,
            body_is_html,
            from_address: from,
            from_name,
            to_addresses: msg
                .to_recipients
                .into_iter()
                .filter_map(|r| r.email_address.address)
                .collect(),
            received_at,
            importance: msg.importance,
            has_attachments: msg.has_attachments,
        })
    }
}

// ── Error mapping ───────────────────────────────────────────────────

fn map_status(status: StatusCode, body: &str) -> GatewayError {
    let reason = format!("{status}: {}", truncate(body, 300));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth {
            service: SERVICE.into(),
            reason,
        },
        StatusCode::NOT_FOUND => GatewayError::NotFound {
            service: SERVICE.into(),
            what: reason,
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => GatewayError::Transient {
            service: SERVICE.into(),
            reason,
        },
        s if s.is_server_error() => GatewayError::Transient {
            service: SERVICE.into(),
            reason,
        },
        _ => GatewayError::InvalidResponse {
            service: SERVICE.into(),
            reason,
        },
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout {
            service: SERVICE.into(),
            after: timeout,
        }
    } else {
        GatewayError::Transient {
            service: SERVICE.into(),
            reason: e.to_string(),
        }
    }
}

fn decode_error(e: reqwest::Error) -> GatewayError {
    GatewayError::InvalidResponse {
        service: SERVICE.into(),
        reason: format!("undecodable body: {e}"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
