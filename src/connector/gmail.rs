//! Gmail connector — OAuth2 code flow plus the Gmail REST v1 API.
//!
//! Tokens live in the store's `connector_config` table so a restart does
//! not force re-authorization. Fetch lists unread primary-category
//! messages, then pulls each one with `format=full` and walks the MIME
//! tree for a text body.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connector::{ConnectionStatus, EmailAttachment, MailboxConnector, RawMessage};
use crate::error::ConnectorError;
use crate::store::IntakeStore;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.modify",
];

/// Config keys in `connector_config`.
const TOKENS_KEY: &str = "gmail_tokens";
const LAST_FETCH_KEY: &str = "gmail_last_fetch";

// ── Configuration ───────────────────────────────────────────────────

/// Gmail OAuth client configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: secrecy::SecretString,
    pub redirect_uri: String,
}

impl GmailConfig {
    /// Build config from environment variables.
    ///
    /// - `GMAIL_CLIENT_ID`, `GMAIL_CLIENT_SECRET` — both required for the
    ///   connector to count as configured
    /// - `GMAIL_REDIRECT_URI` (default points at the callback route)
    pub fn from_env() -> Self {
        let client_id = std::env::var("GMAIL_CLIENT_ID").unwrap_or_default();
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET").unwrap_or_default();
        let redirect_uri = std::env::var("GMAIL_REDIRECT_URI")
            .unwrap_or_else(|_| "http://localhost:8080/api/admin/gmail/callback".to_string());

        Self {
            client_id,
            client_secret: secrecy::SecretString::from(client_secret),
            redirect_uri,
        }
    }
}

/// Persisted token material.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GmailTokens {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    email: Option<String>,
}

// ── API response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    internal_date: String,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    attachment_id: Option<String>,
}

// ── Connector ───────────────────────────────────────────────────────

/// Gmail mailbox connector.
pub struct GmailConnector {
    config: GmailConfig,
    store: Arc<dyn IntakeStore>,
    client: reqwest::Client,
}

impl GmailConnector {
    pub fn new(config: GmailConfig, store: Arc<dyn IntakeStore>) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
        }
    }

    async fn load_tokens(&self) -> Result<Option<GmailTokens>, ConnectorError> {
        let Some(raw) = self.store.get_config(TOKENS_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(e) => {
                warn!("Stored Gmail tokens are unreadable, treating as disconnected: {e}");
                Ok(None)
            }
        }
    }

    async fn save_tokens(&self, tokens: &GmailTokens) -> Result<(), ConnectorError> {
        let raw = serde_json::to_string(tokens).map_err(|e| ConnectorError::Http(e.to_string()))?;
        self.store.set_config(TOKENS_KEY, &raw).await?;
        Ok(())
    }

    /// Return a live access token, refreshing through the token endpoint
    /// when the stored one has expired.
    async fn valid_access_token(&self) -> Result<String, ConnectorError> {
        let tokens = self
            .load_tokens()
            .await?
            .ok_or_else(|| ConnectorError::NotConnected {
                name: "gmail".to_string(),
            })?;

        if tokens.expires_at > Utc::now() {
            return Ok(tokens.access_token);
        }

        let refresh_token =
            tokens
                .refresh_token
                .clone()
                .ok_or_else(|| ConnectorError::RefreshFailed {
                    name: "gmail".to_string(),
                    reason: "token expired and no refresh token stored".to_string(),
                })?;

        debug!("Gmail access token expired — refreshing");

        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::RefreshFailed {
                name: "gmail".to_string(),
                reason: body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| ConnectorError::RefreshFailed {
                name: "gmail".to_string(),
                reason: "no access_token in refresh response".to_string(),
            })?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);

        let refreshed = GmailTokens {
            access_token: access_token.clone(),
            refresh_token: Some(refresh_token),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in as i64),
            email: tokens.email,
        };
        self.save_tokens(&refreshed).await?;

        Ok(access_token)
    }

    /// Fetch the authenticated account's email address (best effort).
    async fn fetch_profile_email(&self, access_token: &str) -> Option<String> {
        let response = self
            .client
            .get(format!("{GMAIL_API}/profile"))
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        body["emailAddress"].as_str().map(String::from)
    }

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<RawMessage, ConnectorError> {
        let response = self
            .client
            .get(format!("{GMAIL_API}/messages/{message_id}"))
            .bearer_auth(access_token)
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let detail: MessageDetail = response
            .json()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        Ok(parse_gmail_message(detail))
    }
}

#[async_trait]
impl MailboxConnector for GmailConnector {
    fn name(&self) -> &str {
        "gmail"
    }

    fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.client_secret.expose_secret().is_empty()
    }

    fn auth_url(&self) -> Result<String, ConnectorError> {
        if !self.is_configured() {
            return Err(ConnectorError::NotConfigured {
                name: "gmail".to_string(),
                hint: "set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET".to_string(),
            });
        }

        let mut auth_url = url::Url::parse(AUTH_ENDPOINT)
            .map_err(|e| ConnectorError::Http(format!("bad auth endpoint: {e}")))?;
        auth_url
            .query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");

        Ok(auth_url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<(), ConnectorError> {
        if !self.is_configured() {
            return Err(ConnectorError::NotConfigured {
                name: "gmail".to_string(),
                hint: "set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET".to_string(),
            });
        }

        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::AuthFailed {
                name: "gmail".to_string(),
                reason: format!("token exchange failed: {body}"),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| ConnectorError::AuthFailed {
                name: "gmail".to_string(),
                reason: "no access_token in token response".to_string(),
            })?
            .to_string();
        let refresh_token = body["refresh_token"].as_str().map(String::from);
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);

        let email = self.fetch_profile_email(&access_token).await;

        self.save_tokens(&GmailTokens {
            access_token,
            refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in as i64),
            email: email.clone(),
        })
        .await?;

        info!(
            account = email.as_deref().unwrap_or("unknown"),
            "Gmail connected"
        );
        Ok(())
    }

    async fn status(&self) -> Result<ConnectionStatus, ConnectorError> {
        let Some(tokens) = self.load_tokens().await? else {
            return Ok(ConnectionStatus::disconnected());
        };

        let last_fetch = self
            .store
            .get_config(LAST_FETCH_KEY)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(ConnectionStatus {
            connected: true,
            email: tokens.email,
            token_expiry: Some(tokens.expires_at),
            last_fetch,
        })
    }

    async fn fetch_unread(&self, max_results: u32) -> Result<Vec<RawMessage>, ConnectorError> {
        let access_token = self.valid_access_token().await?;

        let response = self
            .client
            .get(format!("{GMAIL_API}/messages"))
            .bearer_auth(&access_token)
            .query(&[
                ("q", "is:unread category:primary"),
                ("maxResults", &max_results.to_string()),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::AuthFailed {
                name: "gmail".to_string(),
                reason: "access token rejected".to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let list: MessageListResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let mut messages = Vec::with_capacity(list.messages.len());
        for stub in &list.messages {
            match self.fetch_message(&access_token, &stub.id).await {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // One broken message must not sink the whole fetch.
                    debug!(id = %stub.id, "Skipping message: {e}");
                }
            }
        }

        info!(
            fetched = messages.len(),
            requested = max_results,
            "Fetched unread messages from Gmail"
        );
        Ok(messages)
    }

    async fn mark_processed(&self, message_id: &str) -> Result<(), ConnectorError> {
        let access_token = self.valid_access_token().await?;

        let response = self
            .client
            .post(format!("{GMAIL_API}/messages/{message_id}/modify"))
            .bearer_auth(&access_token)
            .json(&serde_json::json!({ "removeLabelIds": ["UNREAD"] }))
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        self.store
            .set_config(LAST_FETCH_KEY, &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }
}

// ── Message parsing ─────────────────────────────────────────────────

/// Convert a full Gmail message into a `RawMessage`.
fn parse_gmail_message(detail: MessageDetail) -> RawMessage {
    let payload = detail.payload.unwrap_or_default();

    let get_header = |name: &str| -> String {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let from = get_header("From");
    let subject = get_header("Subject");

    let body = extract_body_text(&payload, "text/plain")
        .or_else(|| extract_body_text(&payload, "text/html"))
        .unwrap_or_default();

    let received_at = detail
        .internal_date
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let mut attachments = Vec::new();
    collect_attachments(&payload, &mut attachments);

    RawMessage {
        message_id: detail.id,
        from,
        subject,
        body,
        received_at,
        attachments,
    }
}

/// Recursively walk MIME parts to find body data matching the target MIME type.
fn extract_body_text(payload: &MessagePayload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(ref body) = payload.body {
            if let Some(ref data) = body.data {
                return decode_url_safe_base64(data);
            }
        }
    }
    for part in &payload.parts {
        if let Some(text) = extract_body_text(part, target_mime) {
            return Some(text);
        }
    }
    None
}

/// Collect attachment metadata: parts carrying a filename and attachment id.
fn collect_attachments(payload: &MessagePayload, out: &mut Vec<EmailAttachment>) {
    for part in &payload.parts {
        if !part.filename.is_empty()
            && part
                .body
                .as_ref()
                .is_some_and(|b| b.attachment_id.is_some())
        {
            out.push(EmailAttachment {
                filename: part.filename.clone(),
                mime_type: part.mime_type.clone(),
                size: part.body.as_ref().map(|b| b.size).unwrap_or(0),
            });
        }
        collect_attachments(part, out);
    }
}

/// Decode URL-safe base64 (no padding) as used by the Gmail API.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data) {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        Err(_) => None,
    }
}
