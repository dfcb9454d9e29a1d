//! Mailbox connector — fetches raw inbound messages from a mail provider.
//!
//! The pipeline consumes this as a capability: authorize, report status,
//! fetch unread, mark processed. Provider internals (OAuth transport, REST
//! shapes) stay behind the trait; `GmailConnector` is the one real
//! implementation.

pub mod gmail;

pub use gmail::{GmailConfig, GmailConnector};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// A raw message as returned by the mail provider.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Provider-assigned message identifier. Stable across re-fetches —
    /// the queue's de-duplication key.
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<EmailAttachment>,
}

/// Attachment metadata (content itself is not fetched).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Connection state reported to the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetch: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            email: None,
            token_expiry: None,
            last_fetch: None,
        }
    }
}

/// Capability trait for the mailbox side of the pipeline.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connector name (e.g. "gmail"), for logging and error messages.
    fn name(&self) -> &str;

    /// Whether client credentials are present at all.
    fn is_configured(&self) -> bool;

    /// Authorization URL to send an admin to.
    fn auth_url(&self) -> Result<String, ConnectorError>;

    /// Exchange a provider auth code for tokens and persist them.
    async fn exchange_code(&self, code: &str) -> Result<(), ConnectorError>;

    /// Current connection status.
    async fn status(&self) -> Result<ConnectionStatus, ConnectorError>;

    /// Fetch up to `max_results` unread messages since the last fetch.
    async fn fetch_unread(&self, max_results: u32) -> Result<Vec<RawMessage>, ConnectorError>;

    /// Tell the provider a message has been staged (so it is not re-listed).
    async fn mark_processed(&self, message_id: &str) -> Result<(), ConnectorError>;
}
