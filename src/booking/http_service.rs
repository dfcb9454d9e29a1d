//! Booking capability over HTTP — posts drafts to the domain layer's API.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::booking::{BookingDraft, BookingService};
use crate::error::BookingError;

/// Domain-layer API configuration.
#[derive(Debug, Clone)]
pub struct BookingApiConfig {
    pub base_url: String,
    pub api_token: Option<secrecy::SecretString>,
}

impl BookingApiConfig {
    /// Build config from environment variables.
    /// Returns `None` if `BOOKING_API_URL` is not set (capability disabled).
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("BOOKING_API_URL").ok()?;
        let api_token = std::env::var("BOOKING_API_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .map(secrecy::SecretString::from);
        Some(Self {
            base_url,
            api_token,
        })
    }
}

/// Creates bookings through the domain layer's REST API.
pub struct HttpBookingService {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<secrecy::SecretString>,
}

impl HttpBookingService {
    pub fn new(config: BookingApiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
        }
    }
}

#[async_trait]
impl BookingService for HttpBookingService {
    async fn create_booking(&self, draft: &BookingDraft) -> Result<String, BookingError> {
        let mut request = self
            .client
            .post(format!("{}/bookings", self.base_url))
            .json(draft);
        if let Some(ref token) = self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BookingError::CreateFailed(format!("booking API unreachable: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BookingError::ClientNotFound {
                address: draft.client_email.clone(),
            });
        }
        if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            let body = response.text().await.unwrap_or_default();
            return Err(BookingError::InvalidDraft(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BookingError::CreateFailed(format!("HTTP {status}: {body}")));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BookingError::CreateFailed(format!("invalid response body: {e}")))?;

        value["id"]
            .as_str()
            .or_else(|| value["bookingId"].as_str())
            .map(String::from)
            .ok_or_else(|| {
                BookingError::CreateFailed("no booking id in domain-layer response".to_string())
            })
    }
}

/// Stand-in used when no domain-layer API is configured: every creation
/// attempt fails with a distinct "not configured" signal, so extraction
/// still works and the gap is visible instead of silent.
pub struct UnconfiguredBookingService;

#[async_trait]
impl BookingService for UnconfiguredBookingService {
    async fn create_booking(&self, _draft: &BookingDraft) -> Result<String, BookingError> {
        Err(BookingError::CreateFailed(
            "booking capability not configured — set BOOKING_API_URL".to_string(),
        ))
    }
}
