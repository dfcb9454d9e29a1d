//! Booking materializer — decides whether an extraction becomes a booking.
//!
//! The booking-creation capability itself belongs to the external domain
//! layer; this module owns only the confidence gate and the field mapping.

pub mod http_service;

pub use http_service::{BookingApiConfig, HttpBookingService, UnconfiguredBookingService};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::BookingError;
use crate::extract::{Extraction, ExtractionOutcome};
use crate::pipeline::types::{ParsedEmail, ProcessingResult, ProcessingStatus};

/// Fallback discharge port — the forwarder's home port.
const DEFAULT_DISCHARGE_PORT: &str = "Constanta";

/// Input to the external booking-creation capability.
///
/// Fields are optional where the email may not carry them; the domain
/// layer decides what it can accept and rejects the rest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDraft {
    /// Sender address, used by the domain layer to resolve the client.
    pub client_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill_of_lading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_of_loading: Option<String>,
    pub port_of_discharge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargo_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargo_weight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargo_ready_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_phone: Option<String>,
    pub supplier_email: String,
    /// Provenance note shown to the reviewing admin.
    pub notes: String,
}

/// External capability: persist a booking from a draft.
#[async_trait]
pub trait BookingService: Send + Sync {
    /// Create a booking, returning its id. Rejects invalid or incomplete
    /// drafts with a `BookingError`.
    async fn create_booking(&self, draft: &BookingDraft) -> Result<String, BookingError>;
}

/// Applies the confidence gate and invokes the booking capability.
pub struct Materializer {
    bookings: Arc<dyn BookingService>,
}

impl Materializer {
    pub fn new(bookings: Arc<dyn BookingService>) -> Self {
        Self { bookings }
    }

    /// Decide what to do with an extraction outcome.
    ///
    /// - `auto_create == false`: never create — echo the extraction back
    ///   (the preview/manual-parse flow).
    /// - extraction failed: `FAILED`.
    /// - confidence >= `min_confidence`: map fields, create a booking;
    ///   a domain-layer rejection is `FAILED`, not silently dropped.
    /// - otherwise: `NEEDS_REVIEW`, nothing created.
    pub async fn materialize(
        &self,
        email: &ParsedEmail,
        outcome: ExtractionOutcome,
        auto_create: bool,
        min_confidence: u8,
    ) -> ProcessingResult {
        if !auto_create {
            debug!(id = %email.id, "Auto-create disabled — echoing extraction");
            return ProcessingResult {
                status: ProcessingStatus::Success,
                booking_id: None,
                error: outcome.error_message(),
                extracted: outcome,
            };
        }

        let extraction = match outcome {
            ExtractionOutcome::Extracted(ref extraction) => extraction.clone(),
            ExtractionOutcome::Failed(ref error) => {
                return ProcessingResult {
                    status: ProcessingStatus::Failed,
                    booking_id: None,
                    error: Some(error.to_string()),
                    extracted: outcome,
                };
            }
        };

        if extraction.confidence < min_confidence {
            debug!(
                id = %email.id,
                confidence = extraction.confidence,
                min_confidence,
                "Below confidence gate — needs review"
            );
            return ProcessingResult {
                status: ProcessingStatus::NeedsReview,
                booking_id: None,
                error: None,
                extracted: outcome,
            };
        }

        let draft = build_draft(email, &extraction);
        match self.bookings.create_booking(&draft).await {
            Ok(booking_id) => {
                info!(
                    id = %email.id,
                    booking_id = %booking_id,
                    confidence = extraction.confidence,
                    "Booking created from email"
                );
                ProcessingResult {
                    status: ProcessingStatus::Success,
                    booking_id: Some(booking_id),
                    error: None,
                    extracted: outcome,
                }
            }
            Err(error) => {
                warn!(id = %email.id, error = %error, "Booking creation rejected");
                ProcessingResult {
                    status: ProcessingStatus::Failed,
                    booking_id: None,
                    error: Some(error.to_string()),
                    extracted: outcome,
                }
            }
        }
    }
}

/// Map extracted fields onto a booking draft.
fn build_draft(email: &ParsedEmail, extraction: &Extraction) -> BookingDraft {
    BookingDraft {
        client_email: email.from.clone(),
        container_number: extraction.container_number.clone(),
        bill_of_lading: extraction.bill_of_lading.clone(),
        shipping_line: extraction.shipping_line.clone(),
        port_of_loading: extraction.port_of_loading.clone(),
        port_of_discharge: extraction
            .port_of_discharge
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCHARGE_PORT.to_string()),
        container_type: extraction.container_type.clone(),
        cargo_description: extraction.cargo_description.clone(),
        cargo_weight: extraction.weight.clone(),
        cargo_ready_date: extraction.cargo_ready_date.or(extraction.departure_date),
        departure_date: extraction.departure_date,
        eta: extraction.eta,
        supplier_name: extraction.supplier_name.clone(),
        supplier_phone: extraction.supplier_phone.clone(),
        supplier_email: extraction
            .supplier_email
            .clone()
            .unwrap_or_else(|| email.from.clone()),
        notes: format!(
            "Auto-created from email: {}\n\nContainer: {}\nB/L: {}",
            email.subject,
            extraction.container_number.as_deref().unwrap_or("N/A"),
            extraction.bill_of_lading.as_deref().unwrap_or("N/A"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractionError, ExtractionMethod};
    use chrono::Utc;
    use std::sync::Mutex;

    /// In-memory booking service for tests.
    struct StubBookings {
        drafts: Mutex<Vec<BookingDraft>>,
        reject_with: Option<fn() -> BookingError>,
    }

    impl StubBookings {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                drafts: Mutex::new(Vec::new()),
                reject_with: None,
            })
        }

        fn rejecting(reason: fn() -> BookingError) -> Arc<Self> {
            Arc::new(Self {
                drafts: Mutex::new(Vec::new()),
                reject_with: Some(reason),
            })
        }

        fn created(&self) -> usize {
            self.drafts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BookingService for StubBookings {
        async fn create_booking(&self, draft: &BookingDraft) -> Result<String, BookingError> {
            if let Some(reject) = self.reject_with {
                return Err(reject());
            }
            let mut drafts = self.drafts.lock().unwrap();
            drafts.push(draft.clone());
            Ok(format!("bk-{}", drafts.len()))
        }
    }

    fn email() -> ParsedEmail {
        ParsedEmail {
            id: "m-1".to_string(),
            from: "liwei@agent.cn".to_string(),
            subject: "Shipment Update".to_string(),
            body: "Container MSCU1234567 ... ETA 2025-12-03".to_string(),
            date: Utc::now(),
            attachments: Vec::new(),
        }
    }

    fn extracted(confidence: u8) -> ExtractionOutcome {
        ExtractionOutcome::Extracted(Extraction {
            container_number: Some("MSCU1234567".to_string()),
            eta: NaiveDate::from_ymd_opt(2025, 12, 3),
            confidence,
            method: ExtractionMethod::Ai,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn confidence_below_gate_needs_review_and_creates_nothing() {
        let bookings = StubBookings::accepting();
        let materializer = Materializer::new(bookings.clone());

        let result = materializer
            .materialize(&email(), extracted(79), true, 80)
            .await;

        assert_eq!(result.status, ProcessingStatus::NeedsReview);
        assert!(result.booking_id.is_none());
        assert_eq!(bookings.created(), 0);
    }

    #[tokio::test]
    async fn confidence_at_gate_creates_booking() {
        let bookings = StubBookings::accepting();
        let materializer = Materializer::new(bookings.clone());

        let result = materializer
            .materialize(&email(), extracted(80), true, 80)
            .await;

        assert_eq!(result.status, ProcessingStatus::Success);
        assert_eq!(result.booking_id.as_deref(), Some("bk-1"));
        assert_eq!(bookings.created(), 1);
    }

    #[tokio::test]
    async fn auto_create_false_never_creates_regardless_of_confidence() {
        let bookings = StubBookings::accepting();
        let materializer = Materializer::new(bookings.clone());

        let result = materializer
            .materialize(&email(), extracted(100), false, 80)
            .await;

        assert_eq!(result.status, ProcessingStatus::Success);
        assert!(result.booking_id.is_none());
        assert_eq!(bookings.created(), 0);
    }

    #[tokio::test]
    async fn extraction_error_is_failed() {
        let bookings = StubBookings::accepting();
        let materializer = Materializer::new(bookings.clone());

        let outcome = ExtractionOutcome::Failed(ExtractionError::Unparseable {
            reason: "not JSON".to_string(),
            raw: "garbage".to_string(),
        });
        let result = materializer.materialize(&email(), outcome, true, 80).await;

        assert_eq!(result.status, ProcessingStatus::Failed);
        assert!(result.booking_id.is_none());
        assert!(result.error.as_deref().unwrap().contains("unparseable"));
        assert_eq!(bookings.created(), 0);
    }

    #[tokio::test]
    async fn domain_rejection_is_failed_with_error_preserved() {
        let bookings = StubBookings::rejecting(|| {
            BookingError::InvalidDraft("port of loading is required".to_string())
        });
        let materializer = Materializer::new(bookings);

        let result = materializer
            .materialize(&email(), extracted(95), true, 80)
            .await;

        assert_eq!(result.status, ProcessingStatus::Failed);
        assert!(result.booking_id.is_none());
        assert!(
            result
                .error
                .as_deref()
                .unwrap()
                .contains("port of loading is required")
        );
    }

    #[tokio::test]
    async fn draft_maps_fields_and_defaults() {
        let bookings = StubBookings::accepting();
        let materializer = Materializer::new(bookings.clone());

        let outcome = ExtractionOutcome::Extracted(Extraction {
            container_number: Some("TEMU7654321".to_string()),
            port_of_loading: Some("Ningbo".to_string()),
            departure_date: NaiveDate::from_ymd_opt(2025, 11, 20),
            confidence: 90,
            method: ExtractionMethod::Merged,
            ..Default::default()
        });
        materializer.materialize(&email(), outcome, true, 80).await;

        let drafts = bookings.drafts.lock().unwrap();
        let draft = &drafts[0];
        assert_eq!(draft.client_email, "liwei@agent.cn");
        assert_eq!(draft.port_of_loading.as_deref(), Some("Ningbo"));
        // No discharge port in the email — home port default
        assert_eq!(draft.port_of_discharge, DEFAULT_DISCHARGE_PORT);
        // Ready date falls back to the departure date
        assert_eq!(draft.cargo_ready_date, NaiveDate::from_ymd_opt(2025, 11, 20));
        // No supplier email extracted — sender address stands in
        assert_eq!(draft.supplier_email, "liwei@agent.cn");
        assert!(draft.notes.contains("Shipment Update"));
        assert!(draft.notes.contains("TEMU7654321"));
    }
}
