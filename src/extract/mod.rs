//! Extraction engine — turns unstructured email text into shipment fields
//! with a declared confidence.
//!
//! Two passes: a cheap regex pass over well-known formats (container
//! numbers, B/L, ports, shipping lines), then an LLM pass when the regex
//! score is below the AI threshold. Failures are values, never faults —
//! the orchestrator always gets an `ExtractionOutcome` back.

pub mod engine;
pub mod patterns;

pub use engine::FieldExtractor;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pipeline::types::ParsedEmail;

/// How the fields were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionMethod {
    Regex,
    Ai,
    /// Regex fields merged under an AI result.
    Merged,
}

/// Structured shipment fields pulled out of an email.
///
/// Every business field is optional — a field absent from the text is
/// omitted, never guessed. Free text is mixed Romanian/English; field
/// values are kept verbatim apart from case normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill_of_lading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vessel_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voyage_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_of_loading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_of_discharge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargo_ready_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cargo_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier_email: Option<String>,
    /// Self-declared certainty, 0-100.
    pub confidence: u8,
    pub method: ExtractionMethod,
}

impl Default for ExtractionMethod {
    fn default() -> Self {
        Self::Regex
    }
}

/// Typed extraction failure. Carried as data so operators can tell
/// "no signal" apart from "quota exhausted" or "misconfigured".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    #[error("extraction backend not configured")]
    NotConfigured,

    #[error("extraction backend unreachable: {reason}")]
    Backend { reason: String },

    #[error("extraction backend rate limited: {reason}")]
    RateLimited { reason: String },

    /// The backend answered, but not in the expected structured shape.
    /// The raw response is preserved for audit, never discarded.
    #[error("unparseable extraction response: {reason}")]
    Unparseable { reason: String, raw: String },

    #[error("extraction timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// What the engine hands back: fields or a typed failure.
///
/// Serialized only at the persistence edge (queue audit column) and in
/// API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Extracted(Extraction),
    Failed(ExtractionError),
}

impl ExtractionOutcome {
    /// Effective confidence: the declared score, or 0 on failure.
    pub fn confidence(&self) -> u8 {
        match self {
            Self::Extracted(extraction) => extraction.confidence,
            Self::Failed(_) => 0,
        }
    }

    /// Error message, if this outcome is a failure.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Extracted(_) => None,
            Self::Failed(error) => Some(error.to_string()),
        }
    }

    /// JSON snapshot for the audit column.
    pub fn to_audit_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({"outcome": "failed", "data": {"kind": "unserializable"}})
        })
    }
}

/// Extraction seam — implemented by `FieldExtractor` and by test stubs.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract shipment fields from one email. Infallible by contract:
    /// every failure mode is an `ExtractionOutcome::Failed` value.
    async fn extract(&self, email: &ParsedEmail) -> ExtractionOutcome;
}
