//! `IntakeStore` trait — single async interface for the durable email queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connector::RawMessage;
use crate::error::DatabaseError;

/// Lifecycle status of a queued email.
///
/// `Pending` is the only non-terminal state. The pipeline never retries
/// `Failed` or `NeedsReview` automatically — re-processing goes through a
/// fresh manual submission, never back through the queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    /// Awaiting processing.
    Pending,
    /// Extraction finished; a booking may have been created.
    Processed,
    /// Extraction or booking creation failed.
    Failed,
    /// Extraction succeeded below the confidence gate — a human decides.
    NeedsReview,
}

/// A persisted queue entry.
///
/// `from_address`, `subject` and `body` are captured verbatim at fetch time
/// and never mutated; only the processing outcome fields change, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEmail {
    /// Row id, assigned at enqueue time.
    pub id: String,
    /// Provider-assigned message id — the de-duplication key.
    pub message_id: String,
    pub from_address: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub status: EmailStatus,
    /// Set exactly once, when the status leaves `Pending`.
    pub processed_at: Option<DateTime<Utc>>,
    /// Set iff status is `Processed` and a booking was created.
    pub booking_id: Option<String>,
    /// Confidence recorded at finalize, for stats.
    pub confidence: Option<u8>,
    /// Snapshot of the extraction outcome, written even on failure, for audit.
    pub extracted_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new queue row was created.
    Queued(IncomingEmail),
    /// A row with this `message_id` already exists — silently skipped.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// The single atomic mutation applied when an item's outcome is known.
#[derive(Debug, Clone)]
pub struct FinalizeUpdate {
    /// Terminal status. Must not be `Pending`.
    pub status: EmailStatus,
    /// Created booking id. Only valid with `Processed`.
    pub booking_id: Option<String>,
    /// Extraction confidence, recorded for stats.
    pub confidence: Option<u8>,
    /// Serialized extraction outcome, for audit.
    pub extracted_data: serde_json::Value,
}

/// Aggregate counters over the queue.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total: u64,
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
    pub needs_review: u64,
    pub bookings_created: u64,
    /// Mean recorded confidence over finalized rows, if any.
    pub average_confidence: Option<f64>,
}

/// Backend-agnostic store trait for the intake queue.
#[async_trait]
pub trait IntakeStore: Send + Sync {
    /// Stage a fetched message. Duplicate `message_id`s are a no-op signal,
    /// not an error — at most one row per physical message.
    async fn enqueue(&self, raw: &RawMessage) -> Result<EnqueueOutcome, DatabaseError>;

    /// Get a queue entry by row id.
    async fn get_email(&self, id: &str) -> Result<Option<IncomingEmail>, DatabaseError>;

    /// Get a queue entry by provider message id.
    async fn get_email_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<IncomingEmail>, DatabaseError>;

    /// All `Pending` entries, oldest first by receipt time.
    async fn list_pending(&self) -> Result<Vec<IncomingEmail>, DatabaseError>;

    /// Atomically record an item's outcome: status, processed_at,
    /// booking_id, confidence and extracted_data in one mutation.
    ///
    /// Only `Pending` rows can be finalized; anything else is a
    /// `Constraint` error and changes nothing.
    async fn finalize(&self, id: &str, update: &FinalizeUpdate) -> Result<(), DatabaseError>;

    /// Aggregate counters by status plus bookings created.
    async fn processing_stats(&self) -> Result<ProcessingStats, DatabaseError>;

    /// Read a connector config value (token material, fetch bookmarks).
    async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    /// Upsert a connector config value.
    async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}
