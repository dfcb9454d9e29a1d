//! Shared types for the processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connector::EmailAttachment;
use crate::extract::ExtractionOutcome;
use crate::store::IncomingEmail;

/// Sender used when a manual submission omits one.
const MANUAL_SENDER: &str = "manual@intake.local";

/// Normalized input to extraction.
///
/// Built either from a queued `IncomingEmail` or from an ad-hoc manual
/// submission — manual submissions never touch the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEmail {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

impl ParsedEmail {
    /// Normalize a queued entry for processing.
    pub fn from_queued(email: &IncomingEmail) -> Self {
        Self {
            id: email.message_id.clone(),
            from: email.from_address.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            date: email.received_at,
            attachments: Vec::new(),
        }
    }

    /// Build a process-only manual submission.
    pub fn manual(
        from: Option<String>,
        subject: String,
        body: String,
        date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: format!("manual-{}", Uuid::new_v4()),
            from: from.unwrap_or_else(|| MANUAL_SENDER.to_string()),
            subject,
            body,
            date: date.unwrap_or_else(Utc::now),
            attachments: Vec::new(),
        }
    }
}

/// Outcome of processing one email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Success,
    NeedsReview,
    Failed,
}

/// What the caller gets back for every processing attempt — always a
/// value, never an unhandled fault, so batch summaries stay complete.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub extracted: ExtractionOutcome,
}

/// Aggregate counters for a backlog run.
///
/// `success + needs_review + failed == total`, and
/// `bookings_created <= success`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogSummary {
    pub total: u64,
    pub success: u64,
    pub needs_review: u64,
    pub failed: u64,
    pub bookings_created: u64,
}

impl BacklogSummary {
    /// Fold one result into the counters.
    pub fn record(&mut self, result: &ProcessingResult) {
        self.total += 1;
        match result.status {
            ProcessingStatus::Success => self.success += 1,
            ProcessingStatus::NeedsReview => self.needs_review += 1,
            ProcessingStatus::Failed => self.failed += 1,
        }
        if result.booking_id.is_some() {
            self.bookings_created += 1;
        }
    }
}

/// Result of a triggered fetch. Reports the provider-side count, not the
/// net-new queue growth — callers needing net-new diff the queue size.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FetchReport {
    pub fetched: usize,
}
