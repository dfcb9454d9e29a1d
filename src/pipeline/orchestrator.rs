//! Processing orchestrator — drives one message or the whole pending
//! backlog through extraction → confidence gate → materialization, and
//! finalizes queue state per item.
//!
//! Per-item failures never abort a run. A finalize write belongs to
//! exactly one item; the queue row is the only shared mutable state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::booking::Materializer;
use crate::config::{BacklogStrategy, PipelineConfig};
use crate::connector::MailboxConnector;
use crate::error::{ConnectorError, DatabaseError};
use crate::extract::Extractor;
use crate::pipeline::types::{
    BacklogSummary, FetchReport, ParsedEmail, ProcessingResult, ProcessingStatus,
};
use crate::store::{EmailStatus, FinalizeUpdate, IncomingEmail, IntakeStore};

/// The coordinating component of the pipeline.
pub struct Orchestrator {
    store: Arc<dyn IntakeStore>,
    extractor: Arc<dyn Extractor>,
    materializer: Arc<Materializer>,
    connector: Arc<dyn MailboxConnector>,
    config: PipelineConfig,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn IntakeStore>,
        extractor: Arc<dyn Extractor>,
        materializer: Arc<Materializer>,
        connector: Arc<dyn MailboxConnector>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            materializer,
            connector,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation flag for backlog runs. Setting it stops a run from
    /// pulling new items; in-flight items still finalize cleanly.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Process a single email: extract, gate, materialize.
    ///
    /// Touches no queue state — callers that processed a queued item are
    /// responsible for finalizing it.
    pub async fn process_one(
        &self,
        email: &ParsedEmail,
        auto_create: bool,
        min_confidence: u8,
    ) -> ProcessingResult {
        debug!(id = %email.id, auto_create, min_confidence, "Processing email");
        let outcome = self.extractor.extract(email).await;
        self.materializer
            .materialize(email, outcome, auto_create, min_confidence)
            .await
    }

    /// Process every pending queue item and finalize each one as soon as
    /// its own outcome is known. Result order is receipt order under both
    /// strategies.
    pub async fn process_backlog(
        &self,
        auto_create: bool,
        min_confidence: u8,
    ) -> Result<(BacklogSummary, Vec<ProcessingResult>), DatabaseError> {
        let pending = self.store.list_pending().await?;
        let total = pending.len();
        if total == 0 {
            return Ok((BacklogSummary::default(), Vec::new()));
        }

        info!(total, strategy = ?self.config.strategy, "Processing backlog");

        let results: Vec<ProcessingResult> = match self.config.strategy {
            BacklogStrategy::Sequential => {
                let mut results = Vec::with_capacity(total);
                for email in pending {
                    if self.cancel.load(Ordering::Relaxed) {
                        info!("Backlog run cancelled — leaving remaining items pending");
                        break;
                    }
                    results.push(self.process_and_finalize(email, auto_create, min_confidence).await);
                }
                results
            }
            BacklogStrategy::Bounded { workers } => {
                futures::stream::iter(pending)
                    .map(|email| async move {
                        if self.cancel.load(Ordering::Relaxed) {
                            return None;
                        }
                        Some(
                            self.process_and_finalize(email, auto_create, min_confidence)
                                .await,
                        )
                    })
                    .buffered(workers.max(1))
                    .filter_map(|result| async move { result })
                    .collect()
                    .await
            }
        };

        let mut summary = BacklogSummary::default();
        for result in &results {
            summary.record(result);
        }

        info!(
            total = summary.total,
            success = summary.success,
            needs_review = summary.needs_review,
            failed = summary.failed,
            bookings = summary.bookings_created,
            "Backlog run complete"
        );
        Ok((summary, results))
    }

    /// Process one queued item and immediately write its terminal state.
    async fn process_and_finalize(
        &self,
        email: IncomingEmail,
        auto_create: bool,
        min_confidence: u8,
    ) -> ProcessingResult {
        let parsed = ParsedEmail::from_queued(&email);
        let result = self.process_one(&parsed, auto_create, min_confidence).await;

        let update = finalize_update_for(&result);
        if let Err(e) = self.store.finalize(&email.id, &update).await {
            // The outcome still counts toward the summary; the row just
            // keeps its previous state for a later operator look.
            warn!(id = %email.id, error = %e, "Failed to finalize queue entry");
        }

        result
    }

    /// Fetch unread messages and stage them, skipping duplicates silently.
    ///
    /// Reports the count fetched from the provider, not the net-new count —
    /// the fetch contract stays provider-centric.
    pub async fn fetch_and_queue(&self, max_results: u32) -> Result<FetchReport, ConnectorError> {
        let messages = self.connector.fetch_unread(max_results).await?;
        let fetched = messages.len();

        let mut queued = 0usize;
        for message in &messages {
            if self.store.enqueue(message).await?.is_queued() {
                queued += 1;
            }
            // Best effort — an unread flag left behind only means the
            // message is re-listed (and deduplicated) next fetch.
            if let Err(e) = self.connector.mark_processed(&message.message_id).await {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to mark message processed at provider"
                );
            }
        }

        info!(fetched, queued, skipped = fetched - queued, "Fetch complete");
        Ok(FetchReport { fetched })
    }
}

/// Map a processing result onto the queue's single atomic mutation.
fn finalize_update_for(result: &ProcessingResult) -> FinalizeUpdate {
    let status = match result.status {
        ProcessingStatus::Success => EmailStatus::Processed,
        ProcessingStatus::NeedsReview => EmailStatus::NeedsReview,
        ProcessingStatus::Failed => EmailStatus::Failed,
    };

    let mut extracted_data = result.extracted.to_audit_json();
    if let Some(ref error) = result.error {
        extracted_data["processingError"] = serde_json::Value::String(error.clone());
    }

    FinalizeUpdate {
        status,
        booking_id: result.booking_id.clone(),
        confidence: Some(result.extracted.confidence()),
        extracted_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingDraft, BookingService};
    use crate::connector::{ConnectionStatus, RawMessage};
    use crate::error::BookingError;
    use crate::extract::{
        Extraction, ExtractionError, ExtractionMethod, ExtractionOutcome,
    };
    use crate::store::{EnqueueOutcome, LibSqlBackend};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    // ── Stubs ───────────────────────────────────────────────────────

    /// Extractor scripted by email body markers.
    ///
    /// - body containing "conf=NN" → extraction with that confidence and
    ///   a container number
    /// - body containing "garbage" → unparseable failure
    struct ScriptedExtractor;

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, email: &ParsedEmail) -> ExtractionOutcome {
            if email.body.contains("garbage") {
                return ExtractionOutcome::Failed(ExtractionError::Unparseable {
                    reason: "not JSON".to_string(),
                    raw: "<<<raw model output>>>".to_string(),
                });
            }
            let confidence = email
                .body
                .split("conf=")
                .nth(1)
                .and_then(|s| s[..2.min(s.len())].parse().ok())
                .unwrap_or(0);
            ExtractionOutcome::Extracted(Extraction {
                container_number: Some("MSCU1234567".to_string()),
                eta: chrono::NaiveDate::from_ymd_opt(2025, 12, 3),
                confidence,
                method: ExtractionMethod::Ai,
                ..Default::default()
            })
        }
    }

    struct StubBookings {
        created: AtomicUsize,
    }

    impl StubBookings {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BookingService for StubBookings {
        async fn create_booking(&self, _draft: &BookingDraft) -> Result<String, BookingError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("bk-{n}"))
        }
    }

    /// Connector yielding a fixed batch; records mark_processed calls.
    struct StubConnector {
        messages: Vec<RawMessage>,
        marked: Mutex<Vec<String>>,
    }

    impl StubConnector {
        fn with_messages(messages: Vec<RawMessage>) -> Arc<Self> {
            Arc::new(Self {
                messages,
                marked: Mutex::new(Vec::new()),
            })
        }

        fn empty() -> Arc<Self> {
            Self::with_messages(Vec::new())
        }
    }

    #[async_trait]
    impl MailboxConnector for StubConnector {
        fn name(&self) -> &str {
            "stub"
        }
        fn is_configured(&self) -> bool {
            true
        }
        fn auth_url(&self) -> Result<String, ConnectorError> {
            Ok("https://example.com/auth".to_string())
        }
        async fn exchange_code(&self, _code: &str) -> Result<(), ConnectorError> {
            Ok(())
        }
        async fn status(&self) -> Result<ConnectionStatus, ConnectorError> {
            Ok(ConnectionStatus {
                connected: true,
                email: None,
                token_expiry: None,
                last_fetch: None,
            })
        }
        async fn fetch_unread(&self, max_results: u32) -> Result<Vec<RawMessage>, ConnectorError> {
            Ok(self
                .messages
                .iter()
                .take(max_results as usize)
                .cloned()
                .collect())
        }
        async fn mark_processed(&self, message_id: &str) -> Result<(), ConnectorError> {
            self.marked.lock().unwrap().push(message_id.to_string());
            Ok(())
        }
    }

    fn raw(message_id: &str, body: &str) -> RawMessage {
        RawMessage {
            message_id: message_id.to_string(),
            from: "liwei@agent.cn".to_string(),
            subject: "Shipment Update".to_string(),
            body: body.to_string(),
            received_at: Utc::now(),
            attachments: Vec::new(),
        }
    }

    async fn build_orchestrator(
        connector: Arc<StubConnector>,
        strategy: BacklogStrategy,
    ) -> (Orchestrator, Arc<LibSqlBackend>, Arc<StubBookings>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let bookings = StubBookings::new();
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(ScriptedExtractor),
            Arc::new(Materializer::new(bookings.clone())),
            connector,
            PipelineConfig {
                strategy,
                ..Default::default()
            },
        );
        (orchestrator, store, bookings)
    }

    async fn seed_backlog(store: &Arc<LibSqlBackend>) {
        // Receipt order: high-confidence, garbage, low-confidence
        let mut first = raw("q-1", "conf=85");
        first.received_at = Utc::now() - chrono::Duration::minutes(30);
        let mut second = raw("q-2", "garbage");
        second.received_at = Utc::now() - chrono::Duration::minutes(20);
        let mut third = raw("q-3", "conf=55");
        third.received_at = Utc::now() - chrono::Duration::minutes(10);
        for message in [first, second, third] {
            assert!(store.enqueue(&message).await.unwrap().is_queued());
        }
    }

    // ── process_one ─────────────────────────────────────────────────

    #[tokio::test]
    async fn process_one_success_creates_booking() {
        let (orchestrator, _store, _bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;

        let parsed = ParsedEmail::manual(
            None,
            "Shipment Update".to_string(),
            "Container MSCU1234567 ... ETA 2025-12-03 conf=85".to_string(),
            None,
        );
        let result = orchestrator.process_one(&parsed, true, 80).await;

        assert_eq!(result.status, ProcessingStatus::Success);
        assert!(result.booking_id.is_some());
    }

    #[tokio::test]
    async fn process_one_does_not_touch_the_queue() {
        let (orchestrator, store, _bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;

        let parsed = ParsedEmail::manual(None, "S".to_string(), "conf=90".to_string(), None);
        orchestrator.process_one(&parsed, true, 80).await;

        assert_eq!(store.processing_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn malformed_extraction_reports_failed_without_panicking() {
        let (orchestrator, _store, bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;

        let parsed = ParsedEmail::manual(None, "S".to_string(), "garbage".to_string(), None);
        let result = orchestrator.process_one(&parsed, true, 80).await;

        assert_eq!(result.status, ProcessingStatus::Failed);
        assert_eq!(result.extracted.confidence(), 0);
        assert!(result.error.is_some());
        assert_eq!(bookings.created.load(Ordering::SeqCst), 0);
    }

    // ── process_backlog ─────────────────────────────────────────────

    #[tokio::test]
    async fn backlog_summary_reconciles_and_finalizes_rows() {
        let (orchestrator, store, _bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;
        seed_backlog(&store).await;

        let (summary, results) = orchestrator.process_backlog(true, 80).await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.needs_review, 1);
        assert_eq!(
            summary.success + summary.needs_review + summary.failed,
            summary.total
        );
        assert!(summary.bookings_created <= summary.success);
        assert_eq!(results.len(), 3);

        // Queue is drained and rows carry terminal states
        assert!(store.list_pending().await.unwrap().is_empty());

        let success = store.get_email_by_message_id("q-1").await.unwrap().unwrap();
        assert_eq!(success.status, EmailStatus::Processed);
        assert!(success.booking_id.is_some());
        assert_eq!(success.confidence, Some(85));

        let failed = store.get_email_by_message_id("q-2").await.unwrap().unwrap();
        assert_eq!(failed.status, EmailStatus::Failed);
        assert!(failed.booking_id.is_none());
        // Raw model output preserved for audit
        let audit = failed.extracted_data.unwrap();
        assert_eq!(audit["data"]["raw"], "<<<raw model output>>>");
        assert!(audit["processingError"].is_string());

        let review = store.get_email_by_message_id("q-3").await.unwrap().unwrap();
        assert_eq!(review.status, EmailStatus::NeedsReview);
        assert!(review.booking_id.is_none());
    }

    #[tokio::test]
    async fn backlog_preserves_receipt_order_and_isolates_failures() {
        let (orchestrator, store, _bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;
        seed_backlog(&store).await;

        let (_, results) = orchestrator.process_backlog(true, 80).await.unwrap();

        // The garbage item in the middle didn't block or reorder its siblings
        let statuses: Vec<ProcessingStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ProcessingStatus::Success,
                ProcessingStatus::Failed,
                ProcessingStatus::NeedsReview,
            ]
        );
    }

    #[tokio::test]
    async fn bounded_strategy_produces_the_same_outcome() {
        let (orchestrator, store, _bookings) = build_orchestrator(
            StubConnector::empty(),
            BacklogStrategy::Bounded { workers: 3 },
        )
        .await;
        seed_backlog(&store).await;

        let (summary, results) = orchestrator.process_backlog(true, 80).await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.needs_review, 1);
        // Order still receipt order
        let statuses: Vec<ProcessingStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ProcessingStatus::Success,
                ProcessingStatus::Failed,
                ProcessingStatus::NeedsReview,
            ]
        );
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backlog_without_auto_create_creates_no_bookings() {
        let (orchestrator, store, bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;
        seed_backlog(&store).await;

        let (summary, _) = orchestrator.process_backlog(false, 80).await.unwrap();

        assert_eq!(summary.bookings_created, 0);
        assert_eq!(bookings.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_run_pulls_no_items() {
        let (orchestrator, store, _bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;
        seed_backlog(&store).await;

        orchestrator.cancel_flag().store(true, Ordering::Relaxed);
        let (summary, results) = orchestrator.process_backlog(true, 80).await.unwrap();

        assert_eq!(summary.total, 0);
        assert!(results.is_empty());
        // Nothing was mutated — all items still pending
        assert_eq!(store.list_pending().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_backlog_is_an_empty_summary() {
        let (orchestrator, _store, _bookings) =
            build_orchestrator(StubConnector::empty(), BacklogStrategy::Sequential).await;
        let (summary, results) = orchestrator.process_backlog(true, 80).await.unwrap();
        assert_eq!(summary, BacklogSummary::default());
        assert!(results.is_empty());
    }

    // ── fetch_and_queue ─────────────────────────────────────────────

    #[tokio::test]
    async fn fetch_skips_duplicates_but_reports_provider_count() {
        let connector = StubConnector::with_messages(vec![
            raw("gm-1", "conf=85"),
            raw("gm-2", "conf=40"),
            raw("gm-3", "conf=90"),
        ]);
        let (orchestrator, store, _bookings) =
            build_orchestrator(connector.clone(), BacklogStrategy::Sequential).await;

        // gm-2 was already staged by an earlier fetch
        assert!(matches!(
            store.enqueue(&raw("gm-2", "conf=40")).await.unwrap(),
            EnqueueOutcome::Queued(_)
        ));

        let report = orchestrator.fetch_and_queue(10).await.unwrap();

        // Provider-centric count: 3 fetched even though only 2 are new
        assert_eq!(report.fetched, 3);
        assert_eq!(store.list_pending().await.unwrap().len(), 3);

        // Every fetched message was marked processed at the provider
        assert_eq!(connector.marked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fetch_respects_max_results() {
        let connector = StubConnector::with_messages(vec![
            raw("gm-1", "a"),
            raw("gm-2", "b"),
            raw("gm-3", "c"),
        ]);
        let (orchestrator, store, _bookings) =
            build_orchestrator(connector, BacklogStrategy::Sequential).await;

        let report = orchestrator.fetch_and_queue(2).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(store.list_pending().await.unwrap().len(), 2);
    }
}
