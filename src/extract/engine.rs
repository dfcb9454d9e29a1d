//! Two-pass field extractor: regex first, LLM when the regex score is
//! below the AI threshold, results merged in favor of the stronger pass.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::extract::patterns::extract_with_patterns;
use crate::extract::{
    Extraction, ExtractionError, ExtractionMethod, ExtractionOutcome, Extractor,
};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::ParsedEmail;

/// Regex score at or above this skips the LLM call.
const DEFAULT_AI_THRESHOLD: u8 = 80;

/// Confidence assigned when the backend returns a parseable structure but
/// omits the score — partial structured output is still useful signal.
const DEFAULT_AI_CONFIDENCE: u8 = 75;

/// Max tokens for the extraction call (a single JSON object).
const EXTRACT_MAX_TOKENS: u32 = 1024;

/// Temperature for extraction (deterministic-ish).
const EXTRACT_TEMPERATURE: f32 = 0.1;

/// Body characters sent to the LLM.
const BODY_PREVIEW_CHARS: usize = 3000;

/// The production `Extractor`: regex pass plus optional LLM pass.
pub struct FieldExtractor {
    llm: Option<Arc<dyn LlmProvider>>,
    ai_threshold: u8,
}

impl FieldExtractor {
    /// Create an extractor. Without an LLM provider the regex pass runs
    /// alone and low-signal emails surface as extraction failures.
    pub fn new(llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            llm,
            ai_threshold: DEFAULT_AI_THRESHOLD,
        }
    }

    pub fn with_ai_threshold(mut self, threshold: u8) -> Self {
        self.ai_threshold = threshold.min(100);
        self
    }

    /// Run the LLM pass.
    async fn llm_pass(&self, email: &ParsedEmail) -> Result<Extraction, ExtractionError> {
        let Some(ref llm) = self.llm else {
            return Err(ExtractionError::NotConfigured);
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_extraction_system_prompt()),
            ChatMessage::user(build_extraction_user_prompt(email)),
        ])
        .with_temperature(EXTRACT_TEMPERATURE)
        .with_max_tokens(EXTRACT_MAX_TOKENS);

        let response = llm.complete(request).await.map_err(map_llm_error)?;

        parse_extraction_response(&response.content)
    }
}

#[async_trait]
impl Extractor for FieldExtractor {
    async fn extract(&self, email: &ParsedEmail) -> ExtractionOutcome {
        let regex_pass = extract_with_patterns(&email.subject, &email.body);

        if regex_pass.confidence >= self.ai_threshold {
            debug!(
                id = %email.id,
                confidence = regex_pass.confidence,
                "Regex pass sufficient — skipping LLM"
            );
            return ExtractionOutcome::Extracted(regex_pass);
        }

        match self.llm_pass(email).await {
            Ok(ai_pass) => {
                let merged = merge_passes(regex_pass, ai_pass);
                debug!(
                    id = %email.id,
                    confidence = merged.confidence,
                    method = ?merged.method,
                    "Extraction complete"
                );
                ExtractionOutcome::Extracted(merged)
            }
            Err(error) if regex_pass.confidence > 0 => {
                // The regex pass found real signal — a broken LLM backend
                // must not turn a partially-readable email into a failure.
                warn!(id = %email.id, error = %error, "LLM pass failed, keeping regex result");
                ExtractionOutcome::Extracted(regex_pass)
            }
            Err(error) => {
                warn!(id = %email.id, error = %error, "Extraction failed");
                ExtractionOutcome::Failed(error)
            }
        }
    }
}

/// Map transport-level LLM errors onto the extraction taxonomy.
fn map_llm_error(error: LlmError) -> ExtractionError {
    match error {
        LlmError::RateLimited {
            provider,
            retry_after,
        } => ExtractionError::RateLimited {
            reason: match retry_after {
                Some(after) => format!("{provider} quota exhausted, retry after {after:?}"),
                None => format!("{provider} quota exhausted"),
            },
        },
        LlmError::Timeout { provider, after } => {
            debug!(provider = %provider, "extraction call timed out");
            ExtractionError::Timeout {
                seconds: after.as_secs().max(1),
            }
        }
        LlmError::AuthFailed { provider } => ExtractionError::Backend {
            reason: format!("authentication failed for {provider}"),
        },
        LlmError::RequestFailed { provider, reason } => ExtractionError::Backend {
            reason: format!("{provider}: {reason}"),
        },
        LlmError::InvalidResponse { provider, reason } => ExtractionError::Backend {
            reason: format!("{provider} returned an invalid response: {reason}"),
        },
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_extraction_system_prompt() -> String {
    "You are a logistics email parser for a freight forwarder. Emails are \
     free text, often mixing Romanian and English.\n\n\
     Extract shipping fields and respond with ONLY a JSON object — no \
     explanations, no markdown. Use null for any field not present in the \
     text; never guess.\n\n\
     {\"containerNumber\": null, \"billOfLading\": null, \"shippingLine\": null, \
     \"vesselName\": null, \"voyageNumber\": null, \"portOfLoading\": null, \
     \"portOfDischarge\": null, \"departureDate\": null, \"eta\": null, \
     \"cargoReadyDate\": null, \"containerType\": null, \"cargoDescription\": null, \
     \"weight\": null, \"supplierName\": null, \"supplierPhone\": null, \
     \"supplierEmail\": null, \"confidence\": 0}\n\n\
     Rules:\n\
     - containerNumber: 4 letters + 7 digits (e.g. TEMU1234567)\n\
     - shippingLine: canonical carrier name (MSC, Maersk, Hapag-Lloyd, Cosco, \
     CMA CGM, Evergreen, OOCL, Yangming, ZIM, ONE)\n\
     - dates in ISO format (YYYY-MM-DD)\n\
     - containerType: 20ft, 40ft or 40ft_HC\n\
     - confidence: 0-100, your certainty in the extracted fields as a whole"
        .to_string()
}

fn build_extraction_user_prompt(email: &ParsedEmail) -> String {
    let body_preview: String = email.body.chars().take(BODY_PREVIEW_CHARS).collect();
    format!(
        "From: {}\nSubject: {}\nDate: {}\nBody:\n{}",
        email.from,
        email.subject,
        email.date.to_rfc3339(),
        body_preview,
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Raw LLM extraction response shape. Every field tolerates null/absent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmExtractionResponse {
    #[serde(default)]
    container_number: Option<String>,
    #[serde(default)]
    bill_of_lading: Option<String>,
    #[serde(default)]
    shipping_line: Option<String>,
    #[serde(default)]
    vessel_name: Option<String>,
    #[serde(default)]
    voyage_number: Option<String>,
    #[serde(default)]
    port_of_loading: Option<String>,
    #[serde(default)]
    port_of_discharge: Option<String>,
    #[serde(default)]
    departure_date: Option<String>,
    #[serde(default)]
    eta: Option<String>,
    #[serde(default)]
    cargo_ready_date: Option<String>,
    #[serde(default)]
    container_type: Option<String>,
    #[serde(default)]
    cargo_description: Option<String>,
    #[serde(default)]
    weight: Option<String>,
    #[serde(default)]
    supplier_name: Option<String>,
    #[serde(default)]
    supplier_phone: Option<String>,
    #[serde(default)]
    supplier_email: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse the LLM response into an `Extraction`.
///
/// Tolerates markdown fences around the JSON. An unparseable response is
/// an `Unparseable` error carrying the raw text for audit.
fn parse_extraction_response(raw: &str) -> Result<Extraction, ExtractionError> {
    let json_str = extract_json_object(raw);
    let response: LlmExtractionResponse =
        serde_json::from_str(&json_str).map_err(|e| ExtractionError::Unparseable {
            reason: format!("JSON parse error: {e}"),
            raw: raw.to_string(),
        })?;

    let confidence = match response.confidence {
        Some(c) => c.clamp(0.0, 100.0).round() as u8,
        None => DEFAULT_AI_CONFIDENCE,
    };

    Ok(Extraction {
        container_number: non_empty(response.container_number),
        bill_of_lading: non_empty(response.bill_of_lading),
        shipping_line: non_empty(response.shipping_line),
        vessel_name: non_empty(response.vessel_name),
        voyage_number: non_empty(response.voyage_number),
        port_of_loading: non_empty(response.port_of_loading),
        port_of_discharge: non_empty(response.port_of_discharge),
        departure_date: parse_date(response.departure_date),
        eta: parse_date(response.eta),
        cargo_ready_date: parse_date(response.cargo_ready_date),
        container_type: non_empty(response.container_type),
        cargo_description: non_empty(response.cargo_description),
        weight: non_empty(response.weight),
        supplier_name: non_empty(response.supplier_name),
        supplier_phone: non_empty(response.supplier_phone),
        supplier_email: non_empty(response.supplier_email),
        confidence,
        method: ExtractionMethod::Ai,
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

/// Lenient ISO date parse — a malformed date drops the field, it does not
/// fail the extraction.
fn parse_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

// ── Pass merging ────────────────────────────────────────────────────

/// Merge the two passes: prefer the higher-confidence pass, but keep
/// regex fields the LLM returned nothing for.
fn merge_passes(regex_pass: Extraction, ai_pass: Extraction) -> Extraction {
    if ai_pass.confidence <= regex_pass.confidence {
        return regex_pass;
    }

    let regex_contributed = [
        regex_pass.container_number.is_some() && ai_pass.container_number.is_none(),
        regex_pass.bill_of_lading.is_some() && ai_pass.bill_of_lading.is_none(),
        regex_pass.shipping_line.is_some() && ai_pass.shipping_line.is_none(),
        regex_pass.vessel_name.is_some() && ai_pass.vessel_name.is_none(),
        regex_pass.voyage_number.is_some() && ai_pass.voyage_number.is_none(),
        regex_pass.port_of_loading.is_some() && ai_pass.port_of_loading.is_none(),
        regex_pass.port_of_discharge.is_some() && ai_pass.port_of_discharge.is_none(),
        regex_pass.departure_date.is_some() && ai_pass.departure_date.is_none(),
        regex_pass.eta.is_some() && ai_pass.eta.is_none(),
        regex_pass.container_type.is_some() && ai_pass.container_type.is_none(),
        regex_pass.weight.is_some() && ai_pass.weight.is_none(),
        regex_pass.supplier_email.is_some() && ai_pass.supplier_email.is_none(),
        regex_pass.supplier_phone.is_some() && ai_pass.supplier_phone.is_none(),
    ]
    .into_iter()
    .any(|contributed| contributed);

    Extraction {
        container_number: ai_pass.container_number.or(regex_pass.container_number),
        bill_of_lading: ai_pass.bill_of_lading.or(regex_pass.bill_of_lading),
        shipping_line: ai_pass.shipping_line.or(regex_pass.shipping_line),
        vessel_name: ai_pass.vessel_name.or(regex_pass.vessel_name),
        voyage_number: ai_pass.voyage_number.or(regex_pass.voyage_number),
        port_of_loading: ai_pass.port_of_loading.or(regex_pass.port_of_loading),
        port_of_discharge: ai_pass.port_of_discharge.or(regex_pass.port_of_discharge),
        departure_date: ai_pass.departure_date.or(regex_pass.departure_date),
        eta: ai_pass.eta.or(regex_pass.eta),
        cargo_ready_date: ai_pass.cargo_ready_date.or(regex_pass.cargo_ready_date),
        container_type: ai_pass.container_type.or(regex_pass.container_type),
        cargo_description: ai_pass.cargo_description.or(regex_pass.cargo_description),
        weight: ai_pass.weight.or(regex_pass.weight),
        supplier_name: ai_pass.supplier_name.or(regex_pass.supplier_name),
        supplier_phone: ai_pass.supplier_phone.or(regex_pass.supplier_phone),
        supplier_email: ai_pass.supplier_email.or(regex_pass.supplier_email),
        confidence: ai_pass.confidence,
        method: if regex_contributed {
            ExtractionMethod::Merged
        } else {
            ExtractionMethod::Ai
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, LlmProvider};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stub provider returning a canned response or error.
    struct StubLlm {
        response: Result<String, LlmError>,
        calls: AtomicUsize,
    }

    impl StubLlm {
        fn ok(content: &str) -> Self {
            Self {
                response: Ok(content.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn err(error: LlmError) -> Self {
            Self {
                response: Err(error),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                }),
                Err(e) => Err(clone_llm_error(e)),
            }
        }
    }

    fn clone_llm_error(e: &LlmError) -> LlmError {
        match e {
            LlmError::RateLimited {
                provider,
                retry_after,
            } => LlmError::RateLimited {
                provider: provider.clone(),
                retry_after: *retry_after,
            },
            LlmError::Timeout { provider, after } => LlmError::Timeout {
                provider: provider.clone(),
                after: *after,
            },
            LlmError::AuthFailed { provider } => LlmError::AuthFailed {
                provider: provider.clone(),
            },
            LlmError::RequestFailed { provider, reason } => LlmError::RequestFailed {
                provider: provider.clone(),
                reason: reason.clone(),
            },
            LlmError::InvalidResponse { provider, reason } => LlmError::InvalidResponse {
                provider: provider.clone(),
                reason: reason.clone(),
            },
        }
    }

    fn email(subject: &str, body: &str) -> ParsedEmail {
        ParsedEmail {
            id: "test-1".to_string(),
            from: "liwei@agent.cn".to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            date: Utc::now(),
            attachments: Vec::new(),
        }
    }

    // ── Response parsing ────────────────────────────────────────────

    #[test]
    fn parses_plain_json_response() {
        let extraction = parse_extraction_response(
            r#"{"containerNumber": "MSCU1234567", "eta": "2025-12-03", "confidence": 85}"#,
        )
        .unwrap();
        assert_eq!(extraction.container_number.as_deref(), Some("MSCU1234567"));
        assert_eq!(extraction.eta, NaiveDate::from_ymd_opt(2025, 12, 3));
        assert_eq!(extraction.confidence, 85);
        assert_eq!(extraction.method, ExtractionMethod::Ai);
    }

    #[test]
    fn parses_markdown_wrapped_response() {
        let raw = "Here you go:\n```json\n{\"shippingLine\": \"MSC\", \"confidence\": 60}\n```";
        let extraction = parse_extraction_response(raw).unwrap();
        assert_eq!(extraction.shipping_line.as_deref(), Some("MSC"));
        assert_eq!(extraction.confidence, 60);
    }

    #[test]
    fn missing_confidence_defaults_conservatively() {
        let extraction =
            parse_extraction_response(r#"{"containerNumber": "TEMU7654321"}"#).unwrap();
        assert_eq!(extraction.confidence, DEFAULT_AI_CONFIDENCE);
    }

    #[test]
    fn null_and_empty_fields_are_omitted() {
        let extraction = parse_extraction_response(
            r#"{"containerNumber": null, "vesselName": "  ", "confidence": 40}"#,
        )
        .unwrap();
        assert!(extraction.container_number.is_none());
        assert!(extraction.vessel_name.is_none());
    }

    #[test]
    fn malformed_date_drops_the_field_only() {
        let extraction = parse_extraction_response(
            r#"{"eta": "first week of December", "confidence": 50}"#,
        )
        .unwrap();
        assert!(extraction.eta.is_none());
        assert_eq!(extraction.confidence, 50);
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let extraction = parse_extraction_response(r#"{"confidence": 250}"#).unwrap();
        assert_eq!(extraction.confidence, 100);
    }

    #[test]
    fn unparseable_response_preserves_raw_text() {
        let raw = "I'm sorry, I cannot parse this email.";
        let error = parse_extraction_response(raw).unwrap_err();
        match error {
            ExtractionError::Unparseable { raw: kept, .. } => assert_eq!(kept, raw),
            other => panic!("expected Unparseable, got {other:?}"),
        }
    }

    // ── Merging ─────────────────────────────────────────────────────

    #[test]
    fn merge_keeps_regex_fields_the_llm_missed() {
        let regex_pass = Extraction {
            container_number: Some("MSCU1234567".to_string()),
            supplier_phone: Some("+8613912345678".to_string()),
            confidence: 22,
            method: ExtractionMethod::Regex,
            ..Default::default()
        };
        let ai_pass = Extraction {
            port_of_loading: Some("Ningbo".to_string()),
            eta: NaiveDate::from_ymd_opt(2025, 12, 3),
            confidence: 85,
            method: ExtractionMethod::Ai,
            ..Default::default()
        };

        let merged = merge_passes(regex_pass, ai_pass);
        assert_eq!(merged.container_number.as_deref(), Some("MSCU1234567"));
        assert_eq!(merged.port_of_loading.as_deref(), Some("Ningbo"));
        assert_eq!(merged.confidence, 85);
        assert_eq!(merged.method, ExtractionMethod::Merged);
    }

    #[test]
    fn merge_prefers_ai_values_on_conflict() {
        let regex_pass = Extraction {
            shipping_line: Some("MSC".to_string()),
            confidence: 10,
            ..Default::default()
        };
        let ai_pass = Extraction {
            shipping_line: Some("Maersk".to_string()),
            confidence: 70,
            method: ExtractionMethod::Ai,
            ..Default::default()
        };
        let merged = merge_passes(regex_pass, ai_pass);
        assert_eq!(merged.shipping_line.as_deref(), Some("Maersk"));
        assert_eq!(merged.method, ExtractionMethod::Ai);
    }

    #[test]
    fn merge_keeps_regex_result_when_ai_is_weaker() {
        let regex_pass = Extraction {
            container_number: Some("MSCU1234567".to_string()),
            confidence: 50,
            ..Default::default()
        };
        let ai_pass = Extraction {
            confidence: 30,
            method: ExtractionMethod::Ai,
            ..Default::default()
        };
        let merged = merge_passes(regex_pass.clone(), ai_pass);
        assert_eq!(merged, regex_pass);
    }

    // ── Engine behavior ─────────────────────────────────────────────

    #[tokio::test]
    async fn strong_regex_pass_skips_the_llm() {
        let stub = Arc::new(StubLlm::ok(r#"{"confidence": 99}"#));
        let extractor = FieldExtractor::new(Some(stub.clone()));

        let body = "TEMU1234567, B/L MEDUEN98765432 via Cosco.\n\
                    Loading Ningbo, discharge Constanta. 40 HC.\n\
                    ETD 2025-11-20, ETA 2025-12-18.";
        let outcome = extractor.extract(&email("Booking", body)).await;

        let ExtractionOutcome::Extracted(extraction) = outcome else {
            panic!("expected Extracted");
        };
        assert_eq!(extraction.method, ExtractionMethod::Regex);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn weak_regex_pass_invokes_llm_and_merges() {
        let stub = Arc::new(StubLlm::ok(
            r#"{"portOfLoading": "Shanghai", "eta": "2025-12-03", "confidence": 85}"#,
        ));
        let extractor = FieldExtractor::new(Some(stub.clone()));

        let outcome = extractor
            .extract(&email("Update", "Container MSCU1234567, vezi detaliile atașate"))
            .await;

        let ExtractionOutcome::Extracted(extraction) = outcome else {
            panic!("expected Extracted");
        };
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert_eq!(extraction.confidence, 85);
        // LLM field
        assert_eq!(extraction.port_of_loading.as_deref(), Some("Shanghai"));
        // Regex field the LLM returned null for
        assert_eq!(extraction.container_number.as_deref(), Some("MSCU1234567"));
        assert_eq!(extraction.method, ExtractionMethod::Merged);
    }

    #[tokio::test]
    async fn llm_failure_with_regex_signal_keeps_regex_result() {
        let stub = Arc::new(StubLlm::err(LlmError::RequestFailed {
            provider: "stub".to_string(),
            reason: "connection refused".to_string(),
        }));
        let extractor = FieldExtractor::new(Some(stub));

        let outcome = extractor
            .extract(&email("Update", "Container MSCU1234567 arriving soon"))
            .await;

        let ExtractionOutcome::Extracted(extraction) = outcome else {
            panic!("expected Extracted");
        };
        assert_eq!(extraction.method, ExtractionMethod::Regex);
        assert_eq!(extraction.container_number.as_deref(), Some("MSCU1234567"));
    }

    #[tokio::test]
    async fn llm_failure_without_signal_is_a_failure() {
        let stub = Arc::new(StubLlm::err(LlmError::RateLimited {
            provider: "stub".to_string(),
            retry_after: None,
        }));
        let extractor = FieldExtractor::new(Some(stub));

        let outcome = extractor
            .extract(&email("Hello", "Just checking in, no shipping info here"))
            .await;

        assert!(matches!(
            outcome,
            ExtractionOutcome::Failed(ExtractionError::RateLimited { .. })
        ));
        assert_eq!(outcome.confidence(), 0);
    }

    #[tokio::test]
    async fn unparseable_llm_response_without_signal_fails_with_raw() {
        let stub = Arc::new(StubLlm::ok("Sorry, no can do."));
        let extractor = FieldExtractor::new(Some(stub));

        let outcome = extractor.extract(&email("Hi", "nothing shippy here")).await;

        let ExtractionOutcome::Failed(ExtractionError::Unparseable { raw, .. }) = outcome else {
            panic!("expected Unparseable, got {outcome:?}");
        };
        assert_eq!(raw, "Sorry, no can do.");
    }

    #[tokio::test]
    async fn no_llm_configured_without_signal_reports_not_configured() {
        let extractor = FieldExtractor::new(None);
        let outcome = extractor.extract(&email("Hi", "see you tomorrow")).await;
        assert!(matches!(
            outcome,
            ExtractionOutcome::Failed(ExtractionError::NotConfigured)
        ));
    }

    #[test]
    fn user_prompt_truncates_long_bodies() {
        let long_body = "x".repeat(10_000);
        let parsed = email("S", &long_body);
        let prompt = build_extraction_user_prompt(&parsed);
        assert!(prompt.len() < 3600);
    }

    #[test]
    fn system_prompt_lists_the_contract() {
        let prompt = build_extraction_system_prompt();
        assert!(prompt.contains("containerNumber"));
        assert!(prompt.contains("confidence"));
        assert!(prompt.contains("null"));
    }
}
