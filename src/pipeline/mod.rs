//! Processing pipeline — orchestration of fetch, extraction, confidence
//! gating, materialization and queue finalization.

pub mod orchestrator;
pub mod types;

pub use orchestrator::Orchestrator;
pub use types::{
    BacklogSummary, FetchReport, ParsedEmail, ProcessingResult, ProcessingStatus,
};
