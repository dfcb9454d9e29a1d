//! Persistence layer — libSQL-backed intake queue and connector config.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    EmailStatus, EnqueueOutcome, FinalizeUpdate, IncomingEmail, IntakeStore, ProcessingStats,
};
