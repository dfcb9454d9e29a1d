//! Error types for the intake pipeline.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Booking error: {0}")]
    Booking(#[from] BookingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox connector errors.
///
/// These abort the fetch step only — already-queued items keep processing.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connector {name} is not configured: {hint}")]
    NotConfigured { name: String, hint: String },

    #[error("Connector {name} is not connected — authorize first")]
    NotConnected { name: String },

    #[error("Authorization failed for {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Token refresh failed for {name}: {reason}")]
    RefreshFailed { name: String, reason: String },

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Domain-layer booking creation errors.
///
/// Raised by the external booking capability when a mapped draft is
/// rejected (e.g. unresolvable client, missing origin port).
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Booking draft invalid: {0}")]
    InvalidDraft(String),

    #[error("No client could be resolved for {address}")]
    ClientNotFound { address: String },

    #[error("Booking creation failed: {0}")]
    CreateFailed(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
