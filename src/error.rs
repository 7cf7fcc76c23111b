//! Error types for inbox triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Enrichment error: {0}")]
    Enrichment(#[from] EnrichmentError),

    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),
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

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail transport errors (IMAP session, draft append, calendar feed).
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Authentication failed for {username}")]
    AuthFailed { username: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Calendar feed error: {0}")]
    Calendar(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Non-fatal context enrichment failures.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Contact lookup failed: {0}")]
    ContactLookup(String),

    #[error("Calendar fetch failed: {0}")]
    Calendar(String),

    #[error("Company research failed for {domain}: {reason}")]
    Research { domain: String, reason: String },
}

/// Triage pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Decision service failed: {0}")]
    Decision(String),

    #[error("Email {email_id} cannot move from {from} to {to}")]
    InvalidTransition {
        email_id: String,
        from: String,
        to: String,
    },

    #[error("No decision recorded for email {0}")]
    UnknownEmail(String),

    #[error("Mail fetch failed: {0}")]
    Fetch(#[from] MailError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
