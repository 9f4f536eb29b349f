//! Error types for the feed sync engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing feeds.
#[derive(Error, Debug)]
pub enum Error {
    /// One endpoint failed or timed out. Never fatal for a fan-out.
    #[error("endpoint {endpoint} unavailable: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },

    /// Every endpoint of a fan-out failed.
    #[error("all {attempted} endpoints failed")]
    AllEndpointsFailed { attempted: usize },

    /// A point lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Endpoint directory lookup failed.
    #[error("directory error: {0}")]
    Directory(String),

    /// SQLite error with context.
    #[error("database error: {0}")]
    Database(String),

    /// Raw SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The session was cancelled before the operation finished.
    #[error("cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Nostr SDK error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Core type error.
    #[error(transparent)]
    Core(#[from] yakbak_core::Error),
}
