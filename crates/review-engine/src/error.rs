//! Engine error types.

use crate::models::{CardKey, ItemId};
use crate::queue::QueueError;
use thiserror::Error;

/// Errors that can occur in the review engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Schedule record missing for a card.
    #[error("No schedule record for {0}")]
    NotFound(CardKey),

    /// Item missing.
    #[error("No item {0}")]
    ItemNotFound(ItemId),

    /// Grade outside the known range.
    #[error("Invalid grade: {0}")]
    InvalidGrade(String),

    /// Unknown drill type.
    #[error("Invalid drill type: {0}")]
    InvalidDrill(String),

    /// Rejected queue transition.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Session actor is gone.
    #[error("Session closed")]
    SessionClosed,

    /// Store lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    Poisoned,

    /// Store work on the blocking pool panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
