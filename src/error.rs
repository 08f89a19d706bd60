//! Error types for the ingest core.
//!
//! `ParseFailure` is deliberately not part of [`IngestError`]: a malformed
//! sample is expected noise in a raw scan and never fails a batch.

use thiserror::Error;

// ---

/// Persistence layer failure.
#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

/// Failures surfaced by the ingest core to whichever front end called it.
#[derive(Debug, Error)]
pub enum IngestError {
    // ---
    /// The opening batch of a measurement held no convertible point.
    #[error("no valid points in opening batch")]
    NoValidPoints,

    /// Target missing, owned by someone else, or already frozen.
    #[error("measurement not found or already finalized")]
    MeasurementNotFound,

    #[error("unknown owner: {0}")]
    UnknownOwner(String),

    #[error("invalid owner identity")]
    InvalidOwner,

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl IngestError {
    /// Stable machine-readable code shared by every front end.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::NoValidPoints => "no_valid_points",
            IngestError::MeasurementNotFound => "measurement_not_found",
            IngestError::UnknownOwner(_) => "unknown_owner",
            IngestError::InvalidOwner => "invalid_owner",
            IngestError::Storage(_) => "storage_failure",
        }
    }
}

/// A single record that could not be read as a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    // ---
    pub record: String,
    pub reason: &'static str,
}
