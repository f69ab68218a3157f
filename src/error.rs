use thiserror::Error;

use crate::types::TeamId;

/// Top-level error for a single event's journey through the pipeline.
///
/// Identity-resolution failures never surface here: the processor logs and
/// swallows them so the event itself still records. Everything that does
/// surface fails the event and is the delivery layer's to retry or drop.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("invalid event uuid: {0}")]
    InvalidUuid(String),

    #[error("no team found for id {0}")]
    UnknownTeam(TeamId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Errors from the relational state layer (persons, distinct ids, teams,
/// definitions).
///
/// `RaceCondition` and `ForeignKeyViolation` are expected under concurrent
/// workers and drive the retry protocols; the rest are transient or fatal
/// and propagate.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A peer worker won a unique-constraint race (SQLSTATE 23505).
    #[error("race condition: {0}")]
    RaceCondition(String),

    /// A row still references the entity being deleted (SQLSTATE 23503).
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("person not found")]
    NotFound,

    #[error("merge attempts exhausted after {0} tries")]
    MergeAttemptsExhausted(u32),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Producer(#[from] ProducerError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            match db_err.code().as_deref() {
                Some("23505") => return StoreError::RaceCondition(db_err.to_string()),
                Some("23503") => return StoreError::ForeignKeyViolation(db_err.to_string()),
                _ => {}
            }
        }
        StoreError::Database(err.to_string())
    }
}

/// Errors from the event sinks (log or row).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Produce(#[from] ProducerError),

    #[error("wire format error: {0}")]
    Wire(String),

    #[error("row sink error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        SinkError::Database(err.to_string())
    }
}

/// Errors from the log producer seam.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    #[error("failed to produce: {0}")]
    Produce(String),

    #[error("produce timed out")]
    Canceled,
}

/// Errors raised by the user-supplied transformation code.
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("plugin timed out after {0}ms")]
    Timeout(u64),

    #[error("plugin failed: {0}")]
    Failed(String),
}

/// Errors surfaced by the worker pool to task submitters.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker crashed while running the task")]
    WorkerCrashed,

    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Ingestion(#[from] IngestionError),
}
