//! ---
//! tso_section: "03-persistence-logging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Persistence abstractions and storage bindings."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Durable storage for the orchestrator: a relational store for run records,
//! identity aliases, stage handles, and results, plus a document store for
//! run configurations and algorithm-version metadata.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for SQLite failures.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Wrapper for IO errors encountered while reading/writing document files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a stored document fails integrity verification.
    #[error("document hash mismatch for {0}")]
    HashMismatch(String),
    /// Document keys must be plain file-name-safe identifiers.
    #[error("invalid document key: {0:?}")]
    InvalidKey(String),
    /// A stored value could not be mapped back to its domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl PersistenceError {
    /// Whether retrying the same operation shortly after may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PersistenceError::Sqlite(rusqlite::Error::SqliteFailure(inner, _)) => matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            PersistenceError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub mod document;
pub mod metrics;
pub mod relational;

pub use document::{AlgorithmVersionDocument, DocumentStore, RunConfigDocument};
pub use metrics::PersistenceMetrics;
pub use relational::{
    ClaimedRun, RunFilter, RunStore, RunUpdate, RunWriter, StageRow, TransitionOutcome,
    UpdateDisposition, UpdateReport,
};
