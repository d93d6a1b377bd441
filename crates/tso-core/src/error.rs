//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Error taxonomy for orchestration and resource management."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;
use tso_common::RunStatus;
use tso_persistence::PersistenceError;
use tso_stream::{EntryId, StreamError};

use crate::resources::Stage;

/// Result alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Failures reported by a [`ResourceManager`](crate::resources::ResourceManager).
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{what} did not finish within {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("container {name} stopped while starting: {state}")]
    Exited { name: String, state: String },
    #[error("resource manager unreachable: {0}")]
    Unreachable(String),
    #[error("resource manager rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("run configuration invalid, missing or empty: {}", fields.join(", "))]
    ConfigInvalid { fields: Vec<String> },
    #[error("run {run_id}: stage {stage} failed to start: {source}")]
    StageStartFailed {
        run_id: String,
        stage: Stage,
        #[source]
        source: ResourceError,
    },
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("storage inconsistency for run {run_id}: {detail}")]
    StorageInconsistency { run_id: String, detail: String },
    #[error("event stream unavailable: {0}")]
    StreamUnavailable(String),
    #[error("malformed stream entry {entry_id}: {reason}")]
    MalformedEvent { entry_id: EntryId, reason: String },
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("{active} runs active, limit is {limit}")]
    CapacityExceeded { active: usize, limit: usize },
    #[error("storage call did not complete: {0}")]
    StorageTask(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Stream(StreamError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl From<StreamError> for OrchestrationError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Unavailable(reason) => OrchestrationError::StreamUnavailable(reason),
            other => OrchestrationError::Stream(other),
        }
    }
}

impl OrchestrationError {
    /// Whether retrying after a short delay may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestrationError::StreamUnavailable(_) => true,
            OrchestrationError::Persistence(err) => err.is_transient(),
            OrchestrationError::Stream(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::ConfigInvalid { .. } => "config_invalid",
            OrchestrationError::StageStartFailed { .. } => "stage_start_failed",
            OrchestrationError::RunNotFound(_) => "run_not_found",
            OrchestrationError::StorageInconsistency { .. } => "storage_inconsistency",
            OrchestrationError::StreamUnavailable(_) => "stream_unavailable",
            OrchestrationError::MalformedEvent { .. } => "malformed_event",
            OrchestrationError::InvalidTransition { .. } => "invalid_transition",
            OrchestrationError::CapacityExceeded { .. } => "capacity_exceeded",
            OrchestrationError::StorageTask(_) => "storage_task",
            OrchestrationError::Persistence(_) => "persistence",
            OrchestrationError::Stream(_) => "stream",
            OrchestrationError::Resource(_) => "resource",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_outage_maps_to_transient_variant() {
        let err: OrchestrationError = StreamError::Unavailable("offline".into()).into();
        assert!(matches!(err, OrchestrationError::StreamUnavailable(_)));
        assert!(err.is_transient());
        assert_eq!(err.kind(), "stream_unavailable");
    }

    #[test]
    fn config_errors_list_fields() {
        let err = OrchestrationError::ConfigInvalid {
            fields: vec!["algorithm".into(), "duration_seconds".into()],
        };
        assert!(err.to_string().contains("algorithm, duration_seconds"));
        assert!(!err.is_transient());
    }
}
