//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Primary orchestration, reconciliation and lifecycle management."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Run orchestration core: identity reconciliation between worker-reported and
//! canonical run identifiers, the event stream consumer, idempotent
//! persistence of worker events, and the pipeline stage lifecycle.

pub mod consumer;
pub mod error;
pub mod event;
pub mod identity;
pub mod lifecycle;
pub mod orchestrator;
pub mod reconcile;
pub mod resources;

#[cfg(test)]
mod test_support;

pub use consumer::{BatchReport, ConsumerHandle, ConsumerStats, StreamConsumer};
pub use error::{OrchestrationError, ResourceError, Result};
pub use event::{encode_event, EventKind, StageFailure, WorkerEvent};
pub use identity::{IdentityRegistry, Resolution, ResolutionOrigin};
pub use lifecycle::{LaunchOutcome, LifecycleManager, TeardownReport};
pub use orchestrator::{
    Components, ComponentHealth, HealthReport, Orchestrator, RecoveryReport, RunView, StageView,
    REPORTER_HINT_KEY,
};
pub use reconcile::{ApplyOutcome, ReconciliationService, RetryPolicy};
pub use resources::{DockerResourceManager, ResourceManager, Stage, StageHandle, StageSpec};
