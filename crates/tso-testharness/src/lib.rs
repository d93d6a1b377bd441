//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Test harness scaffolding and shared exports."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Scripted collaborators and fixtures used by the scenario tests.
//!
//! [`ScriptedResourceManager`] stands in for the container runtime and records
//! every call; [`Harness`] wires an [`tso_core::Orchestrator`] over an
//! in-memory stream and a throwaway on-disk store; [`EventBuilder`] produces
//! the field sets workers publish.

pub mod events;
pub mod fixtures;
pub mod resources;

pub use events::EventBuilder;
pub use fixtures::{run_request, test_config, Harness};
pub use resources::{ResourceCall, ScriptedResourceManager};
