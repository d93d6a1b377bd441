//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Shared primitives and utilities for the orchestration runtime."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Core shared primitives for the trading simulation orchestrator workspace.
//! This crate exposes configuration loading, logging, and the run domain
//! model consumed by the persistence, stream, and core crates.

pub mod config;
pub mod logging;
pub mod run;
pub mod time;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, OrchestrationConfig,
    StageImages, StorageConfig, StreamBackend, StreamConfig,
};
pub use logging::{init_cli_tracing, init_tracing, LogFormat};
pub use run::{
    default_algo_params, default_simulator_params, MetricValue, ParamMap, PositionRecord,
    RunConfig, RunMetrics, RunRecord, RunRequest, RunStatus,
    TradeRecord, TradeSide,
};
