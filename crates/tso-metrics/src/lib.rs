//! ---
//! tso_section: "03-persistence-logging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Metrics collection and export utilities."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Json, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Result of a readiness check served at `/healthz`.
#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    pub details: serde_json::Value,
}

/// Source of the `/healthz` payload.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + 'static {
    async fn readiness(&self) -> Readiness;
}

/// Probe that always reports ready; used when no backend checks are wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn readiness(&self) -> Readiness {
        Readiness {
            ready: true,
            details: serde_json::json!({}),
        }
    }
}

/// Spawn an HTTP server exposing `/metrics` and `/healthz`.
pub fn spawn_http_server(
    registry: SharedRegistry,
    addr: SocketAddr,
    probe: Arc<dyn ReadinessProbe>,
) -> Result<MetricsServer> {
    let app = Router::new()
        .route(
            "/metrics",
            get({
                let registry = registry.clone();
                move || metrics_handler(registry.clone())
            }),
        )
        .route(
            "/healthz",
            get({
                let probe = probe.clone();
                move || health_handler(probe.clone())
            }),
        );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

async fn health_handler(probe: Arc<dyn ReadinessProbe>) -> impl IntoResponse {
    let readiness = probe.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness.details))
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the configured one when port 0 was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "tsod_starts_total",
            "Total number of times the orchestration daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tsod_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("tsod_build_info", "Build metadata for the running daemon"),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Run lifecycle and event consumption metrics.
#[derive(Clone, Debug)]
pub struct OrchestratorMetrics {
    registry: SharedRegistry,
    runs_started: IntCounter,
    active_runs: IntGauge,
    transitions: IntCounterVec,
    stage_start_seconds: HistogramVec,
    stage_failures: IntCounterVec,
    stream_entries: IntCounterVec,
    stream_reconnects: IntCounter,
    identity_resolutions: IntCounterVec,
}

impl OrchestratorMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs_started = IntCounter::with_opts(Opts::new(
            "tso_runs_started_total",
            "Runs whose launch was requested",
        ))?;
        registry.register(Box::new(runs_started.clone()))?;

        let active_runs = IntGauge::with_opts(Opts::new(
            "tso_active_runs",
            "Runs currently pending or running",
        ))?;
        registry.register(Box::new(active_runs.clone()))?;

        let transitions = IntCounterVec::new(
            Opts::new(
                "tso_run_transitions_total",
                "Applied run status transitions by target status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let stage_start_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tso_stage_start_seconds",
                "Time taken to start a pipeline stage",
            )
            .buckets(buckets),
            &["stage"],
        )?;
        registry.register(Box::new(stage_start_seconds.clone()))?;

        let stage_failures = IntCounterVec::new(
            Opts::new(
                "tso_stage_failures_total",
                "Stage start or stop failures by stage and phase",
            ),
            &["stage", "phase"],
        )?;
        registry.register(Box::new(stage_failures.clone()))?;

        let stream_entries = IntCounterVec::new(
            Opts::new(
                "tso_stream_entries_total",
                "Stream entries handled by the consumer, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(stream_entries.clone()))?;

        let stream_reconnects = IntCounter::with_opts(Opts::new(
            "tso_stream_reconnects_total",
            "Times the consumer backed off after the stream became unavailable",
        ))?;
        registry.register(Box::new(stream_reconnects.clone()))?;

        let identity_resolutions = IntCounterVec::new(
            Opts::new(
                "tso_identity_resolutions_total",
                "Reporter identifiers resolved, by resolution origin",
            ),
            &["origin"],
        )?;
        registry.register(Box::new(identity_resolutions.clone()))?;

        Ok(Self {
            registry,
            runs_started,
            active_runs,
            transitions,
            stage_start_seconds,
            stage_failures,
            stream_entries,
            stream_reconnects,
            identity_resolutions,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_run_started(&self) {
        self.runs_started.inc();
    }

    pub fn set_active_runs(&self, count: usize) {
        self.active_runs.set(count as i64);
    }

    pub fn record_transition(&self, status: &str) {
        self.transitions.with_label_values(&[status]).inc();
    }

    pub fn observe_stage_start(&self, stage: &str, seconds: f64) {
        self.stage_start_seconds
            .with_label_values(&[stage])
            .observe(seconds);
    }

    pub fn record_stage_failure(&self, stage: &str, phase: &str) {
        self.stage_failures.with_label_values(&[stage, phase]).inc();
    }

    pub fn record_stream_entry(&self, outcome: &str) {
        self.stream_entries.with_label_values(&[outcome]).inc();
    }

    pub fn inc_stream_reconnect(&self) {
        self.stream_reconnects.inc();
    }

    pub fn record_identity_resolution(&self, origin: &str) {
        self.identity_resolutions.with_label_values(&[origin]).inc();
    }
}

pub use prometheus;
