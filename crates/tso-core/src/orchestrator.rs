//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Facade exposing start, stop, query, health and recovery of runs."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tso_common::time::{elapsed_seconds, remaining_seconds};
use tso_common::{
    AppConfig, OrchestrationConfig, ParamMap, PositionRecord, RunRecord, RunRequest, RunStatus,
    TradeRecord,
};
use tso_metrics::{OrchestratorMetrics, Readiness, ReadinessProbe, SharedRegistry};
use tso_persistence::{
    DocumentStore, PersistenceMetrics, RunConfigDocument, RunFilter, RunStore, TransitionOutcome,
};
use tso_stream::{open_stream, EventStream};

use crate::consumer::{ConsumerHandle, ConsumerStats, StreamConsumer};
use crate::error::{OrchestrationError, Result};
use crate::identity::IdentityRegistry;
use crate::lifecycle::{LaunchOutcome, LifecycleManager};
use crate::reconcile::{ReconciliationService, RetryPolicy};
use crate::resources::{DockerResourceManager, ResourceManager};

/// Metadata key naming the reporter identifier a run's workers are expected to use.
pub const REPORTER_HINT_KEY: &str = "reporter_id";

/// Collaborators the orchestrator is assembled from.
pub struct Components {
    pub store: Arc<RunStore>,
    pub documents: Option<Arc<DocumentStore>>,
    pub stream: Arc<dyn EventStream>,
    pub resources: Arc<dyn ResourceManager>,
    pub metrics: Option<OrchestratorMetrics>,
}

/// A started stage as reported by [`Orchestrator::get_run`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StageView {
    pub stage: String,
    pub handle: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Reconciled snapshot of one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunView {
    #[serde(flatten)]
    pub record: RunRecord,
    pub aliases: Vec<String>,
    pub stages: Vec<StageView>,
    pub elapsed_seconds: Option<i64>,
    pub remaining_seconds: Option<i64>,
    pub trades: Vec<TradeRecord>,
    pub positions: Vec<PositionRecord>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self { ok: true, error: None },
            Err(err) => Self {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Reachability of every collaborator.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub ready: bool,
    pub resource_manager: ComponentHealth,
    pub stream: ComponentHealth,
    pub relational: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<ComponentHealth>,
    pub consumer: ConsumerStats,
}

/// What [`Orchestrator::recover`] did with runs left over by an earlier process.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_pending: Vec<String>,
    pub rearmed: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct Orchestrator {
    store: Arc<RunStore>,
    documents: Option<Arc<DocumentStore>>,
    stream: Arc<dyn EventStream>,
    registry: Arc<IdentityRegistry>,
    lifecycle: Arc<LifecycleManager>,
    consumer: Arc<StreamConsumer>,
    config: OrchestrationConfig,
    metrics: Option<OrchestratorMetrics>,
    launches: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Orchestrator {
    /// Open every backend named by `config` and wire the services together.
    pub fn from_config(config: &AppConfig, registry: Option<SharedRegistry>) -> anyhow::Result<Self> {
        let mut store = RunStore::open(&config.storage.sqlite_path, config.storage.busy_timeout)
            .with_context(|| {
                format!("opening run store {}", config.storage.sqlite_path.display())
            })?;
        let metrics = match &registry {
            Some(registry) => {
                store = store.with_metrics(PersistenceMetrics::new(registry.clone())?);
                Some(OrchestratorMetrics::new(registry.clone())?)
            }
            None => None,
        };
        let documents = DocumentStore::open(&config.storage.document_root).with_context(|| {
            format!(
                "opening document store {}",
                config.storage.document_root.display()
            )
        })?;
        let stream = open_stream(&config.stream).context("opening event stream")?;
        let resources = Arc::new(DockerResourceManager::from_config(&config.orchestration));

        Ok(Self::with_components(
            Components {
                store: Arc::new(store),
                documents: Some(Arc::new(documents)),
                stream,
                resources,
                metrics,
            },
            config,
        ))
    }

    pub fn with_components(components: Components, config: &AppConfig) -> Self {
        let Components {
            store,
            documents,
            stream,
            resources,
            metrics,
        } = components;
        let registry = Arc::new(IdentityRegistry::new(store.clone(), metrics.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            documents.clone(),
            resources,
            config.orchestration.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(ReconciliationService::new(
            registry.clone(),
            store.clone(),
            RetryPolicy::from_config(&config.storage),
        ));
        let consumer = Arc::new(StreamConsumer::new(
            stream.clone(),
            reconciler,
            Some(lifecycle.clone()),
            config.stream.clone(),
            metrics.clone(),
        ));

        Self {
            store,
            documents,
            stream,
            registry,
            lifecycle,
            consumer,
            config: config.orchestration.clone(),
            metrics,
            launches: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn documents(&self) -> Option<&Arc<DocumentStore>> {
        self.documents.as_ref()
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn consumer(&self) -> &Arc<StreamConsumer> {
        &self.consumer
    }

    /// Start the stream consumer on a background task.
    pub fn spawn_consumer(&self) -> ConsumerHandle {
        self.consumer.clone().spawn()
    }

    /// Validate and record a run, then launch its stages in the background.
    ///
    /// Returns the canonical identifier as soon as the run is `pending`.
    pub async fn start_run(&self, request: RunRequest) -> Result<String> {
        let missing = request.missing_fields(
            &self.config.required_algo_params,
            &self.config.required_simulator_params,
        );
        if !missing.is_empty() {
            return Err(OrchestrationError::ConfigInvalid { fields: missing });
        }

        let active = self.store.count_active()?;
        if active >= self.config.max_concurrent_runs {
            return Err(OrchestrationError::CapacityExceeded {
                active,
                limit: self.config.max_concurrent_runs,
            });
        }

        let hint = request
            .metadata
            .get(REPORTER_HINT_KEY)
            .and_then(|value| value.as_str())
            .map(str::to_owned);
        let defaults = self.version_defaults(&request.algorithm_version);
        let config = request.into_config(defaults.as_ref());

        let now = Utc::now();
        let run_id = self.registry.generate(now);
        self.store.insert_run(&run_id, &config, now)?;
        if let Some(documents) = &self.documents {
            if let Err(err) = documents.save_run_config(&RunConfigDocument::new(&run_id, &config, now)) {
                warn!(run_id = %run_id, error = %err, "failed to save run configuration document");
            }
        }
        self.registry.expect_report(&run_id, hint.as_deref(), now)?;

        if let Some(metrics) = &self.metrics {
            metrics.inc_run_started();
            metrics.set_active_runs(active + 1);
        }
        info!(
            run_id = %run_id,
            algorithm = %config.algorithm,
            version = %config.algorithm_version,
            duration_secs = config.duration_seconds,
            "run accepted"
        );

        let lifecycle = self.lifecycle.clone();
        let id = run_id.clone();
        let task = tokio::spawn(async move {
            match lifecycle.launch(&id, &config).await {
                Ok(LaunchOutcome::Running) => debug!(run_id = %id, "launch finished"),
                Ok(LaunchOutcome::Aborted(status)) => {
                    info!(run_id = %id, %status, "launch abandoned")
                }
                Err(err) => error!(run_id = %id, error = %err, "launch failed"),
            }
        });
        let mut launches = self.launches.lock();
        launches.retain(|_, task| !task.is_finished());
        launches.insert(run_id.clone(), task);
        Ok(run_id)
    }

    fn version_defaults(&self, version: &str) -> Option<ParamMap> {
        let documents = self.documents.as_ref()?;
        match documents.get_algorithm_version(version) {
            Ok(Some(document)) => Some(document.default_config),
            Ok(None) => None,
            Err(err) => {
                warn!(version, error = %err, "algorithm version lookup failed; using built-in defaults");
                None
            }
        }
    }

    /// Wait for the background launch of `run_id`, if one is in flight.
    pub async fn wait_for_launch(&self, run_id: &str) {
        let task = self.launches.lock().remove(run_id);
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(run_id, error = %err, "launch task did not finish cleanly");
            }
        }
    }

    /// Stop a run and return its status afterwards.
    ///
    /// A run that already ended is left alone and its final status returned.
    pub async fn stop_run(&self, run_id: &str) -> Result<RunStatus> {
        let canonical_id = self.canonical(run_id)?;
        match self.lifecycle.stop(&canonical_id).await? {
            TransitionOutcome::Applied { .. } => Ok(RunStatus::Stopped),
            TransitionOutcome::Rejected { current } => {
                info!(run_id = %canonical_id, status = %current, "stop requested for finished run");
                Ok(current)
            }
            TransitionOutcome::Missing => Err(OrchestrationError::RunNotFound(canonical_id)),
        }
    }

    /// Current snapshot of a run; accepts canonical or reporter identifiers.
    pub fn get_run(&self, run_id: &str) -> Result<RunView> {
        let canonical_id = self.canonical(run_id)?;
        let record = self
            .store
            .get_run(&canonical_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))?;
        let now = Utc::now();
        let stages = self
            .store
            .stages_for(&canonical_id)?
            .into_iter()
            .map(|row| StageView {
                stage: row.stage,
                handle: row.handle,
                started_at: row.started_at,
                stopped_at: row.stopped_at,
            })
            .collect();
        let remaining = match (&record.config, record.status) {
            (Some(config), RunStatus::Running) => {
                remaining_seconds(record.started_at, config.duration_seconds, now)
            }
            _ => None,
        };

        Ok(RunView {
            aliases: self.registry.aliases(&canonical_id)?,
            stages,
            elapsed_seconds: elapsed_seconds(record.started_at, record.ended_at, now),
            remaining_seconds: remaining,
            trades: self.store.trades_for(&canonical_id)?,
            positions: self.store.positions_for(&canonical_id)?,
            record,
        })
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        Ok(self.store.list_runs(filter)?)
    }

    fn canonical(&self, run_id: &str) -> Result<String> {
        self.registry
            .lookup(run_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))
    }

    pub async fn health(&self) -> HealthReport {
        let resource_manager = ComponentHealth::from_result(self.lifecycle.resources().ping().await);
        let stream = ComponentHealth::from_result(self.stream.ping().await);
        let relational = ComponentHealth::from_result(self.store.ping());
        let documents = self
            .documents
            .as_ref()
            .map(|documents| ComponentHealth::from_result(documents.ping()));
        let ready = resource_manager.ok
            && stream.ok
            && relational.ok
            && documents.as_ref().map_or(true, |health| health.ok);
        HealthReport {
            ready,
            resource_manager,
            stream,
            relational,
            documents,
            consumer: self.consumer.stats(),
        }
    }

    /// Settle runs left by a previous process.
    ///
    /// `pending` runs never finished launching and are failed with their
    /// recorded stages torn down; `running` runs get their watchdog back.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for record in self.store.runs_with_status(&[RunStatus::Pending])? {
            match self
                .lifecycle
                .fail(&record.run_id, "orchestrator restarted before launch finished")
                .await
            {
                Ok(TransitionOutcome::Applied { .. }) => report.failed_pending.push(record.run_id),
                Ok(_) => report.skipped.push(record.run_id),
                Err(err) => {
                    warn!(run_id = %record.run_id, error = %err, "could not fail interrupted launch");
                    report.skipped.push(record.run_id);
                }
            }
        }

        for record in self.store.runs_with_status(&[RunStatus::Running])? {
            let Some(config) = &record.config else {
                debug!(run_id = %record.run_id, "running placeholder has no duration; not watched");
                report.skipped.push(record.run_id);
                continue;
            };
            let remaining = remaining_seconds(record.started_at, config.duration_seconds, now)
                .unwrap_or(0)
                .max(0) as u64;
            let delay = self.lifecycle.watchdog_delay(remaining);
            self.lifecycle.arm_watchdog(&record.run_id, delay);
            report.rearmed.push(record.run_id);
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_active_runs(self.store.count_active()?);
        }
        info!(
            failed = report.failed_pending.len(),
            rearmed = report.rearmed.len(),
            skipped = report.skipped.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Abort in-flight launches and watchdogs. Stored state is left for [`Self::recover`].
    pub fn shutdown(&self) {
        let launches: Vec<_> = self.launches.lock().drain().collect();
        for (run_id, task) in launches {
            if !task.is_finished() {
                warn!(run_id = %run_id, "aborting in-flight launch");
                task.abort();
            }
        }
        self.lifecycle.shutdown();
    }
}

#[async_trait]
impl ReadinessProbe for Orchestrator {
    async fn readiness(&self) -> Readiness {
        let report = self.health().await;
        Readiness {
            ready: report.ready,
            details: serde_json::to_value(&report).unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store.location())
            .field("stream", &self.stream.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Stage;
    use crate::test_support::{Call, RecordingResources};
    use serde_json::json;
    use tso_persistence::AlgorithmVersionDocument;
    use tso_stream::MemoryStream;

    fn orchestrator(resources: Arc<RecordingResources>, config: &AppConfig) -> Orchestrator {
        let components = Components {
            store: Arc::new(RunStore::in_memory().unwrap()),
            documents: None,
            stream: Arc::new(MemoryStream::new("trading-stats")),
            resources,
            metrics: None,
        };
        Orchestrator::with_components(components, config)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_run_launches_stages_in_order() {
        let resources = Arc::new(RecordingResources::default());
        let orchestrator = orchestrator(resources.clone(), &AppConfig::default());

        let run_id = orchestrator
            .start_run(RunRequest::new("order_book", "v1.0.0", 60))
            .await
            .unwrap();
        assert!(run_id.starts_with("run_"));
        orchestrator.wait_for_launch(&run_id).await;

        assert_eq!(
            resources.calls(),
            vec![
                Call::Start(Stage::DataSource),
                Call::Start(Stage::Algorithm),
                Call::Start(Stage::Simulator)
            ]
        );
        let view = orchestrator.get_run(&run_id).unwrap();
        assert_eq!(view.record.status, RunStatus::Running);
        assert_eq!(view.stages.len(), 3);
        assert!(view.remaining_seconds.is_some());
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn invalid_request_has_no_side_effects() {
        let resources = Arc::new(RecordingResources::default());
        let orchestrator = orchestrator(resources.clone(), &AppConfig::default());

        let err = orchestrator
            .start_run(RunRequest::new("", "v1.0.0", 0))
            .await
            .unwrap_err();
        match err {
            OrchestrationError::ConfigInvalid { fields } => {
                assert!(fields.contains(&"algorithm".to_string()));
                assert!(fields.contains(&"duration_seconds".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(orchestrator.list_runs(&RunFilter::default()).unwrap().is_empty());
        assert!(resources.calls().is_empty());
    }

    #[tokio::test]
    async fn capacity_limit_rejects_new_runs() {
        let mut config = AppConfig::default();
        config.orchestration.max_concurrent_runs = 1;
        let orchestrator = orchestrator(Arc::new(RecordingResources::default()), &config);

        let first = orchestrator
            .start_run(RunRequest::new("order_book", "v1.0.0", 60))
            .await
            .unwrap();
        let err = orchestrator
            .start_run(RunRequest::new("order_book", "v1.0.0", 60))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::CapacityExceeded { active: 1, limit: 1 }));
        orchestrator.wait_for_launch(&first).await;
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn orphan_placeholders_do_not_use_capacity() {
        let mut config = AppConfig::default();
        config.orchestration.max_concurrent_runs = 1;
        let orchestrator = orchestrator(Arc::new(RecordingResources::default()), &config);

        let stray = orchestrator.registry().resolve("stray-worker", Utc::now()).unwrap();
        assert!(stray.created);
        let report = orchestrator.recover().await.unwrap();
        assert_eq!(report.skipped, vec!["stray-worker".to_string()]);
        assert_eq!(orchestrator.lifecycle().armed_watchdogs(), 0);

        let run_id = orchestrator
            .start_run(RunRequest::new("order_book", "v1.0.0", 60))
            .await
            .unwrap();
        orchestrator.wait_for_launch(&run_id).await;
        assert_eq!(orchestrator.store().count_active().unwrap(), 1);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let orchestrator = orchestrator(Arc::new(RecordingResources::default()), &AppConfig::default());
        assert!(matches!(
            orchestrator.stop_run("run_missing").await,
            Err(OrchestrationError::RunNotFound(_))
        ));
        assert!(matches!(
            orchestrator.get_run("run_missing"),
            Err(OrchestrationError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stopping_finished_run_reports_its_status() {
        let resources = Arc::new(RecordingResources::default());
        let orchestrator = orchestrator(resources.clone(), &AppConfig::default());
        let run_id = orchestrator
            .start_run(RunRequest::new("order_book", "v1.0.0", 60))
            .await
            .unwrap();
        orchestrator.wait_for_launch(&run_id).await;

        assert_eq!(orchestrator.stop_run(&run_id).await.unwrap(), RunStatus::Stopped);
        assert_eq!(resources.stops(Stage::Simulator), 1);
        assert_eq!(orchestrator.stop_run(&run_id).await.unwrap(), RunStatus::Stopped);
        assert_eq!(resources.stops(Stage::Simulator), 1);
    }

    #[tokio::test]
    async fn version_defaults_layer_under_request() {
        let dir = tempfile::tempdir().unwrap();
        let documents = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let mut defaults = ParamMap::new();
        defaults.insert("IMBALANCE_THRESHOLD".into(), json!(0.75));
        defaults.insert("LOOKBACK_PERIODS".into(), json!(9));
        documents
            .put_algorithm_version(&AlgorithmVersionDocument {
                version: "v2.0.0".into(),
                created_at: Utc::now(),
                description: "wider lookback".into(),
                default_config: defaults,
                config_schema: json!({}),
            })
            .unwrap();

        let components = Components {
            store: Arc::new(RunStore::in_memory().unwrap()),
            documents: Some(documents.clone()),
            stream: Arc::new(MemoryStream::new("trading-stats")),
            resources: Arc::new(RecordingResources::default()),
            metrics: None,
        };
        let orchestrator = Orchestrator::with_components(components, &AppConfig::default());
        let mut request = RunRequest::new("order_book", "v2.0.0", 30);
        request.algo_params.insert("LOOKBACK_PERIODS".into(), json!(3));
        let run_id = orchestrator.start_run(request).await.unwrap();
        orchestrator.wait_for_launch(&run_id).await;

        let config = orchestrator.get_run(&run_id).unwrap().record.config.unwrap();
        assert_eq!(config.algo_params["IMBALANCE_THRESHOLD"], json!(0.75));
        assert_eq!(config.algo_params["LOOKBACK_PERIODS"], json!(3));
        let document = documents.get_run_config(&run_id).unwrap().unwrap();
        assert_eq!(document.status, RunStatus::Running);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn recover_fails_interrupted_launches() {
        let orchestrator = orchestrator(Arc::new(RecordingResources::default()), &AppConfig::default());
        let config = RunRequest::new("order_book", "v1.0.0", 60).into_config(None);
        orchestrator
            .store()
            .insert_run("run_left_pending", &config, Utc::now())
            .unwrap();

        let report = orchestrator.recover().await.unwrap();
        assert_eq!(report.failed_pending, vec!["run_left_pending".to_string()]);
        let record = orchestrator.store().get_run("run_left_pending").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn health_reports_every_backend() {
        let orchestrator = orchestrator(Arc::new(RecordingResources::default()), &AppConfig::default());
        let report = orchestrator.health().await;
        assert!(report.ready);
        assert!(report.documents.is_none());
        let readiness = orchestrator.readiness().await;
        assert_eq!(readiness.details["stream"]["ok"], json!(true));
    }
}
