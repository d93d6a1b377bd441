//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Run state machine and pipeline stage start/teardown."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! The lifecycle manager is the only writer of run status and timestamps.
//!
//! Stages start strictly in [`Stage::ORDER`], each awaited before the next.
//! Teardown is issued for every started stage in reverse order without
//! waiting on one another, and every outcome is collected.
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tso_common::{OrchestrationConfig, RunConfig, RunStatus};
use tso_metrics::OrchestratorMetrics;
use tso_persistence::{DocumentStore, RunStore, TransitionOutcome};

use crate::error::{OrchestrationError, ResourceError, Result};
use crate::resources::{ResourceManager, Stage, StageHandle, StageSpec};

/// Slack on top of `stage_start_timeout` before an unresponsive start is abandoned.
pub const STAGE_START_MARGIN: Duration = Duration::from_secs(30);

/// Outcome of [`LifecycleManager::launch`] when no stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// All stages started and the run is `running`.
    Running,
    /// The run reached a terminal status while stages were starting.
    Aborted(RunStatus),
}

/// Collected results of tearing down a run's stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub stopped: Vec<Stage>,
    pub failures: Vec<(Stage, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct LifecycleManager {
    store: Arc<RunStore>,
    documents: Option<Arc<DocumentStore>>,
    resources: Arc<dyn ResourceManager>,
    config: OrchestrationConfig,
    metrics: Option<OrchestratorMetrics>,
    watchdogs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<RunStore>,
        documents: Option<Arc<DocumentStore>>,
        resources: Arc<dyn ResourceManager>,
        config: OrchestrationConfig,
        metrics: Option<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            documents,
            resources,
            config,
            metrics,
            watchdogs: Mutex::new(HashMap::new()),
        }
    }

    pub fn resources(&self) -> &Arc<dyn ResourceManager> {
        &self.resources
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    fn network_for(&self, run_id: &str) -> String {
        format!("{}-{}", self.config.network_prefix, run_id)
    }

    /// Start every stage of a `pending` run and move it to `running`.
    ///
    /// A stage failure tears down the stages already started, fails the run
    /// with the cause recorded, and returns [`OrchestrationError::StageStartFailed`].
    pub async fn launch(self: &Arc<Self>, run_id: &str, config: &RunConfig) -> Result<LaunchOutcome> {
        let mut started: Vec<StageHandle> = Vec::with_capacity(Stage::ORDER.len());
        // The manager's own health wait gets to finish and clean up first.
        let limit = self.config.stage_start_timeout + STAGE_START_MARGIN;

        for stage in Stage::ORDER {
            if let Some(status) = self.terminal_status(run_id)? {
                info!(run_id, %status, "run ended while launching; tearing down started stages");
                self.teardown(run_id, started).await;
                return Ok(LaunchOutcome::Aborted(status));
            }

            let spec = StageSpec::for_run(run_id, stage, config, &self.config);
            let begun = Instant::now();
            let result = match tokio::time::timeout(limit, self.resources.start_stage(&spec)).await {
                Ok(result) => result,
                Err(_) => {
                    // The abandoned start may already have created the stage.
                    started.push(StageHandle {
                        run_id: run_id.to_string(),
                        stage,
                        id: spec.name.clone(),
                    });
                    Err(ResourceError::Timeout {
                        what: format!("start of stage {stage}"),
                        after: limit,
                    })
                }
            };

            let handle = match result {
                Ok(handle) => handle,
                Err(source) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_stage_failure(stage.as_str(), "start");
                    }
                    error!(run_id, %stage, error = %source, "stage failed to start");
                    let message = format!("stage {stage} failed to start: {source}");
                    self.abort_launch(run_id, started, &message).await?;
                    return Err(OrchestrationError::StageStartFailed {
                        run_id: run_id.to_string(),
                        stage,
                        source,
                    });
                }
            };

            if let Some(metrics) = &self.metrics {
                metrics.observe_stage_start(stage.as_str(), begun.elapsed().as_secs_f64());
            }
            let recorded = self
                .store
                .record_stage(run_id, stage.as_str(), &handle.id, Utc::now());
            info!(run_id, %stage, handle = %handle.id, "stage started");
            started.push(handle);
            if let Err(err) = recorded {
                // Later teardowns read the stage table; an unrecorded stage would leak.
                error!(run_id, %stage, error = %err, "failed to record started stage");
                let message = format!("stage {stage} started but could not be recorded: {err}");
                self.abort_launch(run_id, started, &message).await?;
                return Err(err.into());
            }
        }

        match self.apply_transition(run_id, RunStatus::Running, None)? {
            TransitionOutcome::Applied { .. } => {
                self.arm_watchdog(run_id, self.watchdog_delay(config.duration_seconds));
                Ok(LaunchOutcome::Running)
            }
            TransitionOutcome::Rejected { current } => {
                info!(run_id, status = %current, "run ended before it reached running");
                self.teardown(run_id, started).await;
                Ok(LaunchOutcome::Aborted(current))
            }
            TransitionOutcome::Missing => Err(OrchestrationError::RunNotFound(run_id.to_string())),
        }
    }

    async fn abort_launch(&self, run_id: &str, started: Vec<StageHandle>, message: &str) -> Result<()> {
        let report = self.teardown(run_id, started).await;
        debug!(run_id, stopped = report.stopped.len(), "partial pipeline torn down");
        self.apply_transition(run_id, RunStatus::Failed, Some(message))?;
        Ok(())
    }

    /// Natural completion signal.
    pub async fn complete(&self, run_id: &str) -> Result<TransitionOutcome> {
        self.finish(run_id, RunStatus::Completed, None).await
    }

    /// Fatal failure reported for a running run.
    pub async fn fail(&self, run_id: &str, reason: &str) -> Result<TransitionOutcome> {
        self.finish(run_id, RunStatus::Failed, Some(reason)).await
    }

    /// Explicit stop request.
    pub async fn stop(&self, run_id: &str) -> Result<TransitionOutcome> {
        self.finish(run_id, RunStatus::Stopped, None).await
    }

    async fn finish(
        &self,
        run_id: &str,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let outcome = self.apply_transition(run_id, to, reason)?;
        match outcome {
            TransitionOutcome::Applied { .. } => {
                let report = self.teardown_recorded(run_id).await?;
                if !report.is_clean() {
                    warn!(run_id, failures = ?report.failures, "teardown left failures");
                }
            }
            TransitionOutcome::Rejected { current } => {
                debug!(run_id, from = %current, to = %to, "transition ignored");
            }
            TransitionOutcome::Missing => {
                return Err(OrchestrationError::RunNotFound(run_id.to_string()))
            }
        }
        Ok(outcome)
    }

    fn apply_transition(
        &self,
        run_id: &str,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let now = Utc::now();
        let outcome = self.store.transition(run_id, to, reason, now)?;
        if let TransitionOutcome::Applied { from } = outcome {
            info!(run_id, %from, %to, reason, "run status changed");
            if to.is_terminal() {
                self.cancel_watchdog(run_id);
            }
            if let Some(documents) = &self.documents {
                if let Err(err) = documents.update_run_status(run_id, to, now) {
                    warn!(run_id, error = %err, "failed to mirror status to document store");
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_transition(to.as_str());
                match self.store.count_active() {
                    Ok(active) => metrics.set_active_runs(active),
                    Err(err) => debug!(error = %err, "active run count unavailable"),
                }
            }
        }
        Ok(outcome)
    }

    fn terminal_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let record = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))?;
        Ok(record.status.is_terminal().then_some(record.status))
    }

    /// Tear down every stage recorded as still running for the run.
    pub async fn teardown_recorded(&self, run_id: &str) -> Result<TeardownReport> {
        let handles = self
            .store
            .active_stages(run_id)?
            .into_iter()
            .filter_map(|row| match row.stage.parse::<Stage>() {
                Ok(stage) => Some(StageHandle {
                    run_id: run_id.to_string(),
                    stage,
                    id: row.handle,
                }),
                Err(err) => {
                    warn!(run_id, error = %err, "skipping unrecognised stage row");
                    None
                }
            })
            .collect();
        Ok(self.teardown(run_id, handles).await)
    }

    /// Stop `handles` in reverse dependency order, collecting every outcome.
    pub async fn teardown(&self, run_id: &str, mut handles: Vec<StageHandle>) -> TeardownReport {
        handles.sort_by_key(|handle| Reverse(handle.stage));
        let timeout = self.config.teardown_timeout;
        let stops = handles.iter().map(|handle| async move {
            let result = match tokio::time::timeout(timeout, self.resources.stop_stage(handle)).await {
                Ok(result) => result,
                Err(_) => Err(ResourceError::Timeout {
                    what: format!("stop of stage {}", handle.stage),
                    after: timeout,
                }),
            };
            (handle, result)
        });

        let mut report = TeardownReport::default();
        for (handle, result) in join_all(stops).await {
            match result {
                Ok(()) => {
                    if let Err(err) =
                        self.store
                            .mark_stage_stopped(run_id, handle.stage.as_str(), Utc::now())
                    {
                        warn!(run_id, stage = %handle.stage, error = %err, "failed to record stage stop");
                    }
                    report.stopped.push(handle.stage);
                }
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_stage_failure(handle.stage.as_str(), "teardown");
                    }
                    error!(run_id, stage = %handle.stage, error = %err, "stage teardown failed");
                    report.failures.push((handle.stage, err.to_string()));
                }
            }
        }

        if report.is_clean() && !report.stopped.is_empty() {
            let network = self.network_for(run_id);
            if let Err(err) = self.resources.release_run(run_id, &network).await {
                warn!(run_id, network = %network, error = %err, "failed to release run resources");
            }
        }
        report
    }

    /// Delay after which a running run is completed without a completion signal.
    pub fn watchdog_delay(&self, duration_seconds: u64) -> Duration {
        Duration::from_secs(duration_seconds) + self.config.completion_grace
    }

    /// Complete the run after `after` unless it ends first.
    pub fn arm_watchdog(self: &Arc<Self>, run_id: &str, after: Duration) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let id = run_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.watchdogs.lock().remove(&id);
            match manager.complete(&id).await {
                Ok(TransitionOutcome::Applied { .. }) => {
                    info!(run_id = %id, "run completed by watchdog")
                }
                Ok(_) => debug!(run_id = %id, "watchdog found run already finished"),
                Err(err) => warn!(run_id = %id, error = %err, "watchdog completion failed"),
            }
        });
        if let Some(previous) = self.watchdogs.lock().insert(run_id.to_string(), task) {
            previous.abort();
        }
        debug!(run_id, after_secs = after.as_secs(), "completion watchdog armed");
    }

    fn cancel_watchdog(&self, run_id: &str) {
        if let Some(task) = self.watchdogs.lock().remove(run_id) {
            task.abort();
        }
    }

    pub fn armed_watchdogs(&self) -> usize {
        self.watchdogs.lock().len()
    }

    /// Abort all watchdogs; runs stay as they are in storage.
    pub fn shutdown(&self) {
        for (_, task) in self.watchdogs.lock().drain() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("watchdogs", &self.armed_watchdogs())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, RecordingResources};
    use tso_common::RunRequest;

    fn setup(resources: Arc<RecordingResources>) -> (Arc<RunStore>, Arc<LifecycleManager>, RunConfig) {
        let store = Arc::new(RunStore::in_memory().unwrap());
        let manager = Arc::new(LifecycleManager::new(
            store.clone(),
            None,
            resources,
            OrchestrationConfig::default(),
            None,
        ));
        let config = RunRequest::new("order_book_imbalance", "v1.0.0", 60).into_config(None);
        store.insert_run("run-1", &config, Utc::now()).unwrap();
        (store, manager, config)
    }

    #[tokio::test]
    async fn launch_starts_in_order_and_runs() {
        let resources = Arc::new(RecordingResources::default());
        let (store, manager, config) = setup(resources.clone());

        let outcome = manager.launch("run-1", &config).await.unwrap();
        assert_eq!(outcome, LaunchOutcome::Running);
        assert_eq!(
            resources.calls(),
            vec![
                Call::Start(Stage::DataSource),
                Call::Start(Stage::Algorithm),
                Call::Start(Stage::Simulator)
            ]
        );
        let record = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert!(record.started_at.is_some());
        assert_eq!(manager.armed_watchdogs(), 1);

        manager.stop("run-1").await.unwrap();
        assert_eq!(
            &resources.calls()[3..],
            &[
                Call::Stop(Stage::Simulator),
                Call::Stop(Stage::Algorithm),
                Call::Stop(Stage::DataSource)
            ]
        );
        assert_eq!(manager.armed_watchdogs(), 0);
        assert!(store.active_stages("run-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn algorithm_failure_tears_down_source_once() {
        let resources = Arc::new(RecordingResources::failing_start(Stage::Algorithm));
        let (store, manager, config) = setup(resources.clone());

        let err = manager.launch("run-1", &config).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::StageStartFailed { stage: Stage::Algorithm, .. }
        ));
        assert_eq!(resources.stops(Stage::DataSource), 1);
        assert_eq!(resources.stops(Stage::Simulator), 0);
        let record = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("algorithm"));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_start_is_torn_down_by_name() {
        let resources = Arc::new(RecordingResources::default());
        resources.hang_start.lock().insert(Stage::Algorithm);
        let (store, manager, config) = setup(resources.clone());

        let err = manager.launch("run-1", &config).await.unwrap_err();
        match err {
            OrchestrationError::StageStartFailed {
                stage: Stage::Algorithm,
                source: ResourceError::Timeout { after, .. },
                ..
            } => assert_eq!(
                after,
                OrchestrationConfig::default().stage_start_timeout + STAGE_START_MARGIN
            ),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(resources.stops(Stage::Algorithm), 1);
        assert_eq!(resources.stops(Stage::DataSource), 1);
        assert_eq!(resources.stops(Stage::Simulator), 0);
        let record = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("algorithm"));
    }

    #[tokio::test]
    async fn unrecorded_stage_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let store = Arc::new(RunStore::open(&path, Duration::from_secs(1)).unwrap());
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_algorithm BEFORE INSERT ON run_stages \
                 WHEN NEW.stage = 'algorithm' \
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
        let resources = Arc::new(RecordingResources::default());
        let manager = Arc::new(LifecycleManager::new(
            store.clone(),
            None,
            resources.clone(),
            OrchestrationConfig::default(),
            None,
        ));
        let config = RunRequest::new("order_book_imbalance", "v1.0.0", 60).into_config(None);
        store.insert_run("run-1", &config, Utc::now()).unwrap();

        let err = manager.launch("run-1", &config).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Persistence(_)));
        assert_eq!(resources.stops(Stage::Algorithm), 1);
        assert_eq!(resources.stops(Stage::DataSource), 1);
        assert!(!resources.calls().contains(&Call::Start(Stage::Simulator)));
        let record = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("algorithm"));
        assert_eq!(manager.armed_watchdogs(), 0);
    }

    #[tokio::test]
    async fn teardown_continues_past_failures() {
        let resources = Arc::new(RecordingResources::default());
        resources.fail_stop.lock().insert(Stage::Simulator);
        let (store, manager, config) = setup(resources.clone());
        manager.launch("run-1", &config).await.unwrap();

        manager.fail("run-1", "simulator crashed").await.unwrap();
        for stage in Stage::ORDER {
            assert_eq!(resources.stops(stage), 1, "{stage}");
        }
        let remaining = store.active_stages("run-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stage, "simulator");
    }

    #[tokio::test]
    async fn terminal_runs_ignore_further_transitions() {
        let resources = Arc::new(RecordingResources::default());
        let (store, manager, config) = setup(resources.clone());
        manager.launch("run-1", &config).await.unwrap();
        manager.complete("run-1").await.unwrap();

        let outcome = manager.stop("run-1").await.unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Rejected {
                current: RunStatus::Completed
            }
        );
        assert_eq!(
            store.get_run("run-1").unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert!(matches!(
            manager.stop("ghost").await,
            Err(OrchestrationError::RunNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_completes_overdue_run() {
        let resources = Arc::new(RecordingResources::default());
        let (store, manager, config) = setup(resources.clone());
        manager.launch("run-1", &config).await.unwrap();

        tokio::time::sleep(manager.watchdog_delay(60) + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            store.get_run("run-1").unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(resources.stops(Stage::DataSource), 1);
    }
}
