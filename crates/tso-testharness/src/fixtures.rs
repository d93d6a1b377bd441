//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Orchestrator fixture over scripted collaborators."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tso_common::{AppConfig, RunRecord, RunRequest, StreamBackend};
use tso_core::{BatchReport, Components, Orchestrator};
use tso_persistence::{DocumentStore, RunStore};
use tso_stream::{EntryId, EventStream, Fields, MemoryStream};

use crate::resources::ScriptedResourceManager;

/// Configuration with timeouts short enough for tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.stream.backend = StreamBackend::Memory;
    config.stream.block_timeout = Duration::from_millis(20);
    config.stream.reconnect_delay = Duration::from_millis(10);
    config.stream.max_reconnect_delay = Duration::from_millis(50);
    config.storage.retry_delay = Duration::from_millis(5);
    config.orchestration.stage_start_timeout = Duration::from_millis(500);
    config.orchestration.teardown_timeout = Duration::from_millis(500);
    config.orchestration.completion_grace = Duration::from_secs(5);
    config
}

/// A valid request for the default algorithm.
pub fn run_request(duration_seconds: u64) -> RunRequest {
    RunRequest::new("order_book_imbalance", "v1.0.0", duration_seconds)
}

/// Orchestrator wired to a scripted runtime, an in-memory stream and stores
/// under a temporary directory.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub resources: Arc<ScriptedResourceManager>,
    pub stream: Arc<MemoryStream>,
    pub store: Arc<RunStore>,
    pub documents: Arc<DocumentStore>,
    pub config: AppConfig,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::build(ScriptedResourceManager::new(), |_| {})
    }

    pub fn with_resources(resources: ScriptedResourceManager) -> Result<Self> {
        Self::build(resources, |_| {})
    }

    pub fn build(
        resources: ScriptedResourceManager,
        configure: impl FnOnce(&mut AppConfig),
    ) -> Result<Self> {
        let dir = tempfile::tempdir().context("creating harness directory")?;
        let mut config = test_config();
        config.storage.sqlite_path = dir.path().join("runs.sqlite");
        config.storage.document_root = dir.path().join("documents");
        configure(&mut config);

        let store = Arc::new(RunStore::open(
            &config.storage.sqlite_path,
            config.storage.busy_timeout,
        )?);
        let documents = Arc::new(DocumentStore::open(&config.storage.document_root)?);
        let stream = Arc::new(MemoryStream::new(config.stream.stream_name.clone()));
        let resources = Arc::new(resources);

        let orchestrator = Orchestrator::with_components(
            Components {
                store: store.clone(),
                documents: Some(documents.clone()),
                stream: stream.clone(),
                resources: resources.clone(),
                metrics: None,
            },
            &config,
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            resources,
            stream,
            store,
            documents,
            config,
            dir,
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Start a run and wait until its launch settles.
    pub async fn launch(&self, request: RunRequest) -> Result<String> {
        let run_id = self.orchestrator.start_run(request).await?;
        self.orchestrator.wait_for_launch(&run_id).await;
        Ok(run_id)
    }

    pub async fn publish(&self, fields: Fields) -> Result<EntryId> {
        Ok(self.stream.append(fields).await?)
    }

    /// Replay pending entries, then process whatever is already in the stream.
    pub async fn drain(&self) -> Result<BatchReport> {
        let consumer = self.orchestrator.consumer();
        let mut total = consumer.prepare().await?;
        if total.interrupted {
            return Ok(total);
        }
        loop {
            let report = consumer.poll_once(Duration::from_millis(10)).await?;
            total.absorb(report);
            if report.handled == 0 || report.interrupted {
                return Ok(total);
            }
        }
    }

    pub fn run(&self, run_id: &str) -> Result<RunRecord> {
        self.store
            .get_run(run_id)?
            .with_context(|| format!("run {run_id} not stored"))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}
