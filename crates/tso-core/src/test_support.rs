//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Recording resource manager for unit tests."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tso_persistence::{RunStore, RunUpdate, RunWriter, UpdateDisposition, UpdateReport};

use crate::error::ResourceError;
use crate::resources::{ResourceManager, Stage, StageHandle, StageSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start(Stage),
    Stop(Stage),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingResources {
    pub calls: Mutex<Vec<Call>>,
    pub fail_start: Mutex<HashSet<Stage>>,
    pub fail_stop: Mutex<HashSet<Stage>>,
    pub hang_start: Mutex<HashSet<Stage>>,
}

impl RecordingResources {
    pub fn failing_start(stage: Stage) -> Self {
        let resources = Self::default();
        resources.fail_start.lock().insert(stage);
        resources
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn stops(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == Call::Stop(stage))
            .count()
    }
}

#[async_trait]
impl ResourceManager for RecordingResources {
    async fn start_stage(&self, spec: &StageSpec) -> Result<StageHandle, ResourceError> {
        self.calls.lock().push(Call::Start(spec.stage));
        if self.fail_start.lock().contains(&spec.stage) {
            return Err(ResourceError::Rejected(format!("{} refused", spec.name)));
        }
        if self.hang_start.lock().contains(&spec.stage) {
            std::future::pending::<()>().await;
        }
        Ok(StageHandle {
            run_id: spec.run_id.clone(),
            stage: spec.stage,
            id: spec.name.clone(),
        })
    }

    async fn stop_stage(&self, handle: &StageHandle) -> Result<(), ResourceError> {
        self.calls.lock().push(Call::Stop(handle.stage));
        if self.fail_stop.lock().contains(&handle.stage) {
            return Err(ResourceError::Rejected(format!("{} stuck", handle.id)));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Writer whose updates never match a row, as if the run vanished between statements.
pub(crate) struct VanishingWriter {
    pub store: Arc<RunStore>,
    pub updates: AtomicUsize,
}

impl VanishingWriter {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self {
            store,
            updates: AtomicUsize::new(0),
        }
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl RunWriter for VanishingWriter {
    fn apply_update(&self, _run_id: &str, _update: &RunUpdate) -> tso_persistence::Result<UpdateReport> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateReport {
            rows_affected: 0,
            disposition: UpdateDisposition::Missing,
            trades_inserted: 0,
            positions_upserted: 0,
        })
    }

    fn insert_placeholder(&self, run_id: &str, now: DateTime<Utc>) -> tso_persistence::Result<usize> {
        self.store.insert_placeholder(run_id, now)
    }
}
