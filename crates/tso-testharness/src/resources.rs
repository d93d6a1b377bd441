//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Scripted resource manager recording stage starts and stops."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use tso_core::{ResourceError, ResourceManager, Stage, StageHandle, StageSpec};

/// One call observed by [`ScriptedResourceManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceCall {
    Start { stage: Stage, name: String },
    Stop { stage: Stage, handle: String },
    Release { run_id: String, network: String },
}

/// In-process stand-in for the container runtime.
///
/// Starts and stops succeed unless scripted otherwise. Stopping a handle that
/// is not running is a no-op success, as the real runtime is idempotent.
#[derive(Debug)]
pub struct ScriptedResourceManager {
    calls: Mutex<Vec<ResourceCall>>,
    start_failures: Mutex<HashMap<Stage, String>>,
    stop_failures: Mutex<HashMap<Stage, String>>,
    start_delay: Mutex<Option<Duration>>,
    stop_delay: Mutex<Option<Duration>>,
    running: Mutex<BTreeSet<String>>,
    available: AtomicBool,
}

impl Default for ScriptedResourceManager {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            start_failures: Mutex::new(HashMap::new()),
            stop_failures: Mutex::new(HashMap::new()),
            start_delay: Mutex::new(None),
            stop_delay: Mutex::new(None),
            running: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl ScriptedResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every start of `stage` fail with `message`.
    pub fn fail_start(&self, stage: Stage, message: impl Into<String>) -> &Self {
        self.start_failures.lock().insert(stage, message.into());
        self
    }

    /// Make every stop of `stage` fail with `message`.
    pub fn fail_stop(&self, stage: Stage, message: impl Into<String>) -> &Self {
        self.stop_failures.lock().insert(stage, message.into());
        self
    }

    pub fn delay_start(&self, delay: Duration) -> &Self {
        *self.start_delay.lock() = Some(delay);
        self
    }

    pub fn delay_stop(&self, delay: Duration) -> &Self {
        *self.stop_delay.lock() = Some(delay);
        self
    }

    /// Toggle the reachability reported by `ping`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ResourceCall> {
        self.calls.lock().clone()
    }

    /// Stages started, in call order.
    pub fn starts(&self) -> Vec<Stage> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ResourceCall::Start { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    /// Stages stopped, in call order.
    pub fn stops(&self) -> Vec<Stage> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ResourceCall::Stop { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    pub fn stop_count(&self, stage: Stage) -> usize {
        self.stops().into_iter().filter(|s| *s == stage).count()
    }

    pub fn releases(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ResourceCall::Release { network, .. } => Some(network.clone()),
                _ => None,
            })
            .collect()
    }

    /// Handles started and not yet stopped.
    pub fn running(&self) -> Vec<String> {
        self.running.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl ResourceManager for ScriptedResourceManager {
    async fn start_stage(&self, spec: &StageSpec) -> Result<StageHandle, ResourceError> {
        self.calls.lock().push(ResourceCall::Start {
            stage: spec.stage,
            name: spec.name.clone(),
        });
        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.start_failures.lock().get(&spec.stage).cloned();
        if let Some(message) = failure {
            debug!(stage = %spec.stage, "scripted start failure");
            return Err(ResourceError::Rejected(message));
        }
        self.running.lock().insert(spec.name.clone());
        Ok(StageHandle {
            run_id: spec.run_id.clone(),
            stage: spec.stage,
            id: spec.name.clone(),
        })
    }

    async fn stop_stage(&self, handle: &StageHandle) -> Result<(), ResourceError> {
        self.calls.lock().push(ResourceCall::Stop {
            stage: handle.stage,
            handle: handle.id.clone(),
        });
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.stop_failures.lock().get(&handle.stage).cloned();
        if let Some(message) = failure {
            return Err(ResourceError::Rejected(message));
        }
        self.running.lock().remove(&handle.id);
        Ok(())
    }

    async fn release_run(&self, run_id: &str, network: &str) -> Result<(), ResourceError> {
        self.calls.lock().push(ResourceCall::Release {
            run_id: run_id.to_string(),
            network: network.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), ResourceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResourceError::Unreachable("scripted runtime offline".into()))
        }
    }
}
