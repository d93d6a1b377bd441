//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Idempotent application of worker events to durable run state."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};
use tso_common::StorageConfig;
use tso_persistence::{PersistenceError, RunUpdate, RunWriter, UpdateDisposition, UpdateReport};

use crate::error::{OrchestrationError, Result};
use crate::event::WorkerEvent;
use crate::identity::{IdentityRegistry, ResolutionOrigin};

/// What applying one event did to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub canonical_id: String,
    pub origin: ResolutionOrigin,
    /// Run rows written. Zero only for duplicates.
    pub rows_affected: usize,
    /// A placeholder run was created to receive the update.
    pub created: bool,
    pub disposition: UpdateDisposition,
    pub trades_inserted: usize,
    pub positions_upserted: usize,
}

/// Bounded retry policy for transient storage failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            retries: config.transaction_retries,
            delay: config.retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_millis(250),
        }
    }
}

pub struct ReconciliationService {
    registry: Arc<IdentityRegistry>,
    store: Arc<dyn RunWriter>,
    retry: RetryPolicy,
}

impl ReconciliationService {
    pub fn new(registry: Arc<IdentityRegistry>, store: Arc<dyn RunWriter>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            store,
            retry,
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Resolve the event's run and apply its update in one transaction.
    ///
    /// A missing run gets a placeholder and exactly one more attempt; a
    /// second miss is a [`OrchestrationError::StorageInconsistency`].
    pub async fn apply(&self, event: &WorkerEvent) -> Result<ApplyOutcome> {
        let registry = self.registry.clone();
        let reporter_id = event.reporter_id.clone();
        let resolution = self
            .with_retry("resolve", move || {
                registry
                    .resolve(&reporter_id, Utc::now())
                    .map_err(|err| match err {
                        OrchestrationError::Persistence(inner) => inner,
                        other => PersistenceError::Corrupt(other.to_string()),
                    })
            })
            .await?;
        let canonical_id = resolution.canonical_id;
        let update = Arc::new(event.to_update());

        let mut created = resolution.created;
        let mut report = self.apply_update(&canonical_id, &update).await?;

        if report.disposition == UpdateDisposition::Missing {
            warn!(
                run_id = %canonical_id,
                event_id = %event.event_id,
                "update matched no run; creating placeholder and retrying once"
            );
            let store = self.store.clone();
            let run_id = canonical_id.clone();
            let inserted = self
                .with_retry("insert_placeholder", move || {
                    store.insert_placeholder(&run_id, Utc::now())
                })
                .await?;
            created |= inserted > 0;
            report = self.apply_update(&canonical_id, &update).await?;
            if report.disposition == UpdateDisposition::Missing {
                error!(
                    run_id = %canonical_id,
                    event_id = %event.event_id,
                    rows_affected = report.rows_affected,
                    "update still matched no run after placeholder creation"
                );
                return Err(OrchestrationError::StorageInconsistency {
                    run_id: canonical_id,
                    detail: format!(
                        "event {} affected zero rows after placeholder creation",
                        event.event_id
                    ),
                });
            }
        }

        log_report(&canonical_id, event, &report);
        Ok(ApplyOutcome {
            canonical_id,
            origin: resolution.origin,
            rows_affected: report.rows_affected,
            created,
            disposition: report.disposition,
            trades_inserted: report.trades_inserted,
            positions_upserted: report.positions_upserted,
        })
    }

    async fn apply_update(&self, run_id: &str, update: &Arc<RunUpdate>) -> Result<UpdateReport> {
        let store = self.store.clone();
        let run_id = run_id.to_string();
        let update = update.clone();
        self.with_retry("apply_update", move || store.apply_update(&run_id, &update))
            .await
    }

    /// Run a storage call on the blocking pool, retrying transient failures.
    async fn with_retry<T, F>(&self, operation: &'static str, attempt: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> tso_persistence::Result<T> + Send + Sync + 'static,
    {
        let attempt = Arc::new(attempt);
        let mut remaining = self.retry.retries;
        loop {
            let call = attempt.clone();
            let result = tokio::task::spawn_blocking(move || call())
                .await
                .map_err(|err| OrchestrationError::StorageTask(format!("{operation}: {err}")))?;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && remaining > 0 => {
                    remaining -= 1;
                    if let Some(metrics) = self.store.metrics() {
                        metrics.record_transaction_retry(operation);
                    }
                    warn!(operation, error = %err, "transient storage failure; retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn log_report(run_id: &str, event: &WorkerEvent, report: &UpdateReport) {
    match report.disposition {
        UpdateDisposition::Applied => debug!(
            run_id,
            event_id = %event.event_id,
            kind = %event.kind,
            rows_affected = report.rows_affected,
            trades = report.trades_inserted,
            "event applied"
        ),
        UpdateDisposition::Stale => warn!(
            run_id,
            event_id = %event.event_id,
            observed_at = %event.observed_at,
            "event older than stored snapshot; metric fields kept"
        ),
        UpdateDisposition::Duplicate => debug!(
            run_id,
            event_id = %event.event_id,
            "event already applied"
        ),
        UpdateDisposition::Missing => {}
    }
}

impl std::fmt::Debug for ReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{encode_event, EventKind};
    use crate::test_support::VanishingWriter;
    use serde_json::json;
    use tso_common::RunStatus;
    use tso_persistence::RunStore;
    use tso_stream::StreamEntry;

    fn service() -> (Arc<RunStore>, ReconciliationService) {
        let store = Arc::new(RunStore::in_memory().unwrap());
        let registry = Arc::new(IdentityRegistry::new(store.clone(), None));
        (
            store.clone(),
            ReconciliationService::new(registry, store, RetryPolicy::default()),
        )
    }

    fn live_stats(run_id: &str, data: serde_json::Value) -> WorkerEvent {
        let entry = StreamEntry {
            id: 1,
            fields: encode_event(EventKind::LiveStats, run_id, &data, Some(Utc::now())),
        };
        WorkerEvent::parse(&entry, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn unseen_reporter_gets_placeholder_then_update() {
        let (store, service) = service();
        let event = live_stats("sim_42", json!({"net_pnl": 12.5, "total_trades": 3}));

        let outcome = service.apply(&event).await.unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert!(outcome.created);
        assert_eq!(outcome.disposition, UpdateDisposition::Applied);

        let record = store.get_run(&outcome.canonical_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.metrics.net_pnl, Some(12.5));
        assert_eq!(record.metrics.total_trades, Some(3));
    }

    #[tokio::test]
    async fn reapplying_event_changes_nothing() {
        let (store, service) = service();
        let event = live_stats("sim_7", json!({"final_capital": 100500.0}));
        let first = service.apply(&event).await.unwrap();
        let before = store.get_run(&first.canonical_id).unwrap().unwrap();

        let second = service.apply(&event).await.unwrap();
        assert_eq!(second.disposition, UpdateDisposition::Duplicate);
        assert!(!second.created);
        let after = store.get_run(&first.canonical_id).unwrap().unwrap();
        assert_eq!(before.metrics, after.metrics);
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn zero_row_retry_is_a_hard_error() {
        let store = Arc::new(RunStore::in_memory().unwrap());
        let registry = Arc::new(IdentityRegistry::new(store.clone(), None));
        let writer = Arc::new(VanishingWriter::new(store.clone()));
        let service = ReconciliationService::new(registry, writer.clone(), RetryPolicy::default());

        let event = live_stats("sim_gone", json!({"net_pnl": 4.0}));
        let err = service.apply(&event).await.unwrap_err();
        match err {
            OrchestrationError::StorageInconsistency { run_id, .. } => assert_eq!(run_id, "sim_gone"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(writer.updates(), 2);
        let record = store.get_run("sim_gone").unwrap().unwrap();
        assert_eq!(record.metrics.net_pnl, None);
    }
}
