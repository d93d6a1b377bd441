//! ---
//! tso_section: "03-persistence-logging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Persistence abstractions and storage bindings."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::relational::UpdateDisposition;
use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    runs_inserted: IntCounterVec,
    updates: IntCounterVec,
    transaction_retries: IntCounterVec,
    transaction_duration: HistogramVec,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let runs_inserted = IntCounterVec::new(
            Opts::new(
                "tso_runs_inserted_total",
                "Run rows created, labelled by origin (request or placeholder)",
            ),
            &["origin"],
        )?;
        registry.register(Box::new(runs_inserted.clone()))?;

        let updates = IntCounterVec::new(
            Opts::new(
                "tso_run_updates_total",
                "Metric update attempts by disposition",
            ),
            &["disposition"],
        )?;
        registry.register(Box::new(updates.clone()))?;

        let transaction_retries = IntCounterVec::new(
            Opts::new(
                "tso_storage_transaction_retries_total",
                "Storage operations retried after a transient failure",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(transaction_retries.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "tso_storage_transaction_seconds",
            "Duration of relational store transactions",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 12)?);
        let transaction_duration = HistogramVec::new(histogram_opts, &["operation"])?;
        registry.register(Box::new(transaction_duration.clone()))?;

        Ok(Self {
            runs_inserted,
            updates,
            transaction_retries,
            transaction_duration,
            registry,
        })
    }

    /// Count a newly inserted run row.
    pub fn record_run_inserted(&self, origin: &str) {
        self.runs_inserted.with_label_values(&[origin]).inc();
    }

    /// Count the disposition of a metric update.
    pub fn record_update(&self, disposition: UpdateDisposition) {
        self.updates
            .with_label_values(&[disposition.as_str()])
            .inc();
    }

    /// Count a retry of a storage operation.
    pub fn record_transaction_retry(&self, operation: &str) {
        self.transaction_retries
            .with_label_values(&[operation])
            .inc();
    }

    /// Observe how long a storage transaction took.
    pub fn observe_transaction(&self, operation: &str, seconds: f64) {
        self.transaction_duration
            .with_label_values(&[operation])
            .observe(seconds);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
