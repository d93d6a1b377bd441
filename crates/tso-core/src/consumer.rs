//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Long-lived consumer applying stream entries through reconciliation."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Entries are acknowledged only after their write is committed. A transient
//! failure stops the batch without acknowledging, and the consumer re-drains
//! its pending entries before reading new ones so stream order is kept.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tso_common::StreamConfig;
use tso_metrics::OrchestratorMetrics;
use tso_persistence::UpdateDisposition;
use tso_stream::{EntryId, EventStream, GroupCreation, StreamEntry};

use crate::error::{OrchestrationError, Result};
use crate::event::{EventKind, WorkerEvent};
use crate::lifecycle::LifecycleManager;
use crate::reconcile::{ApplyOutcome, ReconciliationService};

/// Running totals kept by the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumerStats {
    pub processed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub acknowledged: u64,
    pub reconnects: u64,
    pub by_type: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    pub last_entry_id: Option<EntryId>,
    pub last_entry_at: Option<DateTime<Utc>>,
}

/// Result of processing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub handled: usize,
    pub acknowledged: usize,
    /// A transient failure left the rest of the batch unacknowledged.
    pub interrupted: bool,
}

impl BatchReport {
    /// Fold another batch into this running total.
    pub fn absorb(&mut self, other: BatchReport) {
        self.handled += other.handled;
        self.acknowledged += other.acknowledged;
        self.interrupted |= other.interrupted;
    }
}

enum EntryOutcome {
    Applied(Box<ApplyOutcome>),
    Rejected(String),
    /// Permanent failure; the entry is acknowledged so it cannot block the stream.
    Failed(OrchestrationError),
    /// Transient failure; the entry stays pending.
    Retry(OrchestrationError),
}

pub struct StreamConsumer {
    stream: Arc<dyn EventStream>,
    reconciler: Arc<ReconciliationService>,
    lifecycle: Option<Arc<LifecycleManager>>,
    config: StreamConfig,
    stats: Mutex<ConsumerStats>,
    metrics: Option<OrchestratorMetrics>,
}

impl StreamConsumer {
    pub fn new(
        stream: Arc<dyn EventStream>,
        reconciler: Arc<ReconciliationService>,
        lifecycle: Option<Arc<LifecycleManager>>,
        config: StreamConfig,
        metrics: Option<OrchestratorMetrics>,
    ) -> Self {
        Self {
            stream,
            reconciler,
            lifecycle,
            config,
            stats: Mutex::new(ConsumerStats::default()),
            metrics,
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().clone()
    }

    /// Ensure the group exists, then replay entries left pending by an earlier run.
    ///
    /// The report totals every replayed batch; `interrupted` is set when
    /// draining stopped on a transient failure.
    pub async fn prepare(&self) -> Result<BatchReport> {
        let group = &self.config.consumer_group;
        match self.stream.ensure_group(group).await? {
            GroupCreation::Created => info!(
                stream = %self.stream.name(),
                group = %group,
                "consumer group created at start of stream"
            ),
            GroupCreation::AlreadyExists => debug!(group = %group, "consumer group exists"),
        }

        let mut total = BatchReport::default();
        loop {
            let pending = self
                .stream
                .read_pending(group, &self.config.consumer_name, self.config.batch_size)
                .await?;
            if pending.is_empty() {
                return Ok(total);
            }
            info!(count = pending.len(), "replaying pending entries");
            let report = self.process_batch(pending).await?;
            total.absorb(report);
            if report.interrupted || report.acknowledged == 0 {
                return Ok(total);
            }
        }
    }

    /// Read and process one batch of new entries, waiting at most `block`.
    pub async fn poll_once(&self, block: Duration) -> Result<BatchReport> {
        let entries = self
            .stream
            .read_group(
                &self.config.consumer_group,
                &self.config.consumer_name,
                self.config.batch_size,
                block,
            )
            .await?;
        self.process_batch(entries).await
    }

    /// Process entries in order, acknowledging each one once it is durable.
    pub async fn process_batch(&self, entries: Vec<StreamEntry>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for entry in entries {
            let outcome = self.handle(&entry).await;
            report.handled += 1;
            let label = match &outcome {
                EntryOutcome::Applied(applied) => applied.disposition.as_str(),
                EntryOutcome::Rejected(_) => "rejected",
                EntryOutcome::Failed(_) => "failed",
                EntryOutcome::Retry(_) => "retry",
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_stream_entry(label);
            }

            match outcome {
                EntryOutcome::Retry(err) => {
                    warn!(entry_id = entry.id, error = %err, "entry left pending after transient failure");
                    self.record_error(&err);
                    report.interrupted = true;
                    break;
                }
                EntryOutcome::Rejected(reason) => {
                    warn!(entry_id = entry.id, reason = %reason, "rejected malformed entry");
                    self.stats.lock().rejected += 1;
                }
                EntryOutcome::Failed(err) => {
                    error!(entry_id = entry.id, error = %err, "entry failed permanently");
                    self.record_error(&err);
                }
                EntryOutcome::Applied(_) => {}
            }

            let acked = self
                .stream
                .ack(&self.config.consumer_group, &[entry.id])
                .await?;
            report.acknowledged += acked;
            let mut stats = self.stats.lock();
            stats.acknowledged += acked as u64;
            stats.last_entry_id = Some(entry.id);
            stats.last_entry_at = Some(Utc::now());
        }
        Ok(report)
    }

    async fn handle(&self, entry: &StreamEntry) -> EntryOutcome {
        let event = match WorkerEvent::parse(entry, Utc::now()) {
            Ok(event) => event,
            Err(err) => return EntryOutcome::Rejected(err.to_string()),
        };

        match self.reconciler.apply(&event).await {
            Ok(applied) => {
                {
                    let mut stats = self.stats.lock();
                    stats.processed += 1;
                    *stats.by_type.entry(event.kind.as_str().to_string()).or_default() += 1;
                }
                if applied.disposition == UpdateDisposition::Stale {
                    debug!(entry_id = entry.id, run_id = %applied.canonical_id, "stale snapshot");
                }
                self.signal_lifecycle(&event, &applied.canonical_id).await;
                EntryOutcome::Applied(Box::new(applied))
            }
            Err(err) if err.is_transient() => EntryOutcome::Retry(err),
            Err(err) => {
                if let OrchestrationError::StorageInconsistency { run_id, .. } = &err {
                    if let Some(lifecycle) = &self.lifecycle {
                        if let Err(fail_err) = lifecycle.fail(run_id, &err.to_string()).await {
                            warn!(run_id = %run_id, error = %fail_err, "could not fail inconsistent run");
                        }
                    }
                }
                EntryOutcome::Failed(err)
            }
        }
    }

    /// Completion and stage failures drive the run state machine.
    async fn signal_lifecycle(&self, event: &WorkerEvent, run_id: &str) {
        let Some(lifecycle) = &self.lifecycle else {
            return;
        };
        let result = match event.kind {
            EventKind::FinalResults => lifecycle.complete(run_id).await,
            EventKind::StageError => {
                let failure = event.stage_failure().unwrap_or_else(|| crate::event::StageFailure {
                    stage: "unknown".into(),
                    message: "stage reported a fatal error".into(),
                });
                let reason = format!("stage {} reported: {}", failure.stage, failure.message);
                lifecycle.fail(run_id, &reason).await
            }
            EventKind::LiveStats | EventKind::TradeEvent => return,
        };
        if let Err(err) = result {
            warn!(run_id, kind = %event.kind, error = %err, "lifecycle signal not applied");
        }
    }

    fn record_error(&self, err: &OrchestrationError) {
        let mut stats = self.stats.lock();
        stats.failed += 1;
        stats.last_error = Some(err.to_string());
    }

    /// Consume until `shutdown` flips to `true`, finishing the current batch first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let base_delay = self.config.reconnect_delay;
        let mut delay = base_delay;
        let mut ready = false;
        info!(
            stream = %self.stream.name(),
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "stream consumer starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let step = if ready {
                let read = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    read = self.stream.read_group(
                        &self.config.consumer_group,
                        &self.config.consumer_name,
                        self.config.batch_size,
                        self.config.block_timeout,
                    ) => read,
                };
                match read {
                    Ok(entries) => self.process_batch(entries).await.map(|r| r.interrupted),
                    Err(err) => Err(err.into()),
                }
            } else {
                self.prepare().await.map(|report| report.interrupted)
            };

            match step {
                Ok(false) => {
                    ready = true;
                    delay = base_delay;
                    continue;
                }
                Ok(true) => {
                    ready = false;
                }
                Err(err) => {
                    ready = false;
                    self.stats.lock().reconnects += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_stream_reconnect();
                    }
                    warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "stream consumer backing off");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay.max(base_delay));
        }

        info!("stream consumer stopped");
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self: Arc<Self>) -> ConsumerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });
        ConsumerHandle { shutdown, task }
    }
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("stream", &self.stream.name())
            .field("group", &self.config.consumer_group)
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Request shutdown and wait for the current batch to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => Ok(result?),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::encode_event;
    use crate::identity::IdentityRegistry;
    use crate::reconcile::RetryPolicy;
    use crate::test_support::{RecordingResources, VanishingWriter};
    use serde_json::json;
    use tso_common::{OrchestrationConfig, RunRequest, RunStatus};
    use tso_persistence::RunStore;
    use tso_stream::{Fields, MemoryStream};

    fn consumer(stream: Arc<MemoryStream>) -> (Arc<RunStore>, StreamConsumer) {
        let store = Arc::new(RunStore::in_memory().unwrap());
        let registry = Arc::new(IdentityRegistry::new(store.clone(), None));
        let reconciler = Arc::new(ReconciliationService::new(
            registry,
            store.clone(),
            RetryPolicy::default(),
        ));
        let config = StreamConfig {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            block_timeout: Duration::from_millis(20),
            ..StreamConfig::default()
        };
        (store, StreamConsumer::new(stream, reconciler, None, config, None))
    }

    fn garbage() -> Fields {
        let mut fields = Fields::new();
        fields.insert("type".into(), "live_stats".into());
        fields
    }

    #[tokio::test]
    async fn malformed_entries_are_acked_and_counted() {
        let stream = Arc::new(MemoryStream::new("trading-stats"));
        let (store, consumer) = consumer(stream.clone());
        assert!(!consumer.prepare().await.unwrap().interrupted);

        stream.append(garbage()).await.unwrap();
        stream
            .append(encode_event(EventKind::LiveStats, "sim-a", &json!({"net_pnl": 2.0}), None))
            .await
            .unwrap();

        let report = consumer.poll_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(report.handled, 2);
        assert_eq!(report.acknowledged, 2);
        let stats = consumer.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.by_type.get("live_stats"), Some(&1));
        assert_eq!(store.get_run("sim-a").unwrap().unwrap().metrics.net_pnl, Some(2.0));

        let info = stream.info().await.unwrap();
        assert_eq!(info.groups[0].pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn survives_outage_and_stops_gracefully() {
        let stream = Arc::new(MemoryStream::new("trading-stats"));
        let (store, consumer) = consumer(stream.clone());
        stream.set_available(false);
        let consumer = Arc::new(consumer);
        let handle = consumer.clone().spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        stream.set_available(true);
        stream
            .append(encode_event(EventKind::LiveStats, "sim-b", &json!({"total_trades": 4}), None))
            .await
            .unwrap();

        let mut applied = false;
        for _ in 0..100 {
            if store.run_exists("sim-b").unwrap() {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied);
        handle.shutdown().await.unwrap();
        assert!(consumer.stats().reconnects >= 1);
    }

    #[tokio::test]
    async fn storage_inconsistency_fails_run_and_acks_entry() {
        let stream = Arc::new(MemoryStream::new("trading-stats"));
        let store = Arc::new(RunStore::in_memory().unwrap());
        let config = RunRequest::new("order_book", "v1.0.0", 60).into_config(None);
        store.insert_run("run-1", &config, Utc::now()).unwrap();
        store
            .transition("run-1", RunStatus::Running, None, Utc::now())
            .unwrap();

        let registry = Arc::new(IdentityRegistry::new(store.clone(), None));
        let writer = Arc::new(VanishingWriter::new(store.clone()));
        let reconciler = Arc::new(ReconciliationService::new(
            registry,
            writer.clone(),
            RetryPolicy::default(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            None,
            Arc::new(RecordingResources::default()),
            OrchestrationConfig::default(),
            None,
        ));
        let consumer = StreamConsumer::new(
            stream.clone(),
            reconciler,
            Some(lifecycle),
            StreamConfig::default(),
            None,
        );
        consumer.prepare().await.unwrap();

        stream
            .append(encode_event(EventKind::LiveStats, "run-1", &json!({"net_pnl": 3.0}), None))
            .await
            .unwrap();
        let report = consumer.poll_once(Duration::from_millis(10)).await.unwrap();
        assert_eq!(report.handled, 1);
        assert_eq!(report.acknowledged, 1);
        assert!(!report.interrupted);
        assert_eq!(writer.updates(), 2);

        let stats = consumer.stats();
        assert_eq!(stats.failed, 1);
        assert!(stats.last_error.unwrap().contains("storage inconsistency"));

        let record = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error_message.unwrap().contains("storage inconsistency"));
        assert_eq!(record.metrics.net_pnl, None);
        assert_eq!(stream.info().await.unwrap().groups[0].pending, 0);
    }
}
