//! ---
//! tso_section: "03-persistence-logging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Integration tests for the relational and document stores."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prometheus::Registry;
use serde_json::json;
use tempfile::tempdir;
use tso_common::run::{PositionRecord, RunMetrics, RunRequest, RunStatus, TradeRecord};
use tso_persistence::{PersistenceMetrics, RunStore, RunUpdate};

fn trade(id: &str, ts: i64) -> TradeRecord {
    TradeRecord::from_payload(&json!({
        "id": id, "symbol": "BTCUSDT", "side": "BUY", "quantity": 0.1, "price": 42000.0,
        "timestamp": ts, "fees": 4.2
    }))
    .unwrap()
}

#[test]
fn aliases_and_runs_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("runs.sqlite3");
    let now = Utc::now();
    {
        let store = RunStore::open(&path, Duration::from_secs(1)).unwrap();
        let config = RunRequest::new("order_book_imbalance", "v1.0.0", 120).into_config(None);
        store.insert_run("run_2024_01_01_000000_abcd1234", &config, now).unwrap();
        store
            .bind_alias("worker-17", "run_2024_01_01_000000_abcd1234", now)
            .unwrap();
    }

    let reopened = RunStore::open(&path, Duration::from_secs(1)).unwrap();
    assert_eq!(
        reopened.lookup_alias("worker-17").unwrap().as_deref(),
        Some("run_2024_01_01_000000_abcd1234")
    );
    let record = reopened
        .get_run("run_2024_01_01_000000_abcd1234")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Pending);
}

#[test]
fn trades_are_inserted_once_and_positions_upserted() {
    let store = RunStore::in_memory().unwrap();
    let now = Utc::now();
    store.insert_placeholder("run-t", now).unwrap();

    let mut update = RunUpdate::metrics("final-1", now, RunMetrics::default());
    update.trades = vec![trade("1", 10), trade("2", 20)];
    update.positions = vec![PositionRecord::from_payload(
        "BTCUSDT",
        &json!({"quantity": 0.2, "avg_price": 41000.0}),
    )];
    let report = store.apply_update("run-t", &update).unwrap();
    assert_eq!(report.rows_affected, 1);
    assert_eq!(report.trades_inserted, 2);
    assert_eq!(report.positions_upserted, 1);

    let mut redelivered = update.clone();
    redelivered.event_id = "final-1-again".into();
    redelivered.observed_at = now + chrono::Duration::seconds(1);
    redelivered.positions[0].quantity = 0.3;
    let report = store.apply_update("run-t", &redelivered).unwrap();
    assert_eq!(report.trades_inserted, 0);
    assert_eq!(report.positions_upserted, 1);

    assert_eq!(store.trades_for("run-t").unwrap().len(), 2);
    let positions = store.positions_for("run-t").unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, 0.3);
}

#[test]
fn adopt_orphan_creates_placeholder_once() {
    let store = RunStore::in_memory().unwrap();
    let now = Utc::now();
    let (bound, created) = store.adopt_orphan("sim-42", "sim-42", now).unwrap();
    assert_eq!(bound, "sim-42");
    assert!(created);
    let (bound, created) = store.adopt_orphan("sim-42", "sim-42", now).unwrap();
    assert_eq!(bound, "sim-42");
    assert!(!created);

    let record = store.get_run("sim-42").unwrap().unwrap();
    assert!(record.placeholder);
    assert_eq!(record.status, RunStatus::Running);
    assert!(record.config.is_none());
    assert_eq!(record.metrics, RunMetrics::default());
}

#[test]
fn persistence_metrics_capture_activity() {
    let registry = Arc::new(Registry::new());
    let metrics = PersistenceMetrics::new(registry.clone()).unwrap();
    let store = RunStore::in_memory().unwrap().with_metrics(metrics);
    let now = Utc::now();

    store.insert_placeholder("run-m", now).unwrap();
    let update = RunUpdate::metrics(
        "evt",
        now,
        RunMetrics {
            net_pnl: Some(1.5),
            ..RunMetrics::default()
        },
    );
    store.apply_update("run-m", &update).unwrap();
    store.apply_update("run-m", &update).unwrap();
    store.apply_update("ghost", &update).unwrap();

    let families = registry.gather();
    assert_eq!(metric_total(&families, "tso_runs_inserted_total"), 1.0);
    assert_eq!(metric_total(&families, "tso_run_updates_total"), 3.0);
    assert!(metric_histogram_count(&families, "tso_storage_transaction_seconds") >= 4.0);
    assert!(store.metrics().is_some());
}

fn metric_total(families: &[prometheus::proto::MetricFamily], name: &str) -> f64 {
    families
        .iter()
        .find(|family| family.get_name() == name)
        .map(|family| {
            family
                .get_metric()
                .iter()
                .map(|metric| metric.get_counter().get_value())
                .sum()
        })
        .unwrap_or_default()
}

fn metric_histogram_count(families: &[prometheus::proto::MetricFamily], name: &str) -> f64 {
    families
        .iter()
        .find(|family| family.get_name() == name)
        .map(|family| {
            family
                .get_metric()
                .iter()
                .map(|metric| metric.get_histogram().get_sample_count() as f64)
                .sum()
        })
        .unwrap_or_default()
}
