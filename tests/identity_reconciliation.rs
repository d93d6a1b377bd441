//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "integration-tests"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Identity binding and idempotent reconciliation of worker reports."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tso_common::RunStatus;
use tso_core::{
    IdentityRegistry, ReconciliationService, ResolutionOrigin, RetryPolicy, WorkerEvent,
    REPORTER_HINT_KEY,
};
use tso_persistence::{RunStore, UpdateDisposition};
use tso_stream::{EventStream, StreamEntry};
use tso_testharness::{run_request, EventBuilder, Harness};

fn parse(fields: tso_stream::Fields) -> WorkerEvent {
    WorkerEvent::parse(&StreamEntry { id: 1, fields }, Utc::now()).unwrap()
}

#[tokio::test]
async fn unseen_reporter_gets_placeholder_before_update() {
    let harness = Harness::new().unwrap();
    let service = ReconciliationService::new(
        harness.orchestrator.registry().clone(),
        harness.store.clone(),
        RetryPolicy::default(),
    );

    let event = parse(
        EventBuilder::live_stats("sim_1718000000_ab12", json!({"net_pnl": -3.5, "total_trades": 1}))
            .build(),
    );
    let outcome = service.apply(&event).await.unwrap();
    assert_eq!(outcome.rows_affected, 1);
    assert!(outcome.created);
    assert_eq!(outcome.origin, ResolutionOrigin::Orphan);

    let record = harness.run(&outcome.canonical_id).unwrap();
    assert!(record.placeholder);
    assert_eq!(record.status, RunStatus::Running);
    assert!(record.config.is_none());
    assert_eq!(record.metrics.net_pnl, Some(-3.5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_identifier_binds_to_launched_run() {
    let harness = Harness::new().unwrap();
    let run_id = harness.launch(run_request(60)).await.unwrap();

    harness
        .publish(EventBuilder::live_stats("sim_worker_42", json!({"final_capital": 100120.0})).build())
        .await
        .unwrap();
    harness.drain().await.unwrap();

    let view = harness.orchestrator.get_run("sim_worker_42").unwrap();
    assert_eq!(view.record.run_id, run_id);
    assert_eq!(view.aliases, vec!["sim_worker_42".to_string()]);
    assert_eq!(view.record.metrics.final_capital, Some(100120.0));
    assert!(!harness.store.run_exists("sim_worker_42").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reporter_hint_wins_over_launch_order() {
    let harness = Harness::new().unwrap();
    let first = harness.launch(run_request(60)).await.unwrap();
    let mut hinted = run_request(60);
    hinted
        .metadata
        .insert(REPORTER_HINT_KEY.to_string(), json!("worker-b"));
    let second = harness.launch(hinted).await.unwrap();

    let resolution = harness
        .orchestrator
        .registry()
        .resolve("worker-b", Utc::now())
        .unwrap();
    assert_eq!(resolution.canonical_id, second);

    let resolution = harness
        .orchestrator
        .registry()
        .resolve("worker-a", Utc::now())
        .unwrap();
    assert_eq!(resolution.canonical_id, first);
}

#[tokio::test]
async fn bindings_survive_registry_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.sqlite");
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();

    let canonical = {
        let store = Arc::new(RunStore::open(&path, Duration::from_secs(1)).unwrap());
        let registry = IdentityRegistry::new(store.clone(), None);
        let run_id = registry.generate(now);
        store
            .insert_run(&run_id, &run_request(30).into_config(None), now)
            .unwrap();
        registry.expect_report(&run_id, None, now).unwrap();
        let first = registry.resolve("sim-restart", now).unwrap();
        assert_eq!(first.origin, ResolutionOrigin::Claimed);
        let again = registry.resolve("sim-restart", now).unwrap();
        assert_eq!(again.canonical_id, first.canonical_id);
        first.canonical_id
    };

    let store = Arc::new(RunStore::open(&path, Duration::from_secs(1)).unwrap());
    let registry = IdentityRegistry::new(store, None);
    let resolution = registry.resolve("sim-restart", Utc::now()).unwrap();
    assert_eq!(resolution.canonical_id, canonical);
    assert_eq!(resolution.origin, ResolutionOrigin::Alias);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redelivery_after_consumer_restart_changes_nothing() {
    let harness = Harness::new().unwrap();
    let run_id = harness.launch(run_request(60)).await.unwrap();
    let at = Utc::now();
    let fields = EventBuilder::live_stats(&run_id, json!({"net_pnl": 55.0, "win_rate": 0.6}))
        .at(at)
        .build();

    harness.publish(fields.clone()).await.unwrap();
    harness.drain().await.unwrap();
    let applied = harness.run(&run_id).unwrap();

    // Crash before acknowledgment: the entry is delivered but never acked.
    harness.publish(fields).await.unwrap();
    let config = &harness.config.stream;
    let delivered = harness
        .stream
        .read_group(
            &config.consumer_group,
            &config.consumer_name,
            10,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let report = harness.drain().await.unwrap();
    assert_eq!(report.acknowledged, 1);
    let replayed = harness.run(&run_id).unwrap();
    assert_eq!(applied.metrics, replayed.metrics);
    assert_eq!(applied.updated_at, replayed.updated_at);
    assert_eq!(applied.metrics_observed_at, replayed.metrics_observed_at);
    assert_eq!(harness.stream.info().await.unwrap().groups[0].pending, 0);
}

#[tokio::test]
async fn explicit_event_ids_deduplicate_trades() {
    let harness = Harness::new().unwrap();
    let service = ReconciliationService::new(
        harness.orchestrator.registry().clone(),
        harness.store.clone(),
        RetryPolicy::default(),
    );

    let trade = EventBuilder::trade("sim-trades", "t-100", "ETHUSDT", "BUY", 1.5, 3100.0)
        .event_id("evt-100");
    let first = service.apply(&parse(trade.clone().build())).await.unwrap();
    assert_eq!(first.trades_inserted, 1);
    let second = service.apply(&parse(trade.build())).await.unwrap();
    assert_eq!(second.disposition, UpdateDisposition::Duplicate);
    assert_eq!(second.rows_affected, 0);
    assert_eq!(harness.store.trades_for(&first.canonical_id).unwrap().len(), 1);
}
