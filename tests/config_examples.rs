//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "integration-tests"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Validation of shipped configuration and request examples."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use tso_common::{AppConfig, LogFormat, RunRequest, StreamBackend};

fn read(path: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let full = Path::new(manifest_dir).join("..").join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn example_config_parses_and_validates() {
    let raw = read("configs/tsod.example.toml");
    assert!(raw.starts_with("# ---"), "example config must carry frontmatter");

    let config: AppConfig = toml::from_str(&raw).expect("example config parses");
    config.validate().expect("example config validates");
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert_eq!(config.stream.backend, StreamBackend::File);
    assert_eq!(config.stream.stream_name, "trading-stats");
    assert_eq!(config.stream.consumer_group, "trading-api-group");
    assert_eq!(config.stream.block_timeout, Duration::from_millis(1_000));
    assert_eq!(config.orchestration.stage_start_timeout, Duration::from_secs(60));
    assert_eq!(
        config.orchestration.required_simulator_params,
        vec!["INITIAL_CAPITAL".to_string()]
    );
}

#[test]
fn example_config_is_loadable_from_disk() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/tsod.example.toml");
    let loaded = AppConfig::load_with_source(&[path.clone()]).expect("config loads");
    assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
}

#[test]
fn example_run_request_satisfies_example_config() {
    let config: AppConfig = toml::from_str(&read("configs/tsod.example.toml")).unwrap();
    let request: RunRequest =
        serde_json::from_str(&read("configs/run-request.example.json")).expect("request parses");

    let missing = request.missing_fields(
        &config.orchestration.required_algo_params,
        &config.orchestration.required_simulator_params,
    );
    assert!(missing.is_empty(), "missing: {missing:?}");

    let effective = request.into_config(None);
    assert_eq!(effective.algo_params["IMBALANCE_THRESHOLD"], serde_json::json!(0.65));
    assert!(effective.algo_params.contains_key("SIGNAL_COOLDOWN_MS"));
    assert!(effective.simulator_params.contains_key("TRADING_FEE_PCT"));
}

#[test]
fn missing_config_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load_with_source(&[dir.path().join("absent.toml")]).unwrap_err();
    assert!(err.to_string().contains("no configuration files found"));
}
