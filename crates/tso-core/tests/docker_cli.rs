//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Docker resource manager driven against a scripted docker binary."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tso_common::{OrchestrationConfig, RunRequest, RunStatus};
use tso_core::{DockerResourceManager, LifecycleManager, OrchestrationError, Stage};
use tso_persistence::RunStore;

/// Accepts every command and reports every container as still `created`.
fn scripted_docker(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let log = dir.join("docker.log");
    let script = dir.join("docker");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             echo \"$*\" >> '{log}'\n\
             case \"$1\" in\n\
               run) echo 0123456789ab ;;\n\
               inspect) echo created ;;\n\
             esac\n\
             exit 0\n",
            log = log.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

#[tokio::test]
async fn unhealthy_stage_container_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (script, log) = scripted_docker(dir.path());
    let config = OrchestrationConfig {
        stage_start_timeout: Duration::from_secs(1),
        docker_binary: script.display().to_string(),
        ..OrchestrationConfig::default()
    };

    let store = Arc::new(RunStore::in_memory().unwrap());
    let manager = Arc::new(LifecycleManager::new(
        store.clone(),
        None,
        Arc::new(DockerResourceManager::from_config(&config)),
        config.clone(),
        None,
    ));
    let run = RunRequest::new("order_book_imbalance", "v1.0.0", 60).into_config(None);
    store.insert_run("run-1", &run, Utc::now()).unwrap();

    let err = manager.launch("run-1", &run).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::StageStartFailed {
            stage: Stage::DataSource,
            ..
        }
    ));

    let calls = fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = calls.lines().collect();
    let container = Stage::DataSource.container_name("run-1");
    let started = lines
        .iter()
        .position(|line| line.starts_with("run -d") && line.contains(&container))
        .expect("container was started");
    let removed = format!("rm -f {container}");
    assert!(
        lines[started + 1..].iter().any(|line| *line == removed),
        "{calls}"
    );
    assert!(!calls.contains(&Stage::Algorithm.container_name("run-1")));

    let record = store.get_run("run-1").unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.error_message.unwrap().contains("data_source"));
}
