//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Pipeline stage specification and resource manager bindings."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::fmt;
use std::process::Output;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tso_common::{OrchestrationConfig, ParamMap, RunConfig};

use crate::error::ResourceError;

/// One of the three pipeline worker roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DataSource,
    Algorithm,
    Simulator,
}

impl Stage {
    /// Start order; teardown runs in reverse.
    pub const ORDER: [Stage; 3] = [Stage::DataSource, Stage::Algorithm, Stage::Simulator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DataSource => "data_source",
            Stage::Algorithm => "algorithm",
            Stage::Simulator => "simulator",
        }
    }

    /// Container name prefix for the stage.
    pub fn container_prefix(&self) -> &'static str {
        match self {
            Stage::DataSource => "market-streamer",
            Stage::Algorithm => "order-book-algo",
            Stage::Simulator => "trade-simulator",
        }
    }

    pub fn container_name(&self, run_id: &str) -> String {
        format!("{}-{}", self.container_prefix(), run_id)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_source" => Ok(Stage::DataSource),
            "algorithm" => Ok(Stage::Algorithm),
            "simulator" => Ok(Stage::Simulator),
            other => Err(format!("unknown stage `{other}`")),
        }
    }
}

/// Everything needed to start one stage of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub run_id: String,
    pub stage: Stage,
    pub name: String,
    pub image: String,
    pub network: String,
    pub env: IndexMap<String, String>,
    /// How long the stage may take to report healthy.
    pub health_timeout: Duration,
}

impl StageSpec {
    pub fn for_run(
        run_id: &str,
        stage: Stage,
        config: &RunConfig,
        orchestration: &OrchestrationConfig,
    ) -> Self {
        let mut env = IndexMap::new();
        env.insert("SIMULATION_RUN_ID".to_string(), run_id.to_string());
        let image = match stage {
            Stage::DataSource => orchestration.images.data_source.clone(),
            Stage::Algorithm => {
                env.insert(
                    "STREAMING_SOURCE_IP".into(),
                    Stage::DataSource.container_name(run_id),
                );
                env.insert(
                    "STREAMING_SOURCE_PORT".into(),
                    orchestration.streamer_port.to_string(),
                );
                extend_env(&mut env, &config.algo_params);
                orchestration.images.algorithm.clone()
            }
            Stage::Simulator => {
                env.insert(
                    "ALGORITHM_SOURCE_IP".into(),
                    Stage::Algorithm.container_name(run_id),
                );
                env.insert(
                    "ALGORITHM_SOURCE_PORT".into(),
                    orchestration.algorithm_port.to_string(),
                );
                env.insert(
                    "SIMULATION_DURATION_SECS".into(),
                    config.duration_seconds.to_string(),
                );
                extend_env(&mut env, &config.simulator_params);
                orchestration.images.simulator.clone()
            }
        };
        Self {
            run_id: run_id.to_string(),
            stage,
            name: stage.container_name(run_id),
            image,
            network: format!("{}-{}", orchestration.network_prefix, run_id),
            env,
            health_timeout: orchestration.stage_start_timeout,
        }
    }
}

fn extend_env(env: &mut IndexMap<String, String>, params: &ParamMap) {
    for (key, value) in params {
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        env.insert(key.clone(), rendered);
    }
}

/// Opaque reference to a started stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageHandle {
    pub run_id: String,
    pub stage: Stage,
    pub id: String,
}

/// External collaborator that starts and stops pipeline stages.
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    /// Start a stage and return once it reports healthy.
    async fn start_stage(&self, spec: &StageSpec) -> Result<StageHandle, ResourceError>;

    /// Stop a stage. Stopping an already stopped or unknown handle succeeds.
    async fn stop_stage(&self, handle: &StageHandle) -> Result<(), ResourceError>;

    /// Release shared per-run resources after every stage is down.
    async fn release_run(&self, _run_id: &str, _network: &str) -> Result<(), ResourceError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), ResourceError>;
}

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerResourceManager {
    binary: String,
    poll_interval: Duration,
}

impl DockerResourceManager {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            poll_interval: HEALTH_POLL_INTERVAL,
        }
    }

    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self::new(config.docker_binary.clone())
    }

    async fn docker(&self, args: &[&str]) -> Result<Output, ResourceError> {
        debug!(binary = %self.binary, ?args, "invoking docker");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    async fn docker_ok(&self, args: &[&str]) -> Result<String, ResourceError> {
        let output = self.docker(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(command_error(&self.binary, args, &output))
        }
    }

    async fn ensure_network(&self, network: &str) -> Result<(), ResourceError> {
        if self.docker(&["network", "inspect", network]).await?.status.success() {
            return Ok(());
        }
        let output = self.docker(&["network", "create", network]).await?;
        if output.status.success() || stderr_of(&output).contains("already exists") {
            return Ok(());
        }
        Err(command_error(&self.binary, &["network", "create", network], &output))
    }

    async fn remove_container(&self, name: &str) -> Result<(), ResourceError> {
        let output = self.docker(&["rm", "-f", name]).await?;
        if output.status.success() || is_missing(&output) {
            return Ok(());
        }
        Err(command_error(&self.binary, &["rm", "-f", name], &output))
    }

    async fn wait_healthy(&self, name: &str, timeout: Duration) -> Result<(), ResourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self
                .docker_ok(&[
                    "inspect",
                    "-f",
                    "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{end}}",
                    name,
                ])
                .await?;
            let mut parts = state.split_whitespace();
            let status = parts.next().unwrap_or_default();
            let health = parts.next();
            match (status, health) {
                ("running", None) | ("running", Some("healthy")) => return Ok(()),
                ("exited", _) | ("dead", _) | (_, Some("unhealthy")) => {
                    return Err(ResourceError::Exited {
                        name: name.to_string(),
                        state: state.clone(),
                    })
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ResourceError::Timeout {
                    what: format!("health check of {name}"),
                    after: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ResourceManager for DockerResourceManager {
    async fn start_stage(&self, spec: &StageSpec) -> Result<StageHandle, ResourceError> {
        self.ensure_network(&spec.network).await?;
        // A container left over from an earlier attempt would block the name.
        self.remove_container(&spec.name).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let mut args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            spec.name.as_str(),
            "--network",
            spec.network.as_str(),
            "--label",
            "tso.managed=true",
        ];
        for pair in &env {
            args.push("-e");
            args.push(pair.as_str());
        }
        args.push(spec.image.as_str());

        let container_id = self.docker_ok(&args).await?;
        info!(
            run_id = %spec.run_id,
            stage = %spec.stage,
            container = %spec.name,
            container_id = %container_id,
            "stage container started"
        );

        if let Err(err) = self.wait_healthy(&spec.name, spec.health_timeout).await {
            if let Err(cleanup) = self.remove_container(&spec.name).await {
                warn!(container = %spec.name, error = %cleanup, "failed to remove unhealthy container");
            }
            return Err(err);
        }

        Ok(StageHandle {
            run_id: spec.run_id.clone(),
            stage: spec.stage,
            id: spec.name.clone(),
        })
    }

    async fn stop_stage(&self, handle: &StageHandle) -> Result<(), ResourceError> {
        self.remove_container(&handle.id).await?;
        info!(run_id = %handle.run_id, stage = %handle.stage, container = %handle.id, "stage container removed");
        Ok(())
    }

    async fn release_run(&self, run_id: &str, network: &str) -> Result<(), ResourceError> {
        let output = self.docker(&["network", "rm", network]).await?;
        if output.status.success() || is_missing(&output) {
            debug!(run_id, network, "run network released");
            return Ok(());
        }
        Err(command_error(&self.binary, &["network", "rm", network], &output))
    }

    async fn ping(&self) -> Result<(), ResourceError> {
        self.docker_ok(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
            .map_err(|err| ResourceError::Unreachable(err.to_string()))
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing(output: &Output) -> bool {
    let stderr = stderr_of(output).to_lowercase();
    stderr.contains("no such container") || stderr.contains("not found")
}

fn command_error(binary: &str, args: &[&str], output: &Output) -> ResourceError {
    ResourceError::Command {
        command: format!("{} {}", binary, args.join(" ")),
        status: output.status.to_string(),
        stderr: stderr_of(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tso_common::RunRequest;

    #[test]
    fn specs_wire_stages_together() {
        let orchestration = OrchestrationConfig::default();
        let mut request = RunRequest::new("order_book_imbalance", "v1.0.0", 90);
        request
            .algo_params
            .insert("IMBALANCE_THRESHOLD".into(), Value::from(0.7));
        let config = request.into_config(None);
        let run_id = "run_2024_01_01_000000_deadbeef";

        let source = StageSpec::for_run(run_id, Stage::DataSource, &config, &orchestration);
        assert_eq!(source.name, "market-streamer-run_2024_01_01_000000_deadbeef");
        assert_eq!(source.network, "trading-network-run_2024_01_01_000000_deadbeef");
        assert_eq!(source.env.len(), 1);

        let algo = StageSpec::for_run(run_id, Stage::Algorithm, &config, &orchestration);
        assert_eq!(
            algo.env["STREAMING_SOURCE_IP"],
            "market-streamer-run_2024_01_01_000000_deadbeef"
        );
        assert_eq!(algo.env["STREAMING_SOURCE_PORT"], "8888");
        assert_eq!(algo.env["IMBALANCE_THRESHOLD"], "0.7");

        let sim = StageSpec::for_run(run_id, Stage::Simulator, &config, &orchestration);
        assert_eq!(sim.env["ALGORITHM_SOURCE_PORT"], "9999");
        assert_eq!(sim.env["SIMULATION_DURATION_SECS"], "90");
        assert_eq!(sim.env["ENABLE_SHORTING"], "true");
        assert_eq!(sim.image, "trade-simulator:latest");
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ORDER {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("gateway".parse::<Stage>().is_err());
    }

    #[tokio::test]
    async fn missing_docker_binary_is_unreachable() {
        let manager = DockerResourceManager::new("/nonexistent/tso-docker");
        let err = manager.ping().await.unwrap_err();
        assert!(matches!(err, ResourceError::Unreachable(_)));
    }
}
