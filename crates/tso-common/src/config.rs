//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Shared primitives and utilities for the orchestration runtime."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9899))
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("target/tso/runs.sqlite3")
}

fn default_document_root() -> PathBuf {
    PathBuf::from("target/tso/documents")
}

fn default_busy_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_transaction_retries() -> u32 {
    1
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_stream_backend() -> StreamBackend {
    StreamBackend::File
}

fn default_stream_path() -> PathBuf {
    PathBuf::from("target/tso/streams")
}

fn default_stream_name() -> String {
    "trading-stats".to_owned()
}

fn default_consumer_group() -> String {
    "trading-api-group".to_owned()
}

fn default_consumer_name() -> String {
    "trading-api-consumer".to_owned()
}

fn default_batch_size() -> usize {
    10
}

fn default_block_timeout() -> Duration {
    Duration::from_millis(1_000)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(5_000)
}

fn default_max_reconnect_delay() -> Duration {
    Duration::from_millis(60_000)
}

fn default_stage_start_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_teardown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_completion_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_docker_binary() -> String {
    "docker".to_owned()
}

fn default_network_prefix() -> String {
    "trading-network".to_owned()
}

fn default_streamer_port() -> u16 {
    8888
}

fn default_algorithm_port() -> u16 {
    9999
}

/// Primary configuration object for the orchestrator daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "TSO_CONFIG";

    /// Load configuration from disk, respecting the `TSO_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    ///
    /// Fails when neither the environment override nor any candidate exists.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Some(loaded) = Self::discover(candidates)? {
            return Ok(loaded);
        }
        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Like [`AppConfig::load_with_source`] but falls back to defaults when no file exists.
    pub fn load_or_default<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        match Self::discover(candidates)? {
            Some(loaded) => Ok(loaded),
            None => {
                let config = AppConfig::default();
                config.validate()?;
                Ok(LoadedAppConfig {
                    config,
                    source: None,
                })
            }
        }
    }

    fn discover<P: AsRef<Path>>(candidates: &[P]) -> Result<Option<LoadedAppConfig>> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedAppConfig {
                    config,
                    source: Some(path),
                }));
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedAppConfig {
                    config,
                    source: Some(path),
                }));
            }
        }
        Ok(None)
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.stream.validate()?;
        self.orchestration.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Relational and document store settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. `:memory:` keeps everything in process.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,
    #[serde(default = "default_busy_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub busy_timeout: Duration,
    /// Additional attempts after a transient transaction failure.
    #[serde(default = "default_transaction_retries")]
    pub transaction_retries: u32,
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            document_root: default_document_root(),
            busy_timeout: default_busy_timeout(),
            transaction_retries: default_transaction_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.busy_timeout.is_zero() {
            return Err(anyhow!("storage.busy_timeout must be greater than zero"));
        }
        if self.sqlite_path.as_os_str().is_empty() {
            return Err(anyhow!("storage.sqlite_path must not be empty"));
        }
        Ok(())
    }
}

/// Which event stream implementation the daemon consumes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    #[default]
    File,
    Memory,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_backend")]
    pub backend: StreamBackend,
    /// Directory holding the file-backed stream logs.
    #[serde(default = "default_stream_path")]
    pub path: PathBuf,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_block_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub block_timeout: Duration,
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_max_reconnect_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: default_stream_backend(),
            path: default_stream_path(),
            stream_name: default_stream_name(),
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
            batch_size: default_batch_size(),
            block_timeout: default_block_timeout(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_delay: default_max_reconnect_delay(),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(anyhow!("stream.stream_name must not be empty"));
        }
        if self.consumer_group.trim().is_empty() || self.consumer_name.trim().is_empty() {
            return Err(anyhow!(
                "stream.consumer_group and stream.consumer_name must not be empty"
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("stream.batch_size must be at least 1"));
        }
        if self.block_timeout.is_zero() {
            return Err(anyhow!("stream.block_timeout must be greater than zero"));
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(anyhow!(
                "stream.max_reconnect_delay must not be smaller than stream.reconnect_delay"
            ));
        }
        Ok(())
    }
}

/// Container images launched for each pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageImages {
    pub data_source: String,
    pub algorithm: String,
    pub simulator: String,
}

impl Default for StageImages {
    fn default() -> Self {
        Self {
            data_source: "market-streamer:latest".to_owned(),
            algorithm: "order-book-algo:latest".to_owned(),
            simulator: "trade-simulator:latest".to_owned(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Bounded wait for a stage container to report healthy.
    #[serde(default = "default_stage_start_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stage_start_timeout: Duration,
    #[serde(default = "default_teardown_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub teardown_timeout: Duration,
    /// Added to a run's duration before the watchdog completes it.
    #[serde(default = "default_completion_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub completion_grace: Duration,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
    #[serde(default = "default_streamer_port")]
    pub streamer_port: u16,
    #[serde(default = "default_algorithm_port")]
    pub algorithm_port: u16,
    #[serde(default)]
    pub images: StageImages,
    /// Parameter keys every run request must carry for the algorithm stage.
    #[serde(default)]
    pub required_algo_params: Vec<String>,
    #[serde(default)]
    pub required_simulator_params: Vec<String>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            stage_start_timeout: default_stage_start_timeout(),
            teardown_timeout: default_teardown_timeout(),
            completion_grace: default_completion_grace(),
            max_concurrent_runs: default_max_concurrent_runs(),
            docker_binary: default_docker_binary(),
            network_prefix: default_network_prefix(),
            streamer_port: default_streamer_port(),
            algorithm_port: default_algorithm_port(),
            images: StageImages::default(),
            required_algo_params: Vec::new(),
            required_simulator_params: Vec::new(),
        }
    }
}

impl OrchestrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_runs == 0 {
            return Err(anyhow!(
                "orchestration.max_concurrent_runs must be at least 1"
            ));
        }
        if self.stage_start_timeout.is_zero() {
            return Err(anyhow!(
                "orchestration.stage_start_timeout must be greater than zero"
            ));
        }
        if self.network_prefix.trim().is_empty() {
            return Err(anyhow!("orchestration.network_prefix must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config.stream.stream_name, "trading-stats");
        assert_eq!(config.stream.consumer_group, "trading-api-group");
        assert_eq!(config.stream.batch_size, 10);
        assert_eq!(config.stream.block_timeout, Duration::from_millis(1_000));
        assert_eq!(config.stream.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.orchestration.max_concurrent_runs, 10);
        assert_eq!(config.storage.transaction_retries, 1);
    }

    #[test]
    fn durations_parse_in_declared_units() {
        let config = AppConfig::from_str(
            r#"
            [stream]
            block_timeout = 250
            reconnect_delay = 100
            max_reconnect_delay = 400

            [orchestration]
            stage_start_timeout = 5
            completion_grace = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.block_timeout, Duration::from_millis(250));
        assert_eq!(
            config.orchestration.stage_start_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.orchestration.completion_grace, Duration::from_secs(2));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = AppConfig::from_str("[stream]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err =
            AppConfig::from_str("[orchestration]\nmax_concurrent_runs = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_runs"));
    }

    #[test]
    fn load_or_default_without_candidates_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let loaded = AppConfig::load_or_default(&[missing]).unwrap();
        assert!(loaded.source.is_none() || std::env::var(AppConfig::ENV_CONFIG_PATH).is_ok());
    }

    #[test]
    fn load_with_source_reads_first_existing_candidate() {
        if std::env::var(AppConfig::ENV_CONFIG_PATH).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsod.toml");
        fs::write(&path, "[stream]\nstream_name = \"custom\"\n").unwrap();
        let loaded =
            AppConfig::load_with_source(&[dir.path().join("missing.toml"), path.clone()]).unwrap();
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.stream.stream_name, "custom");
    }
}
