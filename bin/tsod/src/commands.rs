//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "binary"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Operator commands for starting, stopping and inspecting runs."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};
use tso_common::{AppConfig, ParamMap, RunRequest, RunStatus, StreamBackend};
use tso_core::event::FIELD_EVENT_ID;
use tso_core::{encode_event, EventKind, Orchestrator};
use tso_persistence::RunFilter;
use tso_stream::open_stream;

const FOLLOW_POLL: Duration = Duration::from_secs(1);

/// Options for `tsod start`.
#[derive(Debug, Args)]
pub struct StartArgs {
    /// JSON run request; flags below override its fields.
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,
    #[arg(long)]
    pub algorithm: Option<String>,
    #[arg(long = "algorithm-version")]
    pub algorithm_version: Option<String>,
    /// Run duration in seconds.
    #[arg(long)]
    pub duration: Option<u64>,
    /// Algorithm parameter as KEY=VALUE; VALUE is parsed as JSON when possible.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,
    /// Simulator parameter as KEY=VALUE.
    #[arg(long = "sim-param", value_name = "KEY=VALUE")]
    pub sim_params: Vec<String>,
    /// Consume worker events in this process until the run ends.
    #[arg(long)]
    pub follow: bool,
}

/// Options for `tsod list`.
#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long = "algorithm-version")]
    pub algorithm_version: Option<String>,
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

/// Options for `tsod emit`.
#[derive(Debug, Args)]
pub struct EmitArgs {
    /// Event type: live_stats, final_results, trade_event or stage_error.
    #[arg(long = "type")]
    pub kind: String,
    #[arg(long = "run-id")]
    pub run_id: String,
    /// JSON object payload.
    #[arg(long, default_value = "{}")]
    pub data: String,
    #[arg(long = "event-id")]
    pub event_id: Option<String>,
    /// RFC 3339 observation time; defaults to now.
    #[arg(long)]
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn start(config: &AppConfig, args: StartArgs) -> Result<()> {
    let request = build_request(args.file.as_ref(), &args)?;
    let orchestrator = Orchestrator::from_config(config, None)?;
    let run_id = orchestrator.start_run(request).await?;
    orchestrator.wait_for_launch(&run_id).await;

    let view = orchestrator.get_run(&run_id)?;
    print_json(&view)?;
    if view.record.status != RunStatus::Running {
        bail!("run {run_id} did not reach running: {}", view.record.status);
    }
    if !args.follow {
        return Ok(());
    }

    let consumer = orchestrator.spawn_consumer();
    info!(run_id = %run_id, "following run; ctrl-c stops it");

    let final_status = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!(run_id = %run_id, "interrupted; stopping run");
                break orchestrator.stop_run(&run_id).await?;
            }
            _ = tokio::time::sleep(FOLLOW_POLL) => {
                let status = orchestrator.get_run(&run_id)?.record.status;
                if status.is_terminal() {
                    break status;
                }
            }
        }
    };

    consumer.shutdown().await?;
    orchestrator.shutdown();
    print_json(&orchestrator.get_run(&run_id)?)?;
    info!(run_id = %run_id, status = %final_status, "run finished");
    Ok(())
}

fn build_request(file: Option<&PathBuf>, args: &StartArgs) -> Result<RunRequest> {
    let mut request = match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read run request {}", path.display()))?;
            serde_json::from_str::<RunRequest>(&raw)
                .with_context(|| format!("failed to parse run request {}", path.display()))?
        }
        None => RunRequest::new("", "", 0),
    };
    if let Some(algorithm) = &args.algorithm {
        request.algorithm = algorithm.clone();
    }
    if let Some(version) = &args.algorithm_version {
        request.algorithm_version = version.clone();
    }
    if let Some(duration) = args.duration {
        request.duration_seconds = duration;
    }
    apply_params(&mut request.algo_params, &args.params)?;
    apply_params(&mut request.simulator_params, &args.sim_params)?;
    Ok(request)
}

fn apply_params(target: &mut ParamMap, pairs: &[String]) -> Result<()> {
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("parameter `{pair}` is not KEY=VALUE"))?;
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.into()));
        target.insert(key.trim().to_string(), value);
    }
    Ok(())
}

pub async fn stop(config: &AppConfig, run_id: &str) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config, None)?;
    let status = orchestrator.stop_run(run_id).await?;
    println!("{run_id}: {status}");
    Ok(())
}

pub fn status(config: &AppConfig, run_id: &str) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config, None)?;
    print_json(&orchestrator.get_run(run_id)?)
}

pub fn list(config: &AppConfig, args: ListArgs) -> Result<()> {
    let status = args
        .status
        .as_deref()
        .map(|raw| raw.parse::<RunStatus>().map_err(|err| anyhow!(err)))
        .transpose()?;
    let filter = RunFilter {
        status,
        algorithm_version: args.algorithm_version,
        limit: args.limit,
        offset: args.offset,
    };
    let orchestrator = Orchestrator::from_config(config, None)?;
    for record in orchestrator.list_runs(&filter)? {
        println!(
            "{:<40} {:<10} {:<20} {}",
            record.run_id,
            record.status.as_str(),
            record
                .config
                .as_ref()
                .map(|config| config.algorithm_version.as_str())
                .unwrap_or("-"),
            record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

pub async fn health(config: &AppConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config, None)?;
    let report = orchestrator.health().await;
    print_json(&report)?;
    if !report.ready {
        bail!("one or more backends are unreachable");
    }
    Ok(())
}

pub async fn emit(config: &AppConfig, args: EmitArgs) -> Result<()> {
    if config.stream.backend == StreamBackend::Memory {
        warn!("memory stream backend is process-local; emitted event will not reach the daemon");
    }
    let kind = args.kind.parse::<EventKind>().map_err(|err| anyhow!(err))?;
    let data = serde_json::from_str::<Value>(&args.data).context("--data is not valid JSON")?;
    if !data.is_object() {
        bail!("--data must be a JSON object");
    }
    let mut fields = encode_event(
        kind,
        &args.run_id,
        &data,
        Some(args.timestamp.unwrap_or_else(Utc::now)),
    );
    if let Some(event_id) = args.event_id {
        fields.insert(FIELD_EVENT_ID.to_string(), event_id);
    }

    let stream = open_stream(&config.stream)?;
    let entry_id = stream.append(fields).await?;
    println!("{} {}", stream.name(), entry_id);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
