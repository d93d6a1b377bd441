//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Run domain model shared by storage, reconciliation, and lifecycle code."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque parameter set handed to a worker stage.
pub type ParamMap = IndexMap<String, Value>;

/// Lifecycle status of a simulation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => matches!(
                next,
                RunStatus::Running | RunStatus::Failed | RunStatus::Stopped
            ),
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Statuses from which `target` is reachable in one step.
    pub fn predecessors(target: RunStatus) -> Vec<RunStatus> {
        RunStatus::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(target))
            .collect()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "stopped" => Ok(RunStatus::Stopped),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Algorithm parameters applied when a request does not set them.
pub fn default_algo_params() -> ParamMap {
    let mut params = ParamMap::new();
    params.insert("IMBALANCE_THRESHOLD".into(), Value::from(0.6));
    params.insert("MIN_VOLUME_THRESHOLD".into(), Value::from(10.0));
    params.insert("LOOKBACK_PERIODS".into(), Value::from(5));
    params.insert("SIGNAL_COOLDOWN_MS".into(), Value::from(100));
    params
}

/// Simulator parameters applied when a request does not set them.
pub fn default_simulator_params() -> ParamMap {
    let mut params = ParamMap::new();
    params.insert("INITIAL_CAPITAL".into(), Value::from(100_000.0));
    params.insert("POSITION_SIZE_PCT".into(), Value::from(0.05));
    params.insert("MAX_POSITION_SIZE".into(), Value::from(10_000.0));
    params.insert("TRADING_FEE_PCT".into(), Value::from(0.001));
    params.insert("MIN_CONFIDENCE".into(), Value::from(0.3));
    params.insert("ENABLE_SHORTING".into(), Value::from(true));
    params.insert("STATS_INTERVAL_SECS".into(), Value::from(30));
    params
}

/// Incoming request to start a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub algorithm: String,
    pub algorithm_version: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub algo_params: ParamMap,
    #[serde(default)]
    pub simulator_params: ParamMap,
    #[serde(default)]
    pub metadata: ParamMap,
}

impl RunRequest {
    pub fn new(
        algorithm: impl Into<String>,
        algorithm_version: impl Into<String>,
        duration_seconds: u64,
    ) -> Self {
        Self {
            algorithm: algorithm.into(),
            algorithm_version: algorithm_version.into(),
            duration_seconds,
            algo_params: ParamMap::new(),
            simulator_params: ParamMap::new(),
            metadata: ParamMap::new(),
        }
    }

    /// Names of required fields that are absent or empty.
    pub fn missing_fields(&self, required_algo: &[String], required_sim: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        if self.algorithm.trim().is_empty() {
            missing.push("algorithm".to_owned());
        }
        if self.algorithm_version.trim().is_empty() {
            missing.push("algorithm_version".to_owned());
        }
        if self.duration_seconds == 0 {
            missing.push("duration_seconds".to_owned());
        }
        for key in required_algo {
            if is_absent(self.algo_params.get(key)) {
                missing.push(format!("algo_params.{key}"));
            }
        }
        for key in required_sim {
            if is_absent(self.simulator_params.get(key)) {
                missing.push(format!("simulator_params.{key}"));
            }
        }
        missing
    }

    /// Build the effective configuration, layering `request > version defaults > built-ins`.
    pub fn into_config(self, version_defaults: Option<&ParamMap>) -> RunConfig {
        let mut algo_params = default_algo_params();
        if let Some(defaults) = version_defaults {
            for (key, value) in defaults {
                algo_params.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in self.algo_params {
            algo_params.insert(key, value);
        }

        let mut simulator_params = default_simulator_params();
        for (key, value) in self.simulator_params {
            simulator_params.insert(key, value);
        }

        RunConfig {
            algorithm: self.algorithm,
            algorithm_version: self.algorithm_version,
            duration_seconds: self.duration_seconds,
            algo_params,
            simulator_params,
            metadata: self.metadata,
        }
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Effective configuration a run was launched with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub algorithm: String,
    pub algorithm_version: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub algo_params: ParamMap,
    #[serde(default)]
    pub simulator_params: ParamMap,
    #[serde(default)]
    pub metadata: ParamMap,
}

/// Typed value of a single metric column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Real(f64),
    Integer(i64),
}

/// Aggregated run metrics. Every field is optional so partial updates leave
/// prior values untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    pub final_capital: Option<f64>,
    pub total_pnl: Option<f64>,
    pub total_fees: Option<f64>,
    pub net_pnl: Option<f64>,
    pub return_pct: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub total_trades: Option<i64>,
    pub winning_trades: Option<i64>,
    pub losing_trades: Option<i64>,
    pub win_rate: Option<f64>,
    pub signals_received: Option<i64>,
    pub signals_executed: Option<i64>,
    pub execution_rate: Option<f64>,
    pub total_volume: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub avg_win: Option<f64>,
    pub avg_loss: Option<f64>,
}

impl RunMetrics {
    /// Column names in storage order.
    pub const COLUMNS: [&'static str; 17] = [
        "final_capital",
        "total_pnl",
        "total_fees",
        "net_pnl",
        "return_pct",
        "max_drawdown",
        "total_trades",
        "winning_trades",
        "losing_trades",
        "win_rate",
        "signals_received",
        "signals_executed",
        "execution_rate",
        "total_volume",
        "sharpe_ratio",
        "avg_win",
        "avg_loss",
    ];

    /// Extract the recognised metric fields from a worker payload.
    ///
    /// Unknown keys are ignored. `execution_rate` is derived when both signal
    /// counters are present and at least one signal was received.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let real = |key: &str| payload.get(key).and_then(Value::as_f64);
        let integer = |key: &str| {
            payload.get(key).and_then(|value| {
                value
                    .as_i64()
                    .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
            })
        };

        let mut metrics = Self {
            final_capital: real("final_capital"),
            total_pnl: real("total_pnl"),
            total_fees: real("total_fees"),
            net_pnl: real("net_pnl"),
            return_pct: real("return_pct"),
            max_drawdown: real("max_drawdown"),
            total_trades: integer("total_trades"),
            winning_trades: integer("winning_trades"),
            losing_trades: integer("losing_trades"),
            win_rate: real("win_rate"),
            signals_received: integer("signals_received"),
            signals_executed: integer("signals_executed"),
            execution_rate: None,
            total_volume: real("total_volume"),
            sharpe_ratio: real("sharpe_ratio"),
            avg_win: real("avg_win"),
            avg_loss: real("avg_loss"),
        };
        if let (Some(received), Some(executed)) = (metrics.signals_received, metrics.signals_executed)
        {
            if received > 0 {
                metrics.execution_rate = Some(executed as f64 / received as f64);
            }
        }
        metrics
    }

    /// Present fields as `(column, value)` pairs in storage order.
    pub fn present_fields(&self) -> Vec<(&'static str, MetricValue)> {
        let reals = [
            ("final_capital", self.final_capital),
            ("total_pnl", self.total_pnl),
            ("total_fees", self.total_fees),
            ("net_pnl", self.net_pnl),
            ("return_pct", self.return_pct),
            ("max_drawdown", self.max_drawdown),
        ];
        let counters = [
            ("total_trades", self.total_trades),
            ("winning_trades", self.winning_trades),
            ("losing_trades", self.losing_trades),
        ];
        let tail_reals = [("win_rate", self.win_rate)];
        let signals = [
            ("signals_received", self.signals_received),
            ("signals_executed", self.signals_executed),
        ];
        let rest = [
            ("execution_rate", self.execution_rate),
            ("total_volume", self.total_volume),
            ("sharpe_ratio", self.sharpe_ratio),
            ("avg_win", self.avg_win),
            ("avg_loss", self.avg_loss),
        ];

        let mut fields = Vec::new();
        fields.extend(
            reals
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, MetricValue::Real(v)))),
        );
        fields.extend(
            counters
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, MetricValue::Integer(v)))),
        );
        fields.extend(
            tail_reals
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, MetricValue::Real(v)))),
        );
        fields.extend(
            signals
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, MetricValue::Integer(v)))),
        );
        fields.extend(
            rest.into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, MetricValue::Real(v)))),
        );
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.present_fields().is_empty()
    }
}

/// Durable run row as seen by readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    /// Set for runs created to absorb reports with no known origin.
    pub placeholder: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub config: Option<RunConfig>,
    pub metrics: RunMetrics,
    /// Observation time of the metric snapshot currently stored.
    pub metrics_observed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {}", other)),
        }
    }
}

/// One executed trade, unique per `(run_id, trade_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub timestamp_ms: i64,
    pub confidence: Option<f64>,
    pub fees: Option<f64>,
    pub source_algo: Option<String>,
}

impl TradeRecord {
    /// Parse a worker trade object; `None` when it carries no usable identifier.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;
        let trade_id = object
            .get("id")
            .or_else(|| object.get("trade_id"))
            .and_then(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })?;
        let side = object
            .get("side")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(TradeSide::Buy);
        Some(Self {
            trade_id,
            symbol: object
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            side,
            quantity: object.get("quantity").and_then(Value::as_f64).unwrap_or(0.0),
            price: object.get("price").and_then(Value::as_f64).unwrap_or(0.0),
            timestamp_ms: object
                .get("timestamp")
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                .unwrap_or(0),
            confidence: object.get("confidence").and_then(Value::as_f64),
            fees: object.get("fees").and_then(Value::as_f64),
            source_algo: object
                .get("source_algo")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

/// Latest position for a symbol, unique per `(run_id, symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionRecord {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub last_price: Option<f64>,
    pub last_update_ms: Option<i64>,
}

impl PositionRecord {
    pub fn from_payload(symbol: &str, payload: &Value) -> Self {
        let field = |key: &str| payload.get(key).and_then(Value::as_f64);
        Self {
            symbol: symbol.to_owned(),
            quantity: field("quantity").unwrap_or(0.0),
            avg_price: field("avg_price"),
            unrealized_pnl: field("unrealized_pnl"),
            realized_pnl: field("realized_pnl"),
            last_price: field("last_price"),
            last_update_ms: payload.get("last_update").and_then(Value::as_i64),
        }
    }
}
