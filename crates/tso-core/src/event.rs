//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Worker event decoding and stream entry encoding."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Workers publish entries with the fields `type`, `run_id`, `data` (a JSON
//! object encoded as a string) and an optional `timestamp`. An explicit
//! `event_id` field is honoured; otherwise the identifier is a digest of the
//! entry content, so a redelivered entry always maps to the same id.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tso_common::time::parse_timestamp;
use tso_common::{PositionRecord, RunMetrics, TradeRecord};
use tso_persistence::RunUpdate;
use tso_stream::{EntryId, Fields, StreamEntry};

use crate::error::{OrchestrationError, Result};

pub const FIELD_TYPE: &str = "type";
pub const FIELD_RUN_ID: &str = "run_id";
pub const FIELD_DATA: &str = "data";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_EVENT_ID: &str = "event_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    LiveStats,
    FinalResults,
    TradeEvent,
    StageError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LiveStats => "live_stats",
            EventKind::FinalResults => "final_results",
            EventKind::TradeEvent => "trade_event",
            EventKind::StageError => "stage_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "live_stats" => Ok(EventKind::LiveStats),
            "final_results" => Ok(EventKind::FinalResults),
            "trade_event" => Ok(EventKind::TradeEvent),
            "stage_error" => Ok(EventKind::StageError),
            other => Err(format!("unknown event type `{other}`")),
        }
    }
}

/// Fatal error a stage reported about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
}

/// Decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub entry_id: EntryId,
    pub event_id: String,
    pub kind: EventKind,
    /// Identifier the worker reported under; not necessarily canonical.
    pub reporter_id: String,
    pub observed_at: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl WorkerEvent {
    /// Decode an entry. `received_at` stands in when the entry carries no usable timestamp.
    pub fn parse(entry: &StreamEntry, received_at: DateTime<Utc>) -> Result<Self> {
        let malformed = |reason: String| OrchestrationError::MalformedEvent {
            entry_id: entry.id,
            reason,
        };

        let kind = required(entry, FIELD_TYPE)
            .ok_or_else(|| malformed("missing `type`".into()))?
            .parse::<EventKind>()
            .map_err(malformed)?;
        let reporter_id = required(entry, FIELD_RUN_ID)
            .ok_or_else(|| malformed("missing `run_id`".into()))?
            .to_string();
        let raw_data = entry.field(FIELD_DATA).unwrap_or("{}");
        let data = match serde_json::from_str::<Value>(raw_data) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(malformed("`data` is not a JSON object".into())),
            Err(err) => return Err(malformed(format!("`data` is not valid JSON: {err}"))),
        };
        let observed_at = entry
            .field(FIELD_TIMESTAMP)
            .and_then(parse_timestamp)
            .unwrap_or(received_at);
        let event_id = match required(entry, FIELD_EVENT_ID) {
            Some(explicit) => explicit.to_string(),
            None => content_digest(entry),
        };

        let event = Self {
            entry_id: entry.id,
            event_id,
            kind,
            reporter_id,
            observed_at,
            data,
        };
        if kind == EventKind::TradeEvent && event.trade().is_none() {
            return Err(malformed("trade_event without a trade identifier".into()));
        }
        Ok(event)
    }

    /// Storage mutation carried by this event.
    pub fn to_update(&self) -> RunUpdate {
        let mut update = RunUpdate::metrics(self.event_id.clone(), self.observed_at, RunMetrics::default());
        match self.kind {
            EventKind::LiveStats => {
                update.metrics = RunMetrics::from_payload(self.metrics_object());
            }
            EventKind::FinalResults => {
                update.metrics = RunMetrics::from_payload(self.metrics_object());
                update.trades = self
                    .data
                    .get("trades")
                    .and_then(Value::as_array)
                    .map(|trades| trades.iter().filter_map(TradeRecord::from_payload).collect())
                    .unwrap_or_default();
                update.positions = self
                    .data
                    .get("positions_by_symbol")
                    .and_then(Value::as_object)
                    .map(|positions| {
                        positions
                            .iter()
                            .map(|(symbol, payload)| PositionRecord::from_payload(symbol, payload))
                            .collect()
                    })
                    .unwrap_or_default();
            }
            EventKind::TradeEvent => {
                update.trades = self.trade().into_iter().collect();
            }
            EventKind::StageError => {}
        }
        update
    }

    /// Stage failure details for `stage_error` events.
    pub fn stage_failure(&self) -> Option<StageFailure> {
        if self.kind != EventKind::StageError {
            return None;
        }
        let text = |key: &str| self.data.get(key).and_then(Value::as_str).map(str::to_string);
        Some(StageFailure {
            stage: text("stage").unwrap_or_else(|| "unknown".to_string()),
            message: text("message")
                .or_else(|| text("error"))
                .unwrap_or_else(|| "stage reported a fatal error".to_string()),
        })
    }

    fn trade(&self) -> Option<TradeRecord> {
        match self.data.get("trade") {
            Some(nested) => TradeRecord::from_payload(nested),
            None => TradeRecord::from_payload(&Value::Object(self.data.clone())),
        }
    }

    /// Metrics live at the top level or under `metrics`.
    fn metrics_object(&self) -> &Map<String, Value> {
        self.data
            .get("metrics")
            .and_then(Value::as_object)
            .unwrap_or(&self.data)
    }
}

fn required<'a>(entry: &'a StreamEntry, key: &str) -> Option<&'a str> {
    entry
        .field(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn content_digest(entry: &StreamEntry) -> String {
    let mut hasher = Sha256::new();
    for key in [FIELD_TYPE, FIELD_RUN_ID, FIELD_TIMESTAMP, FIELD_DATA] {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.field(key).unwrap_or_default().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Build the field set a worker would publish.
pub fn encode_event(
    kind: EventKind,
    run_id: &str,
    data: &Value,
    timestamp: Option<DateTime<Utc>>,
) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FIELD_TYPE.into(), kind.as_str().into());
    fields.insert(FIELD_RUN_ID.into(), run_id.into());
    fields.insert(FIELD_DATA.into(), data.to_string());
    if let Some(timestamp) = timestamp {
        fields.insert(FIELD_TIMESTAMP.into(), timestamp.to_rfc3339());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: EntryId, fields: Fields) -> StreamEntry {
        StreamEntry { id, fields }
    }

    #[test]
    fn digest_is_stable_across_redelivery() {
        let at = Utc::now();
        let fields = encode_event(EventKind::LiveStats, "sim-1", &json!({"net_pnl": 1.0}), Some(at));
        let first = WorkerEvent::parse(&entry(1, fields.clone()), Utc::now()).unwrap();
        let again = WorkerEvent::parse(&entry(9, fields), Utc::now()).unwrap();
        assert_eq!(first.event_id, again.event_id);
        assert_eq!(first.observed_at.timestamp_millis(), at.timestamp_millis());
    }

    #[test]
    fn explicit_event_id_wins() {
        let mut fields = encode_event(EventKind::LiveStats, "sim-1", &json!({}), None);
        fields.insert(FIELD_EVENT_ID.into(), "evt-7".into());
        let event = WorkerEvent::parse(&entry(1, fields), Utc::now()).unwrap();
        assert_eq!(event.event_id, "evt-7");
    }

    #[test]
    fn rejects_malformed_entries() {
        let received = Utc::now();
        let mut missing_type = Fields::new();
        missing_type.insert(FIELD_RUN_ID.into(), "sim".into());
        let mut bad_json = encode_event(EventKind::LiveStats, "sim", &json!({}), None);
        bad_json.insert(FIELD_DATA.into(), "{not json".into());
        let mut unknown = encode_event(EventKind::LiveStats, "sim", &json!({}), None);
        unknown.insert(FIELD_TYPE.into(), "heartbeat".into());
        let no_trade_id = encode_event(EventKind::TradeEvent, "sim", &json!({"symbol": "BTC"}), None);

        for (idx, fields) in [missing_type, bad_json, unknown, no_trade_id].into_iter().enumerate() {
            let err = WorkerEvent::parse(&entry(idx as EntryId + 1, fields), received).unwrap_err();
            assert!(matches!(err, OrchestrationError::MalformedEvent { .. }), "{err}");
        }
    }

    #[test]
    fn final_results_carry_trades_and_positions() {
        let data = json!({
            "final_capital": 101250.0,
            "total_trades": 2,
            "signals_received": 4,
            "signals_executed": 2,
            "trades": [
                {"id": "t1", "symbol": "BTCUSDT", "side": "BUY", "quantity": 0.1, "price": 42000.0},
                {"symbol": "BTCUSDT"}
            ],
            "positions_by_symbol": {"BTCUSDT": {"quantity": 0.1, "avg_price": 42000.0}}
        });
        let fields = encode_event(EventKind::FinalResults, "sim", &data, None);
        let event = WorkerEvent::parse(&entry(1, fields), Utc::now()).unwrap();
        let update = event.to_update();
        assert_eq!(update.metrics.final_capital, Some(101250.0));
        assert_eq!(update.metrics.execution_rate, Some(0.5));
        assert_eq!(update.trades.len(), 1);
        assert_eq!(update.positions.len(), 1);
        assert!(event.stage_failure().is_none());
    }

    #[test]
    fn stage_error_exposes_failure() {
        let fields = encode_event(
            EventKind::StageError,
            "sim",
            &json!({"stage": "algorithm", "message": "order book feed lost"}),
            None,
        );
        let event = WorkerEvent::parse(&entry(1, fields), Utc::now()).unwrap();
        let failure = event.stage_failure().unwrap();
        assert_eq!(failure.stage, "algorithm");
        assert_eq!(failure.message, "order book feed lost");
        assert!(event.to_update().metrics.is_empty());
    }
}
