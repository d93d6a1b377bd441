//! ---
//! tso_section: "15-testing-qa-runbook"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Builders for worker event field sets."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tso_core::event::FIELD_EVENT_ID;
use tso_core::{encode_event, EventKind};
use tso_stream::Fields;

/// Field set a worker would publish for one event.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: EventKind,
    run_id: String,
    data: Value,
    at: Option<DateTime<Utc>>,
    event_id: Option<String>,
}

impl EventBuilder {
    pub fn new(kind: EventKind, run_id: impl Into<String>) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            data: json!({}),
            at: None,
            event_id: None,
        }
    }

    /// `live_stats` carrying the given metric object.
    pub fn live_stats(run_id: impl Into<String>, metrics: Value) -> Self {
        Self::new(EventKind::LiveStats, run_id).data(metrics)
    }

    /// `final_results` with metrics and no trades.
    pub fn final_results(run_id: impl Into<String>, metrics: Value) -> Self {
        Self::new(EventKind::FinalResults, run_id).data(json!({ "metrics": metrics }))
    }

    pub fn trade(
        run_id: impl Into<String>,
        trade_id: &str,
        symbol: &str,
        side: &str,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self::new(EventKind::TradeEvent, run_id).data(json!({
            "trade": {
                "id": trade_id,
                "symbol": symbol,
                "side": side,
                "quantity": quantity,
                "price": price,
                "timestamp": Utc::now().timestamp_millis(),
            }
        }))
    }

    pub fn stage_error(run_id: impl Into<String>, stage: &str, message: &str) -> Self {
        Self::new(EventKind::StageError, run_id)
            .data(json!({ "stage": stage, "message": message }))
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn build(self) -> Fields {
        let mut fields = encode_event(self.kind, &self.run_id, &self.data, self.at);
        if let Some(event_id) = self.event_id {
            fields.insert(FIELD_EVENT_ID.to_string(), event_id);
        }
        fields
    }
}
