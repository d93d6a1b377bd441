//! ---
//! tso_section: "03-persistence-logging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Relational run store backed by SQLite."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Every mutation reports the number of rows it touched. Callers treat a
//! zero count as a distinct outcome rather than as success.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use tracing::{debug, info};
use tso_common::run::{
    MetricValue, PositionRecord, RunConfig, RunMetrics, RunRecord, RunStatus, TradeRecord,
};

use crate::metrics::PersistenceMetrics;
use crate::{PersistenceError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id              TEXT PRIMARY KEY,
    status              TEXT NOT NULL,
    placeholder         INTEGER NOT NULL DEFAULT 0,
    algorithm           TEXT,
    algorithm_version   TEXT,
    duration_seconds    INTEGER,
    config_json         TEXT,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    ended_at            TEXT,
    updated_at          TEXT NOT NULL,
    final_capital       REAL,
    total_pnl           REAL,
    total_fees          REAL,
    net_pnl             REAL,
    return_pct          REAL,
    max_drawdown        REAL,
    total_trades        INTEGER,
    winning_trades      INTEGER,
    losing_trades       INTEGER,
    win_rate            REAL,
    signals_received    INTEGER,
    signals_executed    INTEGER,
    execution_rate      REAL,
    total_volume        REAL,
    sharpe_ratio        REAL,
    avg_win             REAL,
    avg_loss            REAL,
    metrics_observed_at INTEGER,
    error_message       TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);

CREATE TABLE IF NOT EXISTS run_aliases (
    reporter_id TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL,
    bound_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_aliases_run ON run_aliases(run_id);

CREATE TABLE IF NOT EXISTS awaiting_reports (
    run_id        TEXT PRIMARY KEY,
    hint          TEXT,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS processed_events (
    event_id   TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_stages (
    run_id     TEXT NOT NULL,
    stage      TEXT NOT NULL,
    handle     TEXT NOT NULL,
    started_at TEXT NOT NULL,
    stopped_at TEXT,
    PRIMARY KEY (run_id, stage)
);

CREATE TABLE IF NOT EXISTS trades (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL,
    trade_id     TEXT NOT NULL,
    symbol       TEXT NOT NULL,
    side         TEXT NOT NULL,
    quantity     REAL NOT NULL,
    price        REAL NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    confidence   REAL,
    fees         REAL,
    source_algo  TEXT,
    created_at   TEXT NOT NULL,
    UNIQUE (run_id, trade_id)
);

CREATE TABLE IF NOT EXISTS positions (
    run_id         TEXT NOT NULL,
    symbol         TEXT NOT NULL,
    quantity       REAL NOT NULL,
    avg_price      REAL,
    unrealized_pnl REAL,
    realized_pnl   REAL,
    last_price     REAL,
    last_update_ms INTEGER,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (run_id, symbol)
);
"#;

const RUN_COLUMNS: &str = "run_id, status, placeholder, config_json, created_at, started_at, \
    ended_at, updated_at, final_capital, total_pnl, total_fees, net_pnl, return_pct, \
    max_drawdown, total_trades, winning_trades, losing_trades, win_rate, signals_received, \
    signals_executed, execution_rate, total_volume, sharpe_ratio, avg_win, avg_loss, \
    metrics_observed_at, error_message";

const ACTIVE_STATUSES: &str = "('pending', 'running')";

/// A single reconciled mutation for a run, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    /// Stable identifier of the originating event, used for de-duplication.
    pub event_id: String,
    /// When the worker observed the reported values.
    pub observed_at: DateTime<Utc>,
    /// Metric fields to overwrite; absent fields are left untouched.
    pub metrics: RunMetrics,
    /// Trades to insert idempotently.
    pub trades: Vec<TradeRecord>,
    /// Positions to upsert.
    pub positions: Vec<PositionRecord>,
}

impl RunUpdate {
    /// Update carrying only metric fields.
    pub fn metrics(
        event_id: impl Into<String>,
        observed_at: DateTime<Utc>,
        metrics: RunMetrics,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            observed_at,
            metrics,
            trades: Vec::new(),
            positions: Vec::new(),
        }
    }
}

/// How the store handled a [`RunUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDisposition {
    /// Fields were written.
    Applied,
    /// The run holds a newer snapshot; only the mutation timestamp moved.
    Stale,
    /// The event was applied before; nothing changed.
    Duplicate,
    /// No run row matched the identifier.
    Missing,
}

impl UpdateDisposition {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateDisposition::Applied => "applied",
            UpdateDisposition::Stale => "stale",
            UpdateDisposition::Duplicate => "duplicate",
            UpdateDisposition::Missing => "missing",
        }
    }
}

/// Result of [`RunStore::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    /// Run rows written by the update statement.
    pub rows_affected: usize,
    /// Classification of the outcome.
    pub disposition: UpdateDisposition,
    /// Trades newly inserted (re-deliveries count zero).
    pub trades_inserted: usize,
    /// Position rows inserted or updated.
    pub positions_upserted: usize,
}

impl UpdateReport {
    fn untouched(disposition: UpdateDisposition) -> Self {
        Self {
            rows_affected: 0,
            disposition,
            trades_inserted: 0,
            positions_upserted: 0,
        }
    }
}

/// Result of [`RunStore::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The status moved from `from` to the requested target.
    Applied {
        /// Status held before the transition.
        from: RunStatus,
    },
    /// The state machine does not allow the move from `current`.
    Rejected {
        /// Status the run currently holds.
        current: RunStatus,
    },
    /// No such run.
    Missing,
}

impl TransitionOutcome {
    /// Rows written by the transition.
    pub fn rows_affected(&self) -> usize {
        match self {
            TransitionOutcome::Applied { .. } => 1,
            _ => 0,
        }
    }
}

/// Filter for [`RunStore::list_runs`].
#[derive(Debug, Clone)]
pub struct RunFilter {
    /// Restrict to one status.
    pub status: Option<RunStatus>,
    /// Restrict to one algorithm version.
    pub algorithm_version: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Rows to skip.
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            algorithm_version: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Durable record of a started pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRow {
    /// Stage name.
    pub stage: String,
    /// Resource manager handle needed to stop the stage.
    pub handle: String,
    /// When the stage start succeeded.
    pub started_at: DateTime<Utc>,
    /// When teardown succeeded, if it has.
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Result of claiming a run that awaits its first worker report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRun {
    /// Canonical identifier now bound to the reporter.
    pub run_id: String,
    /// How many runs were eligible when the claim was made.
    pub candidates: usize,
    /// Whether the claim matched the run's expected reporter hint.
    pub hinted: bool,
}

/// Write path used by reconciliation.
///
/// Implementations must report the rows each call touched; a zero-row update
/// comes back as [`UpdateDisposition::Missing`], never as success.
pub trait RunWriter: Send + Sync + 'static {
    fn apply_update(&self, run_id: &str, update: &RunUpdate) -> Result<UpdateReport>;

    fn insert_placeholder(&self, run_id: &str, now: DateTime<Utc>) -> Result<usize>;

    fn metrics(&self) -> Option<&PersistenceMetrics> {
        None
    }
}

impl RunWriter for RunStore {
    fn apply_update(&self, run_id: &str, update: &RunUpdate) -> Result<UpdateReport> {
        RunStore::apply_update(self, run_id, update)
    }

    fn insert_placeholder(&self, run_id: &str, now: DateTime<Utc>) -> Result<usize> {
        RunStore::insert_placeholder(self, run_id, now)
    }

    fn metrics(&self) -> Option<&PersistenceMetrics> {
        RunStore::metrics(self)
    }
}

/// SQLite-backed store for runs and everything keyed by them.
pub struct RunStore {
    conn: Mutex<Connection>,
    location: String,
    metrics: Option<PersistenceMetrics>,
}

impl RunStore {
    /// Open (or create) the database at `path`. `:memory:` opens a private in-memory database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if path == Path::new(":memory:") {
            return Self::in_memory();
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn, path.display().to_string())
    }

    /// Private in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, ":memory:".to_owned())
    }

    fn with_connection(conn: Connection, location: String) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        info!(location = %location, "run store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            location,
            metrics: None,
        })
    }

    /// Attach persistence metrics.
    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Metrics handle, if attached.
    pub fn metrics(&self) -> Option<&PersistenceMetrics> {
        self.metrics.as_ref()
    }

    /// Where the database lives.
    pub fn location(&self) -> &str {
        &self.location
    }

    fn timed<T>(&self, operation: &str, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut conn = self.conn.lock();
        let result = f(&mut conn);
        if let Some(metrics) = &self.metrics {
            metrics.observe_transaction(operation, started.elapsed().as_secs_f64());
        }
        result
    }

    /// Reachability probe.
    pub fn ping(&self) -> Result<()> {
        self.timed("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    /// Insert a freshly requested run in `pending`. Returns 0 if the id already exists.
    pub fn insert_run(&self, run_id: &str, config: &RunConfig, now: DateTime<Utc>) -> Result<usize> {
        let config_json = serde_json::to_string(config)?;
        let duration = i64::try_from(config.duration_seconds)
            .map_err(|_| PersistenceError::Corrupt("duration_seconds overflows".into()))?;
        let rows = self.timed("insert_run", |conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO runs (run_id, status, placeholder, algorithm, \
                 algorithm_version, duration_seconds, config_json, created_at, updated_at) \
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    run_id,
                    RunStatus::Pending.as_str(),
                    config.algorithm,
                    config.algorithm_version,
                    duration,
                    config_json,
                    now
                ],
            )?)
        })?;
        if rows > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.record_run_inserted("request");
            }
        }
        Ok(rows)
    }

    /// Insert a minimal `running` placeholder. Returns 0 if the id already exists.
    pub fn insert_placeholder(&self, run_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.timed("insert_placeholder", |conn| {
            Ok(insert_placeholder_row(conn, run_id, now)?)
        })?;
        if rows > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.record_run_inserted("placeholder");
            }
        }
        Ok(rows)
    }

    /// Whether a run row exists.
    pub fn run_exists(&self, run_id: &str) -> Result<bool> {
        self.timed("run_exists", |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE run_id = ?1)",
                params![run_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Fetch a run by canonical identifier.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let raw = self.timed("get_run", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                    params![run_id],
                    read_raw_run,
                )
                .optional()?)
        })?;
        raw.map(RawRun::into_record).transpose()
    }

    /// Runs matching `filter`, newest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            values.push(Box::new(status.as_str()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(version) = &filter.algorithm_version {
            values.push(Box::new(version.clone()));
            clauses.push(format!("algorithm_version = ?{}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Box::new(i64::try_from(filter.limit).unwrap_or(i64::MAX)));
        let limit_idx = values.len();
        values.push(Box::new(i64::try_from(filter.offset).unwrap_or(i64::MAX)));
        let offset_idx = values.len();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs {where_clause} \
             ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );

        let raws = self.timed("list_runs", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), read_raw_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raws.into_iter().map(RawRun::into_record).collect()
    }

    /// Runs currently in any of `statuses`, oldest first.
    pub fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<RunRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ({placeholders}) \
             ORDER BY created_at ASC, rowid ASC"
        );
        let labels: Vec<&str> = statuses.iter().map(RunStatus::as_str).collect();
        let raws = self.timed("runs_with_status", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(labels.iter()), read_raw_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raws.into_iter().map(RawRun::into_record).collect()
    }

    /// Number of launched runs that are pending or running.
    ///
    /// Placeholders adopted for orphaned reporters own no stages and are not counted.
    pub fn count_active(&self) -> Result<usize> {
        self.timed("count_active", |conn| {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM runs WHERE status IN {ACTIVE_STATUSES} AND placeholder = 0"
                ),
                [],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    /// Apply a reconciled update in one transaction.
    ///
    /// Metric fields are gated on `observed_at`: an update older than the stored
    /// snapshot only advances `updated_at`. Events are de-duplicated by
    /// `event_id`. Trades are inserted with insert-or-ignore semantics.
    pub fn apply_update(&self, run_id: &str, update: &RunUpdate) -> Result<UpdateReport> {
        let report = self.timed("apply_update", |conn| {
            let tx = conn.transaction()?;
            let stored: Option<Option<i64>> = tx
                .query_row(
                    "SELECT metrics_observed_at FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(stored_observed) = stored else {
                return Ok(UpdateReport::untouched(UpdateDisposition::Missing));
            };

            let seen: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = ?1)",
                params![update.event_id],
                |row| row.get(0),
            )?;
            if seen {
                return Ok(UpdateReport::untouched(UpdateDisposition::Duplicate));
            }

            let now = Utc::now();
            let observed_ms = update.observed_at.timestamp_millis();
            let stale = matches!(stored_observed, Some(stored) if observed_ms < stored);
            let fields = update.metrics.present_fields();

            let rows_affected = if stale || fields.is_empty() {
                tx.execute(
                    "UPDATE runs SET updated_at = ?1 WHERE run_id = ?2",
                    params![now, run_id],
                )?
            } else {
                let mut assignments = Vec::with_capacity(fields.len() + 2);
                let mut values: Vec<Box<dyn ToSql>> = Vec::with_capacity(fields.len() + 3);
                for (column, value) in &fields {
                    values.push(match value {
                        MetricValue::Real(v) => Box::new(*v) as Box<dyn ToSql>,
                        MetricValue::Integer(v) => Box::new(*v) as Box<dyn ToSql>,
                    });
                    assignments.push(format!("{column} = ?{}", values.len()));
                }
                values.push(Box::new(observed_ms));
                assignments.push(format!("metrics_observed_at = ?{}", values.len()));
                values.push(Box::new(now));
                assignments.push(format!("updated_at = ?{}", values.len()));
                values.push(Box::new(run_id.to_owned()));
                let sql = format!(
                    "UPDATE runs SET {} WHERE run_id = ?{}",
                    assignments.join(", "),
                    values.len()
                );
                tx.execute(&sql, params_from_iter(values.iter()))?
            };
            if rows_affected == 0 {
                return Ok(UpdateReport::untouched(UpdateDisposition::Missing));
            }

            tx.execute(
                "INSERT INTO processed_events (event_id, run_id, applied_at) VALUES (?1, ?2, ?3)",
                params![update.event_id, run_id, now],
            )?;

            let mut trades_inserted = 0;
            for trade in &update.trades {
                trades_inserted += tx.execute(
                    "INSERT OR IGNORE INTO trades (run_id, trade_id, symbol, side, quantity, \
                     price, timestamp_ms, confidence, fees, source_algo, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        run_id,
                        trade.trade_id,
                        trade.symbol,
                        trade.side.as_str(),
                        trade.quantity,
                        trade.price,
                        trade.timestamp_ms,
                        trade.confidence,
                        trade.fees,
                        trade.source_algo,
                        now
                    ],
                )?;
            }

            let mut positions_upserted = 0;
            if !stale {
                for position in &update.positions {
                    positions_upserted += tx.execute(
                        "INSERT INTO positions (run_id, symbol, quantity, avg_price, \
                         unrealized_pnl, realized_pnl, last_price, last_update_ms, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                         ON CONFLICT (run_id, symbol) DO UPDATE SET \
                         quantity = excluded.quantity, avg_price = excluded.avg_price, \
                         unrealized_pnl = excluded.unrealized_pnl, \
                         realized_pnl = excluded.realized_pnl, last_price = excluded.last_price, \
                         last_update_ms = excluded.last_update_ms, updated_at = excluded.updated_at",
                        params![
                            run_id,
                            position.symbol,
                            position.quantity,
                            position.avg_price,
                            position.unrealized_pnl,
                            position.realized_pnl,
                            position.last_price,
                            position.last_update_ms,
                            now
                        ],
                    )?;
                }
            }

            tx.commit()?;
            Ok(UpdateReport {
                rows_affected,
                disposition: if stale {
                    UpdateDisposition::Stale
                } else {
                    UpdateDisposition::Applied
                },
                trades_inserted,
                positions_upserted,
            })
        })?;

        if let Some(metrics) = &self.metrics {
            metrics.record_update(report.disposition);
        }
        debug!(
            run_id,
            event_id = %update.event_id,
            rows_affected = report.rows_affected,
            disposition = report.disposition.as_str(),
            "run update applied"
        );
        Ok(report)
    }

    /// Move a run to `to` if the state machine allows it.
    ///
    /// Entering `running` stamps `started_at`; entering a terminal state stamps
    /// `ended_at`. `error` is recorded when provided.
    pub fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        self.timed("transition", |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Ok(TransitionOutcome::Missing);
            };
            let current = parse_status(&current)?;
            if !current.can_transition_to(to) {
                return Ok(TransitionOutcome::Rejected { current });
            }
            let rows = tx.execute(
                "UPDATE runs SET status = ?1, updated_at = ?2, \
                 started_at = CASE WHEN ?3 THEN COALESCE(started_at, ?2) ELSE started_at END, \
                 ended_at = CASE WHEN ?4 THEN COALESCE(ended_at, ?2) ELSE ended_at END, \
                 error_message = COALESCE(?5, error_message) \
                 WHERE run_id = ?6 AND status = ?7",
                params![
                    to.as_str(),
                    now,
                    to == RunStatus::Running,
                    to.is_terminal(),
                    error,
                    run_id,
                    current.as_str()
                ],
            )?;
            if rows == 0 {
                return Ok(TransitionOutcome::Rejected { current });
            }
            if to.is_terminal() {
                tx.execute(
                    "DELETE FROM awaiting_reports WHERE run_id = ?1",
                    params![run_id],
                )?;
            }
            tx.commit()?;
            Ok(TransitionOutcome::Applied { from: current })
        })
    }

    /// Record an error message on the run without touching its status.
    pub fn record_error(&self, run_id: &str, message: &str, now: DateTime<Utc>) -> Result<usize> {
        self.timed("record_error", |conn| {
            Ok(conn.execute(
                "UPDATE runs SET error_message = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![message, now, run_id],
            )?)
        })
    }

    /// Bind `reporter_id` to `run_id` unless it is already bound.
    ///
    /// Returns the canonical identifier the reporter is bound to afterwards,
    /// which is the earlier binding when one existed.
    pub fn bind_alias(&self, reporter_id: &str, run_id: &str, now: DateTime<Utc>) -> Result<String> {
        self.timed("bind_alias", |conn| {
            let tx = conn.transaction()?;
            let bound = bind_alias_row(&tx, reporter_id, run_id, now)?;
            tx.commit()?;
            Ok(bound)
        })
    }

    /// Canonical identifier bound to a reporter, if any.
    pub fn lookup_alias(&self, reporter_id: &str) -> Result<Option<String>> {
        self.timed("lookup_alias", |conn| {
            Ok(conn
                .query_row(
                    "SELECT run_id FROM run_aliases WHERE reporter_id = ?1",
                    params![reporter_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Reporter identifiers bound to a run, in binding order.
    pub fn aliases_for(&self, run_id: &str) -> Result<Vec<String>> {
        self.timed("aliases_for", |conn| {
            let mut stmt = conn.prepare(
                "SELECT reporter_id FROM run_aliases WHERE run_id = ?1 ORDER BY bound_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Create a placeholder for an orphaned reporter and bind the alias atomically.
    ///
    /// Returns the bound canonical identifier and whether a run row was created.
    pub fn adopt_orphan(
        &self,
        reporter_id: &str,
        canonical_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, bool)> {
        let (bound, created) = self.timed("adopt_orphan", |conn| {
            let tx = conn.transaction()?;
            let created = insert_placeholder_row(&tx, canonical_id, now)? > 0;
            let bound = bind_alias_row(&tx, reporter_id, canonical_id, now)?;
            tx.commit()?;
            Ok((bound, created))
        })?;
        if created {
            if let Some(metrics) = &self.metrics {
                metrics.record_run_inserted("placeholder");
            }
        }
        Ok((bound, created))
    }

    /// Mark a run as awaiting its first worker report.
    pub fn register_awaiting(
        &self,
        run_id: &str,
        hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.timed("register_awaiting", |conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO awaiting_reports (run_id, hint, registered_at) \
                 VALUES (?1, ?2, ?3)",
                params![run_id, hint, now],
            )?)
        })
    }

    /// Drop a run from the awaiting set.
    pub fn clear_awaiting(&self, run_id: &str) -> Result<usize> {
        self.timed("clear_awaiting", |conn| {
            Ok(conn.execute(
                "DELETE FROM awaiting_reports WHERE run_id = ?1",
                params![run_id],
            )?)
        })
    }

    /// Runs currently awaiting a first report.
    pub fn awaiting_runs(&self) -> Result<Vec<String>> {
        self.timed("awaiting_runs", |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id FROM awaiting_reports ORDER BY registered_at, rowid",
            )?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    /// Claim an awaiting run for `reporter_id` and bind the alias in one transaction.
    ///
    /// A run whose hint equals the reporter wins; otherwise the oldest unhinted
    /// active run is taken.
    pub fn claim_awaiting(&self, reporter_id: &str, now: DateTime<Utc>) -> Result<Option<ClaimedRun>> {
        self.timed("claim_awaiting", |conn| {
            let tx = conn.transaction()?;
            let hinted: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT a.run_id FROM awaiting_reports a JOIN runs r ON r.run_id = a.run_id \
                         WHERE a.hint = ?1 AND r.status IN {ACTIVE_STATUSES} \
                         ORDER BY a.registered_at, a.rowid LIMIT 1"
                    ),
                    params![reporter_id],
                    |row| row.get(0),
                )
                .optional()?;
            let candidates: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM awaiting_reports a JOIN runs r ON r.run_id = a.run_id \
                     WHERE a.hint IS NULL AND r.status IN {ACTIVE_STATUSES}"
                ),
                [],
                |row| row.get(0),
            )?;
            let (run_id, is_hinted) = match hinted {
                Some(run_id) => (run_id, true),
                None => {
                    let fifo: Option<String> = tx
                        .query_row(
                            &format!(
                                "SELECT a.run_id FROM awaiting_reports a \
                                 JOIN runs r ON r.run_id = a.run_id \
                                 WHERE a.hint IS NULL AND r.status IN {ACTIVE_STATUSES} \
                                 ORDER BY a.registered_at, a.rowid LIMIT 1"
                            ),
                            [],
                            |row| row.get(0),
                        )
                        .optional()?;
                    match fifo {
                        Some(run_id) => (run_id, false),
                        None => return Ok(None),
                    }
                }
            };
            tx.execute(
                "DELETE FROM awaiting_reports WHERE run_id = ?1",
                params![run_id],
            )?;
            let bound = bind_alias_row(&tx, reporter_id, &run_id, now)?;
            tx.commit()?;
            Ok(Some(ClaimedRun {
                run_id: bound,
                candidates: usize::try_from(candidates).unwrap_or_default(),
                hinted: is_hinted,
            }))
        })
    }

    /// Persist a started stage handle.
    pub fn record_stage(
        &self,
        run_id: &str,
        stage: &str,
        handle: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.timed("record_stage", |conn| {
            Ok(conn.execute(
                "INSERT INTO run_stages (run_id, stage, handle, started_at, stopped_at) \
                 VALUES (?1, ?2, ?3, ?4, NULL) \
                 ON CONFLICT (run_id, stage) DO UPDATE SET handle = excluded.handle, \
                 started_at = excluded.started_at, stopped_at = NULL",
                params![run_id, stage, handle, now],
            )?)
        })
    }

    /// Mark a stage as torn down.
    pub fn mark_stage_stopped(&self, run_id: &str, stage: &str, now: DateTime<Utc>) -> Result<usize> {
        self.timed("mark_stage_stopped", |conn| {
            Ok(conn.execute(
                "UPDATE run_stages SET stopped_at = ?1 \
                 WHERE run_id = ?2 AND stage = ?3 AND stopped_at IS NULL",
                params![now, run_id, stage],
            )?)
        })
    }

    /// All stages recorded for a run, in start order.
    pub fn stages_for(&self, run_id: &str) -> Result<Vec<StageRow>> {
        self.timed("stages_for", |conn| {
            let mut stmt = conn.prepare(
                "SELECT stage, handle, started_at, stopped_at FROM run_stages \
                 WHERE run_id = ?1 ORDER BY started_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok(StageRow {
                        stage: row.get(0)?,
                        handle: row.get(1)?,
                        started_at: row.get(2)?,
                        stopped_at: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Stages that were started and not yet torn down.
    pub fn active_stages(&self, run_id: &str) -> Result<Vec<StageRow>> {
        Ok(self
            .stages_for(run_id)?
            .into_iter()
            .filter(|row| row.stopped_at.is_none())
            .collect())
    }

    /// Trades stored for a run, ordered by execution time.
    pub fn trades_for(&self, run_id: &str) -> Result<Vec<TradeRecord>> {
        let rows = self.timed("trades_for", |conn| {
            let mut stmt = conn.prepare(
                "SELECT trade_id, symbol, side, quantity, price, timestamp_ms, confidence, fees, \
                 source_algo FROM trades WHERE run_id = ?1 ORDER BY timestamp_ms, id",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(
                |(trade_id, symbol, side, quantity, price, timestamp_ms, confidence, fees, source_algo)|
                 -> Result<TradeRecord> {
                    Ok(TradeRecord {
                        side: side.parse().map_err(PersistenceError::Corrupt)?,
                        trade_id,
                        symbol,
                        quantity,
                        price,
                        timestamp_ms,
                        confidence,
                        fees,
                        source_algo,
                    })
                },
            )
            .collect()
    }

    /// Positions stored for a run, by symbol.
    pub fn positions_for(&self, run_id: &str) -> Result<Vec<PositionRecord>> {
        self.timed("positions_for", |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, quantity, avg_price, unrealized_pnl, realized_pnl, last_price, \
                 last_update_ms FROM positions WHERE run_id = ?1 ORDER BY symbol",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok(PositionRecord {
                        symbol: row.get(0)?,
                        quantity: row.get(1)?,
                        avg_price: row.get(2)?,
                        unrealized_pnl: row.get(3)?,
                        realized_pnl: row.get(4)?,
                        last_price: row.get(5)?,
                        last_update_ms: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

fn insert_placeholder_row(conn: &Connection, run_id: &str, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO runs (run_id, status, placeholder, created_at, started_at, updated_at) \
         VALUES (?1, ?2, 1, ?3, ?3, ?3)",
        params![run_id, RunStatus::Running.as_str(), now],
    )
}

fn bind_alias_row(
    conn: &Connection,
    reporter_id: &str,
    run_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<String> {
    conn.execute(
        "INSERT OR IGNORE INTO run_aliases (reporter_id, run_id, bound_at) VALUES (?1, ?2, ?3)",
        params![reporter_id, run_id, now],
    )?;
    conn.query_row(
        "SELECT run_id FROM run_aliases WHERE reporter_id = ?1",
        params![reporter_id],
        |row| row.get(0),
    )
}

fn parse_status(raw: &str) -> Result<RunStatus> {
    raw.parse().map_err(PersistenceError::Corrupt)
}

struct RawRun {
    run_id: String,
    status: String,
    placeholder: bool,
    config_json: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    metrics: RunMetrics,
    metrics_observed_at: Option<i64>,
    error_message: Option<String>,
}

fn read_raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        status: row.get(1)?,
        placeholder: row.get(2)?,
        config_json: row.get(3)?,
        created_at: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        updated_at: row.get(7)?,
        metrics: RunMetrics {
            final_capital: row.get(8)?,
            total_pnl: row.get(9)?,
            total_fees: row.get(10)?,
            net_pnl: row.get(11)?,
            return_pct: row.get(12)?,
            max_drawdown: row.get(13)?,
            total_trades: row.get(14)?,
            winning_trades: row.get(15)?,
            losing_trades: row.get(16)?,
            win_rate: row.get(17)?,
            signals_received: row.get(18)?,
            signals_executed: row.get(19)?,
            execution_rate: row.get(20)?,
            total_volume: row.get(21)?,
            sharpe_ratio: row.get(22)?,
            avg_win: row.get(23)?,
            avg_loss: row.get(24)?,
        },
        metrics_observed_at: row.get(25)?,
        error_message: row.get(26)?,
    })
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        let config = self
            .config_json
            .as_deref()
            .map(serde_json::from_str::<RunConfig>)
            .transpose()?;
        Ok(RunRecord {
            status: parse_status(&self.status)?,
            run_id: self.run_id,
            placeholder: self.placeholder,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            updated_at: self.updated_at,
            config,
            metrics: self.metrics,
            metrics_observed_at: self
                .metrics_observed_at
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            error_message: self.error_message,
        })
    }
}
