//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Canonical run identifiers and reporter alias binding."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Workers report under their own identifiers. The registry maps every
//! reporter identifier onto exactly one canonical run, durably and for good.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use tso_metrics::OrchestratorMetrics;
use tso_persistence::RunStore;
use uuid::Uuid;

use crate::error::Result;

/// How a reporter identifier was mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOrigin {
    /// Served from the in-process cache of durable bindings.
    Cached,
    /// Found in the durable alias table.
    Alias,
    /// The reporter used the canonical identifier itself.
    Canonical,
    /// Claimed a run that was waiting for its first report.
    Claimed,
    /// No run matched; a placeholder run was adopted for the reporter.
    Orphan,
}

impl ResolutionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionOrigin::Cached => "cached",
            ResolutionOrigin::Alias => "alias",
            ResolutionOrigin::Canonical => "canonical",
            ResolutionOrigin::Claimed => "claimed",
            ResolutionOrigin::Orphan => "orphan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub canonical_id: String,
    pub origin: ResolutionOrigin,
    /// A placeholder run row was created while resolving.
    pub created: bool,
}

/// Generates canonical identifiers and resolves reporter identifiers onto them.
pub struct IdentityRegistry {
    store: Arc<RunStore>,
    cache: RwLock<HashMap<String, String>>,
    metrics: Option<OrchestratorMetrics>,
}

impl IdentityRegistry {
    pub fn new(store: Arc<RunStore>, metrics: Option<OrchestratorMetrics>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// New canonical identifier, `run_<YYYY_MM_DD_HHMMSS>_<8 hex>`.
    pub fn generate(&self, now: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("run_{}_{}", now.format("%Y_%m_%d_%H%M%S"), &suffix[..8])
    }

    /// Record that `run_id` was just launched and awaits its first report.
    ///
    /// `hint` names the reporter identifier the run is expected to use, when known.
    pub fn expect_report(&self, run_id: &str, hint: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.store.register_awaiting(run_id, hint, now)?;
        debug!(run_id, hint, "run awaiting first worker report");
        Ok(())
    }

    /// Map a reporter identifier onto its canonical run, binding it on first sight.
    ///
    /// Resolution order: existing alias, the canonical identifier itself, an
    /// awaiting run, and finally a placeholder run adopted for the reporter.
    /// Repeated calls return the same canonical identifier.
    pub fn resolve(&self, reporter_id: &str, now: DateTime<Utc>) -> Result<Resolution> {
        if let Some(canonical_id) = self.cache.read().get(reporter_id).cloned() {
            return Ok(self.resolved(reporter_id, canonical_id, ResolutionOrigin::Cached, false));
        }

        if let Some(canonical_id) = self.store.lookup_alias(reporter_id)? {
            return Ok(self.resolved(reporter_id, canonical_id, ResolutionOrigin::Alias, false));
        }

        if self.store.run_exists(reporter_id)? {
            let canonical_id = self.store.bind_alias(reporter_id, reporter_id, now)?;
            self.store.clear_awaiting(&canonical_id)?;
            return Ok(self.resolved(
                reporter_id,
                canonical_id,
                ResolutionOrigin::Canonical,
                false,
            ));
        }

        if let Some(claim) = self.store.claim_awaiting(reporter_id, now)? {
            if claim.candidates > 1 && !claim.hinted {
                warn!(
                    reporter_id,
                    run_id = %claim.run_id,
                    candidates = claim.candidates,
                    "several runs awaited a first report; bound reporter to the oldest"
                );
            }
            info!(reporter_id, run_id = %claim.run_id, "reporter bound to awaiting run");
            return Ok(self.resolved(
                reporter_id,
                claim.run_id,
                ResolutionOrigin::Claimed,
                false,
            ));
        }

        let (canonical_id, created) = self.store.adopt_orphan(reporter_id, reporter_id, now)?;
        warn!(
            reporter_id,
            run_id = %canonical_id,
            created,
            "no run matched reporter; adopted as orphaned run"
        );
        Ok(self.resolved(reporter_id, canonical_id, ResolutionOrigin::Orphan, created))
    }

    /// Reporter identifiers bound to a run.
    pub fn aliases(&self, run_id: &str) -> Result<Vec<String>> {
        Ok(self.store.aliases_for(run_id)?)
    }

    /// Canonical identifier for `id` without binding anything.
    pub fn lookup(&self, id: &str) -> Result<Option<String>> {
        if let Some(canonical_id) = self.cache.read().get(id).cloned() {
            return Ok(Some(canonical_id));
        }
        if let Some(canonical_id) = self.store.lookup_alias(id)? {
            return Ok(Some(canonical_id));
        }
        Ok(self.store.run_exists(id)?.then(|| id.to_string()))
    }

    fn resolved(
        &self,
        reporter_id: &str,
        canonical_id: String,
        origin: ResolutionOrigin,
        created: bool,
    ) -> Resolution {
        if origin != ResolutionOrigin::Cached {
            self.cache
                .write()
                .insert(reporter_id.to_string(), canonical_id.clone());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_identity_resolution(origin.as_str());
        }
        Resolution {
            canonical_id,
            origin,
            created,
        }
    }
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}
