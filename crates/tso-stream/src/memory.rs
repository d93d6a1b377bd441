//! ---
//! tso_section: "04-messaging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "In-process event stream used by tests and single-process deployments."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::group::GroupState;
use crate::{
    EntryId, EventStream, Fields, GroupCreation, Result, StreamEntry, StreamError, StreamInfo,
};

#[derive(Default)]
struct MemoryInner {
    entries: Vec<Fields>,
    groups: BTreeMap<String, GroupState>,
}

/// Stream kept entirely in memory.
///
/// Availability can be toggled to exercise reconnect paths.
pub struct MemoryStream {
    name: String,
    inner: Mutex<MemoryInner>,
    appended: Notify,
    available: AtomicBool,
}

impl MemoryStream {
    /// Create an empty stream.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryInner::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no entries were appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StreamError::Unavailable(format!(
                "memory stream `{}` is offline",
                self.name
            )))
        }
    }

    fn unknown_group(&self, group: &str) -> StreamError {
        StreamError::UnknownGroup {
            stream: self.name.clone(),
            group: group.to_string(),
        }
    }

    fn take_new(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let MemoryInner { entries, groups } = &mut *inner;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| self.unknown_group(group))?;
        let ids = state.next_batch(entries.len() as EntryId, count);
        state.deliver(consumer, &ids, Utc::now());
        Ok(collect(entries, &ids))
    }
}

fn collect(entries: &[Fields], ids: &[EntryId]) -> Vec<StreamEntry> {
    ids.iter()
        .filter_map(|id| {
            let index = usize::try_from(*id).ok()?.checked_sub(1)?;
            entries.get(index).map(|fields| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl EventStream for MemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_group(&self, group: &str) -> Result<GroupCreation> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if inner.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        inner.groups.insert(group.to_string(), GroupState::default());
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Registered before the check so an append in between still wakes us.
            let notified = self.appended.notified();
            let batch = self.take_new(group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let MemoryInner { entries, groups } = &mut *inner;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| self.unknown_group(group))?;
        let ids = state.redeliver(consumer, count, Utc::now());
        Ok(collect(entries, &ids))
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| self.unknown_group(group))?;
        Ok(state.ack(ids))
    }

    async fn append(&self, fields: Fields) -> Result<EntryId> {
        self.check_available()?;
        let id = {
            let mut inner = self.inner.lock();
            inner.entries.push(fields);
            inner.entries.len() as EntryId
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn info(&self) -> Result<StreamInfo> {
        self.check_available()?;
        let inner = self.inner.lock();
        let length = inner.entries.len() as u64;
        Ok(StreamInfo {
            name: self.name.clone(),
            length,
            last_id: length,
            groups: inner
                .groups
                .iter()
                .map(|(name, state)| state.info(name))
                .collect(),
        })
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
