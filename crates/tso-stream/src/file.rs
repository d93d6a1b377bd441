//! ---
//! tso_section: "04-messaging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Durable JSONL event stream with persisted consumer-group state."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Layout on disk, per stream:
//!
//! * `<dir>/<name>.log`: header line followed by one JSON record per entry.
//! * `<dir>/<name>.groups.json`: cursor and pending entries of every group.
//!
//! Entry identifiers are line ordinals, so external producers may append
//! records with `O_APPEND` without coordinating sequence numbers.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::group::GroupState;
use crate::{
    EntryId, EventStream, Fields, GroupCreation, Result, StreamEntry, StreamError, StreamInfo,
};

const STREAM_LOG_VERSION: u16 = 1;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct StreamLogHeader {
    version: u16,
    stream: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamRecord {
    #[serde(default)]
    appended_at: Option<DateTime<Utc>>,
    fields: Fields,
}

#[derive(Default)]
struct FileInner {
    entries: Vec<Fields>,
    offset: u64,
    header_seen: bool,
    groups: BTreeMap<String, GroupState>,
}

/// Stream persisted as an append-only JSONL file.
pub struct FileStream {
    name: String,
    log_path: PathBuf,
    groups_path: PathBuf,
    inner: Mutex<FileInner>,
    appended: Notify,
}

impl FileStream {
    /// Open or create the stream `name` under `dir`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
        let log_path = dir.join(format!("{name}.log"));
        let groups_path = dir.join(format!("{name}.groups.json"));

        let is_new = fs::metadata(&log_path).map(|meta| meta.len() == 0).unwrap_or(true);
        if is_new {
            let header = StreamLogHeader {
                version: STREAM_LOG_VERSION,
                stream: name.to_string(),
                created_at: Utc::now(),
            };
            let mut file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            let mut line = serde_json::to_vec(&header)?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.flush()?;
        }

        let groups = if groups_path.exists() {
            let raw = fs::read(&groups_path)?;
            serde_json::from_slice(&raw)?
        } else {
            BTreeMap::new()
        };

        let stream = Self {
            name: name.to_string(),
            log_path,
            groups_path,
            inner: Mutex::new(FileInner {
                groups,
                ..FileInner::default()
            }),
            appended: Notify::new(),
        };
        {
            let mut inner = stream.inner.lock();
            stream.refresh(&mut inner)?;
        }
        Ok(stream)
    }

    /// Path of the entry log.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Pull in complete lines written since the last refresh.
    fn refresh(&self, inner: &mut FileInner) -> Result<()> {
        let mut file = File::open(&self.log_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StreamError::Unavailable(format!("{} is missing", self.log_path.display()))
            } else {
                StreamError::Io(err)
            }
        })?;
        file.seek(SeekFrom::Start(inner.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut consumed = 0usize;
        while let Some(pos) = buf[consumed..].iter().position(|byte| *byte == b'\n') {
            let line = &buf[consumed..consumed + pos];
            consumed += pos + 1;
            if !inner.header_seen {
                inner.header_seen = true;
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<StreamRecord>(line) {
                Ok(record) => inner.entries.push(record.fields),
                Err(err) => {
                    // Keep the ordinal so ids stay stable; consumers see an empty entry.
                    warn!(
                        stream = %self.name,
                        entry = inner.entries.len() + 1,
                        error = %err,
                        "unparseable stream record"
                    );
                    inner.entries.push(Fields::new());
                }
            }
        }
        inner.offset += consumed as u64;
        Ok(())
    }

    fn persist_groups(&self, groups: &BTreeMap<String, GroupState>) -> Result<()> {
        let tmp = self.groups_path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(groups)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.groups_path)?;
        Ok(())
    }

    fn unknown_group(&self, group: &str) -> StreamError {
        StreamError::UnknownGroup {
            stream: self.name.clone(),
            group: group.to_string(),
        }
    }

    fn take_new(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut guard = self.inner.lock();
        self.refresh(&mut guard)?;
        let inner = &mut *guard;
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| self.unknown_group(group))?;
        let ids = state.next_batch(inner.entries.len() as EntryId, count);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        state.deliver(consumer, &ids, Utc::now());
        self.persist_groups(&inner.groups)?;
        Ok(collect(&inner.entries, &ids))
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
impl EventStream for FileStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_group(&self, group: &str) -> Result<GroupCreation> {
        let mut inner = self.inner.lock();
        if inner.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        inner.groups.insert(group.to_string(), GroupState::default());
        self.persist_groups(&inner.groups)?;
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
            let notified = self.appended.notified();
            let batch = self.take_new(group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Other processes append without notifying us, so poll as well.
            let wake = deadline.min(now + POLL_INTERVAL);
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut guard = self.inner.lock();
        self.refresh(&mut guard)?;
        let inner = &mut *guard;
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| self.unknown_group(group))?;
        let ids = state.redeliver(consumer, count, Utc::now());
        if !ids.is_empty() {
            self.persist_groups(&inner.groups)?;
        }
        Ok(collect(&inner.entries, &ids))
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| self.unknown_group(group))?;
        let acked = state.ack(ids);
        if acked > 0 {
            self.persist_groups(&inner.groups)?;
        }
        Ok(acked)
    }

    /// Appends a record and returns the ordinal visible after the write.
    /// Concurrent writers in other processes may shift the returned id.
    async fn append(&self, fields: Fields) -> Result<EntryId> {
        let record = StreamRecord {
            appended_at: Some(Utc::now()),
            fields,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let id = {
            let mut inner = self.inner.lock();
            let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
            file.write_all(&line)?;
            file.flush()?;
            self.refresh(&mut inner)?;
            inner.entries.len() as EntryId
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> Result<()> {
        fs::metadata(&self.log_path).map_err(|err| {
            StreamError::Unavailable(format!("{}: {err}", self.log_path.display()))
        })?;
        Ok(())
    }

    async fn info(&self) -> Result<StreamInfo> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
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

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("name", &self.name)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fields(run_id: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("type".into(), "live_stats".into());
        fields.insert("run_id".into(), run_id.into());
        fields
    }

    #[tokio::test]
    async fn pending_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let stream = FileStream::open(dir.path(), "trading-stats").unwrap();
            stream.ensure_group("g").await.unwrap();
            stream.append(fields("a")).await.unwrap();
            stream.append(fields("b")).await.unwrap();
            let batch = stream
                .read_group("g", "c", 10, Duration::from_millis(5))
                .await
                .unwrap();
            assert_eq!(batch.len(), 2);
            stream.ack("g", &[1]).await.unwrap();
        }

        let reopened = FileStream::open(dir.path(), "trading-stats").unwrap();
        assert_eq!(
            reopened.ensure_group("g").await.unwrap(),
            GroupCreation::AlreadyExists
        );
        let pending = reopened.read_pending("g", "c", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field("run_id"), Some("b"));
        assert!(reopened
            .read_group("g", "c", 10, Duration::from_millis(5))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn external_appends_and_garbage_lines_are_picked_up() {
        let dir = tempdir().unwrap();
        let stream = FileStream::open(dir.path(), "s").unwrap();
        stream.ensure_group("g").await.unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(stream.log_path())
            .unwrap();
        file.write_all(b"not json\n").unwrap();
        file.write_all(b"{\"fields\":{\"type\":\"trade_event\"}}\n")
            .unwrap();
        file.write_all(b"{\"fields\":{\"type\":\"par").unwrap();

        let batch = stream
            .read_group("g", "c", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].fields.is_empty());
        assert_eq!(batch[1].field("type"), Some("trade_event"));

        file.write_all(b"tial\"}}\n").unwrap();
        let info = stream.info().await.unwrap();
        assert_eq!(info.length, 3);
        assert_eq!(info.groups[0].pending, 2);
    }

    #[tokio::test]
    async fn missing_log_is_unavailable() {
        let dir = tempdir().unwrap();
        let stream = FileStream::open(dir.path(), "s").unwrap();
        fs::remove_file(stream.log_path()).unwrap();
        assert!(stream.ping().await.unwrap_err().is_transient());
        assert!(stream.info().await.unwrap_err().is_transient());
    }
}
