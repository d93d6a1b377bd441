//! ---
//! tso_section: "04-messaging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Consumer-group event stream abstraction and backends."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
//! Append-only event streams read through named consumer groups.
//!
//! Every group keeps a delivery cursor and a pending list of entries handed
//! to a consumer but not yet acknowledged. Unacknowledged entries survive a
//! consumer restart and are redelivered through [`EventStream::read_pending`].
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tso_common::{StreamBackend, StreamConfig};

mod file;
mod group;
mod memory;

pub use file::FileStream;
pub use memory::MemoryStream;

/// Result alias for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Ordinal identifier of a stream entry. Identifiers start at 1.
pub type EntryId = u64;

/// Field map carried by every entry.
pub type Fields = IndexMap<String, String>;

/// Errors raised by stream backends.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Backend cannot be reached right now.
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    /// Group was never created on this stream.
    #[error("consumer group `{group}` does not exist on stream `{stream}`")]
    UnknownGroup {
        /// Stream name.
        stream: String,
        /// Missing group name.
        group: String,
    },
    /// Underlying filesystem failure.
    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),
    /// Group state or entry could not be encoded.
    #[error("stream serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Whether reconnecting after a delay may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Unavailable(_) | StreamError::Io(_))
    }
}

/// Single entry read from a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Ordinal position in the stream.
    pub id: EntryId,
    /// String fields as written by the producer.
    pub fields: Fields,
}

impl StreamEntry {
    /// Look up a field by name.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Outcome of [`EventStream::ensure_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    /// Group did not exist and now starts at the beginning of the stream.
    Created,
    /// Group already existed; its cursor is untouched.
    AlreadyExists,
}

/// Snapshot of a consumer group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,
    /// Highest entry id handed to any consumer.
    pub last_delivered: EntryId,
    /// Entries delivered and not yet acknowledged.
    pub pending: usize,
    /// Distinct consumers holding pending entries.
    pub consumers: usize,
}

/// Snapshot of a stream and its groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Number of entries appended so far.
    pub length: u64,
    /// Identifier of the newest entry, 0 when empty.
    pub last_id: EntryId,
    /// Registered consumer groups.
    pub groups: Vec<GroupInfo>,
}

/// Consumer-group stream contract shared by all backends.
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    /// Name of the stream.
    fn name(&self) -> &str;

    /// Create the group at the start of the stream unless it already exists.
    async fn ensure_group(&self, group: &str) -> Result<GroupCreation>;

    /// Deliver up to `count` entries never handed to the group before,
    /// waiting at most `block` for the first one to arrive.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Return entries already delivered to `consumer` that are still unacknowledged.
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries and return how many were pending.
    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize>;

    /// Append an entry and return its identifier.
    async fn append(&self, fields: Fields) -> Result<EntryId>;

    /// Verify the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Describe the stream and its groups.
    async fn info(&self) -> Result<StreamInfo>;
}

/// Open the backend selected in configuration.
pub fn open_stream(config: &StreamConfig) -> Result<Arc<dyn EventStream>> {
    match config.backend {
        StreamBackend::File => {
            let stream = FileStream::open(&config.path, &config.stream_name)?;
            Ok(Arc::new(stream))
        }
        StreamBackend::Memory => Ok(Arc::new(MemoryStream::new(&config.stream_name))),
    }
}
