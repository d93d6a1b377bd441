//! ---
//! tso_section: "04-messaging"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Consumer-group cursor and pending-entry bookkeeping."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntryId, GroupInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PendingEntry {
    pub consumer: String,
    pub delivery_count: u32,
    pub delivered_at: DateTime<Utc>,
}

/// Delivery cursor plus unacknowledged entries for one group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct GroupState {
    pub last_delivered: EntryId,
    #[serde(default)]
    pub pending: BTreeMap<EntryId, PendingEntry>,
}

impl GroupState {
    /// Identifiers past the cursor, capped at `count` and `available`.
    pub fn next_batch(&self, available: EntryId, count: usize) -> Vec<EntryId> {
        if count == 0 {
            return Vec::new();
        }
        (self.last_delivered + 1..=available).take(count).collect()
    }

    /// Move the cursor and record `ids` as pending for `consumer`.
    pub fn deliver(&mut self, consumer: &str, ids: &[EntryId], now: DateTime<Utc>) {
        for id in ids {
            self.last_delivered = self.last_delivered.max(*id);
            self.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    delivered_at: now,
                },
            );
        }
    }

    /// Pending identifiers owned by `consumer`, oldest first. Bumps delivery counts.
    pub fn redeliver(&mut self, consumer: &str, count: usize, now: DateTime<Utc>) -> Vec<EntryId> {
        let mut ids = Vec::new();
        for (id, entry) in self.pending.iter_mut() {
            if ids.len() >= count {
                break;
            }
            if entry.consumer == consumer {
                entry.delivery_count = entry.delivery_count.saturating_add(1);
                entry.delivered_at = now;
                ids.push(*id);
            }
        }
        ids
    }

    pub fn ack(&mut self, ids: &[EntryId]) -> usize {
        ids.iter()
            .filter(|id| self.pending.remove(id).is_some())
            .count()
    }

    pub fn info(&self, name: &str) -> GroupInfo {
        let consumers: BTreeSet<&str> = self
            .pending
            .values()
            .map(|entry| entry.consumer.as_str())
            .collect();
        GroupInfo {
            name: name.to_string(),
            last_delivered: self.last_delivered,
            pending: self.pending.len(),
            consumers: consumers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_moves_cursor_and_tracks_pending() {
        let mut state = GroupState::default();
        let now = Utc::now();
        let batch = state.next_batch(5, 3);
        assert_eq!(batch, vec![1, 2, 3]);
        state.deliver("c1", &batch, now);
        assert_eq!(state.last_delivered, 3);
        assert_eq!(state.next_batch(5, 10), vec![4, 5]);

        assert_eq!(state.ack(&[2, 9]), 1);
        assert_eq!(state.redeliver("c1", 10, now), vec![1, 3]);
        assert!(state.redeliver("c2", 10, now).is_empty());
        assert_eq!(state.pending[&1].delivery_count, 2);
    }

    #[test]
    fn info_counts_distinct_consumers() {
        let mut state = GroupState::default();
        let now = Utc::now();
        state.deliver("a", &[1, 2], now);
        state.deliver("b", &[3], now);
        let info = state.info("g");
        assert_eq!(info.pending, 3);
        assert_eq!(info.consumers, 2);
        assert_eq!(info.last_delivered, 3);
    }
}
