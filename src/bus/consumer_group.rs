//! Consumer group state: last-delivered cursor plus the pending-entries
//! list used for redelivery (spec.md §3 "Consumer Group").
//!
//! Persisted to sled so a restart doesn't lose track of in-flight
//! deliveries (S6: entries published before a crash are still pending
//! for a fresh consumer after restart and get redelivered).

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub consumer: String,
    pub delivered_at_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerGroupState {
    pub last_delivered_id: u64,
    pub pending: BTreeMap<u64, PendingEntry>,
}

/// Durable handle for one (topic, group) cursor. The in-memory state is
/// the source of truth during a run; every mutation is mirrored to sled
/// before returning so a crash between mutation and persistence never
/// happens (persist-then-return, not the reverse).
pub struct ConsumerGroupStore {
    tree: sled::Tree,
    key: Vec<u8>,
    state: Mutex<ConsumerGroupState>,
}

impl ConsumerGroupStore {
    pub fn open(db: &sled::Db, topic: &str, group: &str) -> CoreResult<Self> {
        let tree = db.open_tree("consumer_groups")?;
        let key = format!("{topic}::{group}").into_bytes();
        let state = match tree.get(&key)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => ConsumerGroupState::default(),
        };
        Ok(Self {
            tree,
            key,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &ConsumerGroupState) -> CoreResult<()> {
        let raw = serde_json::to_vec(state)?;
        self.tree.insert(&self.key, raw)?;
        Ok(())
    }

    pub fn last_delivered_id(&self) -> u64 {
        self.state.lock().last_delivered_id
    }

    /// Record a new delivery: advances the cursor if `entry_id` is newer,
    /// and adds/refreshes the pending entry for `entry_id`.
    pub fn mark_delivered(
        &self,
        entry_id: u64,
        consumer: &str,
        now_ms: u64,
    ) -> CoreResult<u32> {
        let mut state = self.state.lock();
        if entry_id > state.last_delivered_id {
            state.last_delivered_id = entry_id;
        }
        let attempts = {
            let entry = state
                .pending
                .entry(entry_id)
                .or_insert_with(|| PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at_ms: now_ms,
                    attempts: 0,
                });
            entry.consumer = consumer.to_string();
            entry.delivered_at_ms = now_ms;
            entry.attempts += 1;
            entry.attempts
        };
        self.persist(&state)?;
        Ok(attempts)
    }

    /// Remove `entry_id` from pending — the only effect of an ack.
    pub fn ack(&self, entry_id: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.pending.remove(&entry_id);
        self.persist(&state)
    }

    /// Entries whose visibility deadline has passed and are eligible for
    /// redelivery (spec.md §4.2 state machine: `delivered(pending)[on
    /// timeout or nack] → delivered(pending)[retry]`).
    pub fn overdue(&self, visibility_timeout_ms: u64, now_ms: u64) -> Vec<(u64, u32)> {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .filter(|(_, entry)| now_ms.saturating_sub(entry.delivered_at_ms) >= visibility_timeout_ms)
            .map(|(id, entry)| (*id, entry.attempts))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}
