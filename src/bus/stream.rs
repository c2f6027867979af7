//! Durable append-only stream backing one topic.
//!
//! Grounded on `knhk-workflow-engine::state::store`'s sled-tree-per-concern
//! layout; entry ids come from `sled::Tree::generate_id`, which hands out a
//! per-tree monotonically increasing counter — exactly the "monotonically
//! increasing entry identifier assigned by the store" spec.md §3 asks for.

use crate::error::CoreResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One durable entry: the id the store assigned plus the raw (already
/// envelope-encoded) payload bytes.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry_id: u64,
    pub payload: Vec<u8>,
}

fn id_to_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn key_to_id(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(key);
    u64::from_be_bytes(buf)
}

/// Append-only log over a single sled tree, keyed by big-endian entry id
/// so range scans come back in append order for free.
pub struct DurableStream {
    tree: sled::Tree,
    /// Woken on every append so reader loops can block-wait instead of
    /// busy-polling for new entries (spec.md §4.2 "blocking read of next
    /// pending or new entries").
    notify: Arc<Notify>,
}

impl DurableStream {
    pub fn open(db: &sled::Db, topic: &str) -> CoreResult<Self> {
        let tree = db.open_tree(format!("stream::{topic}"))?;
        Ok(Self {
            tree,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Append `payload`, returning the entry id the store assigned.
    pub fn append(&self, payload: Vec<u8>) -> CoreResult<u64> {
        let id = self.tree.generate_id()?;
        self.tree.insert(id_to_key(id), payload)?;
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Entries strictly after `after_id`, oldest first, capped at
    /// `limit`.
    pub fn read_after(&self, after_id: u64, limit: usize) -> CoreResult<Vec<StoredEntry>> {
        let start = id_to_key(after_id.saturating_add(1));
        let mut out = Vec::with_capacity(limit.min(64));
        for item in self.tree.range(start..) {
            let (key, value) = item?;
            out.push(StoredEntry {
                entry_id: key_to_id(&key),
                payload: value.to_vec(),
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Fetch a specific entry, e.g. for dead-letter replay.
    pub fn get(&self, entry_id: u64) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.tree.get(id_to_key(entry_id))?.map(|v| v.to_vec()))
    }

    /// Block until either a new entry is appended or `timeout` elapses —
    /// whichever first. Used by reader loops between batches.
    pub async fn wait_for_append(&self, timeout: Duration) {
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Trim to at most `max_entries`, dropping the oldest first (one of
    /// the two configurable trim policies spec.md §3 names).
    pub fn trim_by_count(&self, max_entries: usize) -> CoreResult<usize> {
        let mut trimmed = 0;
        while self.tree.len() > max_entries {
            if let Some((key, _)) = self.tree.iter().next().transpose()? {
                self.tree.remove(key)?;
                trimmed += 1;
            } else {
                break;
            }
        }
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> DurableStream {
        let db = sled::Config::new().temporary(true).open().unwrap();
        DurableStream::open(&db, "agent-invoke.echo").unwrap()
    }

    #[test]
    fn entry_ids_are_monotonic() {
        let s = stream();
        let a = s.append(b"one".to_vec()).unwrap();
        let b = s.append(b"two".to_vec()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn read_after_returns_in_append_order() {
        let s = stream();
        let a = s.append(b"one".to_vec()).unwrap();
        s.append(b"two".to_vec()).unwrap();
        s.append(b"three".to_vec()).unwrap();

        let entries = s.read_after(a, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, b"two");
        assert_eq!(entries[1].payload, b"three");
    }

    #[test]
    fn read_after_zero_returns_everything() {
        let s = stream();
        s.append(b"one".to_vec()).unwrap();
        s.append(b"two".to_vec()).unwrap();
        assert_eq!(s.read_after(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn trim_by_count_drops_oldest_first() {
        let s = stream();
        s.append(b"one".to_vec()).unwrap();
        s.append(b"two".to_vec()).unwrap();
        s.append(b"three".to_vec()).unwrap();
        let trimmed = s.trim_by_count(1).unwrap();
        assert_eq!(trimmed, 2);
        assert_eq!(s.len(), 1);
        let remaining = s.read_after(0, 10).unwrap();
        assert_eq!(remaining[0].payload, b"three");
    }

    #[tokio::test]
    async fn wait_for_append_wakes_on_publish() {
        let s = Arc::new(stream());
        let waiter = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            waiter.wait_for_append(Duration::from_secs(5)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.append(b"wake".to_vec()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }
}
