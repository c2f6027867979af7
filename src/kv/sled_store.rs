//! sled-backed [`KvStore`] implementation.
//!
//! Grounded on `knhk-workflow-engine::state::store::StateStore`'s
//! sled-opens-a-directory-of-trees shape. sled has no native per-key TTL,
//! so expiry is tracked in a side tree keyed by the entry's key and swept
//! lazily on read (a key past its TTL reads as absent even before a sweep
//! runs) plus periodically by a background task.

use super::{CasOutcome, HealthStatus, KvStore};
use crate::error::{CoreError, CoreResult};
use crate::resilience::{with_deadline, DeadlineConfig};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

/// sled-backed KV store with a namespace prefix applied to every key.
pub struct SledKvStore {
    db: sled::Db,
    values: sled::Tree,
    ttls: sled::Tree,
    namespace: String,
    deadlines: DeadlineConfig,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SledKvStore {
    /// Open (or create) the sled database at `path`, namespacing all keys
    /// under `namespace`.
    pub fn open<P: AsRef<Path>>(path: P, namespace: impl Into<String>) -> CoreResult<Self> {
        let db = sled::open(path)?;
        let values = db.open_tree("values")?;
        let ttls = db.open_tree("ttls")?;
        Ok(Self {
            db,
            values,
            ttls,
            namespace: namespace.into(),
            deadlines: DeadlineConfig::default(),
        })
    }

    /// Build a store over an already-open `sled::Db`, so the bus and the
    /// KV namespace can share one on-disk database (spec.md §6: "one
    /// embedded store backs both the bus and the KV namespace") without
    /// each independently locking the same path.
    pub fn from_db(db: sled::Db, namespace: impl Into<String>) -> CoreResult<Self> {
        let values = db.open_tree("kv_values")?;
        let ttls = db.open_tree("kv_ttls")?;
        Ok(Self {
            db,
            values,
            ttls,
            namespace: namespace.into(),
            deadlines: DeadlineConfig::default(),
        })
    }

    /// Open a temporary, in-memory-backed store — used by tests and the
    /// S1-S6 scenario suite.
    pub fn open_temporary(namespace: impl Into<String>) -> CoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let values = db.open_tree("values")?;
        let ttls = db.open_tree("ttls")?;
        Ok(Self {
            db,
            values,
            ttls,
            namespace: namespace.into(),
            deadlines: DeadlineConfig::default(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// True if `key` has an expiry recorded and it is in the past. Does
    /// not mutate state; callers decide whether to sweep.
    fn is_expired(&self, key: &str) -> CoreResult<bool> {
        match self.ttls.get(key)? {
            Some(raw) => {
                let expiry = u64::from_be_bytes(
                    raw.as_ref()
                        .try_into()
                        .map_err(|_| CoreError::Internal {
                            message: "corrupt ttl entry".to_string(),
                        })?,
                );
                Ok(expiry <= now_ms())
            }
            None => Ok(false),
        }
    }

    fn sweep_if_expired(&self, key: &str) -> CoreResult<()> {
        if self.is_expired(key)? {
            self.values.remove(key)?;
            self.ttls.remove(key)?;
        }
        Ok(())
    }

    /// Sweep every key with a past-due TTL. Intended to run on a periodic
    /// background task; also safe to call inline.
    pub fn sweep_expired(&self) -> CoreResult<usize> {
        let now = now_ms();
        let mut swept = 0;
        for entry in self.ttls.iter() {
            let (key, raw) = entry?;
            let expiry = u64::from_be_bytes(
                raw.as_ref()
                    .try_into()
                    .map_err(|_| CoreError::Internal {
                        message: "corrupt ttl entry".to_string(),
                    })?,
            );
            if expiry <= now {
                self.values.remove(&key)?;
                self.ttls.remove(&key)?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Spawn a background sweeper that runs every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.sweep_expired() {
                    Ok(n) if n > 0 => debug!(swept = n, "swept expired kv entries"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "ttl sweep failed"),
                }
            }
        })
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let key = self.namespaced(key);
        self.sweep_if_expired(&key)?;
        Ok(self.values.get(&key)?.map(|v| v.to_vec()))
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CoreResult<()> {
        let key = self.namespaced(key);
        self.values.insert(key.as_bytes(), value)?;
        match ttl {
            Some(d) => {
                let expiry = now_ms() + d.as_millis() as u64;
                self.ttls.insert(key.as_bytes(), &expiry.to_be_bytes())?;
            }
            None => {
                self.ttls.remove(key.as_bytes())?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn del(&self, key: &str) -> CoreResult<()> {
        let key = self.namespaced(key);
        self.values.remove(key.as_bytes())?;
        self.ttls.remove(key.as_bytes())?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let key = self.namespaced(key);
        self.sweep_if_expired(&key)?;
        let result = self
            .values
            .fetch_and_update(key.as_bytes(), |existing| {
                let current = existing
                    .and_then(|v| v.try_into().ok())
                    .map(i64::from_be_bytes)
                    .unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })?;
        let previous = result
            .and_then(|v| v.as_ref().try_into().ok())
            .map(i64::from_be_bytes)
            .unwrap_or(0);
        Ok(previous + 1)
    }

    #[instrument(skip(self, expected, new))]
    async fn cas(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CoreResult<CasOutcome> {
        let deadline = Duration::from_millis(self.deadlines.cas_ms);
        with_deadline("kv.cas", deadline, async {
            let key = self.namespaced(key);
            self.sweep_if_expired(&key)?;

            let outcome = self.values.compare_and_swap(
                key.as_bytes(),
                expected.as_deref(),
                Some(new.as_slice()),
            )?;

            match outcome {
                Ok(()) => {
                    match ttl {
                        Some(d) => {
                            let expiry = now_ms() + d.as_millis() as u64;
                            self.ttls.insert(key.as_bytes(), &expiry.to_be_bytes())?;
                        }
                        None => {
                            self.ttls.remove(key.as_bytes())?;
                        }
                    }
                    Ok(CasOutcome::Applied)
                }
                Err(err) => Ok(CasOutcome::NotApplied {
                    current: err.current.map(|v| v.to_vec()),
                }),
            }
        })
        .await
    }

    #[instrument(skip(self))]
    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        let full_prefix = self.namespaced(prefix);
        let ns_len = self.namespace.len() + 1;
        let mut out = Vec::new();
        for item in self.values.scan_prefix(full_prefix.as_bytes()) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key).into_owned();
            if self.is_expired(&key_str)? {
                continue;
            }
            out.push((key_str[ns_len..].to_string(), value.to_vec()));
        }
        Ok(out)
    }

    async fn health(&self) -> CoreResult<HealthStatus> {
        let start = Instant::now();
        let probe_key = format!("__health__:{}", uuid::Uuid::new_v4());
        let result = (|| -> CoreResult<()> {
            self.values.insert(probe_key.as_bytes(), b"ok".as_slice())?;
            let read_back = self.values.get(probe_key.as_bytes())?;
            self.values.remove(probe_key.as_bytes())?;
            if read_back.as_deref() != Some(b"ok".as_slice()) {
                return Err(CoreError::kv_transport("health probe read-back mismatch"));
            }
            Ok(())
        })();

        let latency = start.elapsed();
        match result {
            Ok(()) => Ok(HealthStatus {
                ok: true,
                latency,
                detail: format!("{} trees open", self.db.tree_names().len()),
            }),
            Err(e) => Ok(HealthStatus {
                ok: false,
                latency,
                detail: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SledKvStore {
        SledKvStore::open_temporary("test").expect("open temporary store")
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kv = store();
        kv.set("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn get_absent_key_is_none() {
        let kv = store();
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn del_is_idempotent() {
        let kv = store();
        kv.del("never-existed").await.unwrap();
        kv.set("x", b"1".to_vec(), None).await.unwrap();
        kv.del("x").await.unwrap();
        kv.del("x").await.unwrap();
        assert_eq!(kv.get("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_initializes_to_one() {
        let kv = store();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
        assert_eq!(kv.incr("counter").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cas_applies_on_match_and_rejects_on_mismatch() {
        let kv = store();
        let applied = kv
            .cas("job:1", None, b"v1".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(applied, CasOutcome::Applied);

        let conflict = kv
            .cas("job:1", None, b"v2".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            conflict,
            CasOutcome::NotApplied {
                current: Some(b"v1".to_vec())
            }
        );

        let applied2 = kv
            .cas("job:1", Some(b"v1".to_vec()), b"v2".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(applied2, CasOutcome::Applied);
        assert_eq!(kv.get("job:1").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expires_entry() {
        let kv = store();
        kv.set("temp", b"v".to_vec(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("temp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn namespacing_isolates_two_stores_on_the_same_backend() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let values = db.open_tree("values").unwrap();
        let ttls = db.open_tree("ttls").unwrap();
        let a = SledKvStore {
            db: db.clone(),
            values: values.clone(),
            ttls: ttls.clone(),
            namespace: "ns-a".to_string(),
            deadlines: DeadlineConfig::default(),
        };
        let b = SledKvStore {
            db,
            values,
            ttls,
            namespace: "ns-b".to_string(),
            deadlines: DeadlineConfig::default(),
        };

        a.set("shared", b"from-a".to_vec(), None).await.unwrap();
        b.set("shared", b"from-b".to_vec(), None).await.unwrap();

        assert_eq!(a.get("shared").await.unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(b.get("shared").await.unwrap(), Some(b"from-b".to_vec()));
    }

    #[tokio::test]
    async fn scan_prefix_lists_matching_keys_in_order() {
        let kv = store();
        kv.set("job:1", b"a".to_vec(), None).await.unwrap();
        kv.set("job:2", b"b".to_vec(), None).await.unwrap();
        kv.set("execution:1", b"c".to_vec(), None).await.unwrap();

        let jobs = kv.scan_prefix("job:").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].0, "job:1");
        assert_eq!(jobs[1].0, "job:2");
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired_entries() {
        let kv = store();
        kv.set("job:1", b"a".to_vec(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let jobs = kv.scan_prefix("job:").await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let kv = store();
        let status = kv.health().await.unwrap();
        assert!(status.ok);
    }
}
