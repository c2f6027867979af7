//! Conductor core: a durable message bus, namespaced KV coordination
//! store, job scheduler, and observer channel for an agent-workflow
//! runtime.
//!
//! The three primitives compose but don't depend on each other's
//! internals: [`bus::Bus`] and [`kv::KvStore`] are usable standalone,
//! [`scheduler::Scheduler`] is built on top of both, and
//! [`observer::Observer`] is an optional fan-out any of them can feed.

pub mod bus;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod kv;
pub mod metrics;
pub mod observer;
pub mod resilience;
pub mod scheduler;
pub mod telemetry;

pub use bus::Bus;
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::RuntimeConfig;
pub use envelope::Envelope;
pub use error::{CoreError, CoreResult};
pub use ids::{IdGenerator, UuidGenerator};
pub use kv::{KvStore, SledKvStore};
pub use observer::{Observer, ObserverEvent, SharedObserver};
pub use scheduler::Scheduler;

/// Everything needed to stand up a conductor runtime in a single
/// process: the bus and KV store share one sled database, the
/// scheduler is wired to both, and the observer is always present
/// (spec.md §4.4 runs regardless of whether anything attaches).
pub struct Runtime {
    pub kv: std::sync::Arc<dyn KvStore>,
    pub bus: std::sync::Arc<Bus>,
    pub scheduler: std::sync::Arc<Scheduler>,
    pub observer: SharedObserver,
}

impl Runtime {
    /// Build a runtime backed by a single sled database at `data_dir`,
    /// per `config`. The Bus and KV store are separate sled trees within
    /// the same database file (spec.md §6 "one embedded store backs both
    /// the bus and the KV namespace").
    pub fn open(config: &RuntimeConfig) -> CoreResult<Self> {
        let db = sled::open(&config.kv.data_dir)?;
        let clock: SharedClock = std::sync::Arc::new(SystemClock);
        let ids: std::sync::Arc<dyn IdGenerator> = std::sync::Arc::new(UuidGenerator);
        let observer: SharedObserver = std::sync::Arc::new(Observer::new());

        let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(SledKvStore::from_db(
            db.clone(),
            config.kv.namespace.clone(),
        )?);
        let bus = std::sync::Arc::new(Bus::new(db, clock.clone(), config.bus.clone()));
        let scheduler = Scheduler::new(
            kv.clone(),
            bus.clone(),
            clock,
            ids,
            config.scheduler.clone(),
            Some(observer.clone()),
        );

        Ok(Self {
            kv,
            bus,
            scheduler,
            observer,
        })
    }

    /// Start the scheduler's dispatch ticker. Call once after `open`.
    pub fn start(&self) {
        self.scheduler.spawn_ticker();
    }

    /// Stop accepting new observer attachments, signal bus readers to
    /// drain, and stop the scheduler's ticker.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.bus.disconnect();
        self.observer.shutdown();
    }
}
