//! Durable message bus: publish/subscribe with a durable stream mirror,
//! consumer groups, explicit ack, and retry-on-failure (spec.md §4.2).
//!
//! Per the "durable-stream-only" decision recorded in DESIGN.md, every
//! publish goes through the durable stream — there is no separate
//! in-memory pub/sub path to keep in sync.

mod consumer_group;
mod dlq;
mod stream;

pub use dlq::{DeadLetter, DeadLetterQueue};
pub use stream::StoredEntry;

use crate::clock::SharedClock;
use crate::config::BusConfig;
use crate::envelope::{decode_envelope, encode_envelope, Envelope};
use crate::error::{CoreError, CoreResult};
use crate::resilience::{with_deadline, DeadlineConfig};
use async_trait::async_trait;
use consumer_group::ConsumerGroupStore;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream::DurableStream;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};

/// A registered consumer of entries on a topic. Handlers for one entry
/// are invoked concurrently (spec.md §4.2); the entry acks only if every
/// handler resolves successfully.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, envelope: &Envelope) -> CoreResult<()>;
}

/// Adapts a plain async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = CoreResult<()>> + Send,
{
    async fn invoke(&self, envelope: &Envelope) -> CoreResult<()> {
        (self.0)(envelope.clone()).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Informational only — the Bus does not deduplicate; handlers must
    /// treat the envelope's `message_id` as their own idempotency key
    /// (spec.md §4.2 "Deduplication").
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub group: String,
    pub consumer_name: Option<String>,
    pub visibility_timeout: Duration,
    pub max_in_flight: usize,
}

impl SubscribeOptions {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer_name: None,
            visibility_timeout: Duration::from_secs(30),
            max_in_flight: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusHealth {
    pub ok: bool,
    pub latency: Duration,
    pub detail: String,
}

/// One (topic, consumer-group) binding's durable state plus the handle
/// needed to stop its background reader task.
struct GroupBinding {
    state: Arc<ConsumerGroupStore>,
    semaphore: Arc<Semaphore>,
    handlers: Arc<std::sync::Mutex<Vec<Arc<dyn Handler>>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Durable pub/sub transport over sled-backed streams.
pub struct Bus {
    db: sled::Db,
    streams: DashMap<String, Arc<DurableStream>>,
    groups: DashMap<(String, String), Arc<GroupBinding>>,
    clock: SharedClock,
    config: BusConfig,
    consumer_seq: AtomicU64,
    deadlines: DeadlineConfig,
}

impl Bus {
    pub fn new(db: sled::Db, clock: SharedClock, config: BusConfig) -> Self {
        Self {
            db,
            streams: DashMap::new(),
            groups: DashMap::new(),
            clock,
            config,
            consumer_seq: AtomicU64::new(0),
            deadlines: DeadlineConfig::default(),
        }
    }

    fn stream_for(&self, topic: &str) -> CoreResult<Arc<DurableStream>> {
        if let Some(existing) = self.streams.get(topic) {
            return Ok(Arc::clone(&existing));
        }
        let stream = Arc::new(DurableStream::open(&self.db, topic)?);
        self.streams.insert(topic.to_string(), Arc::clone(&stream));
        Ok(stream)
    }

    fn dlq_for(&self, topic: &str) -> CoreResult<DeadLetterQueue> {
        DeadLetterQueue::for_topic(&self.db, topic)
    }

    /// Append `envelope` to `topic`'s durable stream. Returns once the
    /// write is durable (spec.md §4.2: "returns after the envelope is
    /// accepted by the durable mirror").
    #[instrument(skip(self, envelope, _options))]
    pub async fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
        _options: PublishOptions,
    ) -> CoreResult<u64> {
        let deadline = Duration::from_millis(self.deadlines.publish_ms);
        with_deadline("bus.publish", deadline, async {
            let stream = self.stream_for(topic)?;
            let payload = encode_envelope(envelope).map_err(|e| CoreError::ParseFailure {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
            let entry_id = stream.append(payload)?;
            debug!(topic, entry_id, message_id = %envelope.message_id, "published envelope");
            Ok(entry_id)
        })
        .await
    }

    /// Register `handler` on `topic` under `options.group`. The first
    /// subscriber for a (topic, group) pair spawns its reader task;
    /// later subscribers on the same pair just add another handler to
    /// the existing reader. Returns an unsubscribe closure that detaches
    /// only this handler.
    #[instrument(skip(self, handler, options))]
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> CoreResult<Unsubscribe> {
        let binding_key = (topic.to_string(), options.group.clone());
        let binding = match self.groups.get(&binding_key) {
            Some(existing) => {
                existing.handlers.lock().unwrap().push(Arc::clone(&handler));
                Arc::clone(&existing)
            }
            None => {
                let state = Arc::new(ConsumerGroupStore::open(&self.db, topic, &options.group)?);
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let semaphore = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
                let handlers = Arc::new(std::sync::Mutex::new(vec![Arc::clone(&handler)]));
                let binding = Arc::new(GroupBinding {
                    state: Arc::clone(&state),
                    semaphore: Arc::clone(&semaphore),
                    handlers: Arc::clone(&handlers),
                    shutdown_tx,
                });
                self.groups.insert(binding_key.clone(), Arc::clone(&binding));

                let consumer_name = options.consumer_name.clone().unwrap_or_else(|| {
                    format!(
                        "consumer-{}",
                        self.consumer_seq.fetch_add(1, Ordering::Relaxed)
                    )
                });
                self.spawn_reader(
                    topic.to_string(),
                    options.group.clone(),
                    consumer_name,
                    options.visibility_timeout,
                    state,
                    semaphore,
                    handlers,
                    shutdown_rx,
                )?;
                binding
            }
        };

        Ok(Unsubscribe {
            bus: Arc::clone(self),
            key: binding_key,
            handler,
        })
    }

    fn spawn_reader(
        self: &Arc<Self>,
        topic: String,
        group: String,
        consumer_name: String,
        visibility_timeout: Duration,
        state: Arc<ConsumerGroupStore>,
        semaphore: Arc<Semaphore>,
        handlers: Arc<std::sync::Mutex<Vec<Arc<dyn Handler>>>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> CoreResult<()> {
        let stream = self.stream_for(&topic)?;
        let dlq = Arc::new(self.dlq_for(&topic)?);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let dispatch_topic = topic.clone();
        let handler_invocation_ms = self.deadlines.handler_invocation_ms;

        tokio::spawn(async move {
            info!(topic = %dispatch_topic, group = %group, consumer = %consumer_name, "reader started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                // Backpressure (spec.md §4.2): when in-flight capacity is
                // exhausted, stop fetching rather than queuing more work
                // behind the semaphore than handlers can drain.
                if semaphore.available_permits() == 0 {
                    tokio::select! {
                        acquired = semaphore.acquire() => { drop(acquired); }
                        _ = shutdown_rx.changed() => {}
                    }
                    continue;
                }

                let now_ms = clock.now().timestamp_millis().max(0) as u64;
                let overdue = state.overdue(visibility_timeout.as_millis() as u64, now_ms);
                let mut redelivered = 0usize;
                for (entry_id, attempts) in overdue {
                    if attempts >= config.max_delivery_attempts {
                        if let Ok(Some(payload)) = stream.get(entry_id) {
                            let _ = dlq.push(
                                &dispatch_topic,
                                entry_id,
                                &payload,
                                "max delivery attempts exceeded".to_string(),
                                attempts,
                            );
                        }
                        let _ = state.ack(entry_id);
                        continue;
                    }
                    if let Ok(Some(payload)) = stream.get(entry_id) {
                        redelivered += 1;
                        Self::dispatch_entry(
                            entry_id,
                            payload,
                            dispatch_topic.clone(),
                            consumer_name.clone(),
                            now_ms,
                            Arc::clone(&state),
                            Arc::clone(&semaphore),
                            Arc::clone(&handlers),
                            Arc::clone(&dlq),
                            config.max_delivery_attempts,
                            handler_invocation_ms,
                        );
                    }
                }

                let last_id = state.last_delivered_id();
                let new_entries = stream
                    .read_after(last_id, config.batch_size)
                    .unwrap_or_default();
                let mut dispatched_new = 0usize;
                for entry in new_entries {
                    let now_ms = clock.now().timestamp_millis().max(0) as u64;
                    dispatched_new += 1;
                    Self::dispatch_entry(
                        entry.entry_id,
                        entry.payload,
                        dispatch_topic.clone(),
                        consumer_name.clone(),
                        now_ms,
                        Arc::clone(&state),
                        Arc::clone(&semaphore),
                        Arc::clone(&handlers),
                        Arc::clone(&dlq),
                        config.max_delivery_attempts,
                        handler_invocation_ms,
                    );
                }

                if redelivered == 0 && dispatched_new == 0 {
                    tokio::select! {
                        _ = stream.wait_for_append(Duration::from_millis(config.block_timeout_ms)) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
            info!(topic = %dispatch_topic, group = %group, consumer = %consumer_name, "reader stopped");
        });

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_entry(
        entry_id: u64,
        payload: Vec<u8>,
        topic: String,
        consumer_name: String,
        now_ms: u64,
        state: Arc<ConsumerGroupStore>,
        semaphore: Arc<Semaphore>,
        handlers: Arc<std::sync::Mutex<Vec<Arc<dyn Handler>>>>,
        dlq: Arc<DeadLetterQueue>,
        max_attempts: u32,
        handler_invocation_ms: u64,
    ) {
        let attempts = match state.mark_delivered(entry_id, &consumer_name, now_ms) {
            Ok(a) => a,
            Err(e) => {
                warn!(topic, entry_id, error = %e, "failed to record delivery");
                return;
            }
        };

        tokio::spawn(async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                return;
            };
            let _permit = permit;

            let envelope = match decode_envelope(&payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(topic, entry_id, error = %e, "poison entry, acking to avoid infinite loop");
                    let _ = state.ack(entry_id);
                    return;
                }
            };

            let deadline = Duration::from_millis(handler_invocation_ms);
            let handler_list: Vec<Arc<dyn Handler>> = handlers.lock().unwrap().clone();
            let results = join_all(
                handler_list
                    .iter()
                    .map(|h| with_deadline("bus.handler_invocation", deadline, h.invoke(&envelope))),
            )
            .await;
            let all_ok = results.iter().all(|r| r.is_ok());

            if all_ok {
                let _ = state.ack(entry_id);
            } else if attempts >= max_attempts {
                let reason = results
                    .into_iter()
                    .find_map(|r| r.err())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "handler failed".to_string());
                let _ = dlq.push(&topic, entry_id, &payload, reason, attempts);
                let _ = state.ack(entry_id);
            }
            // else: left unacked, eligible for redelivery on next overdue sweep.
        });
    }

    /// Round-trip ping plus KV sanity (spec.md §4.2).
    pub async fn health(&self) -> CoreResult<BusHealth> {
        let start = Instant::now();
        let probe_topic = "__bus_health__";
        let result: CoreResult<()> = (|| {
            let stream = self.stream_for(probe_topic)?;
            stream.append(b"ping".to_vec())?;
            Ok(())
        })();

        let latency = start.elapsed();
        match result {
            Ok(()) => Ok(BusHealth {
                ok: true,
                latency,
                detail: format!("{} active streams", self.streams.len()),
            }),
            Err(e) => Ok(BusHealth {
                ok: false,
                latency,
                detail: e.to_string(),
            }),
        }
    }

    /// Detach all handlers and stop every reader task.
    pub fn disconnect(&self) {
        for entry in self.groups.iter() {
            let _ = entry.value().shutdown_tx.send(true);
        }
        self.groups.clear();
    }
}

/// Detaches one handler from a (topic, group) binding on drop or call.
/// If it was the last handler on the binding, the reader task is
/// stopped (spec.md §4.2 "stops the underlying consumer").
pub struct Unsubscribe {
    bus: Arc<Bus>,
    key: (String, String),
    handler: Arc<dyn Handler>,
}

impl Unsubscribe {
    pub fn call(self) {
        if let Some(binding) = self.bus.groups.get(&self.key) {
            let mut handlers = binding.handlers.lock().unwrap();
            handlers.retain(|h| !Arc::ptr_eq(h, &self.handler));
            let empty = handlers.is_empty();
            drop(handlers);
            if empty {
                let _ = binding.shutdown_tx.send(true);
                drop(binding);
                self.bus.groups.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_util::TestClock;
    use crate::envelope::{Envelope, ExecutionConstraints, Priority};
    use crate::ids::SequentialGenerator;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    fn sample_envelope(ids: &SequentialGenerator) -> Envelope {
        Envelope::new_invocation(
            ids,
            "task-1".to_string(),
            "wf-1".to_string(),
            "echo-agent".to_string(),
            Priority::Medium,
            ExecutionConstraints {
                timeout_ms: 1_000,
                max_retries: 1,
                attempt: 0,
            },
            serde_json::json!({"n": 1}),
        )
    }

    fn test_bus() -> Arc<Bus> {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let clock: SharedClock = Arc::new(TestClock::at(chrono::Utc::now()));
        Arc::new(Bus::new(db, clock, BusConfig::default()))
    }

    struct RecordingHandler {
        seen: Arc<AsyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn invoke(&self, envelope: &Envelope) -> CoreResult<()> {
            self.seen.lock().await.push(envelope.message_id.clone());
            Ok(())
        }
    }

    struct AlwaysFailsHandler;

    #[async_trait]
    impl Handler for AlwaysFailsHandler {
        async fn invoke(&self, _envelope: &Envelope) -> CoreResult<()> {
            Err(CoreError::HandlerFailure {
                handler: "always-fails".to_string(),
                message: "nope".to_string(),
            })
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) {
        let start = Instant::now();
        while !cond() {
            if start.elapsed() > timeout {
                panic!("condition not met within timeout");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_and_acks() {
        let bus = test_bus();
        let ids = SequentialGenerator::new("env");
        let envelope = sample_envelope(&ids);

        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler {
            seen: Arc::clone(&seen),
        });
        bus.subscribe(
            "agent-invoke.echo",
            handler,
            SubscribeOptions::new("workers"),
        )
        .unwrap();

        bus.publish("agent-invoke.echo", &envelope, PublishOptions::default())
            .await
            .unwrap();

        wait_until(|| seen.try_lock().map(|v| !v.is_empty()).unwrap_or(false), Duration::from_secs(2)).await;
        let seen = seen.lock().await;
        assert_eq!(seen[0], envelope.message_id);
    }

    #[tokio::test]
    async fn failing_handler_eventually_dead_letters() {
        let mut config = BusConfig::default();
        config.max_delivery_attempts = 2;
        config.visibility_timeout_ms = 20;
        config.block_timeout_ms = 20;

        let db = sled::Config::new().temporary(true).open().unwrap();
        let clock: SharedClock = Arc::new(TestClock::at(chrono::Utc::now()));
        let bus = Arc::new(Bus::new(db, clock, config));

        let ids = SequentialGenerator::new("env");
        let envelope = sample_envelope(&ids);

        bus.subscribe(
            "agent-invoke.echo",
            Arc::new(AlwaysFailsHandler),
            SubscribeOptions::new("workers"),
        )
        .unwrap();

        bus.publish("agent-invoke.echo", &envelope, PublishOptions::default())
            .await
            .unwrap();

        let dlq = bus.dlq_for("agent-invoke.echo").unwrap();
        wait_until(|| !dlq.is_empty(), Duration::from_secs(5)).await;
        let letters = dlq.drain(0, 10).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].retry_count, 2);
    }

    #[tokio::test]
    async fn replay_after_restart_redelivers_unacked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ids = SequentialGenerator::new("env");

        {
            let db = sled::open(dir.path()).unwrap();
            let clock: SharedClock = Arc::new(TestClock::at(chrono::Utc::now()));
            let bus = Bus::new(db, clock, BusConfig::default());
            for _ in 0..10 {
                let envelope = sample_envelope(&ids);
                bus.publish("agent-invoke.echo", &envelope, PublishOptions::default())
                    .await
                    .unwrap();
            }
            // No subscriber attached: nothing acked. Drop `bus` to simulate
            // shutdown before any delivery happens.
        }

        let db = sled::open(dir.path()).unwrap();
        let clock: SharedClock = Arc::new(TestClock::at(chrono::Utc::now()));
        let bus = Arc::new(Bus::new(db, clock, BusConfig::default()));

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);
        let handler = Arc::new(FnHandler(move |_env: Envelope| {
            let delivered = Arc::clone(&delivered_clone);
            async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        bus.subscribe(
            "agent-invoke.echo",
            handler,
            SubscribeOptions::new("fresh-consumer"),
        )
        .unwrap();

        wait_until(
            || delivered.load(Ordering::SeqCst) == 10,
            Duration::from_secs(5),
        )
        .await;
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let bus = test_bus();
        let health = bus.health().await.unwrap();
        assert!(health.ok);
    }

    #[tokio::test]
    async fn disconnect_stops_readers() {
        let bus = test_bus();
        bus.subscribe(
            "agent-invoke.echo",
            Arc::new(RecordingHandler {
                seen: Arc::new(AsyncMutex::new(Vec::new())),
            }),
            SubscribeOptions::new("workers"),
        )
        .unwrap();
        assert_eq!(bus.groups.len(), 1);
        bus.disconnect();
        assert_eq!(bus.groups.len(), 0);
    }
}
