//! Scheduler: job registry, due-time dispatch, execution history,
//! retries, overlap control, and statistics (spec.md §4.3).

pub mod cron;
pub mod event_handler;
pub mod execution;
pub mod job;

pub use event_handler::{ActionDescriptor, EventHandler, InlineEventHandler};
pub use execution::{Execution, ExecutionStatus};
pub use job::{HandlerKind, Job, JobCounters, JobKind, JobStatus, JobTrigger, RecurringBounds, RetryPolicy};

use crate::bus::{Bus, Handler, PublishOptions, SubscribeOptions};
use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::envelope::{Envelope, EnvelopeStatus, ExecutionConstraints, Priority};
use crate::error::{CoreError, CoreResult};
use crate::ids::IdGenerator;
use crate::kv::KvStore;
use crate::observer::{ObserverEvent, SharedObserver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{error, info, instrument, warn};

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn execution_key(id: &str) -> String {
    format!("execution:{id}")
}

fn history_key(job_id: &str, completed_at: DateTime<Utc>, execution_id: &str) -> String {
    // Invert the timestamp so ascending key order is descending
    // completed-at order (spec.md §6 "(job-id, completed-at desc)").
    let inverted = i64::MAX - completed_at.timestamp_millis();
    format!("history:{job_id}:{inverted:020}:{execution_id}")
}

/// Minimal, ungeneralized due-queue: a min-heap of (next-run, job-id),
/// woken by [`Notify`] whenever a new entry is pushed (spec.md §4.3
/// "single logical ticker wakes at the earliest next-run, or sooner on
/// signal").
struct DueQueue {
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
    notify: Notify,
}

impl DueQueue {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, next_run: DateTime<Utc>, job_id: String) {
        self.heap.lock().await.push(Reverse((next_run, job_id)));
        self.notify.notify_one();
    }

    async fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().await.peek().map(|Reverse((t, _))| *t)
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut heap = self.heap.lock().await;
        let mut due = Vec::new();
        while let Some(Reverse((t, _))) = heap.peek() {
            if *t > now {
                break;
            }
            if let Some(Reverse((_, id))) = heap.pop() {
                due.push(id);
            }
        }
        due
    }

    async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }
}

#[derive(Default)]
struct SchedulerMetrics {
    dispatched: std::sync::atomic::AtomicU64,
    succeeded: std::sync::atomic::AtomicU64,
    failed: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone)]
pub struct AggregateMetrics {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub queue_depth: usize,
    pub worker_count: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerHealth {
    pub kv_ok: bool,
    pub bus_ok: bool,
    pub queue_depth: usize,
}

/// Owns job/execution records and drives dispatch. The sole writer of
/// job and execution state (spec.md §3 "Ownership").
pub struct Scheduler {
    kv: Arc<dyn KvStore>,
    bus: Arc<Bus>,
    clock: SharedClock,
    ids: Arc<dyn IdGenerator>,
    config: SchedulerConfig,
    due_queue: Arc<DueQueue>,
    event_handlers: DashMap<String, Vec<EventHandler>>,
    observer: Option<SharedObserver>,
    metrics: Arc<SchedulerMetrics>,
    shutdown_tx: watch::Sender<bool>,
    /// Handler names already subscribed on `agent-result.<handler-name>`
    /// (spec.md §4.3 "Completion"). Populated lazily as jobs are scheduled.
    result_subscriptions: DashMap<String, ()>,
}

impl Scheduler {
    pub fn new(
        kv: Arc<dyn KvStore>,
        bus: Arc<Bus>,
        clock: SharedClock,
        ids: Arc<dyn IdGenerator>,
        config: SchedulerConfig,
        observer: Option<SharedObserver>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            kv,
            bus,
            clock,
            ids,
            config,
            due_queue: Arc::new(DueQueue::new()),
            event_handlers: DashMap::new(),
            observer,
            metrics: Arc::new(SchedulerMetrics::default()),
            shutdown_tx,
            result_subscriptions: DashMap::new(),
        })
    }

    /// Bind a reader on `agent-result.<handler-name>` the first time a job
    /// for that handler is scheduled, so results are correlated back to
    /// their execution without any external wiring (spec.md §4.3
    /// "Completion": "the scheduler subscribes to result topics to close
    /// out executions"). A no-op on the second and later call for the same
    /// handler name.
    fn ensure_result_subscription(self: &Arc<Self>, handler_name: &str) -> CoreResult<()> {
        if self.result_subscriptions.contains_key(handler_name) {
            return Ok(());
        }
        let topic = format!("agent-result.{handler_name}");
        let handler: Arc<dyn Handler> = Arc::new(ResultHandler {
            scheduler: Arc::clone(self),
        });
        self.bus
            .subscribe(&topic, handler, SubscribeOptions::new("scheduler"))?;
        self.result_subscriptions.insert(handler_name.to_string(), ());
        Ok(())
    }

    fn emit(&self, event: ObserverEvent) {
        if let Some(observer) = &self.observer {
            observer.broadcast(event);
        }
    }

    // ---- job CAS helpers ----------------------------------------------

    pub async fn get_job(&self, id: &str) -> CoreResult<Job> {
        let raw = self.kv.get(&job_key(id)).await?.ok_or_else(|| CoreError::NotFound {
            kind: "job".to_string(),
            id: id.to_string(),
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Read-modify-CAS-write loop bounded by `cas_retry_attempts`
    /// (spec.md §4.3 "Concurrent mutation", §7 "CASConflict").
    async fn cas_update_job<F>(&self, id: &str, mut f: F) -> CoreResult<Job>
    where
        F: FnMut(&mut Job) -> CoreResult<()>,
    {
        let key = job_key(id);
        for _ in 0..self.config.cas_retry_attempts {
            let current = self.get_job(id).await?;
            let old_bytes = serde_json::to_vec(&current)?;
            let mut updated = current;
            f(&mut updated)?;
            updated.version += 1;
            let new_bytes = serde_json::to_vec(&updated)?;

            match self.kv.cas(&key, Some(old_bytes), new_bytes, None).await? {
                crate::kv::CasOutcome::Applied => return Ok(updated),
                crate::kv::CasOutcome::NotApplied { .. } => continue,
            }
        }
        Err(CoreError::CasConflict {
            key,
            attempts: self.config.cas_retry_attempts,
        })
    }

    async fn put_new_job(&self, job: &Job) -> CoreResult<()> {
        let bytes = serde_json::to_vec(job)?;
        match self.kv.cas(&job_key(&job.id), None, bytes, None).await? {
            crate::kv::CasOutcome::Applied => Ok(()),
            crate::kv::CasOutcome::NotApplied { .. } => Err(CoreError::ValidationFailure {
                message: format!("job id {} already exists", job.id),
            }),
        }
    }

    async fn cas_update_execution<F>(&self, id: &str, mut f: F) -> CoreResult<Execution>
    where
        F: FnMut(&mut Execution) -> CoreResult<()>,
    {
        let key = execution_key(id);
        for _ in 0..self.config.cas_retry_attempts {
            let raw = self.kv.get(&key).await?.ok_or_else(|| CoreError::NotFound {
                kind: "execution".to_string(),
                id: id.to_string(),
            })?;
            let current: Execution = serde_json::from_slice(&raw)?;
            let old_bytes = raw;
            let mut updated = current;
            f(&mut updated)?;
            updated.version += 1;
            let new_bytes = serde_json::to_vec(&updated)?;
            match self.kv.cas(&key, Some(old_bytes), new_bytes, None).await? {
                crate::kv::CasOutcome::Applied => return Ok(updated),
                crate::kv::CasOutcome::NotApplied { .. } => continue,
            }
        }
        Err(CoreError::CasConflict {
            key,
            attempts: self.config.cas_retry_attempts,
        })
    }

    fn timezone(expression_tz: &str) -> CoreResult<Tz> {
        Tz::from_str(expression_tz).map_err(|_| CoreError::ValidationFailure {
            message: format!("unknown IANA time zone '{expression_tz}'"),
        })
    }

    // ---- public contract: scheduling -----------------------------------

    #[instrument(skip(self, payload))]
    pub async fn schedule(
        self: &Arc<Self>,
        handler_name: String,
        handler_kind: HandlerKind,
        cron_expression: String,
        timezone: String,
        payload: serde_json::Value,
        retry_policy: RetryPolicy,
        timeout_ms: u64,
        priority: Priority,
        concurrency: u32,
        overlap_allowed: bool,
    ) -> CoreResult<Job> {
        let tz = Self::timezone(&timezone)?;
        let parsed = cron::parse_schedule(&cron_expression)?;
        let now = self.clock.now();
        let next_run = cron::next_run_after(&parsed, tz, now)?;

        let job = Job {
            id: self.ids.next_id(),
            kind: JobKind::Cron,
            status: JobStatus::Active,
            trigger: JobTrigger::Cron {
                expression: cron_expression,
                timezone,
            },
            bounds: None,
            handler_name,
            handler_kind,
            payload,
            retry_policy,
            timeout_ms,
            priority,
            concurrency: concurrency.max(1),
            overlap_allowed,
            counters: JobCounters::default(),
            last_run_at: None,
            next_run_at: Some(next_run),
            created_at: now,
            version: 0,
            running_count: 0,
        };
        job.validate().map_err(|message| CoreError::ValidationFailure { message })?;
        self.put_new_job(&job).await?;
        self.ensure_result_subscription(&job.handler_name)?;
        self.due_queue.push(next_run, job.id.clone()).await;
        self.emit(ObserverEvent::JobStateChanged {
            job_id: job.id.clone(),
            status: "active".to_string(),
        });
        Ok(job)
    }

    #[instrument(skip(self, payload))]
    pub async fn schedule_once(
        self: &Arc<Self>,
        handler_name: String,
        handler_kind: HandlerKind,
        execute_at: DateTime<Utc>,
        payload: serde_json::Value,
        retry_policy: RetryPolicy,
        timeout_ms: u64,
        priority: Priority,
    ) -> CoreResult<Job> {
        let job = Job {
            id: self.ids.next_id(),
            kind: JobKind::OneShot,
            status: JobStatus::Active,
            trigger: JobTrigger::ExecuteAt(execute_at),
            bounds: None,
            handler_name,
            handler_kind,
            payload,
            retry_policy,
            timeout_ms,
            priority,
            concurrency: 1,
            overlap_allowed: false,
            counters: JobCounters::default(),
            last_run_at: None,
            next_run_at: Some(execute_at),
            created_at: self.clock.now(),
            version: 0,
            running_count: 0,
        };
        job.validate().map_err(|message| CoreError::ValidationFailure { message })?;
        self.put_new_job(&job).await?;
        self.ensure_result_subscription(&job.handler_name)?;
        self.due_queue.push(execute_at, job.id.clone()).await;
        Ok(job)
    }

    #[instrument(skip(self, payload))]
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_recurring(
        self: &Arc<Self>,
        handler_name: String,
        handler_kind: HandlerKind,
        cron_expression: String,
        timezone: String,
        bounds: RecurringBounds,
        payload: serde_json::Value,
        retry_policy: RetryPolicy,
        timeout_ms: u64,
        priority: Priority,
        concurrency: u32,
        overlap_allowed: bool,
    ) -> CoreResult<Job> {
        let tz = Self::timezone(&timezone)?;
        let parsed = cron::parse_schedule(&cron_expression)?;
        let now = self.clock.now().max(bounds.start);
        let next_run = cron::next_run_after(&parsed, tz, now)?;
        let next_run = clamp_to_bounds(next_run, &bounds);

        let job = Job {
            id: self.ids.next_id(),
            kind: JobKind::RecurringBounded,
            status: JobStatus::Active,
            trigger: JobTrigger::Cron {
                expression: cron_expression,
                timezone,
            },
            bounds: Some(bounds),
            handler_name,
            handler_kind,
            payload,
            retry_policy,
            timeout_ms,
            priority,
            concurrency: concurrency.max(1),
            overlap_allowed,
            counters: JobCounters::default(),
            last_run_at: None,
            next_run_at: next_run,
            created_at: now,
            version: 0,
            running_count: 0,
        };
        job.validate().map_err(|message| CoreError::ValidationFailure { message })?;
        self.put_new_job(&job).await?;
        self.ensure_result_subscription(&job.handler_name)?;
        if let Some(next) = job.next_run_at {
            self.due_queue.push(next, job.id.clone()).await;
        }
        Ok(job)
    }

    /// Recompute next-run from a new schedule; in-flight executions
    /// continue untouched (spec.md §4.3 "reschedule").
    pub async fn reschedule(&self, job_id: &str, new_cron_expression: String) -> CoreResult<Job> {
        let updated = self
            .cas_update_job(job_id, |job| {
                let JobTrigger::Cron { timezone, .. } = &job.trigger else {
                    return Err(CoreError::ValidationFailure {
                        message: "reschedule only applies to cron-triggered jobs".to_string(),
                    });
                };
                let tz = Self::timezone(timezone)?;
                let parsed = cron::parse_schedule(&new_cron_expression)?;
                job.trigger = JobTrigger::Cron {
                    expression: new_cron_expression.clone(),
                    timezone: timezone.clone(),
                };
                job.next_run_at = Some(cron::next_run_after(&parsed, tz, job.created_at)?);
                Ok(())
            })
            .await?;
        if let Some(next) = updated.next_run_at {
            self.due_queue.push(next, updated.id.clone()).await;
        }
        Ok(updated)
    }

    /// Transition to cancelled; pending scheduled executions are marked
    /// skipped (spec.md §4.3 "unschedule").
    pub async fn unschedule(&self, job_id: &str) -> CoreResult<Job> {
        let job = self
            .cas_update_job(job_id, |job| {
                job.status = JobStatus::Cancelled;
                job.next_run_at = None;
                Ok(())
            })
            .await?;
        self.skip_pending_executions(job_id).await?;
        Ok(job)
    }

    /// Transition every not-yet-terminal execution of `job_id` to skipped.
    /// `dispatch_due`'s non-active early return leaves the running
    /// execution it was asked about untouched, and a cancel can arrive
    /// while an execution is still pending/running, so this sweeps
    /// whatever is left over explicitly rather than relying on the
    /// dispatch path to notice the cancellation.
    async fn skip_pending_executions(&self, job_id: &str) -> CoreResult<()> {
        let now = self.clock.now();
        for (_, raw) in self.kv.scan_prefix("execution:").await? {
            let execution: Execution = match serde_json::from_slice(&raw) {
                Ok(e) => e,
                Err(_) => continue,
            };
            if execution.job_id != job_id || execution.status.is_terminal() {
                continue;
            }
            let updated = self
                .cas_update_execution(&execution.id, |e| {
                    e.complete(ExecutionStatus::Skipped, now);
                    Ok(())
                })
                .await?;
            self.persist_execution(&updated).await?;
            self.emit(ObserverEvent::ExecutionTransitioned {
                execution_id: updated.id.clone(),
                job_id: updated.job_id.clone(),
                status: "skipped".to_string(),
            });
        }
        Ok(())
    }

    pub async fn pause_job(&self, job_id: &str) -> CoreResult<Job> {
        self.cas_update_job(job_id, |job| {
            if !job.is_terminal() {
                job.status = JobStatus::Paused;
            }
            Ok(())
        })
        .await
    }

    /// Resume a paused job and re-enqueue its existing `next_run_at`
    /// (spec.md §4.3). `dispatch_due`'s non-active early return never
    /// re-pushes a paused job onto the due-queue — `pop_due` consumes
    /// entries, so without this a job paused at-or-before its due time
    /// would never fire again even after resuming.
    pub async fn resume_job(&self, job_id: &str) -> CoreResult<Job> {
        let mut became_active = false;
        let job = self
            .cas_update_job(job_id, |job| {
                if job.status == JobStatus::Paused {
                    job.status = JobStatus::Active;
                    became_active = true;
                }
                Ok(())
            })
            .await?;
        if became_active {
            if let Some(next) = job.next_run_at {
                self.due_queue.push(next, job.id.clone()).await;
            }
        }
        Ok(job)
    }

    pub async fn cancel_job(&self, job_id: &str) -> CoreResult<Job> {
        self.unschedule(job_id).await
    }

    // ---- public contract: events ---------------------------------------

    pub fn on_event(&self, handler: EventHandler) {
        self.event_handlers
            .entry(handler.event_name.clone())
            .or_default()
            .push(handler);
    }

    /// Dispatch enabled handlers for `event_name`, sorted by priority
    /// descending (spec.md §4.3 "Event triggering"). A handler's failure
    /// does not halt dispatch of lower-priority handlers.
    #[instrument(skip(self, payload))]
    pub async fn trigger_event(self: &Arc<Self>, event_name: &str, payload: serde_json::Value) -> CoreResult<usize> {
        let handlers = self
            .event_handlers
            .get(event_name)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        let ordered = event_handler::dispatch_order(handlers);
        let mut dispatched = 0;

        for handler in ordered {
            let result: Result<(), String> = if let Some(inline) = handler.inline.clone() {
                inline.handle(payload.clone()).await
            } else {
                match &handler.action {
                    Some(ActionDescriptor::CreateJob { handler_name, payload: action_payload }) => {
                        let execute_at = self.clock.now();
                        self.schedule_once(
                            handler_name.clone(),
                            HandlerKind::Function,
                            execute_at,
                            action_payload.clone(),
                            RetryPolicy::default(),
                            30_000,
                            Priority::Medium,
                        )
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                    }
                    Some(ActionDescriptor::TriggerWorkflow { .. }) | Some(ActionDescriptor::DispatchAgent { .. }) => {
                        Ok(())
                    }
                    None => Ok(()),
                }
            };

            if let Err(e) = &result {
                warn!(event_name, handler = %handler.handler_name, error = %e, "event handler failed");
            } else {
                dispatched += 1;
            }

            if let Some(mut entry) = self.event_handlers.get_mut(event_name) {
                if let Some(stored) = entry.iter_mut().find(|h| h.handler_name == handler.handler_name) {
                    stored.counters.invocations += 1;
                    if result.is_err() {
                        stored.counters.failures += 1;
                    }
                }
            }
        }

        Ok(dispatched)
    }

    // ---- public contract: reads -----------------------------------------

    pub async fn list_jobs(&self) -> CoreResult<Vec<Job>> {
        let entries = self.kv.scan_prefix("job:").await?;
        entries
            .into_iter()
            .map(|(_, raw)| Ok(serde_json::from_slice(&raw)?))
            .collect()
    }

    /// History entries are keyed by inverted completed-at, so `scan_prefix`
    /// already returns them newest-first; the value is the execution id,
    /// resolved against the primary `execution:<id>` record.
    pub async fn get_job_history(&self, job_id: &str, limit: usize) -> CoreResult<Vec<Execution>> {
        let prefix = format!("history:{job_id}:");
        let mut out = Vec::new();
        for (_, raw_id) in self.kv.scan_prefix(&prefix).await?.into_iter().take(limit) {
            let execution_id = String::from_utf8_lossy(&raw_id).into_owned();
            if let Ok(execution) = self.get_execution(&execution_id).await {
                out.push(execution);
            }
        }
        Ok(out)
    }

    pub async fn get_execution(&self, execution_id: &str) -> CoreResult<Execution> {
        let raw = self
            .kv
            .get(&execution_key(execution_id))
            .await?
            .ok_or_else(|| CoreError::NotFound {
                kind: "execution".to_string(),
                id: execution_id.to_string(),
            })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Re-run a terminal-failed execution's job as a fresh attempt.
    pub async fn retry_execution(&self, execution_id: &str) -> CoreResult<Execution> {
        let execution = self.get_execution(execution_id).await?;
        let job = self.get_job(&execution.job_id).await?;
        self.dispatch_attempt(&job, self.clock.now(), execution.attempt + 1)
            .await
    }

    pub async fn get_metrics(&self, _window: Duration) -> CoreResult<AggregateMetrics> {
        let entries = self.kv.scan_prefix("execution:").await?;
        let mut durations: Vec<u64> = Vec::new();
        let mut success = 0u64;
        let mut failure = 0u64;
        for (_, raw) in &entries {
            if let Ok(execution) = serde_json::from_slice::<Execution>(raw) {
                if let Some(ms) = execution.duration_ms() {
                    durations.push(ms.max(0) as u64);
                }
                match execution.status {
                    ExecutionStatus::Success => success += 1,
                    ExecutionStatus::Failed | ExecutionStatus::Timeout => failure += 1,
                    _ => {}
                }
            }
        }
        let samples = crate::metrics::LatencySamples::from_unsorted(durations);
        let load = crate::metrics::LoadSnapshot::capture(self.due_queue.len().await);

        Ok(AggregateMetrics {
            total: entries.len() as u64,
            success,
            failure,
            p50_ms: samples.p50(),
            p95_ms: samples.p95(),
            p99_ms: samples.p99(),
            queue_depth: load.queue_depth,
            worker_count: load.worker_count,
        })
    }

    pub async fn health_check(&self) -> CoreResult<SchedulerHealth> {
        let kv_ok = self.kv.health().await.map(|h| h.ok).unwrap_or(false);
        let bus_ok = self.bus.health().await.map(|h| h.ok).unwrap_or(false);
        Ok(SchedulerHealth {
            kv_ok,
            bus_ok,
            queue_depth: self.due_queue.len().await,
        })
    }

    // ---- dispatch loop ----------------------------------------------------

    /// Spawn the ticker task that drives due jobs (spec.md §4.3 "Dispatch
    /// loop"). Call once per `Scheduler` instance.
    pub fn spawn_ticker(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = scheduler.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("scheduler ticker started");
            let backoff = crate::resilience::RetryConfig::transport_default(
                scheduler.config.tick_backoff_ceiling_ms,
            );
            let mut consecutive_failures: u32 = 0;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let now = scheduler.clock.now();
                let wait = match scheduler.due_queue.peek_next().await {
                    Some(t) if t > now => (t - now).to_std().unwrap_or(Duration::ZERO),
                    Some(_) => Duration::ZERO,
                    None => Duration::from_secs(3600),
                };

                tokio::select! {
                    _ = scheduler.clock.sleep(wait) => {}
                    _ = scheduler.due_queue.notify.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }

                if *shutdown_rx.borrow() {
                    break;
                }

                let now = scheduler.clock.now();
                let due = scheduler.due_queue.pop_due(now).await;
                let mut saw_recoverable_failure = false;
                for job_id in due {
                    if let Err(e) = scheduler.dispatch_due(&job_id, now).await {
                        error!(job_id = %job_id, error = %e, "dispatch failed");
                        saw_recoverable_failure |= e.is_recoverable();
                    }
                }

                // spec.md §7: the tick never gives up, but backs off
                // exponentially (up to `tick_backoff_ceiling_ms`) while the
                // bus or KV backend keeps returning transport errors, so a
                // down dependency doesn't turn into a busy loop.
                if saw_recoverable_failure {
                    let delay_ms = ((backoff.initial_delay_ms as f64)
                        * backoff.multiplier.powi(consecutive_failures as i32))
                    .min(backoff.max_delay_ms as f64) as u64;
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(delay_ms, "backing off after a recoverable dispatch failure");
                    scheduler.clock.sleep(Duration::from_millis(delay_ms)).await;
                } else {
                    consecutive_failures = 0;
                }
            }
            info!("scheduler ticker stopped");
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    #[instrument(skip(self))]
    async fn dispatch_due(&self, job_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        let job = match self.get_job(job_id).await {
            Ok(job) => job,
            Err(CoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        if job.status != JobStatus::Active {
            return Ok(());
        }

        if job.running_count >= job.concurrency && !job.overlap_allowed {
            self.record_skip(&job, now).await?;
            self.advance_schedule(&job, now).await?;
            return Ok(());
        }

        self.cas_update_job(job_id, |j| {
            j.running_count += 1;
            j.counters.total += 1;
            j.last_run_at = Some(now);
            Ok(())
        })
        .await?;

        self.dispatch_attempt(&job, now, 0).await?;
        self.advance_schedule(&job, now).await?;
        Ok(())
    }

    async fn advance_schedule(&self, job: &Job, now: DateTime<Utc>) -> CoreResult<()> {
        match (&job.kind, &job.trigger) {
            (JobKind::Cron, JobTrigger::Cron { expression, timezone }) => {
                let tz = Self::timezone(timezone)?;
                let parsed = cron::parse_schedule(expression)?;
                let next = cron::next_run_after(&parsed, tz, now)?;
                self.cas_update_job(&job.id, |j| {
                    j.next_run_at = Some(next);
                    Ok(())
                })
                .await?;
                self.due_queue.push(next, job.id.clone()).await;
            }
            (JobKind::RecurringBounded, JobTrigger::Cron { expression, timezone }) => {
                let bounds = job.bounds.clone().ok_or_else(|| CoreError::Internal {
                    message: "recurring-bounded job missing bounds".to_string(),
                })?;
                let max_reached = bounds
                    .max_executions
                    .map(|max| job.counters.success >= max as u64)
                    .unwrap_or(false);
                if max_reached {
                    self.cas_update_job(&job.id, |j| {
                        j.status = JobStatus::Completed;
                        j.next_run_at = None;
                        Ok(())
                    })
                    .await?;
                    return Ok(());
                }
                let tz = Self::timezone(timezone)?;
                let parsed = cron::parse_schedule(expression)?;
                let next = cron::next_run_after(&parsed, tz, now)?;
                match clamp_to_bounds(next, &bounds) {
                    Some(next) => {
                        self.cas_update_job(&job.id, |j| {
                            j.next_run_at = Some(next);
                            Ok(())
                        })
                        .await?;
                        self.due_queue.push(next, job.id.clone()).await;
                    }
                    None => {
                        self.cas_update_job(&job.id, |j| {
                            j.status = JobStatus::Completed;
                            j.next_run_at = None;
                            Ok(())
                        })
                        .await?;
                    }
                }
            }
            (JobKind::OneShot, _) => {
                self.cas_update_job(&job.id, |j| {
                    j.status = JobStatus::Completed;
                    j.next_run_at = None;
                    Ok(())
                })
                .await?;
            }
            (JobKind::Event, _) => {}
            (kind, trigger) => {
                warn!(?kind, ?trigger, job = %job.id, "job kind and trigger mismatched, not rescheduling");
            }
        }
        Ok(())
    }

    async fn record_skip(&self, job: &Job, now: DateTime<Utc>) -> CoreResult<()> {
        let execution_id = self.ids.next_id();
        let mut execution = Execution::new_pending(
            execution_id.clone(),
            job.id.clone(),
            now,
            0,
            job.retry_policy.max_retries,
            self.ids.next_id(),
        );
        execution.complete(ExecutionStatus::Skipped, now);
        self.persist_execution(&execution).await?;
        self.emit(ObserverEvent::ExecutionTransitioned {
            execution_id,
            job_id: job.id.clone(),
            status: "skipped".to_string(),
        });
        Ok(())
    }

    async fn persist_execution(&self, execution: &Execution) -> CoreResult<()> {
        let bytes = serde_json::to_vec(execution)?;
        self.kv.set(&execution_key(&execution.id), bytes, None).await?;
        if let Some(completed_at) = execution.completed_at {
            self.kv
                .set(
                    &history_key(&execution.job_id, completed_at, &execution.id),
                    execution.id.clone().into_bytes(),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Publish an invocation envelope and record a running execution
    /// (spec.md §4.3 dispatch step (c)).
    async fn dispatch_attempt(&self, job: &Job, now: DateTime<Utc>, attempt: u32) -> CoreResult<Execution> {
        let execution_id = self.ids.next_id();
        let trace_id = self.ids.next_id();
        let mut execution = Execution::new_pending(
            execution_id.clone(),
            job.id.clone(),
            now,
            attempt,
            job.retry_policy.max_retries,
            trace_id,
        );
        execution.started_at = Some(now);
        execution.status = ExecutionStatus::Running;
        self.persist_execution(&execution).await?;

        let envelope = Envelope::new_invocation(
            self.ids.as_ref(),
            execution_id.clone(),
            job.id.clone(),
            job.handler_name.clone(),
            job.priority,
            ExecutionConstraints {
                timeout_ms: job.timeout_ms,
                max_retries: job.retry_policy.max_retries,
                attempt,
            },
            job.payload.clone(),
        );

        self.metrics.dispatched.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bus
            .publish(
                &format!("agent-invoke.{}", job.handler_name),
                &envelope,
                PublishOptions::default(),
            )
            .await?;
        self.emit(ObserverEvent::ExecutionTransitioned {
            execution_id: execution.id.clone(),
            job_id: job.id.clone(),
            status: "running".to_string(),
        });
        Ok(execution)
    }

    /// Correlate a result envelope arriving on `agent-result.<handler>`
    /// back to its execution (spec.md §4.3 "Completion").
    #[instrument(skip(self, result))]
    pub async fn complete_execution(
        &self,
        execution_id: &str,
        result: CoreResult<serde_json::Value>,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        let is_ok = result.is_ok();
        let execution = self
            .cas_update_execution(execution_id, |execution| {
                let status = if is_ok {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                };
                execution.complete(status, now);
                match &result {
                    Ok(value) => execution.result = Some(value.clone()),
                    Err(e) => {
                        execution.error = Some(execution::ExecutionError {
                            message: e.to_string(),
                            stack: None,
                        })
                    }
                }
                Ok(())
            })
            .await?;

        self.on_execution_terminal(&execution).await
    }

    /// A running execution exceeded its timeout (spec.md §4.3
    /// "Timeouts"): counts as a failure for retry purposes.
    pub async fn timeout_execution(&self, execution_id: &str) -> CoreResult<()> {
        let now = self.clock.now();
        let execution = self
            .cas_update_execution(execution_id, |execution| {
                execution.complete(ExecutionStatus::Timeout, now);
                Ok(())
            })
            .await?;
        self.on_execution_terminal(&execution).await
    }

    async fn on_execution_terminal(&self, execution: &Execution) -> CoreResult<()> {
        self.persist_execution(execution).await?;
        self.emit(ObserverEvent::ExecutionTransitioned {
            execution_id: execution.id.clone(),
            job_id: execution.job_id.clone(),
            status: format!("{:?}", execution.status).to_lowercase(),
        });

        let job = self.get_job(&execution.job_id).await?;
        let now = self.clock.now();

        if execution.status.counts_as_failure() {
            self.metrics.failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if execution.attempt < job.retry_policy.max_retries {
                let delay = Duration::from_millis(job.retry_policy.delay_ms);
                let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                self.cas_update_execution(&execution.id, |e| {
                    e.next_retry_at = Some(retry_at);
                    Ok(())
                })
                .await
                .ok();
                self.schedule_retry(&job, retry_at, execution.attempt + 1).await?;
            } else {
                self.cas_update_job(&job.id, |j| {
                    j.counters.failure += 1;
                    j.running_count = j.running_count.saturating_sub(1);
                    Ok(())
                })
                .await?;
            }
        } else {
            self.metrics.succeeded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.cas_update_job(&job.id, |j| {
                j.counters.success += 1;
                j.running_count = j.running_count.saturating_sub(1);
                if let Some(ms) = execution.duration_ms() {
                    j.counters.cumulative_duration_ms += ms.max(0) as u64;
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Wait out the retry delay, then dispatch the next attempt directly
    /// (spec.md §4.3 "Retries" — retries are not re-enqueued on the
    /// due-queue since their trigger is the failed attempt, not the
    /// job's schedule).
    async fn schedule_retry(&self, job: &Job, retry_at: DateTime<Utc>, next_attempt: u32) -> CoreResult<()> {
        self.clock.sleep_until(retry_at).await;
        self.dispatch_attempt(job, self.clock.now(), next_attempt).await?;
        Ok(())
    }
}

/// Routes `agent-result.<handler-name>` envelopes back to the scheduler
/// (spec.md §4.3 "Completion"). Correlation key is `task_id`, which
/// `dispatch_attempt` sets to the execution id, not the job id.
struct ResultHandler {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl Handler for ResultHandler {
    async fn invoke(&self, envelope: &Envelope) -> CoreResult<()> {
        let execution_id = envelope.task_id.clone();
        match envelope.status {
            EnvelopeStatus::Succeeded => {
                self.scheduler
                    .complete_execution(&execution_id, Ok(envelope.payload.clone()))
                    .await
            }
            EnvelopeStatus::Failed => {
                let message = envelope
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("handler reported failure")
                    .to_string();
                self.scheduler
                    .complete_execution(
                        &execution_id,
                        Err(CoreError::HandlerFailure {
                            handler: envelope.agent_type.clone(),
                            message,
                        }),
                    )
                    .await
            }
            EnvelopeStatus::TimedOut => self.scheduler.timeout_execution(&execution_id).await,
            // Pending/Running/Cancelled/Skipped results carry no
            // completion action for the scheduler.
            _ => Ok(()),
        }
    }
}

fn clamp_to_bounds(candidate: DateTime<Utc>, bounds: &RecurringBounds) -> Option<DateTime<Utc>> {
    if candidate < bounds.start {
        return Some(bounds.start);
    }
    if let Some(end) = bounds.end {
        if candidate > end {
            return None;
        }
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_util::TestClock;
    use crate::ids::SequentialGenerator;
    use crate::kv::SledKvStore;
    use chrono::TimeZone;

    async fn test_scheduler() -> (Arc<Scheduler>, Arc<TestClock>) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(SledKvStore::open_temporary("sched-test").unwrap());
        let clock = Arc::new(TestClock::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let shared_clock: SharedClock = clock.clone();
        let bus = Arc::new(Bus::new(db, shared_clock.clone(), crate::config::BusConfig::default()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialGenerator::new("sched"));
        let scheduler = Scheduler::new(
            kv,
            bus,
            shared_clock,
            ids,
            SchedulerConfig::default(),
            None,
        );
        (scheduler, clock)
    }

    #[tokio::test]
    async fn schedule_computes_next_run_per_s1() {
        let (scheduler, _clock) = test_scheduler().await;
        let job = scheduler
            .schedule(
                "echo".to_string(),
                HandlerKind::Agent,
                "*/5 * * * *".to_string(),
                "UTC".to_string(),
                serde_json::json!({}),
                RetryPolicy::default(),
                5_000,
                Priority::Medium,
                1,
                false,
            )
            .await
            .unwrap();

        assert_eq!(
            job.next_run_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let (scheduler, _clock) = test_scheduler().await;
        let job = scheduler
            .schedule(
                "echo".to_string(),
                HandlerKind::Agent,
                "*/5 * * * *".to_string(),
                "UTC".to_string(),
                serde_json::json!({}),
                RetryPolicy::default(),
                5_000,
                Priority::Medium,
                1,
                false,
            )
            .await
            .unwrap();

        let paused = scheduler.pause_job(&job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        let resumed = scheduler.resume_job(&job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn unschedule_cancels_job() {
        let (scheduler, _clock) = test_scheduler().await;
        let job = scheduler
            .schedule_once(
                "echo".to_string(),
                HandlerKind::Agent,
                Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
                serde_json::json!({}),
                RetryPolicy::default(),
                5_000,
                Priority::Medium,
            )
            .await
            .unwrap();

        let cancelled = scheduler.unschedule(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.next_run_at, None);
    }

    #[tokio::test]
    async fn s4_concurrent_pause_one_applies_one_converges() {
        let (scheduler, _clock) = test_scheduler().await;
        let job = scheduler
            .schedule(
                "echo".to_string(),
                HandlerKind::Agent,
                "*/5 * * * *".to_string(),
                "UTC".to_string(),
                serde_json::json!({}),
                RetryPolicy::default(),
                5_000,
                Priority::Medium,
                1,
                false,
            )
            .await
            .unwrap();

        let a = scheduler.pause_job(&job.id).await.unwrap();
        let b = scheduler.pause_job(&job.id).await.unwrap();
        assert_eq!(a.status, JobStatus::Paused);
        assert_eq!(b.status, JobStatus::Paused);
        assert!(b.version > a.version);
    }

    #[tokio::test]
    async fn event_handlers_dispatch_by_priority_and_do_not_halt_on_failure() {
        let (scheduler, _clock) = test_scheduler().await;

        struct FailingHandler;
        #[async_trait::async_trait]
        impl InlineEventHandler for FailingHandler {
            async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
                Err("boom".to_string())
            }
        }
        struct OkHandler(Arc<std::sync::atomic::AtomicBool>);
        #[async_trait::async_trait]
        impl InlineEventHandler for OkHandler {
            async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        scheduler.on_event(EventHandler::new_inline(
            "job.completed",
            "high-prio-fails",
            Priority::Critical,
            Arc::new(FailingHandler),
        ));
        scheduler.on_event(EventHandler::new_inline(
            "job.completed",
            "low-prio-ok",
            Priority::Low,
            Arc::new(OkHandler(Arc::clone(&flag))),
        ));

        let dispatched = scheduler
            .trigger_event("job.completed", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(dispatched, 1);
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn s2_timeout_retries_up_to_configured_bound_then_fails() {
        let (scheduler, _clock) = test_scheduler().await;
        let job = scheduler
            .schedule(
                "echo".to_string(),
                HandlerKind::Agent,
                "0 * * * *".to_string(),
                "UTC".to_string(),
                serde_json::json!({}),
                RetryPolicy {
                    max_retries: 2,
                    delay_ms: 0,
                },
                100,
                Priority::Medium,
                1,
                false,
            )
            .await
            .unwrap();

        let now = scheduler.clock.now();
        scheduler.dispatch_due(&job.id, now).await.unwrap();

        // Drive three timeouts by hand: attempt 0 and 1 are retried (max_retries
        // is 2), attempt 2 exhausts the bound and the job counts a failure.
        for _ in 0..3 {
            let executions = scheduler.kv.scan_prefix("execution:").await.unwrap();
            let running = executions
                .into_iter()
                .map(|(_, bytes)| serde_json::from_slice::<Execution>(&bytes).unwrap())
                .find(|e| !e.status.is_terminal())
                .expect("a running execution should exist before each timeout");
            scheduler.timeout_execution(&running.id).await.unwrap();
        }

        let finished = scheduler.get_job(&job.id).await.unwrap();
        assert_eq!(finished.counters.failure, 1);
        assert_eq!(finished.running_count, 0);

        let history = scheduler.get_job_history(&job.id, 10).await.unwrap();
        assert_eq!(history.len(), 3, "attempt 0, 1, and 2 all terminated as Timeout");
        assert!(history.iter().all(|e| e.status == ExecutionStatus::Timeout));
        assert!(history.iter().all(|e| e.attempt <= 2), "retry bound: no more than max_retries + 1 attempts");
    }

    #[tokio::test]
    async fn s3_overlap_disallowed_skips_while_one_execution_is_running() {
        let (scheduler, _clock) = test_scheduler().await;
        let job = scheduler
            .schedule(
                "echo".to_string(),
                HandlerKind::Agent,
                "* * * * *".to_string(),
                "UTC".to_string(),
                serde_json::json!({}),
                RetryPolicy::default(),
                90_000,
                Priority::Medium,
                1,
                false,
            )
            .await
            .unwrap();

        let now = scheduler.clock.now();
        scheduler.dispatch_due(&job.id, now).await.unwrap();
        scheduler.dispatch_due(&job.id, now).await.unwrap();
        scheduler.dispatch_due(&job.id, now).await.unwrap();

        let after = scheduler.get_job(&job.id).await.unwrap();
        assert_eq!(after.running_count, 1, "first attempt is still running");

        let history = scheduler.get_job_history(&job.id, 10).await.unwrap();
        assert_eq!(history.len(), 2, "the two overlapping ticks were skipped, not dispatched");
        assert!(history.iter().all(|e| e.status == ExecutionStatus::Skipped));
    }

    #[tokio::test]
    async fn list_jobs_returns_all_created_jobs() {
        let (scheduler, _clock) = test_scheduler().await;
        scheduler
            .schedule(
                "echo".to_string(),
                HandlerKind::Agent,
                "*/5 * * * *".to_string(),
                "UTC".to_string(),
                serde_json::json!({}),
                RetryPolicy::default(),
                5_000,
                Priority::Medium,
                1,
                false,
            )
            .await
            .unwrap();
        scheduler
            .schedule_once(
                "echo".to_string(),
                HandlerKind::Agent,
                Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
                serde_json::json!({}),
                RetryPolicy::default(),
                5_000,
                Priority::Medium,
            )
            .await
            .unwrap();

        let jobs = scheduler.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
    }
}
