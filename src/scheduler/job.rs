//! Job: the scheduler's unit of work (spec.md §3 "Job").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Cron,
    OneShot,
    RecurringBounded,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Function,
    Agent,
    Workflow,
}

/// Retry policy: bounded attempts with a fixed or exponential delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
        }
    }
}

/// Exactly one of these is set, per the job's `kind` (spec.md §3
/// invariant: "exactly one of {schedule, execute-at, event-name} is set
/// according to kind").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobTrigger {
    Cron { expression: String, timezone: String },
    ExecuteAt(DateTime<Utc>),
    Event { event_name: String },
}

/// Bounds for a `recurring-bounded` job layered on top of a cron
/// trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringBounds {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub max_executions: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub cumulative_duration_ms: u64,
}

/// The scheduler's persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub bounds: Option<RecurringBounds>,
    pub handler_name: String,
    pub handler_kind: HandlerKind,
    pub payload: serde_json::Value,
    pub retry_policy: RetryPolicy,
    pub timeout_ms: u64,
    pub priority: crate::envelope::Priority,
    pub concurrency: u32,
    pub overlap_allowed: bool,
    pub counters: JobCounters,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped on every CAS write
    /// (spec.md §4.3 "Concurrent mutation").
    pub version: u64,
    /// Executions currently running for this job; mutated alongside
    /// `version` under the same CAS write.
    pub running_count: u32,
}

impl Job {
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be >= 1".to_string());
        }
        match (&self.kind, &self.trigger) {
            (JobKind::Cron, JobTrigger::Cron { .. }) => {}
            (JobKind::RecurringBounded, JobTrigger::Cron { .. }) => {
                if self.bounds.is_none() {
                    return Err("recurring-bounded jobs require bounds".to_string());
                }
            }
            (JobKind::OneShot, JobTrigger::ExecuteAt(_)) => {}
            (JobKind::Event, JobTrigger::Event { .. }) => {}
            _ => return Err("job kind and trigger are mismatched".to_string()),
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}
