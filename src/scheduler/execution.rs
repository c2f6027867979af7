//! Execution: one attempt to run a job (spec.md §3 "Execution").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    /// Terminal statuses are sticky (spec.md §3 invariant, §8 invariant
    /// 4): once reached, no further transition is valid.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled | Self::Skipped
        )
    }

    /// Whether this terminal status counts against the job's retry
    /// budget (spec.md §4.3 "Retries").
    pub fn counts_as_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    pub stack: Option<String>,
}

/// One attempt to run a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub job_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub trace_id: String,
    /// CAS version, bumped on every write.
    pub version: u64,
}

impl Execution {
    pub fn new_pending(
        id: String,
        job_id: String,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        max_attempts: u32,
        trace_id: String,
    ) -> Self {
        Self {
            id,
            job_id,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            attempt,
            max_attempts,
            next_retry_at: None,
            worker_id: None,
            trace_id,
            version: 0,
        }
    }

    /// Transition to a terminal status, setting `completed_at` and
    /// `duration` (spec.md §3: "duration = completed-at - started-at is
    /// set iff status is terminal and started-at exists"). No-op if
    /// already terminal.
    pub fn complete(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.completed_at = Some(now);
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if self.status.is_terminal() => {
                Some((end - start).num_milliseconds())
            }
            _ => None,
        }
    }
}
