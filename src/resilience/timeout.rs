//! Per-operation deadline guard.
//!
//! Generalizes `knhk-workflow-engine::resilience::timeout::TimeoutManager`
//! from three fixed hot/warm/cold buckets to the configurable
//! per-operation deadlines spec.md §5 requires: "every publish, read, CAS,
//! and handler invocation has a default deadline (configurable)."

use crate::error::{CoreError, CoreResult};
use std::time::Duration;
use tokio::time::timeout;

/// Runs `future` under a deadline, mapping expiry to
/// [`CoreError::Timeout`] tagged with `operation`'s name — deadline
/// expiry is reported as a failure kind, never silently dropped
/// (spec.md §5).
pub async fn with_deadline<F, T>(operation: &str, deadline: Duration, future: F) -> CoreResult<T>
where
    F: std::future::Future<Output = CoreResult<T>>,
{
    match timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: deadline.as_millis() as u64,
        }),
    }
}

/// Default deadlines for the suspension points named in spec.md §5.
#[derive(Debug, Clone)]
pub struct DeadlineConfig {
    pub publish_ms: u64,
    pub read_ms: u64,
    pub cas_ms: u64,
    pub handler_invocation_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            publish_ms: 2_000,
            read_ms: 5_000,
            cas_ms: 1_000,
            handler_invocation_ms: 30_000,
        }
    }
}
