//! Bounded retry with backoff.
//!
//! Generalizes `knhk-workflow-engine::resilience::retry::retry_with_backoff`
//! from a workflow-specific policy to one keyed off
//! [`CoreError::is_recoverable`]. Used by the scheduler ticker's
//! exponential backoff on transport failure and by CAS callers re-reading
//! on conflict (spec.md §7).

use crate::error::{CoreError, CoreResult};
use std::time::Duration;
use tokio::time::sleep;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryConfig {
    /// No-backoff, bounded re-read-and-retry loop for CAS conflicts
    /// (spec.md §7: "bounded attempt count, default 8").
    pub fn cas_default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff up to a ceiling, for the scheduler tick's
    /// recovery from a down bus/KV backend (spec.md §7:
    /// "scheduler tick backs off exponentially up to a ceiling, never
    /// gives up").
    pub fn transport_default(ceiling_ms: u64) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay_ms: 200,
            max_delay_ms: ceiling_ms,
            multiplier: 2.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Run `f` up to `config.max_attempts` times, sleeping with exponential
/// backoff between attempts, stopping early on a non-recoverable error.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut f: F) -> CoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let mut delay = Duration::from_millis(config.initial_delay_ms);
    let mut last_error: Option<CoreError> = None;

    for attempt in 0..config.max_attempts {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retryable = e.is_recoverable();
                last_error = Some(e);
                if attempt + 1 >= config.max_attempts || !retryable {
                    break;
                }
                if !delay.is_zero() {
                    sleep(delay).await;
                    delay = Duration::from_millis(
                        ((delay.as_millis() as f64 * config.multiplier) as u64)
                            .min(config.max_delay_ms.max(1)),
                    );
                }
            }
        }
    }

    Err(last_error.unwrap_or(CoreError::Internal {
        message: "retry loop exhausted without an error".to_string(),
    }))
}
