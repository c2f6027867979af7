//! Circuit breaker for KV/Bus transport calls.
//!
//! Ported from `knhk-workflow-engine::resilience::circuit_breaker`.

use crate::error::{CoreError, CoreResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaks the circuit after `failure_threshold` consecutive failures,
/// probes again after `timeout`, and requires `success_threshold`
/// consecutive successes while half-open before fully closing.
pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<RwLock<u32>>,
    success_count: Arc<RwLock<u32>>,
    last_failure: Arc<RwLock<Option<Instant>>>,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(RwLock::new(0)),
            success_count: Arc::new(RwLock::new(0)),
            last_failure: Arc::new(RwLock::new(None)),
            failure_threshold,
            success_threshold: 3,
            timeout,
        }
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let state = *self.state.read().await;
        match state {
            CircuitState::Open => {
                let last_failure = *self.last_failure.read().await;
                let elapsed_ok = last_failure.map(|t| t.elapsed() >= self.timeout).unwrap_or(false);
                if elapsed_ok {
                    *self.state.write().await = CircuitState::HalfOpen;
                    *self.success_count.write().await = 0;
                } else {
                    return Err(CoreError::kv_transport("circuit breaker open"));
                }
            }
            CircuitState::HalfOpen | CircuitState::Closed => {}
        }

        match operation().await {
            Ok(result) => {
                *self.failure_count.write().await = 0;
                let state = *self.state.read().await;
                if state == CircuitState::HalfOpen {
                    let mut success_count = self.success_count.write().await;
                    *success_count += 1;
                    if *success_count >= self.success_threshold {
                        *self.state.write().await = CircuitState::Closed;
                        *success_count = 0;
                    }
                }
                Ok(result)
            }
            Err(e) => {
                let mut failure_count = self.failure_count.write().await;
                *failure_count += 1;
                *self.last_failure.write().await = Some(Instant::now());
                if *failure_count >= self.failure_threshold {
                    *self.state.write().await = CircuitState::Open;
                }
                Err(e)
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }
}
