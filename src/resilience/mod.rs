//! Resilience helpers shared by the KV store, bus, and scheduler:
//! bounded retry with backoff, a circuit breaker for transport calls,
//! and per-operation deadline guards.

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use retry::{retry_with_backoff, RetryConfig};
pub use timeout::{with_deadline, DeadlineConfig};
