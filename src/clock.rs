//! Clock port.
//!
//! spec.md §9 calls out the source's global mutable clock as a redesign
//! target: "inject a clock port (now, sleep-until)... the main enabler of
//! deterministic property tests". Mirrors the `Timebase` trait
//! `knhk-workflow-engine::services::timer::TimerService` is generic over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Abstract source of time, injected into the Bus and Scheduler so tests
/// can control the passage of time deterministically.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task until `duration` has elapsed according to
    /// this clock.
    async fn sleep(&self, duration: Duration);

    /// Suspend until `at`, or return immediately if `at` is already past.
    async fn sleep_until(&self, at: DateTime<Utc>) {
        let now = self.now();
        if at > now {
            let delta = (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.sleep(delta).await;
        }
    }
}

/// Real wall-clock backed by `tokio::time`.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A reference-counted clock handle, the shape components actually hold.
pub type SharedClock = Arc<dyn Clock>;

/// Deterministic test clock: `now()` is fixed until advanced explicitly;
/// `sleep`/`sleep_until` resolve immediately rather than yielding to the
/// runtime's timer wheel, so property tests for schedule determinism
/// (spec.md §8 invariant 5) don't depend on wall-clock jitter.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use parking_lot::RwLock;

    #[derive(Default)]
    pub struct TestClock {
        now: RwLock<DateTime<Utc>>,
    }

    impl TestClock {
        pub fn at(instant: DateTime<Utc>) -> Self {
            Self {
                now: RwLock::new(instant),
            }
        }

        pub fn advance(&self, duration: Duration) {
            let mut now = self.now.write();
            *now = *now + chrono::Duration::from_std(duration).unwrap_or_default();
        }

        pub fn set(&self, instant: DateTime<Utc>) {
            *self.now.write() = instant;
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.read()
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }
}
