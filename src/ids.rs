//! Id generator port.
//!
//! spec.md §9: "inject... an id generator port" alongside the clock, to
//! make envelope/job/execution identifiers reproducible in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Abstract generator of globally-unique identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Production generator: random UUIDv4s, matching spec.md §6's
/// `message_id`/`task_id`/`workflow_id` wire format (`UUIDv4`).
#[derive(Debug, Clone, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic generator for tests: monotonically increasing, prefixed
/// ids, so S1-style scenarios can assert on exact identifiers.
#[derive(Debug, Default)]
pub struct SequentialGenerator {
    next: AtomicU64,
    prefix: &'static str,
}

impl SequentialGenerator {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            next: AtomicU64::new(1),
            prefix,
        }
    }
}

impl IdGenerator for SequentialGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:06}", self.prefix, n)
    }
}
