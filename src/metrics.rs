//! Hand-rolled aggregate metrics: latency percentiles, counts, queue
//! depth. Generalizes the one-off computation in
//! [`crate::scheduler::Scheduler::get_metrics`] so other callers (the
//! bus, a future HTTP exporter) can reuse the same estimator without
//! pulling in a histogram crate the teacher's own stack doesn't carry.

/// A closed set of millisecond samples, summarized on demand.
///
/// No crate in the teacher's dependency stack does streaming percentile
/// estimation (t-digest, HDR histograms); `observability/metrics.rs`
/// there is itself a stub. Rather than add a dependency for this alone,
/// this keeps the full sample set and sorts at read time, which is fine
/// at the cardinality a single process's execution history reaches.
#[derive(Debug, Clone, Default)]
pub struct LatencySamples {
    sorted_ms: Vec<u64>,
}

impl LatencySamples {
    pub fn from_unsorted(mut samples: Vec<u64>) -> Self {
        samples.sort_unstable();
        Self { sorted_ms: samples }
    }

    pub fn len(&self) -> usize {
        self.sorted_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_ms.is_empty()
    }

    /// Nearest-rank percentile, `p` in `[0.0, 1.0]`. Returns 0 on an
    /// empty sample set rather than panicking.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.sorted_ms.is_empty() {
            return 0;
        }
        let idx = ((self.sorted_ms.len() as f64 - 1.0) * p.clamp(0.0, 1.0)).round() as usize;
        self.sorted_ms[idx.min(self.sorted_ms.len() - 1)]
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> u64 {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    pub fn mean(&self) -> f64 {
        if self.sorted_ms.is_empty() {
            return 0.0;
        }
        self.sorted_ms.iter().sum::<u64>() as f64 / self.sorted_ms.len() as f64
    }
}

/// Snapshot of a process's point-in-time load, used to build
/// [`crate::observer::ObserverEvent::MetricSnapshot`].
#[derive(Debug, Clone)]
pub struct LoadSnapshot {
    pub queue_depth: usize,
    pub worker_count: usize,
}

impl LoadSnapshot {
    pub fn capture(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            worker_count: num_cpus::get(),
        }
    }
}
