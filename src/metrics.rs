//! Runtime counters and timing histograms exposed to the dashboard.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    pub captures_enqueued: AtomicU64,
    pub captures_suppressed: AtomicU64,
    pub observations_created: AtomicU64,
    pub observations_revised: AtomicU64,
    pub observations_dropped: AtomicU64,
    pub observations_tombstoned: AtomicU64,
    pub items_failed: AtomicU64,
    pub batches_processed: AtomicU64,
    pub searches: AtomicU64,
    pub context_assemblies: AtomicU64,
    timings: Mutex<HashMap<&'static str, Timing>>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Timing {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one operation duration under a named histogram.
    pub fn record_timing(&self, name: &'static str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut timings = match self.timings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = timings.entry(name).or_default();
        entry.count += 1;
        entry.total_ms += ms;
        entry.max_ms = entry.max_ms.max(ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let timings = match self.timings.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        MetricsSnapshot {
            captures_enqueued: self.captures_enqueued.load(Ordering::Relaxed),
            captures_suppressed: self.captures_suppressed.load(Ordering::Relaxed),
            observations_created: self.observations_created.load(Ordering::Relaxed),
            observations_revised: self.observations_revised.load(Ordering::Relaxed),
            observations_dropped: self.observations_dropped.load(Ordering::Relaxed),
            observations_tombstoned: self.observations_tombstoned.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            context_assemblies: self.context_assemblies.load(Ordering::Relaxed),
            timings: timings
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub captures_enqueued: u64,
    pub captures_suppressed: u64,
    pub observations_created: u64,
    pub observations_revised: u64,
    pub observations_dropped: u64,
    pub observations_tombstoned: u64,
    pub items_failed: u64,
    pub batches_processed: u64,
    pub searches: u64,
    pub context_assemblies: u64,
    pub timings: HashMap<String, Timing>,
}
