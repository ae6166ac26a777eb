//! Per-run stage timers and counters.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Timings and counters collected by one worker during one run.
///
/// Passed explicitly into each stage; nothing here is global.
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    /// Wall time per stage, accumulated over repeated stages
    pub timings: BTreeMap<String, Duration>,
    /// Named counters
    pub counters: BTreeMap<String, u64>,
}

impl RunMetrics {
    /// Empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` and add its wall time to `stage`.
    pub fn time<T>(&mut self, stage: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stage, start.elapsed());
        out
    }

    /// Add `elapsed` to `stage`.
    pub fn record(&mut self, stage: &str, elapsed: Duration) {
        *self.timings.entry(stage.to_string()).or_default() += elapsed;
    }

    /// Add `n` to `counter`.
    pub fn add(&mut self, counter: &str, n: u64) {
        *self.counters.entry(counter.to_string()).or_default() += n;
    }

    /// Current value of `counter`, zero if never touched.
    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    /// Log every timer and counter.
    pub fn log_summary(&self, rank: usize) {
        for (stage, t) in &self.timings {
            tracing::info!("Worker {} {:<22} {:>10.3} ms", rank, stage, t.as_secs_f64() * 1e3);
        }
        for (name, n) in &self.counters {
            tracing::info!("Worker {} {:<22} {:>10}", rank, name, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_accumulates_per_stage() {
        let mut m = RunMetrics::new();
        let v = m.time("cluster", || 7);
        m.record("cluster", Duration::from_millis(5));
        assert_eq!(v, 7);
        assert!(m.timings["cluster"] >= Duration::from_millis(5));
    }

    #[test]
    fn counters_add_up() {
        let mut m = RunMetrics::new();
        m.add("groups", 3);
        m.add("groups", 2);
        assert_eq!(m.counter("groups"), 5);
        assert_eq!(m.counter("missing"), 0);
    }
}
