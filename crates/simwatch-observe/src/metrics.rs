use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Level that moves both ways, e.g. runs currently being watched.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Count, sum and worst case of a stream of durations, in microseconds.
#[derive(Debug, Default)]
pub struct DurationAgg {
    samples: AtomicU64,
    sum_us: AtomicU64,
    worst_us: AtomicU64,
}

fn micros(dur: Duration) -> u64 {
    u64::try_from(dur.as_micros()).unwrap_or(u64::MAX)
}

impl DurationAgg {
    pub fn record(&self, dur: Duration) {
        let us = micros(dur);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.worst_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DurationSummary {
        let samples = self.samples.load(Ordering::Relaxed);
        let sum = self.sum_us.load(Ordering::Relaxed);
        DurationSummary {
            samples,
            mean: Duration::from_micros(sum.checked_div(samples).unwrap_or(0)),
            worst: Duration::from_micros(self.worst_us.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSummary {
    pub samples: u64,
    pub mean: Duration,
    pub worst: Duration,
}

/// Records into `agg` on drop, so early returns are timed too.
pub struct ScopedTimer<'a> {
    started: Instant,
    agg: &'a DurationAgg,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(agg: &'a DurationAgg) -> Self {
        Self {
            started: Instant::now(),
            agg,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.agg.record(self.started.elapsed());
    }
}
