//! Per-second ring buffer underlying `ChannelMetrics` (C5).

use chrono::{DateTime, Utc};

use crate::models::{ChannelMetricsSnapshot, PerformanceRecord};

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Epoch-second this bucket currently represents. `0` means "never
    /// written", which is fine since epoch second 0 (1970) will never occur
    /// in practice and is naturally treated as stale on first use.
    epoch_second: i64,
    count: u64,
    errors: u64,
    total_latency_ms: f64,
}

/// Fixed-size ring of one bucket per second over the sliding window `W`.
/// A bucket is lazily reset to zero the first time it's touched for a new
/// epoch second, which is what makes this a *sliding* window rather than a
/// simple counter: buckets older than `W` seconds are implicitly stale and
/// overwritten rather than explicitly evicted.
pub struct MetricsRing {
    window_secs: i64,
    buckets: Vec<Bucket>,
}

impl MetricsRing {
    pub fn new(window_secs: i64) -> Self {
        let window_secs = window_secs.max(1);
        Self {
            window_secs,
            buckets: vec![Bucket::default(); window_secs as usize],
        }
    }

    fn index(&self, epoch_second: i64) -> usize {
        (epoch_second.rem_euclid(self.window_secs)) as usize
    }

    pub fn record(&mut self, rec: &PerformanceRecord, now: DateTime<Utc>) {
        let epoch_second = now.timestamp();
        let idx = self.index(epoch_second);
        let bucket = &mut self.buckets[idx];
        if bucket.epoch_second != epoch_second {
            *bucket = Bucket { epoch_second, count: 0, errors: 0, total_latency_ms: 0.0 };
        }
        bucket.count += 1;
        if !rec.success {
            bucket.errors += 1;
        }
        if let Some(latency) = rec.latency_ms {
            bucket.total_latency_ms += latency;
        }
    }

    /// Sums every bucket whose epoch second falls within `[now - W, now]`.
    /// Buckets outside that range are ignored even if not yet physically
    /// overwritten -- this is what keeps the aggregate a true sliding
    /// window instead of an all-time counter.
    pub fn snapshot(&self, now: DateTime<Utc>) -> ChannelMetricsSnapshot {
        let now_secs = now.timestamp();
        let floor = now_secs - self.window_secs;

        let mut count = 0u64;
        let mut errors = 0u64;
        let mut total_latency_ms = 0.0;
        for bucket in &self.buckets {
            if bucket.epoch_second > floor && bucket.epoch_second <= now_secs {
                count += bucket.count;
                errors += bucket.errors;
                total_latency_ms += bucket.total_latency_ms;
            }
        }

        if count == 0 {
            return ChannelMetricsSnapshot::default();
        }
        ChannelMetricsSnapshot {
            success_rate: (count - errors) as f64 / count as f64,
            avg_latency_ms: if count > 0 { total_latency_ms / count as f64 } else { 0.0 },
            samples: count,
        }
    }
}
