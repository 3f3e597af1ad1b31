//! Bounded-channel metrics ingestion and the sliding-window store it feeds
//! (C5).
//!
//! Ingestion is deliberately best-effort: a slow or stalled consumer must
//! never make the request path block on telemetry, so `record` uses
//! `try_send` and drops (with a counter) rather than awaiting capacity.

mod window;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::autodisable::AutoDisableEngine;
use crate::circuit_breaker::ModelCircuitBreaker;
use crate::models::{ChannelMetricsSnapshot, PerformanceRecord};
use window::MetricsRing;

#[derive(Debug, Clone, Copy)]
pub struct PerfConfig {
    pub buffer_capacity: usize,
    pub window_secs: i64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self { buffer_capacity: 1024, window_secs: 600 }
    }
}

/// Single-producer-facing handle; the consumer side runs as a detached task
/// owned by the `JoinHandle` returned from `spawn`.
pub struct PerfRecorder {
    sender: mpsc::Sender<PerformanceRecord>,
    metrics: Arc<DashMap<i64, Mutex<MetricsRing>>>,
    dropped: Arc<AtomicU64>,
    window_secs: i64,
    last_drop_warning: Mutex<Option<std::time::Instant>>,
}

impl PerfRecorder {
    /// Builds the recorder and spawns its single consumer task. The task
    /// runs until every sender clone (this one included) is dropped.
    pub fn spawn(
        config: PerfConfig,
        auto_disable: Arc<AutoDisableEngine>,
        breaker: Arc<ModelCircuitBreaker>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.buffer_capacity);
        let metrics: Arc<DashMap<i64, Mutex<MetricsRing>>> = Arc::new(DashMap::new());
        let recorder = Arc::new(Self {
            sender,
            metrics: Arc::clone(&metrics),
            dropped: Arc::new(AtomicU64::new(0)),
            window_secs: config.window_secs,
            last_drop_warning: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::run_consumer(receiver, metrics, config.window_secs, auto_disable, breaker));
        (recorder, handle)
    }

    /// Never blocks. A record is dropped, with a rate-limited warning,
    /// when the buffer is full.
    pub fn record(&self, record: PerformanceRecord) {
        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let mut last = self.last_drop_warning.lock().unwrap();
            let now = std::time::Instant::now();
            let should_warn = last.map(|t| now.duration_since(t) > Duration::from_secs(5)).unwrap_or(true);
            if should_warn {
                warn!(dropped_total = self.dropped.load(Ordering::Relaxed), "performance record buffer full, dropping");
                *last = Some(now);
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn metrics_for(&self, channel_id: i64) -> ChannelMetricsSnapshot {
        match self.metrics.get(&channel_id) {
            Some(ring) => ring.lock().unwrap().snapshot(Utc::now()),
            None => ChannelMetricsSnapshot::default(),
        }
    }

    async fn run_consumer(
        mut receiver: mpsc::Receiver<PerformanceRecord>,
        metrics: Arc<DashMap<i64, Mutex<MetricsRing>>>,
        window_secs: i64,
        auto_disable: Arc<AutoDisableEngine>,
        breaker: Arc<ModelCircuitBreaker>,
    ) {
        while let Some(record) = receiver.recv().await {
            let now = Utc::now();
            {
                let ring = metrics
                    .entry(record.channel_id)
                    .or_insert_with(|| Mutex::new(MetricsRing::new(window_secs)));
                ring.lock().unwrap().record(&record, now);
            }

            if record.success {
                auto_disable.clear_on_success(record.channel_id, record.api_key.as_deref());
                if let Some(model_id) = &record.model_id {
                    breaker.record_success(record.channel_id, model_id, now);
                }
                continue;
            }

            if let Some(status) = record.error_status_code {
                match &record.api_key {
                    Some(key) => auto_disable.record_key_error(record.channel_id, key, status).await,
                    None => auto_disable.record_channel_error(record.channel_id, status).await,
                }
            }
            if let Some(model_id) = &record.model_id {
                breaker.record_error(record.channel_id, model_id, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelRegistry, InMemoryChannelRepository, RegistryConfig};
    use std::sync::Arc;

    #[tokio::test]
    async fn success_record_updates_metrics_and_clears_errors() {
        let repo = Arc::new(InMemoryChannelRepository::new());
        let registry = Arc::new(ChannelRegistry::new(repo.clone(), RegistryConfig::default()));
        let auto_disable = Arc::new(AutoDisableEngine::new(repo, Arc::clone(&registry)));
        let breaker = Arc::new(ModelCircuitBreaker::new(Default::default()));

        let (recorder, _handle) = PerfRecorder::spawn(PerfConfig::default(), auto_disable, breaker);
        recorder.record(PerformanceRecord::success(1, "k1", 120.0));

        // The consumer runs on its own task; give it a turn to drain.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snap = recorder.metrics_for(1);
        assert_eq!(snap.samples, 1);
        assert_eq!(snap.success_rate, 1.0);
    }

    #[tokio::test]
    async fn unobserved_channel_reports_default_snapshot() {
        let repo = Arc::new(InMemoryChannelRepository::new());
        let registry = Arc::new(ChannelRegistry::new(repo.clone(), RegistryConfig::default()));
        let auto_disable = Arc::new(AutoDisableEngine::new(repo, registry));
        let breaker = Arc::new(ModelCircuitBreaker::new(Default::default()));
        let (recorder, _handle) = PerfRecorder::spawn(PerfConfig::default(), auto_disable, breaker);

        assert_eq!(recorder.metrics_for(999), ChannelMetricsSnapshot::default());
    }

    #[tokio::test]
    async fn full_buffer_drops_and_counts() {
        let repo = Arc::new(InMemoryChannelRepository::new());
        let registry = Arc::new(ChannelRegistry::new(repo.clone(), RegistryConfig::default()));
        let auto_disable = Arc::new(AutoDisableEngine::new(repo, registry));
        let breaker = Arc::new(ModelCircuitBreaker::new(Default::default()));
        let (recorder, _handle) =
            PerfRecorder::spawn(PerfConfig { buffer_capacity: 1, window_secs: 600 }, auto_disable, breaker);

        // `record` never awaits, so on the current-thread test runtime none
        // of this loop yields to the consumer task: the buffer fills after
        // the first send and every following one is a guaranteed drop.
        for _ in 0..100 {
            recorder.record(PerformanceRecord::success(1, "k1", 1.0));
        }
        assert_eq!(recorder.dropped_count(), 99);
    }
}
