//! Per-(channel, model) circuit breaker (C7).
//!
//! Three states: `Closed` (full weight), `HalfOpen` (degraded weight, still
//! serving live traffic), `Open` (no traffic except a single in-flight
//! probe, gated so exactly one caller tests recovery at a time).

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::CircuitBreakerPolicy;

/// Weight reported for the one probe request allowed through while `Open`.
/// Non-zero so a probe is distinguishable from "fully cut off" in logs and
/// metrics, and small enough that it never meaningfully competes with a
/// healthy channel for ranking.
const PROBE_WEIGHT: f64 = 0.01;

/// Backoff grows `probe_interval * 2^probe_attempts`, capped at 8x so a
/// channel that's been down for a long time still gets probed a few times
/// an hour rather than drifting towards "never again".
const MAX_BACKOFF_MULTIPLIER: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

struct BreakerEntry {
    state: BreakerState,
    consecutive_errors: u32,
    last_event_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    probe_attempts: u32,
    probing: bool,
}

impl BreakerEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_errors: 0,
            last_event_at: now,
            opened_at: None,
            probe_attempts: 0,
            probing: false,
        }
    }

    fn backoff_secs(&self, policy: &CircuitBreakerPolicy) -> u64 {
        let multiplier = 1u32.checked_shl(self.probe_attempts).unwrap_or(u32::MAX).min(MAX_BACKOFF_MULTIPLIER);
        policy.probe_interval_secs.saturating_mul(multiplier as u64)
    }

    fn due_for_probe(&self, policy: &CircuitBreakerPolicy, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened_at) => {
                let elapsed = now.signed_duration_since(opened_at).num_seconds().max(0) as u64;
                elapsed >= self.backoff_secs(policy)
            }
            None => true,
        }
    }
}

fn key(channel_id: i64, model_id: &str) -> (i64, String) {
    (channel_id, model_id.to_string())
}

pub struct ModelCircuitBreaker {
    policy: ArcSwap<CircuitBreakerPolicy>,
    entries: DashMap<(i64, String), Mutex<BreakerEntry>>,
}

impl ModelCircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self { policy: ArcSwap::from_pointee(policy), entries: DashMap::new() }
    }

    pub fn set_policy(&self, policy: CircuitBreakerPolicy) {
        self.policy.store(Arc::new(policy));
    }

    pub fn record_error(&self, channel_id: i64, model_id: &str, now: DateTime<Utc>) {
        let policy = self.policy.load();
        let entry = self.entries.entry(key(channel_id, model_id)).or_insert_with(|| Mutex::new(BreakerEntry::new(now)));
        let mut entry = entry.lock().unwrap();

        // A long enough gap since the last failure means the old streak is
        // no longer relevant, regardless of which state it happened in.
        if now.signed_duration_since(entry.last_event_at).num_seconds().max(0) as u64 > policy.failure_stats_ttl_secs {
            entry.consecutive_errors = 0;
        }

        entry.consecutive_errors += 1;
        entry.last_event_at = now;

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen if entry.consecutive_errors >= policy.open_threshold => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now);
                entry.probe_attempts = 0;
            }
            BreakerState::Closed if entry.consecutive_errors >= policy.half_open_threshold => {
                entry.state = BreakerState::HalfOpen;
            }
            BreakerState::HalfOpen => {}
            BreakerState::Open => {
                // A failed probe (or an error racing in while already open):
                // extend the backoff clock and release any in-flight probe.
                entry.opened_at = Some(now);
                entry.probe_attempts += 1;
                entry.probing = false;
            }
            BreakerState::Closed => {}
        }
    }

    /// Unconditional reset to closed, per the "any success clears the
    /// breaker" contract -- a half-open channel doesn't need to accumulate a
    /// streak of successes to earn back full weight.
    pub fn record_success(&self, channel_id: i64, model_id: &str, now: DateTime<Utc>) {
        let entry = self.entries.entry(key(channel_id, model_id)).or_insert_with(|| Mutex::new(BreakerEntry::new(now)));
        *entry.lock().unwrap() = BreakerEntry::new(now);
    }

    pub fn reset_model_status(&self, channel_id: i64, model_id: &str) {
        self.record_success(channel_id, model_id, Utc::now());
    }

    pub fn effective_weight(&self, channel_id: i64, model_id: &str) -> f64 {
        let Some(entry) = self.entries.get(&key(channel_id, model_id)) else { return 1.0 };
        let entry = entry.lock().unwrap();
        let policy = self.policy.load();
        match entry.state {
            BreakerState::Closed => 1.0,
            BreakerState::HalfOpen => policy.half_open_weight,
            BreakerState::Open => {
                if entry.due_for_probe(&policy, Utc::now()) {
                    PROBE_WEIGHT
                } else {
                    0.0
                }
            }
        }
    }

    /// Single-flight gate for the one probe request a caller is allowed to
    /// send while a model is open. Guarded by the same per-entry mutex used
    /// for every other transition, so the check-and-set is atomic without a
    /// separate compare-and-swap primitive.
    pub fn try_begin_probe(&self, channel_id: i64, model_id: &str) -> bool {
        let Some(entry) = self.entries.get(&key(channel_id, model_id)) else { return false };
        let mut entry = entry.lock().unwrap();
        let policy = self.policy.load();
        if entry.state != BreakerState::Open || entry.probing || !entry.due_for_probe(&policy, Utc::now()) {
            return false;
        }
        entry.probing = true;
        true
    }

    /// Releases the probe slot. Call on a probe's completion, success or
    /// failure; `record_success`/`record_error` also clear `probing` as a
    /// side effect, so this is safe to skip if the caller routed the
    /// probe's outcome through those instead.
    pub fn end_probe(&self, channel_id: i64, model_id: &str) {
        if let Some(entry) = self.entries.get(&key(channel_id, model_id)) {
            entry.lock().unwrap().probing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy() -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            half_open_threshold: 2,
            open_threshold: 4,
            failure_stats_ttl_secs: 300,
            probe_interval_secs: 10,
            half_open_weight: 0.5,
        }
    }

    #[test]
    fn closed_channel_reports_full_weight() {
        let cb = ModelCircuitBreaker::new(policy());
        assert_eq!(cb.effective_weight(1, "gpt-4"), 1.0);
    }

    #[test]
    fn crosses_into_half_open_then_open() {
        let cb = ModelCircuitBreaker::new(policy());
        let now = Utc::now();
        cb.record_error(1, "gpt-4", now);
        cb.record_error(1, "gpt-4", now);
        assert_eq!(cb.effective_weight(1, "gpt-4"), 0.5);

        cb.record_error(1, "gpt-4", now);
        cb.record_error(1, "gpt-4", now);
        assert_eq!(cb.effective_weight(1, "gpt-4"), 0.0);
    }

    #[test]
    fn open_channel_allows_a_probe_after_backoff_elapses() {
        let cb = ModelCircuitBreaker::new(policy());
        let t0 = Utc::now();
        for _ in 0..4 {
            cb.record_error(1, "gpt-4", t0);
        }
        assert_eq!(cb.effective_weight(1, "gpt-4"), 0.0);
        assert!(!cb.try_begin_probe(1, "gpt-4"));

        let after_backoff = t0 + Duration::seconds(11);
        assert_eq!(cb.effective_weight_at(1, "gpt-4", after_backoff), PROBE_WEIGHT);
    }

    #[test]
    fn try_begin_probe_is_single_flight() {
        let cb = ModelCircuitBreaker::new(policy());
        let t0 = Utc::now();
        for _ in 0..4 {
            cb.record_error(1, "gpt-4", t0);
        }
        let later = t0 + Duration::seconds(11);
        assert!(cb.try_begin_probe_at(1, "gpt-4", later));
        assert!(!cb.try_begin_probe_at(1, "gpt-4", later));
    }

    #[test]
    fn success_unconditionally_closes() {
        let cb = ModelCircuitBreaker::new(policy());
        let t0 = Utc::now();
        for _ in 0..4 {
            cb.record_error(1, "gpt-4", t0);
        }
        cb.record_success(1, "gpt-4", t0);
        assert_eq!(cb.effective_weight(1, "gpt-4"), 1.0);
    }

    // Test-only time-parameterized variants of the `_now()`-using public
    // methods, so backoff/single-flight behavior can be asserted without a
    // real sleep.
    impl ModelCircuitBreaker {
        fn effective_weight_at(&self, channel_id: i64, model_id: &str, now: DateTime<Utc>) -> f64 {
            let Some(entry) = self.entries.get(&key(channel_id, model_id)) else { return 1.0 };
            let entry = entry.lock().unwrap();
            let policy = self.policy.load();
            match entry.state {
                BreakerState::Closed => 1.0,
                BreakerState::HalfOpen => policy.half_open_weight,
                BreakerState::Open => {
                    if entry.due_for_probe(&policy, now) { PROBE_WEIGHT } else { 0.0 }
                }
            }
        }

        fn try_begin_probe_at(&self, channel_id: i64, model_id: &str, now: DateTime<Utc>) -> bool {
            let Some(entry) = self.entries.get(&key(channel_id, model_id)) else { return false };
            let mut entry = entry.lock().unwrap();
            let policy = self.policy.load();
            if entry.state != BreakerState::Open || entry.probing || !entry.due_for_probe(&policy, now) {
                return false;
            }
            entry.probing = true;
            true
        }
    }
}
