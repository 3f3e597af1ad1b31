//! Policy structs read by the core from the `SystemSettings` key-value
//! store (C10). These are the JSON-encoded payloads behind well-known keys;
//! the cache itself lives in `crate::settings_store`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerStrategy {
    Adaptive,
    Failover,
    CircuitBreaker,
}

/// `{status, times}`: disable after `times` errors with this status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusThreshold {
    pub status: u16,
    pub times: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDisableChannelPolicy {
    pub enabled: bool,
    pub statuses: Vec<StatusThreshold>,
}

impl AutoDisableChannelPolicy {
    pub fn threshold_for(&self, status: u16) -> Option<u32> {
        self.statuses
            .iter()
            .find(|s| s.status == status)
            .map(|s| s.times)
    }
}

impl Default for AutoDisableChannelPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            statuses: vec![
                StatusThreshold { status: 401, times: 3 },
                StatusThreshold { status: 429, times: 5 },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_channel_retries: u32,
    pub max_single_channel_retries: u32,
    pub retry_delay_ms: u64,
    pub load_balancer_strategy: LoadBalancerStrategy,
    pub auto_disable_channel: AutoDisableChannelPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_channel_retries: 3,
            max_single_channel_retries: 1,
            retry_delay_ms: 200,
            load_balancer_strategy: LoadBalancerStrategy::Adaptive,
            auto_disable_channel: AutoDisableChannelPolicy::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyValidationError {
    #[error("half_open_threshold ({half_open}) must be < open_threshold ({open})")]
    ThresholdOrdering { half_open: u32, open: u32 },
    #[error("half_open_weight must be within [0, 1], got {0}")]
    WeightOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    pub half_open_threshold: u32,
    pub open_threshold: u32,
    pub failure_stats_ttl_secs: u64,
    pub probe_interval_secs: u64,
    pub half_open_weight: f64,
}

impl CircuitBreakerPolicy {
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.half_open_threshold >= self.open_threshold {
            return Err(PolicyValidationError::ThresholdOrdering {
                half_open: self.half_open_threshold,
                open: self.open_threshold,
            });
        }
        if !(0.0..=1.0).contains(&self.half_open_weight) {
            return Err(PolicyValidationError::WeightOutOfRange(self.half_open_weight));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            half_open_threshold: 3,
            open_threshold: 5,
            failure_stats_ttl_secs: 300,
            probe_interval_secs: 300,
            half_open_weight: 0.5,
        }
    }
}

/// Allowed reload/probe cadences: cron expressions are restricted to even
/// minute divisors of 60, per SPEC_FULL.md §5.
pub const VALID_PROBE_FREQUENCIES_MINUTES: &[u32] =
    &[1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid probe frequency: {0} (must be an even divisor of 60 minutes)")]
pub struct InvalidProbeFrequency(pub u32);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelProbeSetting {
    pub enabled: bool,
    pub frequency_minutes: u32,
}

impl ChannelProbeSetting {
    pub fn validated(enabled: bool, frequency_minutes: u32) -> Result<Self, InvalidProbeFrequency> {
        if !VALID_PROBE_FREQUENCIES_MINUTES.contains(&frequency_minutes) {
            return Err(InvalidProbeFrequency(frequency_minutes));
        }
        Ok(Self { enabled, frequency_minutes })
    }
}

impl Default for ChannelProbeSetting {
    fn default() -> Self {
        Self { enabled: true, frequency_minutes: 5 }
    }
}
