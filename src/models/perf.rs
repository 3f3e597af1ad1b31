//! Performance observations ingested by `PerfRecorder`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single completed-request observation, as submitted by the (out of
/// scope) HTTP surface after a request finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub channel_id: i64,
    pub api_key: Option<String>,
    pub model_id: Option<String>,
    pub success: bool,
    pub error_status_code: Option<u16>,
    pub request_completed: bool,
    pub end_time: DateTime<Utc>,
    pub latency_ms: Option<f64>,
}

impl PerformanceRecord {
    pub fn success(channel_id: i64, api_key: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            channel_id,
            api_key: Some(api_key.into()),
            model_id: None,
            success: true,
            error_status_code: None,
            request_completed: true,
            end_time: Utc::now(),
            latency_ms: Some(latency_ms),
        }
    }

    pub fn error(
        channel_id: i64,
        api_key: impl Into<String>,
        status_code: u16,
        model_id: Option<String>,
    ) -> Self {
        Self {
            channel_id,
            api_key: Some(api_key.into()),
            model_id,
            success: false,
            error_status_code: Some(status_code),
            request_completed: true,
            end_time: Utc::now(),
            latency_ms: None,
        }
    }
}

/// Read-side view of a channel's sliding-window metrics, as returned to the
/// load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetricsSnapshot {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub samples: u64,
}

impl Default for ChannelMetricsSnapshot {
    fn default() -> Self {
        // An unobserved channel is assumed healthy so it isn't penalized
        // before it has ever been tried.
        Self {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            samples: 0,
        }
    }
}
