//! Error-driven API key and channel auto-disable (C6).
//!
//! Two independent monotone counters: one per `(channel, key, status)`, one
//! per `(channel, status)` for channels with no per-key concept (OAuth,
//! cloud IAM). A success clears both for the channel (and the key, if
//! named) so a channel has to fail *consecutively* to trip, not cumulatively
//! over its whole lifetime.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::models::{AutoDisableChannelPolicy, ChannelStatus};
use crate::registry::{ChannelRegistry, ChannelRepository};

pub struct AutoDisableEngine {
    repo: Arc<dyn ChannelRepository>,
    registry: Arc<ChannelRegistry>,
    policy: ArcSwap<AutoDisableChannelPolicy>,
    key_error_counts: DashMap<(i64, String, u16), u32>,
    channel_error_counts: DashMap<(i64, u16), u32>,
}

impl AutoDisableEngine {
    pub fn new(repo: Arc<dyn ChannelRepository>, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            repo,
            registry,
            policy: ArcSwap::from_pointee(AutoDisableChannelPolicy::default()),
            key_error_counts: DashMap::new(),
            channel_error_counts: DashMap::new(),
        }
    }

    /// Lets `SystemSettings` push a freshly-loaded policy in without
    /// touching the counters already in flight.
    pub fn set_policy(&self, policy: AutoDisableChannelPolicy) {
        self.policy.store(Arc::new(policy));
    }

    pub async fn record_key_error(&self, channel_id: i64, key: &str, status: u16) {
        let policy = self.policy.load();
        if !policy.enabled {
            return;
        }
        let Some(threshold) = policy.threshold_for(status) else { return };

        let count = {
            let mut entry = self
                .key_error_counts
                .entry((channel_id, key.to_string(), status))
                .or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= threshold {
            self.disable_key(channel_id, key, status).await;
        }
    }

    pub async fn record_channel_error(&self, channel_id: i64, status: u16) {
        let policy = self.policy.load();
        if !policy.enabled {
            return;
        }
        let Some(threshold) = policy.threshold_for(status) else { return };

        let count = {
            let mut entry = self.channel_error_counts.entry((channel_id, status)).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= threshold {
            self.disable_channel(channel_id, status).await;
        }
    }

    /// A success resets this channel's standing entirely -- and this key's,
    /// if one is named -- so a lone error after a long healthy stretch never
    /// trips the threshold on its own.
    pub fn clear_on_success(&self, channel_id: i64, key: Option<&str>) {
        self.channel_error_counts.retain(|(id, _), _| *id != channel_id);
        if let Some(key) = key {
            self.key_error_counts
                .retain(|(id, k, _), _| !(*id == channel_id && k == key));
        }
    }

    async fn disable_key(&self, channel_id: i64, key: &str, status: u16) {
        let Ok(Some(mut channel)) = self.repo.get(channel_id).await else { return };
        match channel.disable_api_key(key, Some(status), format!("auto-disabled after repeated {status} errors")) {
            Ok(_) => {
                if let Err(err) = self.repo.upsert(channel).await {
                    warn!(channel_id, error = %err, "failed to persist auto-disabled key");
                    return;
                }
                self.key_error_counts.retain(|(id, k, _), _| !(*id == channel_id && k == key));
                info!(channel_id, key, status, "api key auto-disabled");
                self.registry.async_reload();
            }
            Err(err) => warn!(channel_id, key, error = %err, "auto-disable key mutation rejected"),
        }
    }

    async fn disable_channel(&self, channel_id: i64, status: u16) {
        let Ok(Some(mut channel)) = self.repo.get(channel_id).await else { return };
        if channel.status == ChannelStatus::Disabled {
            return;
        }
        channel.status = ChannelStatus::Disabled;
        channel.error_message = Some(format!("auto-disabled after repeated {status} errors"));
        if let Err(err) = self.repo.upsert(channel).await {
            warn!(channel_id, error = %err, "failed to persist auto-disabled channel");
            return;
        }
        self.channel_error_counts.retain(|(id, _), _| *id != channel_id);
        info!(channel_id, status, "channel auto-disabled");
        self.registry.async_reload();
    }
}
