//! Trace-sticky API key selection (C2).
//!
//! Picks one API key out of a channel's enabled set, trying to keep the
//! same trace id mapped to the same key across requests even as the
//! enabled set changes shape (keys disabled, then re-enabled).

use std::sync::Mutex;

use lru::LruCache;
use rand::seq::SliceRandom;

use crate::hash_ring;
use crate::snapshot::ChannelSnapshot;

const DEFAULT_LRU_CAPACITY: usize = 1024;

/// Builds the LRU's internal key from a channel id and trace id so one
/// provider instance can safely serve every channel without cross-channel
/// key bleed, while still being "stateless with respect to the channel" in
/// the sense that it holds no channel configuration of its own.
fn lru_key(channel_id: i64, trace_id: &str) -> String {
    format!("{channel_id}:{trace_id}")
}

/// Stateless-per-channel, LRU-memoized sticky key picker. Safe to share
/// behind an `Arc` across concurrent callers.
pub struct TraceStickyKeyProvider {
    lru: Mutex<LruCache<String, String>>,
}

impl TraceStickyKeyProvider {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LRU_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Picks an API key for `snapshot`, per the contract in SPEC_FULL.md
    /// §4.2. Never fails: the legacy fallback guarantees a key is always
    /// returned, even for a pathological channel with no enabled keys.
    pub fn get(&self, snapshot: &ChannelSnapshot, trace_id: Option<&str>) -> String {
        let enabled = &snapshot.cached_enabled_api_keys;

        if enabled.is_empty() {
            return snapshot
                .channel
                .all_keys()
                .into_iter()
                .next()
                .unwrap_or_default();
        }
        if enabled.len() == 1 {
            return enabled[0].clone();
        }

        match trace_id {
            Some(trace_id) => self.get_sticky(snapshot.channel.id, enabled, trace_id),
            None => {
                let mut rng = rand::thread_rng();
                enabled
                    .choose(&mut rng)
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    fn get_sticky(&self, channel_id: i64, enabled: &[String], trace_id: &str) -> String {
        let cache_key = lru_key(channel_id, trace_id);
        let mut lru = self.lru.lock().expect("trace-sticky LRU poisoned");

        if let Some(cached) = lru.get(&cache_key) {
            if enabled.iter().any(|k| k == cached) {
                return cached.clone();
            }
        }

        let selected = hash_ring::select(enabled, trace_id)
            .unwrap_or(&enabled[0])
            .to_string();
        lru.put(cache_key, selected.clone());
        selected
    }
}

impl Default for TraceStickyKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, ChannelStatus, ChannelType, Credentials};
    use chrono::Utc;
    use std::collections::HashMap;

    fn channel(keys: &[&str]) -> Channel {
        Channel {
            id: 7,
            name: "test".into(),
            channel_type: ChannelType::OpenAI,
            base_url: "https://example.test".into(),
            credentials: Credentials::ApiKeys(keys.iter().map(|s| s.to_string()).collect()),
            supported_models: vec!["gpt-4".into()],
            model_mappings: vec![],
            extra_model_prefix: None,
            disabled_api_keys: vec![],
            status: ChannelStatus::Enabled,
            ordering_weight: 0,
            updated_at: Utc::now(),
            error_message: None,
            override_params_raw: None,
        }
    }

    fn snapshot_of(channel: Channel) -> ChannelSnapshot {
        ChannelSnapshot::build(channel, HashMap::new())
    }

    #[test]
    fn single_enabled_key_is_returned_directly() {
        let snap = snapshot_of(channel(&["only"]));
        let provider = TraceStickyKeyProvider::new();
        assert_eq!(provider.get(&snap, Some("trace-1")), "only");
        assert_eq!(provider.get(&snap, None), "only");
    }

    #[test]
    fn empty_enabled_falls_back_to_first_credential_key() {
        let mut ch = channel(&["k1", "k2"]);
        ch.disable_api_key("k1", None, "x").unwrap();
        ch.disable_api_key("k2", None, "x").unwrap();
        let snap = snapshot_of(ch);
        let provider = TraceStickyKeyProvider::new();
        assert_eq!(provider.get(&snap, Some("trace")), "k1");
    }

    #[test]
    fn sticky_across_disable_and_re_enable_via_lru() {
        let provider = TraceStickyKeyProvider::new();
        let base = channel(&["k1", "k2", "k3"]);
        let snap_full = snapshot_of(base.clone());
        let chosen = provider.get(&snap_full, Some("trace-a"));

        // Disable the chosen key's channel-level entry (simulate it going
        // unavailable) -- pick a snapshot excluding it.
        let mut without_chosen = base.clone();
        without_chosen.disable_api_key(&chosen, None, "maintenance").unwrap();
        let snap_without = snapshot_of(without_chosen);
        let second_choice = provider.get(&snap_without, Some("trace-a"));
        assert_ne!(second_choice, chosen);

        // Re-enabling (fresh snapshot with the full set again) must return
        // to the original choice because the LRU still maps trace-a -> chosen.
        let snap_reenabled = snapshot_of(base);
        assert_eq!(provider.get(&snap_reenabled, Some("trace-a")), chosen);
    }

    #[test]
    fn no_trace_id_still_returns_an_enabled_key() {
        let snap = snapshot_of(channel(&["k1", "k2"]));
        let provider = TraceStickyKeyProvider::new();
        for _ in 0..20 {
            let picked = provider.get(&snap, None);
            assert!(picked == "k1" || picked == "k2");
        }
    }
}
