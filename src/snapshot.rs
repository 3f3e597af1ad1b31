//! Immutable, derived per-channel cache (C3).
//!
//! A `ChannelSnapshot` is built once by the registry's reload loop and then
//! shared read-only across every request until the next reload swap. It
//! never mutates the underlying `Channel`; every derived field is computed
//! at construction time.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::models::{Channel, Price};

/// Derived, immutable per-channel view. Cheap to clone (an `Arc` wrapper is
/// the caller's job — the registry stores these behind `Arc` in its
/// snapshot vector).
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub cached_enabled_api_keys: Vec<String>,
    pub cached_override_params: HashMap<String, Value>,
    pub cached_model_prices: HashMap<String, Price>,
}

impl ChannelSnapshot {
    /// Builds a snapshot from a channel and its preloaded price map. Any
    /// failure to parse `override_params_raw` is degraded (§7): a warning is
    /// logged and the override map defaults to empty, rather than failing
    /// the whole reload.
    pub fn build(channel: Channel, model_prices: HashMap<String, Price>) -> Self {
        let cached_enabled_api_keys = channel.enabled_keys();
        let cached_override_params = match &channel.override_params_raw {
            Some(raw) if !raw.trim().is_empty() => match serde_json::from_str(raw) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                Ok(_) => {
                    warn!(channel_id = channel.id, "override_params is not a JSON object, defaulting to empty");
                    HashMap::new()
                }
                Err(err) => {
                    warn!(channel_id = channel.id, error = %err, "failed to parse override_params JSON, defaulting to empty");
                    HashMap::new()
                }
            },
            _ => HashMap::new(),
        };

        Self {
            channel,
            cached_enabled_api_keys,
            cached_override_params,
            cached_model_prices: model_prices,
        }
    }

    pub fn is_model_supported(&self, requested: &str) -> bool {
        self.channel.is_model_supported(requested)
    }

    pub fn resolve_model(&self, requested: &str) -> Option<String> {
        self.channel.resolve_model(requested)
    }

    pub fn price_for(&self, resolved_model: &str) -> Option<Price> {
        self.cached_model_prices.get(resolved_model).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelStatus, ChannelType, Credentials};
    use chrono::Utc;

    fn base_channel() -> Channel {
        Channel {
            id: 1,
            name: "test".into(),
            channel_type: ChannelType::OpenAI,
            base_url: "https://example.test".into(),
            credentials: Credentials::ApiKeys(vec!["k1".into(), "k2".into()]),
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

    #[test]
    fn bad_override_json_degrades_to_empty_map() {
        let mut ch = base_channel();
        ch.override_params_raw = Some("{not json".into());
        let snap = ChannelSnapshot::build(ch, HashMap::new());
        assert!(snap.cached_override_params.is_empty());
    }

    #[test]
    fn valid_override_json_is_parsed() {
        let mut ch = base_channel();
        ch.override_params_raw = Some(r#"{"temperature_cap": 0.7}"#.into());
        let snap = ChannelSnapshot::build(ch, HashMap::new());
        assert_eq!(
            snap.cached_override_params.get("temperature_cap"),
            Some(&Value::from(0.7))
        );
    }

    #[test]
    fn enabled_keys_exclude_disabled() {
        let mut ch = base_channel();
        ch.disable_api_key("k1", None, "x").unwrap();
        let snap = ChannelSnapshot::build(ch, HashMap::new());
        assert_eq!(snap.cached_enabled_api_keys, vec!["k2".to_string()]);
    }
}
