//! Model resolution and channel ranking for the retry loop (C9).
//!
//! `Chooser` never performs I/O and never retries anything itself -- it just
//! answers "given this model name, which channels can serve it, in what
//! order, and which key should the caller try on each". The retry loop
//! itself lives with the (out of scope) request-dispatch surface, which
//! walks the ranked list up to `RetryPolicy.max_channel_retries` entries.

use std::sync::Arc;

use crate::circuit_breaker::ModelCircuitBreaker;
use crate::key_provider::TraceStickyKeyProvider;
use crate::registry::ChannelRegistry;
use crate::snapshot::ChannelSnapshot;

#[derive(Debug, Clone)]
pub struct RankedChannel {
    pub snapshot: Arc<ChannelSnapshot>,
    pub resolved_model: String,
    pub effective_weight: f64,
}

pub struct Chooser {
    registry: Arc<ChannelRegistry>,
    key_provider: Arc<TraceStickyKeyProvider>,
    breaker: Arc<ModelCircuitBreaker>,
}

impl Chooser {
    pub fn new(registry: Arc<ChannelRegistry>, key_provider: Arc<TraceStickyKeyProvider>, breaker: Arc<ModelCircuitBreaker>) -> Self {
        Self { registry, key_provider, breaker }
    }

    /// Every enabled channel that can serve `requested_model`, ranked by
    /// `ordering_weight` descending and, within equal weight, by the
    /// model's current circuit-breaker weight descending. Channels with a
    /// zero effective weight are still included (sorted last): a
    /// fully-open model is only truly unreachable if nothing else is left.
    pub fn rank(&self, requested_model: &str) -> Vec<RankedChannel> {
        let mut ranked: Vec<RankedChannel> = self
            .registry
            .snapshots()
            .iter()
            .filter_map(|snapshot| {
                let resolved_model = snapshot.resolve_model(requested_model)?;
                let effective_weight = self.breaker.effective_weight(snapshot.channel.id, &resolved_model);
                Some(RankedChannel { snapshot: Arc::clone(snapshot), resolved_model, effective_weight })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.snapshot
                .channel
                .ordering_weight
                .cmp(&a.snapshot.channel.ordering_weight)
                .then_with(|| b.effective_weight.partial_cmp(&a.effective_weight).unwrap_or(std::cmp::Ordering::Equal))
        });
        ranked
    }

    /// Trace-sticky key pick for one ranked channel. `None` only for a
    /// pathological channel with no credential keys at all.
    pub fn choose_key(&self, channel: &RankedChannel, trace_id: Option<&str>) -> Option<String> {
        let picked = self.key_provider.get(&channel.snapshot, trace_id);
        if picked.is_empty() {
            None
        } else {
            Some(picked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, ChannelStatus, ChannelType, Credentials};
    use crate::registry::{ChannelRepository, InMemoryChannelRepository, RegistryConfig};
    use chrono::Utc;

    fn channel(id: i64, weight: i32, models: &[&str]) -> Channel {
        Channel {
            id,
            name: format!("channel-{id}"),
            channel_type: ChannelType::OpenAI,
            base_url: "https://example.test".into(),
            credentials: Credentials::ApiKeys(vec!["k1".into()]),
            supported_models: models.iter().map(|m| m.to_string()).collect(),
            model_mappings: vec![],
            extra_model_prefix: None,
            disabled_api_keys: vec![],
            status: ChannelStatus::Enabled,
            ordering_weight: weight,
            updated_at: Utc::now(),
            error_message: None,
            override_params_raw: None,
        }
    }

    async fn harness(channels: Vec<Channel>) -> Chooser {
        let repo = Arc::new(InMemoryChannelRepository::new());
        for c in channels {
            repo.seed(c);
        }
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&repo) as Arc<dyn ChannelRepository>, RegistryConfig::default()));
        registry.load_initial().await.unwrap();
        let breaker = Arc::new(ModelCircuitBreaker::new(Default::default()));
        Chooser::new(registry, Arc::new(TraceStickyKeyProvider::new()), breaker)
    }

    #[tokio::test]
    async fn ranks_by_ordering_weight_descending() {
        let chooser = harness(vec![channel(1, 1, &["gpt-4"]), channel(2, 10, &["gpt-4"])]).await;
        let ranked = chooser.rank("gpt-4");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].snapshot.channel.id, 2);
        assert_eq!(ranked[1].snapshot.channel.id, 1);
    }

    #[tokio::test]
    async fn excludes_channels_that_cannot_serve_the_model() {
        let chooser = harness(vec![channel(1, 1, &["claude-3"]), channel(2, 1, &["gpt-4"])]).await;
        let ranked = chooser.rank("gpt-4");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].snapshot.channel.id, 2);
    }

    #[tokio::test]
    async fn tiebreaks_equal_weight_channels_by_circuit_breaker_health() {
        let chooser = harness(vec![channel(1, 5, &["gpt-4"]), channel(2, 5, &["gpt-4"])]).await;
        chooser.breaker.record_error(1, "gpt-4", Utc::now());
        chooser.breaker.record_error(1, "gpt-4", Utc::now());
        chooser.breaker.record_error(1, "gpt-4", Utc::now());
        chooser.breaker.record_error(1, "gpt-4", Utc::now());
        chooser.breaker.record_error(1, "gpt-4", Utc::now());

        let ranked = chooser.rank("gpt-4");
        assert_eq!(ranked[0].snapshot.channel.id, 2);
    }

    #[tokio::test]
    async fn choose_key_returns_a_channel_credential() {
        let chooser = harness(vec![channel(1, 1, &["gpt-4"])]).await;
        let ranked = chooser.rank("gpt-4");
        let key = chooser.choose_key(&ranked[0], Some("trace-1")).unwrap();
        assert_eq!(key, "k1");
    }
}
