//! Request-routing and channel-health core for an LLM API gateway.
//!
//! This crate answers one question for a caller that already has a
//! validated request in hand -- "which upstream channel and API key should
//! this go to, and how should the gateway react to what happens next" -- by
//! gluing together a handful of independent, narrowly-scoped components:
//!
//! - [`hash_ring`]: deterministic, minimal-disruption key selection (rendezvous hashing)
//! - [`key_provider`]: trace-sticky memoization layered on top of the hash ring
//! - [`snapshot`] / [`registry`]: a periodically-refreshed, immutable view of enabled channels
//! - [`perf`]: best-effort sliding-window latency/error metrics
//! - [`autodisable`]: error-driven API key and channel auto-disable
//! - [`circuit_breaker`]: per-(channel, model) open/half-open/closed breaking
//! - [`chooser`]: ties the above together into a ranked channel list
//! - [`price_versioner`]: transactional per-model price history
//! - [`settings_store`]: the typed, cached policy store all of the above read from
//!
//! Everything above the wire protocol -- auth, request/response transforms,
//! the HTTP surface itself -- is an out-of-scope collaborator; this crate
//! only owns the routing and health-tracking decisions.

pub mod autodisable;
pub mod chooser;
pub mod circuit_breaker;
pub mod config;
pub mod hash_ring;
pub mod key_provider;
pub mod models;
pub mod perf;
pub mod price_versioner;
pub mod registry;
pub mod settings_store;
pub mod snapshot;


use std::sync::Arc;

use thiserror::Error;

pub use autodisable::AutoDisableEngine;
pub use chooser::{Chooser, RankedChannel};
pub use circuit_breaker::ModelCircuitBreaker;
pub use config::AppConfig;
pub use key_provider::TraceStickyKeyProvider;
pub use models::{Channel, ChannelStatus, PerformanceRecord, Price};
pub use perf::{PerfConfig, PerfRecorder};
pub use price_versioner::{InMemoryPriceStore, PriceStore, PriceVersionError, PriceVersioner};
pub use registry::{ChannelRegistry, ChannelRepository, InMemoryChannelRepository, RegistryConfig};
pub use settings_store::{InMemorySettingsCache, InMemorySettingsRepository, SettingsCache, SettingsRepository, SystemSettings};
pub use snapshot::ChannelSnapshot;

/// Everything that can go wrong calling into [`GatewayCore`] from outside
/// the crate. Component-internal errors (a bad price, a malformed channel
/// mutation) keep their own specific types; this enum exists for the
/// facade's own fallible operations and to let callers match on one error
/// type without reaching into every submodule.
#[derive(Debug, Error)]
pub enum GatewayCoreError {
    #[error("channel mutation rejected: {0}")]
    ChannelMutation(#[from] models::ChannelMutationError),

    #[error(transparent)]
    PriceVersion(#[from] PriceVersionError),

    #[error("policy rejected: {0}")]
    Policy(#[from] models::PolicyValidationError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, GatewayCoreError>;

/// Wires every component together behind the repository/cache
/// implementations the caller supplies. This is the type an embedding
/// application constructs once at startup and shares behind an `Arc`.
pub struct GatewayCore {
    pub registry: Arc<ChannelRegistry>,
    pub key_provider: Arc<TraceStickyKeyProvider>,
    pub breaker: Arc<ModelCircuitBreaker>,
    pub auto_disable: Arc<AutoDisableEngine>,
    pub perf: Arc<PerfRecorder>,
    pub chooser: Chooser,
    pub price_versioner: PriceVersioner,
    pub settings: SystemSettings,
    perf_consumer: tokio::task::JoinHandle<()>,
}

impl GatewayCore {
    /// Assembles the core from its storage seams. `channels` backs the
    /// registry and auto-disable; `prices` backs price versioning;
    /// `settings_repo`/`settings_cache` back the settings store.
    pub async fn new(
        channels: Arc<dyn ChannelRepository>,
        prices: Arc<dyn PriceStore>,
        settings_repo: Arc<dyn SettingsRepository>,
        settings_cache: Arc<dyn SettingsCache>,
        registry_config: RegistryConfig,
        perf_config: PerfConfig,
    ) -> Result<Self> {
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&channels), registry_config));
        registry.load_initial().await.map_err(GatewayCoreError::Storage)?;

        let settings = SystemSettings::new(settings_repo, settings_cache);
        settings.initialize_defaults().await.map_err(GatewayCoreError::Storage)?;

        let key_provider = Arc::new(TraceStickyKeyProvider::new());
        let breaker = Arc::new(ModelCircuitBreaker::new(settings.circuit_breaker_policy().await.map_err(GatewayCoreError::Storage)?));
        let auto_disable = Arc::new(AutoDisableEngine::new(Arc::clone(&channels), Arc::clone(&registry)));
        auto_disable.set_policy(settings.auto_disable_channel_policy().await.map_err(GatewayCoreError::Storage)?);

        let (perf, perf_consumer) = PerfRecorder::spawn(perf_config, Arc::clone(&auto_disable), Arc::clone(&breaker));
        let chooser = Chooser::new(Arc::clone(&registry), Arc::clone(&key_provider), Arc::clone(&breaker));
        let price_versioner = PriceVersioner::new(prices, Arc::clone(&channels));

        Ok(Self {
            registry,
            key_provider,
            breaker,
            auto_disable,
            perf,
            chooser,
            price_versioner,
            settings,
            perf_consumer,
        })
    }

    /// Convenience constructor over the in-memory test doubles, for local
    /// development and the bundled CLI demo. `self.registry` must still be
    /// seeded via its repository before routing decisions mean anything.
    pub async fn in_memory(registry_config: RegistryConfig, perf_config: PerfConfig) -> Result<Self> {
        Self::new(
            Arc::new(InMemoryChannelRepository::new()),
            Arc::new(InMemoryPriceStore::new()),
            Arc::new(InMemorySettingsRepository::new()),
            Arc::new(InMemorySettingsCache::new()),
            registry_config,
            perf_config,
        )
        .await
    }

    /// Spawns the registry's background reload tick. Returns the join
    /// handle so the caller can abort it on shutdown; the perf consumer's
    /// handle is retained internally and aborted on `Drop`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.registry).start()
    }
}

impl Drop for GatewayCore {
    fn drop(&mut self) {
        self.perf_consumer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{ChannelType, Credentials};
    use chrono::Utc;

    fn channel(id: i64) -> Channel {
        Channel {
            id,
            name: format!("channel-{id}"),
            channel_type: ChannelType::OpenAI,
            base_url: "https://example.test".into(),
            credentials: Credentials::ApiKeys(vec!["k1".into()]),
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

    #[tokio::test]
    async fn bootstraps_and_ranks_a_seeded_channel() {
        let channels = Arc::new(InMemoryChannelRepository::new());
        channels.seed(channel(1));

        let core = GatewayCore::new(
            channels as Arc<dyn ChannelRepository>,
            Arc::new(InMemoryPriceStore::new()),
            Arc::new(InMemorySettingsRepository::new()),
            Arc::new(InMemorySettingsCache::new()),
            RegistryConfig::default(),
            PerfConfig::default(),
        )
        .await
        .unwrap();

        let ranked = core.chooser.rank("gpt-4");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].snapshot.channel.id, 1);
    }
}
