//! Typed, cached key-value store for the gateway's global policies (C10):
//! retry/load-balancer config, auto-disable thresholds, circuit breaker
//! tuning, and per-channel probe schedules.
//!
//! Reads go through a small cache in front of the repository; writes
//! invalidate rather than update the cache in place, so a write is never
//! racing a concurrent reader over what "current" means -- the next read
//! just goes back to the repository.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::models::{AutoDisableChannelPolicy, ChannelProbeSetting, CircuitBreakerPolicy, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    RetryPolicy,
    AutoDisableChannelPolicy,
    CircuitBreakerPolicy,
    ChannelProbe(i64),
}

impl SettingsKey {
    fn as_str(&self) -> String {
        match self {
            SettingsKey::RetryPolicy => "retry_policy".to_string(),
            SettingsKey::AutoDisableChannelPolicy => "auto_disable_channel_policy".to_string(),
            SettingsKey::CircuitBreakerPolicy => "circuit_breaker_policy".to_string(),
            SettingsKey::ChannelProbe(channel_id) => format!("channel_probe:{channel_id}"),
        }
    }
}

pub trait SettingsCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn invalidate(&self, key: &str);
}

/// Disables caching entirely; every read goes straight to the repository.
/// Useful for tests that want to observe repository state directly.
pub struct NoopSettingsCache;

impl SettingsCache for NoopSettingsCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }
    fn set(&self, _key: &str, _value: String) {}
    fn invalidate(&self, _key: &str) {}
}

#[derive(Default)]
pub struct InMemorySettingsCache {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySettingsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsCache for InMemorySettingsCache {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().unwrap().get(key).cloned()
    }
    fn set(&self, key: &str, value: String) {
        self.values.write().unwrap().insert(key.to_string(), value);
    }
    fn invalidate(&self, key: &str) {
        self.values.write().unwrap().remove(key);
    }
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn put_raw(&self, key: &str, value: String) -> anyhow::Result<()>;
    /// All currently-stored keys, for `initialize_defaults`'s membership check.
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Default)]
pub struct InMemorySettingsRepository {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsRepository for InMemorySettingsRepository {
    async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }
    async fn put_raw(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.values.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }
    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.values.read().unwrap().keys().cloned().collect())
    }
}

pub struct SystemSettings {
    repo: Arc<dyn SettingsRepository>,
    cache: Arc<dyn SettingsCache>,
}

impl SystemSettings {
    pub fn new(repo: Arc<dyn SettingsRepository>, cache: Arc<dyn SettingsCache>) -> Self {
        Self { repo, cache }
    }

    pub async fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        self.get_or_default(SettingsKey::RetryPolicy, RetryPolicy::default()).await
    }

    pub async fn set_retry_policy(&self, policy: &RetryPolicy) -> anyhow::Result<()> {
        self.put(SettingsKey::RetryPolicy, policy).await
    }

    pub async fn auto_disable_channel_policy(&self) -> anyhow::Result<AutoDisableChannelPolicy> {
        self.get_or_default(SettingsKey::AutoDisableChannelPolicy, AutoDisableChannelPolicy::default()).await
    }

    pub async fn set_auto_disable_channel_policy(&self, policy: &AutoDisableChannelPolicy) -> anyhow::Result<()> {
        self.put(SettingsKey::AutoDisableChannelPolicy, policy).await
    }

    pub async fn circuit_breaker_policy(&self) -> anyhow::Result<CircuitBreakerPolicy> {
        self.get_or_default(SettingsKey::CircuitBreakerPolicy, CircuitBreakerPolicy::default()).await
    }

    pub async fn set_circuit_breaker_policy(&self, policy: &CircuitBreakerPolicy) -> anyhow::Result<()> {
        policy.validate().map_err(|err| anyhow::anyhow!(err))?;
        self.put(SettingsKey::CircuitBreakerPolicy, policy).await
    }

    pub async fn channel_probe_setting(&self, channel_id: i64) -> anyhow::Result<ChannelProbeSetting> {
        self.get_or_default(SettingsKey::ChannelProbe(channel_id), ChannelProbeSetting::default()).await
    }

    pub async fn set_channel_probe_setting(&self, channel_id: i64, setting: &ChannelProbeSetting) -> anyhow::Result<()> {
        self.put(SettingsKey::ChannelProbe(channel_id), setting).await
    }

    /// Writes the global defaults for any well-known key that isn't present
    /// yet, so a fresh deployment starts from documented values rather than
    /// from whatever each getter's in-process default happens to be. Not
    /// transactional against the backing store in the ACID sense (the
    /// in-memory/Postgres repositories here do one `put_raw` per key), but
    /// each key's write is independent and idempotent, so a partial failure
    /// only leaves the remaining defaults to be filled in on the next call.
    pub async fn initialize_defaults(&self) -> anyhow::Result<()> {
        let existing: std::collections::HashSet<String> = self.repo.keys().await?.into_iter().collect();

        if !existing.contains(&SettingsKey::RetryPolicy.as_str()) {
            self.set_retry_policy(&RetryPolicy::default()).await?;
        }
        if !existing.contains(&SettingsKey::AutoDisableChannelPolicy.as_str()) {
            self.set_auto_disable_channel_policy(&AutoDisableChannelPolicy::default()).await?;
        }
        if !existing.contains(&SettingsKey::CircuitBreakerPolicy.as_str()) {
            self.set_circuit_breaker_policy(&CircuitBreakerPolicy::default()).await?;
        }
        info!("system settings defaults initialized");
        Ok(())
    }

    async fn get_or_default<T>(&self, key: SettingsKey, default: T) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Serialize,
    {
        let key = key.as_str();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(serde_json::from_str(&cached)?);
        }
        match self.repo.get_raw(&key).await? {
            Some(raw) => {
                self.cache.set(&key, raw.clone());
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(default),
        }
    }

    async fn put<T>(&self, key: SettingsKey, value: &T) -> anyhow::Result<()>
    where
        T: Serialize,
    {
        let key = key.as_str();
        let raw = serde_json::to_string(value)?;
        self.repo.put_raw(&key, raw).await?;
        self.cache.invalidate(&key);
        Ok(())
    }
}
