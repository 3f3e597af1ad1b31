//! Layered runtime configuration (§12): defaults, then `config/*.toml`, then
//! `GATEWAY_CORE__*` environment variables, the last always winning. `.env`
//! is loaded once at process start via `dotenv` so local development doesn't
//! need real exported variables.

use std::time::Duration;

use serde::Deserialize;

use crate::perf::PerfConfig;
use crate::registry::RegistryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfigToml {
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    #[serde(default = "default_async_reload_timeout_secs")]
    pub async_reload_timeout_secs: u64,
}

fn default_reload_interval_secs() -> u64 {
    60
}

fn default_async_reload_timeout_secs() -> u64 {
    10
}

impl Default for RegistryConfigToml {
    fn default() -> Self {
        Self {
            reload_interval_secs: default_reload_interval_secs(),
            async_reload_timeout_secs: default_async_reload_timeout_secs(),
        }
    }
}

impl From<RegistryConfigToml> for RegistryConfig {
    fn from(value: RegistryConfigToml) -> Self {
        Self {
            reload_interval: Duration::from_secs(value.reload_interval_secs),
            async_reload_timeout: Duration::from_secs(value.async_reload_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerfConfigToml {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_window_secs() -> i64 {
    600
}

impl Default for PerfConfigToml {
    fn default() -> Self {
        Self { buffer_capacity: default_buffer_capacity(), window_secs: default_window_secs() }
    }
}

impl From<PerfConfigToml> for PerfConfig {
    fn from(value: PerfConfigToml) -> Self {
        Self { buffer_capacity: value.buffer_capacity, window_secs: value.window_secs }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub registry: RegistryConfigToml,
    #[serde(default)]
    pub perf: PerfConfigToml,
}

impl AppConfig {
    /// Loads, in ascending precedence: compiled-in defaults, `config/default.toml`,
    /// `config/local.toml` (git-ignored, developer-local overrides), then
    /// `GATEWAY_CORE` environment variables (`GATEWAY_CORE__DATABASE__URL`, ...).
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("GATEWAY_CORE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_config_toml_converts_seconds_to_durations() {
        let toml = RegistryConfigToml { reload_interval_secs: 30, async_reload_timeout_secs: 5 };
        let config: RegistryConfig = toml.into();
        assert_eq!(config.reload_interval, Duration::from_secs(30));
        assert_eq!(config.async_reload_timeout, Duration::from_secs(5));
    }

    #[test]
    fn defaults_are_sane() {
        let perf: PerfConfig = PerfConfigToml::default().into();
        assert_eq!(perf.buffer_capacity, 1024);
        assert_eq!(perf.window_secs, 600);
    }
}
