//! Channel persistence abstraction (§10).
//!
//! The registry depends on this trait, not on a driver, so reload logic is
//! exercised identically against the in-memory test double and the real
//! Postgres-backed implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Channel, ChannelStatus, Price};

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// `max(updated_at)` across every channel row, used as the registry's
    /// reload watermark. `None` when the table is empty.
    async fn max_updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// All channels with `status = enabled`, ordered by `ordering_weight`
    /// descending.
    async fn list_enabled_ordered(&self) -> anyhow::Result<Vec<Channel>>;

    async fn get(&self, id: i64) -> anyhow::Result<Option<Channel>>;

    /// Inserts or replaces a channel, bumping `updated_at`.
    async fn upsert(&self, channel: Channel) -> anyhow::Result<Channel>;

    async fn delete(&self, id: i64) -> anyhow::Result<()>;

    /// Bumps `updated_at` without otherwise changing the row. Used by
    /// mutators (price save, key disable) that change data the registry
    /// must reload but don't themselves call `upsert`.
    async fn touch(&self, id: i64) -> anyhow::Result<()>;

    /// Current `(model_id -> price)` map for the channel, as loaded from
    /// `channel_model_price`.
    async fn model_prices(&self, channel_id: i64) -> anyhow::Result<HashMap<String, Price>>;
}

/// `RwLock`-guarded in-process store: the default for tests, the bundled
/// CLI demo, and anywhere a live Postgres instance isn't available.
#[derive(Default)]
pub struct InMemoryChannelRepository {
    channels: RwLock<HashMap<i64, Channel>>,
    prices: RwLock<HashMap<i64, HashMap<String, Price>>>,
}

impl InMemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seed helper: insert a channel without going through `upsert`'s
    /// timestamp bump, so callers can control `updated_at` precisely.
    pub fn seed(&self, channel: Channel) {
        self.channels.write().unwrap().insert(channel.id, channel);
    }

    pub fn seed_prices(&self, channel_id: i64, prices: HashMap<String, Price>) {
        self.prices.write().unwrap().insert(channel_id, prices);
    }
}

#[async_trait]
impl ChannelRepository for InMemoryChannelRepository {
    async fn max_updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self
            .channels
            .read()
            .unwrap()
            .values()
            .map(|c| c.updated_at)
            .max())
    }

    async fn list_enabled_ordered(&self) -> anyhow::Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self
            .channels
            .read()
            .unwrap()
            .values()
            .filter(|c| c.status == ChannelStatus::Enabled)
            .cloned()
            .collect();
        channels.sort_by(|a, b| b.ordering_weight.cmp(&a.ordering_weight));
        Ok(channels)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Channel>> {
        Ok(self.channels.read().unwrap().get(&id).cloned())
    }

    async fn upsert(&self, mut channel: Channel) -> anyhow::Result<Channel> {
        channel.updated_at = Utc::now();
        self.channels
            .write()
            .unwrap()
            .insert(channel.id, channel.clone());
        Ok(channel)
    }

    async fn delete(&self, id: i64) -> anyhow::Result<()> {
        self.channels.write().unwrap().remove(&id);
        self.prices.write().unwrap().remove(&id);
        Ok(())
    }

    async fn touch(&self, id: i64) -> anyhow::Result<()> {
        if let Some(channel) = self.channels.write().unwrap().get_mut(&id) {
            channel.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn model_prices(&self, channel_id: i64) -> anyhow::Result<HashMap<String, Price>> {
        Ok(self
            .prices
            .read()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Postgres-backed implementation against the tables named in SPEC_FULL.md
/// §6. Connection lifecycle (pooling, timeouts) is the pool's job; this
/// type only holds one.
pub struct PgChannelRepository {
    pool: sqlx::PgPool,
}

impl PgChannelRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelRepository for PgChannelRepository {
    async fn max_updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<DateTime<Utc>>,)> =
            sqlx::query_as("SELECT max(updated_at) FROM channel")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(ts,)| ts))
    }

    async fn list_enabled_ordered(&self) -> anyhow::Result<Vec<Channel>> {
        // The real column mapping (credentials JSON, disabled-key JSON,
        // model mapping JSON) lives behind `FromRow`/serde, omitted here
        // since schema migration is an out-of-scope collaborator; this
        // method is the seam a migration-owning crate wires up.
        let rows: Vec<ChannelRow> = sqlx::query_as(
            "SELECT id, payload FROM channel WHERE status = 'enabled' ORDER BY ordering_weight DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| serde_json::from_str(&r.payload).map_err(anyhow::Error::from))
            .collect()
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Channel>> {
        let row: Option<ChannelRow> = sqlx::query_as("SELECT id, payload FROM channel WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(&r.payload).map_err(anyhow::Error::from))
            .transpose()
    }

    async fn upsert(&self, mut channel: Channel) -> anyhow::Result<Channel> {
        channel.updated_at = Utc::now();
        let payload = serde_json::to_string(&channel)?;
        sqlx::query(
            "INSERT INTO channel (id, name, status, ordering_weight, updated_at, payload)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
               name = EXCLUDED.name, status = EXCLUDED.status,
               ordering_weight = EXCLUDED.ordering_weight,
               updated_at = EXCLUDED.updated_at, payload = EXCLUDED.payload",
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.status.as_db_str())
        .bind(channel.ordering_weight)
        .bind(channel.updated_at)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(channel)
    }

    async fn delete(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM channel WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE channel SET updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn model_prices(&self, channel_id: i64) -> anyhow::Result<HashMap<String, Price>> {
        let rows: Vec<(String, f64, f64)> = sqlx::query_as(
            "SELECT model_id, prompt_per_1k, completion_per_1k FROM channel_model_price WHERE channel_id = $1",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(model_id, prompt_per_1k, completion_per_1k)| {
                (model_id, Price { prompt_per_1k, completion_per_1k })
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    #[allow(dead_code)]
    id: i64,
    payload: String,
}
