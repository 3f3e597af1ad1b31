//! Per-(channel, model) pricing and its append-only version history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceValidationError {
    #[error("price must be non-negative")]
    Negative,
    #[error("price must be finite")]
    NotFinite,
    #[error("model_id must not be empty")]
    EmptyModelId,
    #[error("duplicate model_id in the same batch: {0}")]
    DuplicateModelId(String),
}

/// Per-token pricing for a single model, in the provider's native currency
/// units. Kept as two plain rates rather than a richer cost model since the
/// wire/billing format is an out-of-scope collaborator (SPEC_FULL.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Price {
    pub fn validate(&self) -> Result<(), PriceValidationError> {
        if !self.prompt_per_1k.is_finite() || !self.completion_per_1k.is_finite() {
            return Err(PriceValidationError::NotFinite);
        }
        if self.prompt_per_1k < 0.0 || self.completion_per_1k < 0.0 {
            return Err(PriceValidationError::Negative);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Active,
    Archived,
}

/// Current price for `(channel_id, model_id)`. Carries its own short
/// `reference_id` so external callers can cite a specific price row without
/// exposing the internal numeric id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelModelPrice {
    pub id: i64,
    pub channel_id: i64,
    pub model_id: String,
    pub price: Price,
    pub reference_id: String,
}

/// One entry in a price's temporal history. At most one `Active` version
/// exists per `channel_model_price_id` at any instant (invariant, SPEC_FULL
/// §3 and §8 property 5); the union of Active+Archived rows for a given
/// price id forms a contiguous, non-overlapping timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelModelPriceVersion {
    pub id: i64,
    pub channel_model_price_id: i64,
    pub price: Price,
    pub status: VersionStatus,
    pub effective_start_at: DateTime<Utc>,
    pub effective_end_at: Option<DateTime<Utc>>,
    pub reference_id: String,
}

/// One caller-supplied `(model_id, price)` pair for `save_channel_model_prices`.
#[derive(Debug, Clone)]
pub struct PriceInput {
    pub model_id: String,
    pub price: Price,
}

/// The action the versioner decided to take for one model, and the
/// resulting row(s). `Skip` still reports the unchanged row so callers get a
/// result entry for every input, per SPEC_FULL.md §6.
#[derive(Debug, Clone)]
pub enum PriceAction {
    Skip(ChannelModelPrice),
    Create(ChannelModelPrice),
    Update(ChannelModelPrice),
    Delete { model_id: String },
}
