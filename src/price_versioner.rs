//! Transactional per-model price saves with append-only version history
//! (C8).
//!
//! `save_channel_model_prices` takes the caller's `(model_id, price)` list
//! as the new desired state for the channel: anything missing from the list
//! that currently has a price is deleted, anything unchanged is skipped,
//! and everything else is created or updated. The diff is computed in the
//! caller's input order so repeated calls with the same input produce the
//! same action ordering.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

use crate::models::{
    ChannelModelPrice, ChannelModelPriceVersion, PriceAction, PriceInput, PriceValidationError,
    VersionStatus,
};
use crate::registry::ChannelRepository;

pub fn generate_reference_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn load(&self, channel_id: i64) -> anyhow::Result<HashMap<String, ChannelModelPrice>>;
    async fn save(&self, channel_id: i64, actions: &[PriceAction]) -> anyhow::Result<()>;
}

/// `RwLock`-guarded in-process store, mirroring `InMemoryChannelRepository`.
#[derive(Default)]
pub struct InMemoryPriceStore {
    prices: RwLock<HashMap<(i64, String), ChannelModelPrice>>,
    history: RwLock<HashMap<i64, Vec<ChannelModelPriceVersion>>>,
    next_version_id: AtomicI64,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_for(&self, channel_model_price_id: i64) -> Vec<ChannelModelPriceVersion> {
        self.history.read().unwrap().get(&channel_model_price_id).cloned().unwrap_or_default()
    }

    fn archive_active(&self, history: &mut HashMap<i64, Vec<ChannelModelPriceVersion>>, price_id: i64, now: chrono::DateTime<Utc>) {
        if let Some(versions) = history.get_mut(&price_id) {
            for v in versions.iter_mut().filter(|v| v.status == VersionStatus::Active) {
                v.status = VersionStatus::Archived;
                v.effective_end_at = Some(now);
            }
        }
    }

    fn push_active(&self, history: &mut HashMap<i64, Vec<ChannelModelPriceVersion>>, price: &ChannelModelPrice, now: chrono::DateTime<Utc>) {
        history.entry(price.id).or_default().push(ChannelModelPriceVersion {
            id: self.next_version_id.fetch_add(1, Ordering::SeqCst),
            channel_model_price_id: price.id,
            price: price.price,
            status: VersionStatus::Active,
            effective_start_at: now,
            effective_end_at: None,
            reference_id: generate_reference_id(),
        });
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn load(&self, channel_id: i64) -> anyhow::Result<HashMap<String, ChannelModelPrice>> {
        Ok(self
            .prices
            .read()
            .unwrap()
            .iter()
            .filter(|((cid, _), _)| *cid == channel_id)
            .map(|((_, model_id), price)| (model_id.clone(), price.clone()))
            .collect())
    }

    async fn save(&self, channel_id: i64, actions: &[PriceAction]) -> anyhow::Result<()> {
        let mut prices = self.prices.write().unwrap();
        let mut history = self.history.write().unwrap();
        let now = Utc::now();

        for action in actions {
            match action {
                PriceAction::Skip(_) => {}
                PriceAction::Create(price) => {
                    self.push_active(&mut history, price, now);
                    prices.insert((channel_id, price.model_id.clone()), price.clone());
                }
                PriceAction::Update(price) => {
                    self.archive_active(&mut history, price.id, now);
                    self.push_active(&mut history, price, now);
                    prices.insert((channel_id, price.model_id.clone()), price.clone());
                }
                PriceAction::Delete { model_id } => {
                    if let Some(existing) = prices.remove(&(channel_id, model_id.clone())) {
                        self.archive_active(&mut history, existing.id, now);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PriceVersionError {
    #[error(transparent)]
    Validation(#[from] PriceValidationError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct PriceVersioner {
    store: Arc<dyn PriceStore>,
    channels: Arc<dyn ChannelRepository>,
    next_price_id: AtomicI64,
}

impl PriceVersioner {
    pub fn new(store: Arc<dyn PriceStore>, channels: Arc<dyn ChannelRepository>) -> Self {
        Self { store, channels, next_price_id: AtomicI64::new(1) }
    }

    pub async fn save_channel_model_prices(
        &self,
        channel_id: i64,
        inputs: Vec<PriceInput>,
    ) -> Result<Vec<PriceAction>, PriceVersionError> {
        let mut batch_model_ids = HashSet::with_capacity(inputs.len());
        for input in &inputs {
            if input.model_id.trim().is_empty() {
                return Err(PriceValidationError::EmptyModelId.into());
            }
            input.price.validate()?;
            if !batch_model_ids.insert(input.model_id.clone()) {
                return Err(PriceValidationError::DuplicateModelId(input.model_id.clone()).into());
            }
        }

        let current = self.store.load(channel_id).await?;
        let mut seen = HashSet::with_capacity(inputs.len());
        let mut actions = Vec::with_capacity(inputs.len());

        for input in inputs {
            seen.insert(input.model_id.clone());
            match current.get(&input.model_id) {
                Some(existing) if existing.price == input.price => {
                    actions.push(PriceAction::Skip(existing.clone()));
                }
                Some(existing) => {
                    actions.push(PriceAction::Update(ChannelModelPrice {
                        price: input.price,
                        ..existing.clone()
                    }));
                }
                None => {
                    let id = self.next_price_id.fetch_add(1, Ordering::SeqCst);
                    actions.push(PriceAction::Create(ChannelModelPrice {
                        id,
                        channel_id,
                        model_id: input.model_id,
                        price: input.price,
                        reference_id: generate_reference_id(),
                    }));
                }
            }
        }

        for model_id in current.keys().filter(|m| !seen.contains(*m)) {
            actions.push(PriceAction::Delete { model_id: model_id.clone() });
        }

        self.store.save(channel_id, &actions).await?;
        self.channels.touch(channel_id).await?;
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, ChannelStatus, ChannelType, Credentials, Price};
    use crate::registry::InMemoryChannelRepository;
    use chrono::Utc;

    fn channel_repo() -> Arc<InMemoryChannelRepository> {
        let repo = Arc::new(InMemoryChannelRepository::new());
        repo.seed(Channel {
            id: 1,
            name: "test".into(),
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
        });
        repo
    }

    fn price(prompt: f64, completion: f64) -> Price {
        Price { prompt_per_1k: prompt, completion_per_1k: completion }
    }

    #[tokio::test]
    async fn first_save_creates_every_model() {
        let store = Arc::new(InMemoryPriceStore::new());
        let repo = channel_repo();
        let versioner = PriceVersioner::new(Arc::clone(&store) as Arc<dyn PriceStore>, Arc::clone(&repo) as Arc<dyn ChannelRepository>);

        let actions = versioner
            .save_channel_model_prices(1, vec![PriceInput { model_id: "gpt-4".into(), price: price(0.03, 0.06) }])
            .await
            .unwrap();

        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], PriceAction::Create(_)));
    }

    #[tokio::test]
    async fn unchanged_price_is_skipped() {
        let store = Arc::new(InMemoryPriceStore::new());
        let repo = channel_repo();
        let versioner = PriceVersioner::new(Arc::clone(&store) as Arc<dyn PriceStore>, Arc::clone(&repo) as Arc<dyn ChannelRepository>);

        let input = vec![PriceInput { model_id: "gpt-4".into(), price: price(0.03, 0.06) }];
        versioner.save_channel_model_prices(1, input.clone()).await.unwrap();
        let second = versioner.save_channel_model_prices(1, input).await.unwrap();

        assert!(matches!(second[0], PriceAction::Skip(_)));
    }

    #[tokio::test]
    async fn changed_price_updates_and_archives_the_old_version() {
        let store = Arc::new(InMemoryPriceStore::new());
        let repo = channel_repo();
        let versioner = PriceVersioner::new(Arc::clone(&store) as Arc<dyn PriceStore>, Arc::clone(&repo) as Arc<dyn ChannelRepository>);

        versioner
            .save_channel_model_prices(1, vec![PriceInput { model_id: "gpt-4".into(), price: price(0.03, 0.06) }])
            .await
            .unwrap();
        let second = versioner
            .save_channel_model_prices(1, vec![PriceInput { model_id: "gpt-4".into(), price: price(0.05, 0.10) }])
            .await
            .unwrap();

        let PriceAction::Update(updated) = &second[0] else { panic!("expected update") };
        let history = store.history_for(updated.id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, VersionStatus::Archived);
        assert_eq!(history[1].status, VersionStatus::Active);
    }

    #[tokio::test]
    async fn model_dropped_from_the_input_is_deleted() {
        let store = Arc::new(InMemoryPriceStore::new());
        let repo = channel_repo();
        let versioner = PriceVersioner::new(Arc::clone(&store) as Arc<dyn PriceStore>, Arc::clone(&repo) as Arc<dyn ChannelRepository>);

        versioner
            .save_channel_model_prices(1, vec![PriceInput { model_id: "gpt-4".into(), price: price(0.03, 0.06) }])
            .await
            .unwrap();
        let second = versioner.save_channel_model_prices(1, vec![]).await.unwrap();

        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], PriceAction::Delete { model_id } if model_id == "gpt-4"));
    }

    #[tokio::test]
    async fn duplicate_model_id_in_one_batch_is_rejected() {
        let store = Arc::new(InMemoryPriceStore::new());
        let repo = channel_repo();
        let versioner = PriceVersioner::new(Arc::clone(&store) as Arc<dyn PriceStore>, Arc::clone(&repo) as Arc<dyn ChannelRepository>);

        let err = versioner
            .save_channel_model_prices(
                1,
                vec![
                    PriceInput { model_id: "gpt-4".into(), price: price(0.03, 0.06) },
                    PriceInput { model_id: "gpt-4".into(), price: price(0.05, 0.10) },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PriceVersionError::Validation(PriceValidationError::DuplicateModelId(ref m)) if m == "gpt-4"));

        // Rejected before any load/mutation happened -- no rows were created.
        assert!(store.load(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn negative_price_is_rejected() {
        let store = Arc::new(InMemoryPriceStore::new());
        let repo = channel_repo();
        let versioner = PriceVersioner::new(Arc::clone(&store) as Arc<dyn PriceStore>, Arc::clone(&repo) as Arc<dyn ChannelRepository>);

        let err = versioner
            .save_channel_model_prices(1, vec![PriceInput { model_id: "gpt-4".into(), price: price(-1.0, 0.0) }])
            .await
            .unwrap_err();
        assert!(matches!(err, PriceVersionError::Validation(PriceValidationError::Negative)));
    }
}
