use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::{
    config::{Config, StoreKind},
    database::RedisStore,
    identity::{IdentityIssuer, generate_secret},
    memory::MemoryStore,
    ranking::RankingCache,
    service::UpvoteService,
    store::{CountStore, SnapshotStore},
};

pub struct AppState {
    pub config: Config,
    pub identity: IdentityIssuer,
    pub upvotes: UpvoteService,
    pub ranking: Arc<RankingCache>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        match config.store {
            StoreKind::Redis => {
                info!("Connecting to Redis...");
                let store = RedisStore::connect(&config.redis_url, config.store_timeout)
                    .await
                    .context("connecting to Redis")?;

                Self::with_store(config, Arc::new(store)).await
            }
            StoreKind::Memory => {
                warn!("Using in-memory store, votes are lost on restart");
                Self::with_store(config, Arc::new(MemoryStore::new())).await
            }
        }
    }

    pub async fn with_store<S>(config: Config, store: Arc<S>) -> Result<Arc<Self>>
    where
        S: CountStore + SnapshotStore + 'static,
    {
        let secret = match &config.cookie_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("No cookie secret configured, using the one persisted in the store");
                store
                    .cookie_secret(&generate_secret())
                    .await
                    .context("resolving cookie secret")?
            }
        };

        Ok(Self::assemble(config, store, &secret))
    }

    pub fn assemble<S>(config: Config, store: Arc<S>, secret: &str) -> Arc<Self>
    where
        S: CountStore + SnapshotStore + 'static,
    {
        let counts: Arc<dyn CountStore> = store.clone();
        let snapshots: Arc<dyn SnapshotStore> = store;

        Arc::new(Self {
            identity: IdentityIssuer::from_config(&config, secret),
            upvotes: UpvoteService::new(counts.clone(), config.min_interval),
            ranking: Arc::new(RankingCache::new(
                counts,
                snapshots,
                config.popular_max_limit,
            )),
            config,
        })
    }
}
