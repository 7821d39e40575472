//! # Count Store
//!
//! Durable page counters and per-visitor vote records.
//!
//! | Implementation | Use |
//! |---|---|
//! | [`RedisStore`](crate::database::RedisStore) | production, shared by every replica |
//! | [`MemoryStore`](crate::memory::MemoryStore) | local development and tests |
//!
//! Invariant kept by every implementation: a page's count equals the number of
//! identities whose record for that page is currently voted. Toggled-off
//! records stay around with the flag cleared.
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{error::StoreError, identity::VisitorIdentity, ranking::RankingSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Toggled {
    pub count: u64,
    pub upvoted: bool,
}

#[async_trait]
pub trait CountStore: Send + Sync {
    /// Zero for pages nobody voted on.
    async fn get(&self, slug: &str) -> Result<u64, StoreError>;

    async fn has_voted(&self, slug: &str, identity: &VisitorIdentity) -> Result<bool, StoreError>;

    /// Atomically flips the visitor's vote and moves the counter with it.
    ///
    /// When `request_id` matches the last request applied to the same
    /// (slug, identity) pair nothing changes and the current state is returned.
    async fn toggle(
        &self,
        slug: &str,
        identity: &VisitorIdentity,
        request_id: Option<&str>,
    ) -> Result<Toggled, StoreError>;

    /// Every counter, in no particular order. Only the ranking refresh scans.
    async fn counts(&self) -> Result<Vec<(String, u64)>, StoreError>;

    /// Returns `false` when `identity` already passed within `interval`.
    async fn throttle(
        &self,
        identity: &VisitorIdentity,
        interval: Duration,
    ) -> Result<bool, StoreError>;

    /// Gives back a slot taken by [`CountStore::throttle`] so the next call passes.
    async fn release_throttle(&self, identity: &VisitorIdentity) -> Result<(), StoreError>;

    /// Persists `candidate` unless a secret is already stored, then returns the stored one.
    async fn cookie_secret(&self, candidate: &str) -> Result<String, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError>;

    /// Replaces the stored snapshot wholesale.
    async fn save_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError>;
}
