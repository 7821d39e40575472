//! In-process store for development and tests. State does not survive a restart
//! and is not shared between replicas.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::{
    error::StoreError,
    identity::VisitorIdentity,
    ranking::RankingSnapshot,
    store::{CountStore, SnapshotStore, Toggled},
};

#[derive(Clone, Debug, Default)]
struct VoteRecord {
    upvoted: bool,
    last_request: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    counts: DashMap<String, u64>,
    voters: DashMap<(String, VisitorIdentity), VoteRecord>,
    throttles: DashMap<VisitorIdentity, Instant>,
    secret: Mutex<Option<String>>,
    snapshot: RwLock<Option<RankingSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CountStore for MemoryStore {
    async fn get(&self, slug: &str) -> Result<u64, StoreError> {
        Ok(self.counts.get(slug).map(|count| *count).unwrap_or(0))
    }

    async fn has_voted(&self, slug: &str, identity: &VisitorIdentity) -> Result<bool, StoreError> {
        let key = (slug.to_string(), identity.clone());

        Ok(self.voters.get(&key).is_some_and(|record| record.upvoted))
    }

    async fn toggle(
        &self,
        slug: &str,
        identity: &VisitorIdentity,
        request_id: Option<&str>,
    ) -> Result<Toggled, StoreError> {
        // The record guard is held while the counter moves. Locks are always taken
        // voters first, then counts.
        let mut record = self
            .voters
            .entry((slug.to_string(), identity.clone()))
            .or_default();

        if request_id.is_some() && record.last_request.as_deref() == request_id {
            let count = self.counts.get(slug).map(|count| *count).unwrap_or(0);

            return Ok(Toggled {
                count,
                upvoted: record.upvoted,
            });
        }

        record.upvoted = !record.upvoted;
        record.last_request = request_id.map(str::to_string);

        let mut count = self.counts.entry(slug.to_string()).or_insert(0);
        if record.upvoted {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }

        Ok(Toggled {
            count: *count,
            upvoted: record.upvoted,
        })
    }

    async fn counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        Ok(self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }

    async fn throttle(
        &self,
        identity: &VisitorIdentity,
        interval: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut allowed = true;

        self.throttles
            .entry(identity.clone())
            .and_modify(|last| {
                if now.duration_since(*last) < interval {
                    allowed = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);

        Ok(allowed)
    }

    async fn release_throttle(&self, identity: &VisitorIdentity) -> Result<(), StoreError> {
        self.throttles.remove(identity);

        Ok(())
    }

    async fn cookie_secret(&self, candidate: &str) -> Result<String, StoreError> {
        let mut secret = self.secret.lock();

        Ok(secret.get_or_insert_with(|| candidate.to_string()).clone())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError> {
        Ok(self.snapshot.read().clone())
    }

    async fn save_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError> {
        *self.snapshot.write() = Some(snapshot.clone());

        Ok(())
    }
}

/// Wraps a [`MemoryStore`] and fails every call while switched off.
#[cfg(test)]
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    down: std::sync::atomic::AtomicBool,
    toggles_down: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fails only `toggle`, the other calls keep working.
    pub fn set_toggles_down(&self, down: bool) {
        self.toggles_down.store(down, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(std::sync::atomic::Ordering::SeqCst) {
            Err(StoreError::Timeout)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CountStore for FlakyStore {
    async fn get(&self, slug: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.get(slug).await
    }

    async fn has_voted(&self, slug: &str, identity: &VisitorIdentity) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.has_voted(slug, identity).await
    }

    async fn toggle(
        &self,
        slug: &str,
        identity: &VisitorIdentity,
        request_id: Option<&str>,
    ) -> Result<Toggled, StoreError> {
        self.check()?;
        if self.toggles_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        self.inner.toggle(slug, identity, request_id).await
    }

    async fn counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.check()?;
        self.inner.counts().await
    }

    async fn throttle(
        &self,
        identity: &VisitorIdentity,
        interval: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.throttle(identity, interval).await
    }

    async fn release_throttle(&self, identity: &VisitorIdentity) -> Result<(), StoreError> {
        self.check()?;
        self.inner.release_throttle(identity).await
    }

    async fn cookie_secret(&self, candidate: &str) -> Result<String, StoreError> {
        self.check()?;
        self.inner.cookie_secret(candidate).await
    }
}

#[cfg(test)]
#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn load_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError> {
        self.check()?;
        self.inner.load_snapshot().await
    }

    async fn save_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_snapshot(snapshot).await
    }
}

#[cfg(test)]
pub fn identity(n: usize) -> VisitorIdentity {
    VisitorIdentity::for_test(&format!("visitor-{n}"))
}
