//! # Popular Pages
//!
//! Precomputed top-N list over the page counters.
//!
//! ## Cron Job
//! - Every refresh interval we run through every counter in the store and rank them
//! - Count descending, ties broken by slug ascending so pages never swap places between runs
//! - Zero counts are dropped, a page that lost all its votes is not popular
//! - The new snapshot replaces the old one in a single write, readers never see a partial list
//! - A failed run keeps the previous snapshot and the next tick tries again
//!
//! ## Readers
//! Readers only ever load the stored snapshot. They never scan counters or kick off
//! a refresh, so read latency does not grow with the number of pages. Before the first
//! successful run readers get an empty list stamped with the unix epoch.
//!
//! Each process also remembers the last snapshot it saved or loaded. When the store
//! cannot be read, readers get that copy instead of the empty list.
use std::{cmp::Reverse, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::{
    error::StoreError,
    store::{CountStore, SnapshotStore},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPage {
    pub slug: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub generated_at: DateTime<Utc>,
    pub items: Vec<RankedPage>,
}

impl RankingSnapshot {
    pub fn stale() -> Self {
        Self {
            generated_at: DateTime::<Utc>::UNIX_EPOCH,
            items: Vec::new(),
        }
    }

    pub fn truncated(mut self, limit: usize) -> Self {
        self.items.truncate(limit);
        self
    }
}

pub fn rank(counts: Vec<(String, u64)>, limit: usize) -> Vec<RankedPage> {
    let mut pages: Vec<RankedPage> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(slug, count)| RankedPage { slug, count })
        .collect();

    pages.sort_unstable_by(|a, b| {
        (Reverse(a.count), &a.slug).cmp(&(Reverse(b.count), &b.slug))
    });
    pages.truncate(limit);

    pages
}

pub struct RankingCache {
    counts: Arc<dyn CountStore>,
    snapshots: Arc<dyn SnapshotStore>,
    max_limit: usize,
    last_good: RwLock<Option<RankingSnapshot>>,
}

impl RankingCache {
    pub fn new(
        counts: Arc<dyn CountStore>,
        snapshots: Arc<dyn SnapshotStore>,
        max_limit: usize,
    ) -> Self {
        Self {
            counts,
            snapshots,
            max_limit,
            last_good: RwLock::new(None),
        }
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Safe to run concurrently, the last writer wins.
    pub async fn refresh(&self) -> Result<RankingSnapshot, StoreError> {
        let counts = self.counts.counts().await?;
        let pages = counts.len();

        let snapshot = RankingSnapshot {
            generated_at: Utc::now(),
            items: rank(counts, self.max_limit),
        };

        self.snapshots.save_snapshot(&snapshot).await?;
        self.remember(&snapshot);

        info!(
            "Ranked {} of {pages} pages at {}",
            snapshot.items.len(),
            snapshot.generated_at
        );

        Ok(snapshot)
    }

    pub async fn refresh_or_keep(&self) {
        if let Err(e) = self.refresh().await {
            warn!("Ranking refresh failed, keeping previous snapshot: {e}");
        }
    }

    pub async fn ranking(&self, limit: usize) -> RankingSnapshot {
        let snapshot = match self.snapshots.load_snapshot().await {
            Ok(Some(snapshot)) => {
                self.remember(&snapshot);
                snapshot
            }
            Ok(None) => self.last_good(),
            Err(e) => {
                warn!("Failed to load ranking snapshot, serving last good copy: {e}");
                self.last_good()
            }
        };

        snapshot.truncated(limit.min(self.max_limit))
    }

    fn remember(&self, snapshot: &RankingSnapshot) {
        let mut last = self.last_good.write();
        // Never step back to an older list than one already served.
        if last
            .as_ref()
            .is_none_or(|kept| kept.generated_at <= snapshot.generated_at)
        {
            *last = Some(snapshot.clone());
        }
    }

    fn last_good(&self) -> RankingSnapshot {
        self.last_good
            .read()
            .clone()
            .unwrap_or_else(RankingSnapshot::stale)
    }

    pub fn spawn_refresher(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                self.refresh_or_keep().await;
            }
        })
    }
}
