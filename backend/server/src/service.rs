use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::AppError,
    identity::VisitorIdentity,
    store::{CountStore, Toggled},
    utils::PageSlug,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpvoteResponse {
    pub slug: String,
    pub upvote_count: u64,
    pub upvoted: bool,
}

impl UpvoteResponse {
    fn new(slug: &PageSlug, toggled: Toggled) -> Self {
        Self {
            slug: slug.to_string(),
            upvote_count: toggled.count,
            upvoted: toggled.upvoted,
        }
    }
}

pub struct UpvoteService {
    store: Arc<dyn CountStore>,
    min_interval: Duration,
}

impl UpvoteService {
    pub fn new(store: Arc<dyn CountStore>, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
        }
    }

    /// Never fails. When the store is unreachable the page reads as zero, not voted.
    pub async fn info(&self, slug: &PageSlug, identity: &VisitorIdentity) -> UpvoteResponse {
        let (count, upvoted) = tokio::join!(
            self.store.get(slug.as_str()),
            self.store.has_voted(slug.as_str(), identity)
        );

        let count = count.unwrap_or_else(|e| {
            warn!("Reading count for {slug} failed, serving 0: {e}");
            0
        });
        let upvoted = upvoted.unwrap_or_else(|e| {
            warn!("Reading vote for {slug} failed, serving not voted: {e}");
            false
        });

        UpvoteResponse::new(slug, Toggled { count, upvoted })
    }

    /// The throttle slot is taken before the toggle runs. A toggle that fails
    /// gives the slot back, so the client's retry is not answered with 429.
    pub async fn toggle(
        &self,
        slug: &PageSlug,
        identity: &VisitorIdentity,
        request_id: Option<&str>,
    ) -> Result<UpvoteResponse, AppError> {
        let throttled = !self.min_interval.is_zero();
        if throttled && !self.store.throttle(identity, self.min_interval).await? {
            debug!("Throttled {} on {slug}", identity.as_str());
            return Err(AppError::RateLimited);
        }

        let toggled = match self.store.toggle(slug.as_str(), identity, request_id).await {
            Ok(toggled) => toggled,
            Err(e) => {
                if throttled {
                    self.release_throttle(identity).await;
                }
                return Err(e.into());
            }
        };

        Ok(UpvoteResponse::new(slug, toggled))
    }

    async fn release_throttle(&self, identity: &VisitorIdentity) {
        if let Err(e) = self.store.release_throttle(identity).await {
            warn!("Releasing throttle for {} failed: {e}", identity.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlakyStore, MemoryStore, identity};

    fn slug(raw: &str) -> PageSlug {
        PageSlug::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_slug_info() {
        let service = UpvoteService::new(Arc::new(MemoryStore::new()), Duration::ZERO);

        let info = service.info(&slug("/never-seen"), &identity(1)).await;

        assert_eq!(info.upvote_count, 0);
        assert!(!info.upvoted);
    }

    #[tokio::test]
    async fn test_toggle_twice() {
        let service = UpvoteService::new(Arc::new(MemoryStore::new()), Duration::ZERO);
        let page = slug("/posts/a/");
        let visitor = identity(1);

        service.toggle(&page, &identity(2), None).await.unwrap();
        let before = service.info(&page, &visitor).await.upvote_count;

        let on = service.toggle(&page, &visitor, None).await.unwrap();
        assert!(on.upvoted);
        assert_eq!(on.upvote_count, before + 1);

        let off = service.toggle(&page, &visitor, None).await.unwrap();
        assert!(!off.upvoted);
        assert_eq!(off.upvote_count, before);

        let info = service.info(&page, &visitor).await;
        assert_eq!((info.upvote_count, info.upvoted), (before, false));
    }

    #[tokio::test]
    async fn test_identities_add_up() {
        let service = UpvoteService::new(Arc::new(MemoryStore::new()), Duration::ZERO);
        let page = slug("/posts/a/");

        for n in 0..10 {
            service.toggle(&page, &identity(n), None).await.unwrap();
        }

        assert_eq!(service.info(&page, &identity(0)).await.upvote_count, 10);
    }

    #[tokio::test]
    async fn test_info_fails_open() {
        let store = Arc::new(FlakyStore::default());
        let service = UpvoteService::new(store.clone(), Duration::ZERO);
        let page = slug("/posts/a/");
        let visitor = identity(1);

        service.toggle(&page, &visitor, None).await.unwrap();
        store.set_down(true);

        let info = service.info(&page, &visitor).await;
        assert_eq!((info.upvote_count, info.upvoted), (0, false));
    }

    #[tokio::test]
    async fn test_toggle_surfaces_transient() {
        let store = Arc::new(FlakyStore::default());
        let service = UpvoteService::new(store.clone(), Duration::ZERO);
        store.set_down(true);

        let result = service.toggle(&slug("/posts/a/"), &identity(1), None).await;

        assert!(matches!(result, Err(AppError::Transient(_))));
    }

    #[tokio::test]
    async fn test_min_interval() {
        let service = UpvoteService::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let page = slug("/posts/a/");

        service.toggle(&page, &identity(1), None).await.unwrap();

        let again = service.toggle(&page, &identity(1), None).await;
        assert!(matches!(again, Err(AppError::RateLimited)));
        assert!(service.info(&page, &identity(1)).await.upvoted);

        service.toggle(&page, &identity(2), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_toggle_releases_throttle() {
        let store = Arc::new(FlakyStore::default());
        let service = UpvoteService::new(store.clone(), Duration::from_secs(60));
        let page = slug("/posts/a/");
        let visitor = identity(1);

        store.set_toggles_down(true);
        let failed = service.toggle(&page, &visitor, Some("r-1")).await;
        assert!(matches!(failed, Err(AppError::Transient(_))));

        store.set_toggles_down(false);
        let retry = service.toggle(&page, &visitor, Some("r-1")).await.unwrap();
        assert!(retry.upvoted);
        assert_eq!(retry.upvote_count, 1);

        let again = service.toggle(&page, &visitor, Some("r-2")).await;
        assert!(matches!(again, Err(AppError::RateLimited)));
    }
}
