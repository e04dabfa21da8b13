//! Per-key build coalescing
//!
//! The first caller for a key registers a shared future; everyone else who
//! asks for that key while it is registered awaits the same future and gets
//! the same outcome.

use crate::builder::ArchiveResult;
use crate::cache::CacheKey;
use crate::error::DocpackResult;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) type SharedBuild = Shared<BoxFuture<'static, DocpackResult<ArchiveResult>>>;

/// Whether the caller started the build or joined one already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Leader,
    Follower,
}

#[derive(Clone, Default)]
pub(crate) struct InflightBuilds {
    slots: Arc<Mutex<HashMap<CacheKey, SharedBuild>>>,
}

impl InflightBuilds {
    /// Join the build for `key`, or register the one `start` creates
    ///
    /// The lock is held only while looking up and inserting.
    pub fn join_or_start(
        &self,
        key: &CacheKey,
        start: impl FnOnce() -> SharedBuild,
    ) -> (SharedBuild, Slot) {
        let mut slots = self.lock();
        if let Some(existing) = slots.get(key) {
            return (existing.clone(), Slot::Follower);
        }

        let build = start();
        slots.insert(key.clone(), build.clone());
        (build, Slot::Leader)
    }

    /// Release the slot so later callers go back to the cache
    pub fn release(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedBuild>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveConfig;
    use crate::error::DocpackError;
    use futures_util::FutureExt;

    fn key() -> CacheKey {
        CacheKey::compute(&ArchiveConfig::default(), [("a", "b")])
    }

    fn failing_build() -> SharedBuild {
        async { Err::<ArchiveResult, _>(DocpackError::Cancelled) }
            .boxed()
            .shared()
    }

    #[tokio::test]
    async fn second_caller_joins_first() {
        let inflight = InflightBuilds::default();
        let mut starts = 0;

        let (first, slot_a) = inflight.join_or_start(&key(), || {
            starts += 1;
            failing_build()
        });
        let (second, slot_b) = inflight.join_or_start(&key(), || {
            starts += 1;
            failing_build()
        });

        assert_eq!((slot_a, slot_b), (Slot::Leader, Slot::Follower));
        assert_eq!(starts, 1);
        assert!(matches!(first.await, Err(DocpackError::Cancelled)));
        assert!(matches!(second.await, Err(DocpackError::Cancelled)));
    }

    #[tokio::test]
    async fn release_allows_new_leader() {
        let inflight = InflightBuilds::default();
        inflight.join_or_start(&key(), failing_build);
        assert_eq!(inflight.len(), 1);

        inflight.release(&key());
        assert_eq!(inflight.len(), 0);

        let (_, slot) = inflight.join_or_start(&key(), failing_build);
        assert_eq!(slot, Slot::Leader);
    }
}
