use crate::prelude::*;
use crate::store::EntityStore;
use fieldx_plus::fx_plus;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// Mutable state of one cached query. All mutations go through the store so
// that listener notification stays in one place; this type only guards the
// fields. The two durations are fixed at creation from the policy that first
// produced the entry.
#[fx_plus(child(EntityStore<S>, rc_strong), sync, rc, default(off))]
pub(crate) struct EntryState<S>
where
    S: QuerySource,
{
    key: QueryKey,

    #[fieldx(get(copy))]
    stale_after: Duration,

    #[fieldx(get(copy))]
    retain_for: Duration,

    #[fieldx(lock, clearer, predicate, get(clone), set, builder(off))]
    value: CachedValue<S>,

    #[fieldx(lock, get(copy), set, default(QueryStatus::Idle), builder(off))]
    status: QueryStatus,

    #[fieldx(lock, optional, clearer, get(copy), set, builder(off))]
    fetched_at: Instant,

    #[fieldx(lock, get(copy), get_mut, default(0), builder(off))]
    subscribers: u32,

    // Eviction deadline; armed only while the entry has no subscribers.
    #[fieldx(lock, optional, clearer, get(copy), set, builder(off))]
    retain_until: Instant,

    #[fieldx(lock, optional, clearer, get(clone), set, builder(off))]
    last_error: Arc<S::Error>,
}

impl<S> EntryState<S>
where
    S: QuerySource,
{
    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }

    // Fresh means: successfully fetched and not yet past its staleness
    // window. Everything else (never fetched, marked stale, errored) is a
    // candidate for refetch.
    pub(crate) fn is_fresh(&self) -> bool {
        self.status() == QueryStatus::Success
            && self.fetched_at().is_some_and(|at| at.elapsed() < self.stale_after())
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot<S> {
        EntrySnapshot {
            key: self.key.clone(),
            value: self.value(),
            status: self.status(),
            fetched_at: self.fetched_at(),
            error: self.last_error(),
            subscribers: self.subscribers(),
        }
    }
}

impl<S> Debug for EntryState<S>
where
    S: QuerySource,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EntryState")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("subscribers", &self.subscribers())
            .finish()
    }
}

/// Point-in-time copy of a cache entry, as handed to readers.
pub struct EntrySnapshot<S>
where
    S: QuerySource,
{
    pub key: QueryKey,
    pub value: Option<CachedValue<S>>,
    pub status: QueryStatus,
    pub fetched_at: Option<Instant>,
    pub error: Option<Arc<S::Error>>,
    pub subscribers: u32,
}

impl<S> Clone for EntrySnapshot<S>
where
    S: QuerySource,
{
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            status: self.status,
            fetched_at: self.fetched_at,
            error: self.error.clone(),
            subscribers: self.subscribers,
        }
    }
}

impl<S> Debug for EntrySnapshot<S>
where
    S: QuerySource,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EntrySnapshot")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("subscribers", &self.subscribers)
            .finish()
    }
}
