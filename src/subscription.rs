use crate::prelude::*;
use crate::store::EntityStore;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

/// Live consumer of a cached query.
///
/// Holding the handle keeps the entry's subscriber count up, which keeps it
/// out of eviction and makes it a refetch target for invalidations. Dropping
/// the handle unregisters the listener (if any) and, when it was the last
/// one, arms the entry's retention clock. Dropping does not cancel an
/// in-flight fetch: the result still lands in the store for whoever
/// subscribes next.
#[fx_plus(child(EntityStore<S>, rc_strong), sync, default(off))]
pub struct QuerySubscription<S>
where
    S: QuerySource,
{
    key: QueryKey,
    id: u64,
}

impl<S> QuerySubscription<S>
where
    S: QuerySource,
{
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn snapshot(&self) -> Option<EntrySnapshot<S>> {
        self.parent().get(&self.key)
    }

    pub fn value(&self) -> Option<CachedValue<S>> {
        self.snapshot().and_then(|s| s.value)
    }

    pub fn status(&self) -> QueryStatus {
        self.parent()
            .status_of(&self.key)
            .unwrap_or(QueryStatus::Idle)
    }

    pub fn error(&self) -> Option<Arc<S::Error>> {
        self.snapshot().and_then(|s| s.error)
    }
}

impl<S> Drop for QuerySubscription<S>
where
    S: QuerySource,
{
    fn drop(&mut self) {
        self.parent().release(&self.key, self.id);
    }
}

impl<S> Debug for QuerySubscription<S>
where
    S: QuerySource,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("QuerySubscription")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}
