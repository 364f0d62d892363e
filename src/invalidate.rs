use crate::cache::SwrCache;
use crate::prelude::*;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;

/// Translates "this mutation affected X" into "these cached queries must be
/// refreshed".
///
/// Matching is by key prefix, never exact: invalidating `["posts"]` hits
/// `["posts", "recent"]`, `["posts", "byId", 42]` and every other view that
/// might contain the affected data, without the mutation author enumerating
/// exact keys. Marking is synchronous; the refetches it triggers for
/// subscribed entries are detached and best-effort, so the caller never
/// blocks on them.
#[fx_plus(child(SwrCache<S>, rc_strong), sync, rc, default(off))]
pub struct InvalidationEngine<S>
where
    S: QuerySource,
{
}

impl<S> InvalidationEngine<S>
where
    S: QuerySource,
{
    /// Marks every entry under any of the prefixes stale and schedules a
    /// refetch for those with subscribers. Returns how many entries matched.
    pub fn invalidate(&self, prefixes: &[QueryKey]) -> usize {
        if prefixes.is_empty() {
            return 0;
        }
        let hub = self.parent();
        tracing::debug!(
            "[{}] INVALIDATE({})",
            hub.label(),
            prefixes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let affected = hub
            .store()
            .mark_stale(|key| prefixes.iter().any(|prefix| key.starts_with(prefix)));
        let matched = affected.len();
        for (key, subscribers) in affected {
            if subscribers > 0 {
                hub.registry().spawn_refresh(key);
            }
        }
        matched
    }

    /// Invalidation-with-removal: drops every matching entry instead of
    /// marking it stale.
    pub fn remove(&self, prefixes: &[QueryKey]) -> usize {
        if prefixes.is_empty() {
            return 0;
        }
        self.parent()
            .store()
            .remove_matching(|key| prefixes.iter().any(|prefix| key.starts_with(prefix)))
    }
}
