use crate::cache::SwrCache;
use crate::prelude::*;
use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

type OptimisticTransform<S> = Arc<dyn Fn(&CachedValue<S>) -> CachedValue<S> + Send + Sync>;

/// Declarative description of one mutation's cache footprint: which entries
/// to edit speculatively and which prefixes to invalidate once the server
/// confirms.
///
/// Transforms must be pure: they are handed the entry's current value and
/// return the value to show while the mutation is in flight. Entries that
/// hold no value are skipped, not snapshotted, and not rolled back.
pub struct MutationPlan<S>
where
    S: QuerySource,
{
    edits: Vec<(QueryKey, OptimisticTransform<S>)>,
    invalidate: Vec<QueryKey>,
}

impl<S> MutationPlan<S>
where
    S: QuerySource,
{
    pub fn new() -> Self {
        Self {
            edits: Vec::new(),
            invalidate: Vec::new(),
        }
    }

    /// Adds an optimistic edit of the entry at `key`.
    pub fn edit(
        mut self,
        key: QueryKey,
        transform: impl Fn(&CachedValue<S>) -> CachedValue<S> + Send + Sync + 'static,
    ) -> Self {
        self.edits.push((key, Arc::new(transform)));
        self
    }

    /// Declares a prefix to invalidate after the mutation succeeds.
    pub fn invalidate(mut self, prefix: QueryKey) -> Self {
        self.invalidate.push(prefix);
        self
    }

    pub(crate) fn edits(&self) -> &[(QueryKey, OptimisticTransform<S>)] {
        &self.edits
    }

    pub(crate) fn invalidate_prefixes(&self) -> &[QueryKey] {
        &self.invalidate
    }
}

impl<S> Default for MutationPlan<S>
where
    S: QuerySource,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Debug for MutationPlan<S>
where
    S: QuerySource,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("MutationPlan")
            .field(
                "edits",
                &self.edits.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .field("invalidate", &self.invalidate)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    /// Optimistic edits are visible in the store.
    Applied,
    /// The mutation call itself is running.
    InFlight,
    SettledOk,
    SettledErr,
}

/// Runs mutations with optimistic cache edits and rollback.
#[fx_plus(child(SwrCache<S>, rc_strong), parent, sync, rc, default(off))]
pub struct MutationCoordinator<S>
where
    S: QuerySource,
{
}

impl<S> MutationCoordinator<S>
where
    S: QuerySource,
{
    /// Prepares a single-shot [`Mutation`] from a plan. Nothing touches the
    /// cache until [`Mutation::run`] is called.
    pub fn start(&self, plan: MutationPlan<S>) -> Mutation<S> {
        child_build!(self, Mutation<S> { plan: plan }).unwrap()
    }

    pub async fn run<R, Fut>(
        &self,
        plan: MutationPlan<S>,
        op: Fut,
    ) -> Result<R, CacheError<S::Error>>
    where
        Fut: Future<Output = Result<R, S::Error>>,
    {
        self.start(plan).run(op).await
    }
}

/// One mutation instance.
///
/// The lifecycle is `Pending -> Applied -> InFlight -> SettledOk/SettledErr`.
/// On success the snapshot is discarded and the plan's prefixes are
/// invalidated, so the optimistic value acts as a placeholder until the
/// authoritative refetch lands. On failure every snapshotted entry is
/// restored to the value captured right before this mutation's edit, and only
/// then is the error surfaced.
///
/// When two mutations editing the same key overlap, each restores its own
/// snapshot: the later rollback may resurrect the earlier mutation's
/// optimistic value rather than server truth. Callers who cannot tolerate
/// that should serialize mutations per key.
#[fx_plus(child(MutationCoordinator<S>, rc_strong), sync, default(off))]
pub struct Mutation<S>
where
    S: QuerySource,
{
    plan: MutationPlan<S>,

    #[fieldx(lock, get(copy), set(private), default(MutationState::Pending), builder(off))]
    state: MutationState,
}

impl<S> Mutation<S>
where
    S: QuerySource,
{
    /// Applies the plan's optimistic edits, awaits `op`, and settles. Single
    /// use; running a settled mutation again would re-apply its edits.
    pub async fn run<R, Fut>(&self, op: Fut) -> Result<R, CacheError<S::Error>>
    where
        Fut: Future<Output = Result<R, S::Error>>,
    {
        let hub = self.parent().parent();
        let store = hub.store();

        let mut snapshot: Vec<(QueryKey, CachedValue<S>)> = Vec::new();
        for (key, transform) in self.plan.edits() {
            if let Some(previous) = store.apply_transform(key, transform.as_ref()) {
                snapshot.push((key.clone(), previous));
            }
        }
        self.set_state(MutationState::Applied);
        tracing::debug!(
            "[{}] MUTATE: {} optimistic edit(s) applied",
            hub.label(),
            snapshot.len()
        );

        self.set_state(MutationState::InFlight);
        match op.await {
            Ok(result) => {
                self.set_state(MutationState::SettledOk);
                drop(snapshot);
                hub.invalidation().invalidate(self.plan.invalidate_prefixes());
                Ok(result)
            }
            Err(cause) => {
                for (key, value) in snapshot.into_iter().rev() {
                    store.restore(&key, value);
                }
                self.set_state(MutationState::SettledErr);
                tracing::debug!("[{}] MUTATE failed, rolled back: {cause}", hub.label());
                Err(CacheError::Mutation { cause })
            }
        }
    }
}

impl<S> Debug for Mutation<S>
where
    S: QuerySource,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Mutation")
            .field("plan", &self.plan)
            .field("state", &self.state())
            .finish()
    }
}
