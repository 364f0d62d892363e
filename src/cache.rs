use crate::prelude::*;
use crate::store::EntityStore;
use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use std::future::Future;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

/// The cache hub: one instance per application (or per test), wiring the
/// entity store, query registry, invalidation engine, mutation coordinator
/// and cursor manager around a single [`QuerySource`].
///
/// ```ignore
/// let source = AppBackend::connect(config).await?;
/// let cache = SwrCache::builder()
///     .name("social")
///     .source(source)
///     .build()?;
///
/// cache.register(query_key!["posts"], QueryPolicy::default());
///
/// let recent = cache.query(query_key!["posts", "recent"]).await?;
/// if let Some(CachedValue::Single(posts)) = recent.value() {
///     render(posts);
/// }
/// ```
///
/// All components live behind `Arc`s handed out by the accessors, so tests
/// can drive any of them directly while sharing the same store.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`SwrCache`].", "", "See [`SwrCache::builder()`] method."),
        method_doc("Implement builder pattern for [`SwrCache`]."),
    )
)]
pub struct SwrCache<S>
where
    S: QuerySource,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    source: Arc<S>,

    /// Cache name. Most useful for debugging and logging.
    #[fieldx(optional, get(copy), builder)]
    name: &'static str,

    #[fieldx(lock, get(copy), set(private), builder(off), default(false))]
    closed: bool,

    #[fieldx(lazy, get(clone), builder(off))]
    store: Arc<EntityStore<S>>,

    #[fieldx(lazy, get(clone), builder(off))]
    registry: Arc<QueryRegistry<S>>,

    #[fieldx(lazy, get(clone), builder(off))]
    invalidation: Arc<InvalidationEngine<S>>,

    #[fieldx(lazy, get(clone), builder(off))]
    mutations: Arc<MutationCoordinator<S>>,

    #[fieldx(lazy, get(clone), builder(off))]
    pagination: Arc<CursorManager<S>>,
}

impl<S> SwrCache<S>
where
    S: QuerySource,
{
    fn build_store(&self) -> Arc<EntityStore<S>> {
        child_build!(self, EntityStore<S>).unwrap()
    }

    fn build_registry(&self) -> Arc<QueryRegistry<S>> {
        child_build!(self, QueryRegistry<S>).unwrap()
    }

    fn build_invalidation(&self) -> Arc<InvalidationEngine<S>> {
        child_build!(self, InvalidationEngine<S>).unwrap()
    }

    fn build_mutations(&self) -> Arc<MutationCoordinator<S>> {
        child_build!(self, MutationCoordinator<S>).unwrap()
    }

    fn build_pagination(&self) -> Arc<CursorManager<S>> {
        child_build!(self, CursorManager<S>).unwrap()
    }

    #[inline]
    pub(crate) fn label(&self) -> &'static str {
        self.name().unwrap_or("<anon>")
    }

    /// Associates a policy with every key under `prefix`. See
    /// [`QueryRegistry::register`].
    pub fn register(&self, prefix: QueryKey, policy: QueryPolicy) {
        self.registry().register(prefix, policy);
    }

    /// Subscribes to `key` and brings it up to date before returning: the
    /// entry is fetched unless it is already fresh or its policy is disabled.
    /// The returned handle keeps the entry alive; see [`QuerySubscription`].
    pub async fn query(&self, key: QueryKey) -> Result<QuerySubscription<S>, CacheError<S::Error>> {
        self.query_with(key, None).await
    }

    /// Like [`query`](Self::query), with a listener notified synchronously on
    /// every change of the entry.
    pub async fn query_with(
        &self,
        key: QueryKey,
        listener: Option<Arc<dyn QueryListener>>,
    ) -> Result<QuerySubscription<S>, CacheError<S::Error>> {
        let policy = self.registry().policy_for(&key).unwrap_or_default();
        let subscription = self.store().subscribe(key.clone(), &policy, listener);
        if policy.enabled {
            self.registry().ensure_fresh(&key).await?;
            if let Some(every) = policy.refresh_interval {
                self.registry().ensure_refresher(&key, every);
            }
        }
        Ok(subscription)
    }

    /// Subscribes without fetching. The entry is created idle if missing.
    pub fn subscribe(&self, key: QueryKey) -> QuerySubscription<S> {
        self.subscribe_with(key, None)
    }

    pub fn subscribe_with(
        &self,
        key: QueryKey,
        listener: Option<Arc<dyn QueryListener>>,
    ) -> QuerySubscription<S> {
        let policy = self.registry().policy_for(&key).unwrap_or_default();
        self.store().subscribe(key, &policy, listener)
    }

    /// Read-through lookup. A cached value is returned immediately even when
    /// stale, with a detached refresh scheduled behind it; only a valueless
    /// entry makes the caller wait for the fetch.
    pub async fn get(&self, key: &QueryKey) -> Result<Option<CachedValue<S>>, CacheError<S::Error>> {
        tracing::debug!("[{}] GET({key})", self.label());

        if let Some(entry) = self.store().entry(key) {
            if let Some(value) = entry.value() {
                if !entry.is_fresh() && entry.status() != QueryStatus::Fetching {
                    self.registry().spawn_refresh(key.clone());
                }
                return Ok(Some(value));
            }
        }

        self.registry().ensure_fresh(key).await?;
        Ok(self.store().get(key).and_then(|snapshot| snapshot.value))
    }

    /// Side-effect-free read of the entry as it stands.
    pub fn peek(&self, key: &QueryKey) -> Option<EntrySnapshot<S>> {
        self.store().get(key)
    }

    /// See [`QueryRegistry::ensure_fresh`].
    pub async fn ensure_fresh(&self, key: &QueryKey) -> Result<(), CacheError<S::Error>> {
        self.registry().ensure_fresh(key).await
    }

    /// See [`CursorManager::fetch_next_page`].
    pub async fn fetch_next_page(&self, key: &QueryKey) -> Result<PageFetch, CacheError<S::Error>> {
        self.pagination().fetch_next_page(key).await
    }

    pub fn reset_pages(&self, key: &QueryKey) {
        self.pagination().reset_pages(key);
    }

    pub fn has_next_page(&self, key: &QueryKey) -> bool {
        self.pagination().has_next_page(key)
    }

    /// Imperative invalidation escape hatch; mutations should prefer
    /// declaring prefixes on their [`MutationPlan`].
    pub fn invalidate(&self, prefixes: &[QueryKey]) -> usize {
        self.invalidation().invalidate(prefixes)
    }

    /// Invalidation-with-removal.
    pub fn remove(&self, prefixes: &[QueryKey]) -> usize {
        self.invalidation().remove(prefixes)
    }

    /// Writes a value straight into the store, bypassing fetch machinery.
    pub fn set_value(&self, key: &QueryKey, value: CachedValue<S>) {
        self.store().set_value(key, value);
    }

    /// Prepares a mutation without running it; see [`MutationCoordinator`].
    pub fn mutation(&self, plan: MutationPlan<S>) -> Mutation<S> {
        self.mutations().start(plan)
    }

    /// Runs `op` with the plan's optimistic edits applied, rolling back on
    /// failure and invalidating on success.
    pub async fn run_mutation<R, Fut>(
        &self,
        plan: MutationPlan<S>,
        op: Fut,
    ) -> Result<R, CacheError<S::Error>>
    where
        Fut: Future<Output = Result<R, S::Error>>,
    {
        self.mutations().run(plan, op).await
    }

    /// Broadcast feed of every cache event.
    pub fn events(&self) -> BroadcastStream<CacheEvent> {
        self.store().events()
    }

    /// Stops background tasks and drops all entries. Further fetches fail
    /// with [`CacheError::Closed`].
    pub async fn close(&self) {
        self.set_closed(true);
        self.registry().shutdown();
        self.store().shutdown().await;
    }
}
