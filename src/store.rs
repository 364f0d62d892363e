use crate::cache::SwrCache;
use crate::entry::EntryState;
use crate::pages::PageCursor;
use crate::prelude::*;
use crate::subscription::QuerySubscription;
use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Keyed store of cache entries: the one shared mutable structure every other
/// component reads and writes through a narrow set of operations.
///
/// The store itself never fails and never fetches; it records what fetches
/// and mutations produced, counts subscribers, notifies listeners after every
/// change, and evicts entries that sat without subscribers past their
/// retention window. Eviction is deferred, not immediate, so a quick
/// unsubscribe/resubscribe (a component remount) does not throw the value
/// away.
#[fx_plus(child(SwrCache<S>, rc_strong), parent, sync, rc, default(off))]
pub struct EntityStore<S>
where
    S: QuerySource,
{
    #[fieldx(private, lazy, clearer, get_mut, lock, builder(off))]
    entries: HashMap<QueryKey, Arc<EntryState<S>>>,

    #[fieldx(private, lazy, clearer, get_mut, lock, builder(off))]
    listeners: HashMap<QueryKey, Vec<(u64, Arc<dyn QueryListener>)>>,

    #[fieldx(lock, private, get(copy), get_mut, default(0), builder(off))]
    next_subscription_id: u64,

    #[fieldx(private, lazy, get(clone), builder(off))]
    events_tx: broadcast::Sender<CacheEvent>,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    sweeper_task: tokio::task::JoinHandle<()>,
}

impl<S> EntityStore<S>
where
    S: QuerySource,
{
    fn build_entries(&self) -> HashMap<QueryKey, Arc<EntryState<S>>> {
        HashMap::new()
    }

    fn build_listeners(&self) -> HashMap<QueryKey, Vec<(u64, Arc<dyn QueryListener>)>> {
        HashMap::new()
    }

    fn build_events_tx(&self) -> broadcast::Sender<CacheEvent> {
        broadcast::channel(EVENT_CHANNEL_CAPACITY).0
    }

    fn label(&self) -> &'static str {
        self.parent().label()
    }

    /// Returns the entry for `key`, creating an idle one from `policy` if
    /// none exists. A fresh entry starts with zero subscribers, so its
    /// retention clock is armed immediately.
    pub(crate) fn ensure_entry(&self, key: &QueryKey, policy: &QueryPolicy) -> Arc<EntryState<S>> {
        let mut created = false;
        let entry = {
            let mut entries = self.entries_mut();
            match entries.get(key) {
                Some(entry) => Arc::clone(entry),
                None => {
                    let entry = child_build!(self, EntryState<S> {
                        key: key.clone(),
                        stale_after: policy.stale_after,
                        retain_for: policy.retain_for,
                    })
                    .unwrap();
                    entry.set_retain_until(Instant::now() + policy.retain_for);
                    entries.insert(key.clone(), Arc::clone(&entry));
                    created = true;
                    entry
                }
            }
        };
        if created {
            tracing::trace!("[{}] NEW({key})", self.label());
            self.check_sweeper();
        }
        entry
    }

    pub(crate) fn entry(&self, key: &QueryKey) -> Option<Arc<EntryState<S>>> {
        self.entries().get(key).cloned()
    }

    /// Side-effect-free read.
    pub fn get(&self, key: &QueryKey) -> Option<EntrySnapshot<S>> {
        self.entries().get(key).map(|e| e.snapshot())
    }

    pub fn status_of(&self, key: &QueryKey) -> Option<QueryStatus> {
        self.entries().get(key).map(|e| e.status())
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> u32 {
        self.entries().get(key).map_or(0, |e| e.subscribers())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub(crate) fn set_fetching(&self, key: &QueryKey) {
        if let Some(entry) = self.entry(key) {
            entry.set_status(QueryStatus::Fetching);
            self.notify(key, CacheEventKind::FetchStarted);
        }
    }

    /// Records a successful fetch (or an optimistically confirmed value):
    /// replaces or creates the entry, stamps the fetch time, clears any prior
    /// error.
    pub(crate) fn set_fetched(&self, key: &QueryKey, value: CachedValue<S>, policy: &QueryPolicy) {
        let entry = self.ensure_entry(key, policy);
        entry.set_value(value);
        entry.set_status(QueryStatus::Success);
        entry.set_fetched_at(Instant::now());
        entry.clear_last_error();
        self.notify(key, CacheEventKind::Updated);
    }

    /// Direct write of an application-produced value, e.g. a mutation result
    /// the server echoed back.
    pub fn set_value(&self, key: &QueryKey, value: CachedValue<S>) {
        self.set_fetched(key, value, &QueryPolicy::default());
    }

    /// Records an exhausted fetch. The stale value, if any, stays readable.
    pub(crate) fn set_error(&self, key: &QueryKey, error: Arc<S::Error>, policy: &QueryPolicy) {
        let entry = self.ensure_entry(key, policy);
        entry.set_status(QueryStatus::Error);
        entry.set_last_error(error);
        self.notify(key, CacheEventKind::Errored);
    }

    /// Applies a pure transform to the entry's current value, returning the
    /// value it replaced. Entries without a value are left untouched and
    /// yield `None`, so callers know not to snapshot them.
    pub(crate) fn apply_transform(
        &self,
        key: &QueryKey,
        transform: &dyn Fn(&CachedValue<S>) -> CachedValue<S>,
    ) -> Option<CachedValue<S>> {
        let entry = self.entry(key)?;
        let previous = entry.value()?;
        entry.set_value(transform(&previous));
        self.notify(key, CacheEventKind::Updated);
        Some(previous)
    }

    /// Puts a previously captured value back, as the rollback path of a
    /// failed mutation. An entry evicted in the meantime stays gone.
    pub(crate) fn restore(&self, key: &QueryKey, value: CachedValue<S>) {
        if let Some(entry) = self.entry(key) {
            entry.set_value(value);
            self.notify(key, CacheEventKind::Updated);
        }
    }

    /// Marks every entry whose key matches `predicate` as logically stale.
    /// Values are kept so readers can show them while a refetch is in flight.
    /// Returns the affected keys with their subscriber counts, for the
    /// invalidation engine to schedule refetches from.
    pub fn mark_stale<P>(&self, predicate: P) -> Vec<(QueryKey, u32)>
    where
        P: Fn(&QueryKey) -> bool,
    {
        let matched: Vec<Arc<EntryState<S>>> = self
            .entries()
            .values()
            .filter(|e| predicate(e.key()))
            .cloned()
            .collect();

        let mut affected = Vec::with_capacity(matched.len());
        for entry in matched {
            // An in-flight fetch is left alone; its completion will supersede
            // the stale marking anyway.
            if entry.status() != QueryStatus::Fetching {
                entry.set_status(QueryStatus::Idle);
            }
            self.notify(entry.key(), CacheEventKind::MarkedStale);
            affected.push((entry.key().clone(), entry.subscribers()));
        }
        affected
    }

    pub(crate) fn page_cursor(&self, key: &QueryKey) -> PageCursor {
        match self.entry(key).and_then(|e| e.value()) {
            Some(CachedValue::Pages(pages)) => pages.cursor(),
            _ => PageCursor::Initial,
        }
    }

    /// Appends a fetched page to the entry's page set, dropping items whose
    /// key already appears in an earlier page. Returns how many items
    /// survived.
    pub(crate) fn append_page(
        &self,
        key: &QueryKey,
        page: crate::pages::Page<S::Item>,
        policy: &QueryPolicy,
    ) -> usize {
        let entry = self.ensure_entry(key, policy);
        let mut pages = match entry.value() {
            Some(CachedValue::Pages(pages)) => pages,
            _ => PageSet::new(),
        };
        let appended = pages.push_deduped(&*self.parent().source(), page);
        entry.set_value(CachedValue::Pages(pages));
        entry.set_status(QueryStatus::Success);
        entry.set_fetched_at(Instant::now());
        entry.clear_last_error();
        self.notify(key, CacheEventKind::Updated);
        appended
    }

    /// Back to zero pages; used when the parameters behind the key changed.
    pub fn reset_pages(&self, key: &QueryKey) {
        if let Some(entry) = self.entry(key) {
            if matches!(entry.value(), Some(CachedValue::Pages(_))) {
                entry.set_value(CachedValue::Pages(PageSet::new()));
            }
            else {
                entry.clear_value();
            }
            entry.set_status(QueryStatus::Idle);
            entry.clear_fetched_at();
            self.notify(key, CacheEventKind::PagesReset);
        }
    }

    /// Drops the entry regardless of subscribers. Invalidation-with-removal.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let removed = self.entries_mut().remove(key).is_some();
        if removed {
            tracing::debug!("[{}] EVICT({key})", self.label());
            self.notify(key, CacheEventKind::Evicted);
        }
        removed
    }

    pub fn remove_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        let keys: Vec<QueryKey> = self
            .entries()
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in &keys {
            if self.evict(key) {
                removed += 1;
            }
        }
        removed
    }

    /// Registers a consumer of `key`: bumps the subscriber count, disarms the
    /// retention clock, and optionally attaches a change listener. Dropping
    /// the returned handle reverses all of it.
    pub fn subscribe(
        &self,
        key: QueryKey,
        policy: &QueryPolicy,
        listener: Option<Arc<dyn QueryListener>>,
    ) -> QuerySubscription<S> {
        let entry = self.ensure_entry(&key, policy);
        {
            let mut count = entry.subscribers_mut();
            *count += 1;
        }
        entry.clear_retain_until();

        let id = {
            let mut next = self.next_subscription_id_mut();
            *next += 1;
            *next
        };
        if let Some(listener) = listener {
            self.listeners_mut()
                .entry(key.clone())
                .or_default()
                .push((id, listener));
        }
        child_build!(self, QuerySubscription<S> { key: key, id: id }).unwrap()
    }

    // Subscription drop path. Arms the retention clock when the last
    // subscriber leaves.
    pub(crate) fn release(&self, key: &QueryKey, id: u64) {
        {
            let mut listeners = self.listeners_mut();
            if let Some(registered) = listeners.get_mut(key) {
                registered.retain(|(lid, _)| *lid != id);
                if registered.is_empty() {
                    listeners.remove(key);
                }
            }
        }

        let Some(entry) = self.entry(key)
        else {
            return;
        };
        let now_unobserved = {
            let mut count = entry.subscribers_mut();
            *count = count.saturating_sub(1);
            *count == 0
        };
        if now_unobserved {
            entry.set_retain_until(Instant::now() + entry.retain_for());
            self.check_sweeper();
        }
    }

    /// Event feed for integration layers that prefer a stream over inline
    /// listeners.
    pub fn events(&self) -> BroadcastStream<CacheEvent> {
        BroadcastStream::new(self.events_tx().subscribe())
    }

    fn notify(&self, key: &QueryKey, kind: CacheEventKind) {
        let event = CacheEvent {
            key: key.clone(),
            kind,
        };
        // Listeners run inline with no store locks held, so they are free to
        // read the cache.
        let targets: Vec<Arc<dyn QueryListener>> = self
            .listeners()
            .get(key)
            .map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in targets {
            listener.on_cache_event(&event);
        }
        let _ = self.events_tx().send(event);
    }

    // Deferred-eviction sweep. Wakes at the earliest retention deadline,
    // drops entries that are still unobserved, and exits when no deadline is
    // armed; subscription releases restart it.
    async fn sweep_expired(&self) {
        tracing::debug!("[{}] Starting eviction sweeper", self.label());
        loop {
            let now = Instant::now();
            let mut due: Vec<QueryKey> = Vec::new();
            let mut next_deadline: Option<Instant> = None;
            {
                let entries = self.entries();
                for (key, entry) in entries.iter() {
                    if entry.subscribers() > 0 {
                        continue;
                    }
                    let Some(deadline) = entry.retain_until()
                    else {
                        continue;
                    };
                    if deadline <= now {
                        due.push(key.clone());
                    }
                    else {
                        next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                    }
                }
            }

            for key in due {
                let expired = {
                    let mut entries = self.entries_mut();
                    match entries.get(&key) {
                        // Re-check under the write lock: a subscriber may have
                        // arrived since the scan.
                        Some(entry)
                            if entry.subscribers() == 0
                                && entry.retain_until().is_some_and(|d| d <= now) =>
                        {
                            entries.remove(&key);
                            true
                        }
                        _ => false,
                    }
                };
                if expired {
                    tracing::debug!("[{}] EVICT({key}): retention expired", self.label());
                    self.notify(&key, CacheEventKind::Evicted);
                }
            }

            match next_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => {
                    tracing::debug!(
                        "[{}] Stopping eviction sweeper since no entry awaits eviction.",
                        self.label()
                    );
                    break;
                }
            }
        }
    }

    fn check_sweeper(&self) {
        if self.sweeper_task().as_ref().map_or(true, |t| t.is_finished()) {
            let Some(async_self) = self.myself()
            else {
                return;
            };
            self.set_sweeper_task(tokio::spawn(async move { async_self.sweep_expired().await }));
        }
    }

    pub(crate) async fn shutdown(&self) {
        if let Some(sweeper) = self.clear_sweeper_task() {
            sweeper.abort();
            let _ = sweeper.await;
        }
        self.clear_listeners();
        self.clear_entries();
    }
}
