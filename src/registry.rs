use crate::cache::SwrCache;
use crate::prelude::*;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// Role of a caller in the per-key single-flight protocol. The lead runs the
// fetch and flips the channel when done; joiners wait on their receiver and
// then read the outcome off the entry.
enum FlightRole {
    Lead(watch::Sender<bool>),
    Join(watch::Receiver<bool>),
}

/// Associates key prefixes with fetch policies and owns the network path:
/// freshness checks, request de-duplication, retries, detached and interval
/// refreshes.
///
/// Registration is by prefix, with the longest matching prefix winning, so
/// one registration covers a whole family of keys (`["posts", "search"]`
/// covers every search term). A key no registration matches cannot be
/// fetched.
#[fx_plus(child(SwrCache<S>, rc_strong), parent, sync, rc, default(off))]
pub struct QueryRegistry<S>
where
    S: QuerySource,
{
    #[fieldx(private, lazy, get_mut, lock, builder(off))]
    registrations: Vec<(QueryKey, QueryPolicy)>,

    #[fieldx(private, lazy, clearer, get_mut, lock, builder(off))]
    in_flight: HashMap<QueryKey, watch::Receiver<bool>>,

    #[fieldx(private, lazy, clearer, get_mut, lock, builder(off))]
    refreshers: HashMap<QueryKey, tokio::task::JoinHandle<()>>,
}

impl<S> QueryRegistry<S>
where
    S: QuerySource,
{
    fn build_registrations(&self) -> Vec<(QueryKey, QueryPolicy)> {
        Vec::new()
    }

    fn build_in_flight(&self) -> HashMap<QueryKey, watch::Receiver<bool>> {
        HashMap::new()
    }

    fn build_refreshers(&self) -> HashMap<QueryKey, tokio::task::JoinHandle<()>> {
        HashMap::new()
    }

    fn label(&self) -> &'static str {
        self.parent().label()
    }

    /// Registers `policy` for every key starting with `prefix`. Re-registering
    /// the same prefix replaces its policy; already-created entries keep the
    /// durations they were born with.
    pub fn register(&self, prefix: QueryKey, policy: QueryPolicy) {
        let mut registrations = self.registrations_mut();
        if let Some(slot) = registrations.iter_mut().find(|(p, _)| *p == prefix) {
            slot.1 = policy;
        }
        else {
            registrations.push((prefix, policy));
        }
    }

    pub fn policy_for(&self, key: &QueryKey) -> Option<QueryPolicy> {
        self.registrations()
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, policy)| policy.clone())
    }

    /// Makes sure the entry for `key` holds a fresh value, fetching if it is
    /// missing, stale, or errored. Overlapping calls for one key share a
    /// single underlying fetch and all resolve from its result.
    ///
    /// A disabled policy makes this a no-op that creates no entry. An entry
    /// left in error state is not retried again until the next explicit call.
    pub async fn ensure_fresh(&self, key: &QueryKey) -> Result<(), CacheError<S::Error>> {
        let hub = self.parent();
        if hub.closed() {
            return Err(CacheError::Closed);
        }
        let Some(policy) = self.policy_for(key)
        else {
            return Err(CacheError::Unregistered(key.clone()));
        };
        if !policy.enabled {
            tracing::trace!("[{}] SKIP({key}): query disabled", self.label());
            return Ok(());
        }

        let store = hub.store();
        if store.entry(key).is_some_and(|e| e.is_fresh()) {
            return Ok(());
        }
        store.ensure_entry(key, &policy);

        match self.flight_role(key) {
            FlightRole::Join(rx) => {
                Self::join_flight(rx).await;
                self.outcome_from_entry(key, &policy)
            }
            FlightRole::Lead(tx) => {
                tracing::debug!("[{}] FETCH({key})", self.label());
                store.set_fetching(key);

                let source = hub.source();
                let fetch_key = key.clone();
                let result = policy
                    .retry
                    .run(|_attempt| {
                        let source = Arc::clone(&source);
                        let fetch_key = fetch_key.clone();
                        async move { source.fetch(&fetch_key).await }
                    })
                    .await;

                let outcome = match result {
                    Ok(value) => {
                        store.set_fetched(key, CachedValue::Single(value), &policy);
                        Ok(())
                    }
                    Err((attempts, error)) => {
                        let error = Arc::new(error);
                        store.set_error(key, Arc::clone(&error), &policy);
                        Err(CacheError::Fetch {
                            key: key.clone(),
                            attempts,
                            cause: error,
                        })
                    }
                };
                self.end_flight(key, tx);
                outcome
            }
        }
    }

    /// Fetches one page through the same single-flight and retry machinery.
    /// The cursor was decided by the cursor manager; `None` means page one.
    pub(crate) async fn paged_fetch(
        &self,
        key: &QueryKey,
        policy: &QueryPolicy,
        cursor: Option<Cursor>,
    ) -> Result<PageFetch, CacheError<S::Error>> {
        let hub = self.parent();
        if hub.closed() {
            return Err(CacheError::Closed);
        }
        let store = hub.store();

        match self.flight_role(key) {
            FlightRole::Join(rx) => {
                Self::join_flight(rx).await;
                self.outcome_from_entry(key, policy)?;
                Ok(PageFetch::Deduplicated)
            }
            FlightRole::Lead(tx) => {
                tracing::debug!("[{}] FETCH-PAGE({key})", self.label());
                store.set_fetching(key);

                let source = hub.source();
                let fetch_key = key.clone();
                let result = policy
                    .retry
                    .run(|_attempt| {
                        let source = Arc::clone(&source);
                        let fetch_key = fetch_key.clone();
                        let cursor = cursor.clone();
                        async move { source.fetch_page(&fetch_key, cursor.as_ref()).await }
                    })
                    .await;

                let outcome = match result {
                    Ok(page) => {
                        let appended = store.append_page(key, page, policy);
                        Ok(PageFetch::Appended { appended })
                    }
                    Err((attempts, error)) => {
                        let error = Arc::new(error);
                        store.set_error(key, Arc::clone(&error), policy);
                        Err(CacheError::Fetch {
                            key: key.clone(),
                            attempts,
                            cause: error,
                        })
                    }
                };
                self.end_flight(key, tx);
                outcome
            }
        }
    }

    /// Detached best-effort refresh; failures are logged and otherwise
    /// swallowed. Used by invalidation cascades and interval refresh.
    pub(crate) fn spawn_refresh(&self, key: QueryKey) {
        let Some(myself) = self.myself()
        else {
            return;
        };
        tokio::spawn(async move {
            if let Err(error) = myself.ensure_fresh(&key).await {
                tracing::debug!(
                    "[{}] background refresh of '{key}' failed: {error}",
                    myself.label()
                );
            }
        });
    }

    /// Keeps `key` fresh on a cadence while it has subscribers. The task
    /// exits on its own once the last subscriber is gone.
    pub(crate) fn ensure_refresher(&self, key: &QueryKey, every: Duration) {
        let mut refreshers = self.refreshers_mut();
        if refreshers.get(key).is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(myself) = self.myself()
        else {
            return;
        };
        let refresh_key = key.clone();
        refreshers.insert(
            key.clone(),
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    if myself.parent().store().subscriber_count(&refresh_key) == 0 {
                        break;
                    }
                    if let Err(error) = myself.ensure_fresh(&refresh_key).await {
                        tracing::debug!(
                            "[{}] interval refresh of '{refresh_key}' failed: {error}",
                            myself.label()
                        );
                    }
                }
            }),
        );
    }

    fn flight_role(&self, key: &QueryKey) -> FlightRole {
        let mut in_flight = self.in_flight_mut();
        match in_flight.get(key) {
            // A receiver whose sender is gone belongs to a flight that
            // unwound without finishing; take the lead over from it.
            Some(rx) if rx.has_changed().is_ok() => FlightRole::Join(rx.clone()),
            _ => {
                let (tx, rx) = watch::channel(false);
                in_flight.insert(key.clone(), rx);
                FlightRole::Lead(tx)
            }
        }
    }

    async fn join_flight(mut rx: watch::Receiver<bool>) {
        // An error means the sender is gone, which also ends the flight.
        let _ = rx.wait_for(|done| *done).await;
    }

    fn end_flight(&self, key: &QueryKey, tx: watch::Sender<bool>) {
        self.in_flight_mut().remove(key);
        let _ = tx.send(true);
    }

    // What a joiner reports after the shared flight settled: whatever the
    // lead left on the entry.
    fn outcome_from_entry(
        &self,
        key: &QueryKey,
        policy: &QueryPolicy,
    ) -> Result<(), CacheError<S::Error>> {
        match self.parent().store().entry(key) {
            Some(entry) if entry.status() == QueryStatus::Error => {
                match entry.last_error() {
                    Some(cause) => Err(CacheError::Fetch {
                        key: key.clone(),
                        attempts: policy.retry.max_attempts.max(1),
                        cause,
                    }),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(refreshers) = self.clear_refreshers() {
            for (_, task) in refreshers {
                task.abort();
            }
        }
        // Dropping the receivers unblocks nobody still waiting; leads hold
        // their own senders and finish normally.
        self.clear_in_flight();
    }
}
