use async_trait::async_trait;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;

use crate::pages::Cursor;
use crate::pages::Page;
use crate::types::CacheEvent;
use crate::types::QueryKey;

// For types that are in charge of talking to the backing service.
#[async_trait]
pub trait QuerySource: Sized + Send + Sync + 'static {
    /// Payload of a plain (non-paginated) query. Opaque to the cache; an enum
    /// works well when different queries return differently shaped data.
    type Value: Debug + Clone + Send + Sync + 'static;

    /// One element of a paginated result set.
    type Item: Debug + Clone + Send + Sync + 'static;

    /// Stable identity of an [`Item`](Self::Item), used to drop duplicates
    /// when two fetched pages overlap.
    type ItemKey: Debug + Hash + Eq + Clone + Send + Sync + 'static;

    type Error: Debug + Display + Send + Sync + 'static;

    /// Resolves a plain query. The key tells the source which query this is;
    /// how it maps keys to backend calls is its own business.
    async fn fetch(&self, key: &QueryKey) -> Result<Self::Value, Self::Error>;

    /// Resolves one page of a paginated query. `cursor` is `None` for the
    /// first page, otherwise whatever the previous page's `next_cursor` said.
    /// Only required for sources that serve paginated queries.
    async fn fetch_page(&self, key: &QueryKey, cursor: Option<&Cursor>)
        -> Result<Page<Self::Item>, Self::Error>;

    fn item_key(&self, item: &Self::Item) -> Self::ItemKey;
}

/// Synchronous observer of cache changes, registered per key alongside a
/// subscription. Invoked inline after every set/mark-stale/evict, before the
/// mutating call returns; keep implementations quick.
pub trait QueryListener: Send + Sync + 'static {
    fn on_cache_event(&self, event: &CacheEvent);
}

impl<F> QueryListener for F
where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
{
    fn on_cache_event(&self, event: &CacheEvent) {
        self(event)
    }
}
