//! # swr-cache
//!
//! Generic read-through caching layer with stale-while-revalidate semantics
//! and optimistic mutation rollback.
//!
//! Think of it as the client-side half of a data-fetching stack: the backend
//! stays an opaque asynchronous key-fetch service, and this crate keeps the
//! many overlapping cached views of it consistent.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Reads are addressed by structural [`QueryKey`](types::QueryKey)s, and
//!   many keys materialize overlapping slices of the same underlying data
//!   (a post shows up in "recent", in an infinite feed, in search results and
//!   as a standalone entry at the same time).
//! - Latency makes speculative local writes worthwhile: a like/save/follow
//!   should be visible before the server confirms it.
//! - Consistency across the overlapping views is maintained by prefix-based
//!   invalidation, not by normalizing shared records.
//!
//! The cache operates on the following principles:
//!
//! - It is backend-agnostic: everything network-shaped lives behind the
//!   [`QuerySource`](traits::QuerySource) trait.
//! - It is value-agnostic. Payload shapes are the application's business; the
//!   only structure the cache understands is the page list of an infinite
//!   query, and there only cursors and item identity.
//! - Stale values stay readable while a refetch is in flight.
//! - Optimistic edits are placeholders, not truth: a successful mutation ends
//!   in invalidation, and the authoritative refetch overwrites the guess.
//! - Fully async, single instance per application, no hidden globals; tests
//!   build as many isolated instances as they like.
//!
//! # Components
//!
//! [`SwrCache`] is the hub. Behind it sit the
//! [`EntityStore`](store::EntityStore) (entries, subscribers, deferred
//! eviction), the [`QueryRegistry`](registry::QueryRegistry) (policies,
//! request de-duplication, retries), the
//! [`InvalidationEngine`](invalidate::InvalidationEngine) (prefix cascades),
//! the [`MutationCoordinator`](mutation::MutationCoordinator)
//! (snapshot/rollback) and the [`CursorManager`](pages::CursorManager)
//! (infinite queries).

pub mod cache;
pub mod entry;
pub mod error;
pub mod invalidate;
pub mod mutation;
pub mod pages;
pub mod policy;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod test;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::SwrCache;
#[doc(inline)]
pub use traits::QuerySource;

pub mod prelude {
    pub use crate::cache::SwrCache;
    pub use crate::entry::EntrySnapshot;
    pub use crate::error::CacheError;
    pub use crate::invalidate::InvalidationEngine;
    pub use crate::mutation::Mutation;
    pub use crate::mutation::MutationCoordinator;
    pub use crate::mutation::MutationPlan;
    pub use crate::mutation::MutationState;
    pub use crate::pages::Cursor;
    pub use crate::pages::CursorManager;
    pub use crate::pages::Page;
    pub use crate::pages::PageFetch;
    pub use crate::pages::PageSet;
    pub use crate::policy::Backoff;
    pub use crate::policy::QueryPolicy;
    pub use crate::policy::RetryPolicy;
    pub use crate::registry::QueryRegistry;
    pub use crate::store::EntityStore;
    pub use crate::subscription::QuerySubscription;
    pub use crate::traits::QueryListener;
    pub use crate::traits::QuerySource;
    pub use crate::types::*;
}

/// Builds a [`QueryKey`](types::QueryKey) from anything convertible into
/// [`KeyPart`](types::KeyPart)s:
///
/// ```
/// use swr_cache::query_key;
///
/// let key = query_key!["posts", "byId", 42];
/// assert!(key.starts_with(&query_key!["posts"]));
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),+ $(,)?) => {
        $crate::types::QueryKey::from_parts(vec![$($crate::types::KeyPart::from($part)),+])
    };
}
