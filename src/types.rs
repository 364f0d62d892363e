use crate::pages::PageSet;
use crate::traits::QuerySource;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;

/// One element of a [`QueryKey`].
///
/// Keys compare structurally: two parts are the same iff they hold equal
/// content. `Filter` keeps its entries in a `BTreeMap` so that two filters
/// built in different insertion orders still compare and hash the same.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Text(String),
    Int(i64),
    Filter(BTreeMap<String, String>),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<BTreeMap<String, String>> for KeyPart {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self::Filter(value)
    }
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Filter(map) => {
                f.write_str("{")?;
                for (idx, (k, v)) in map.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Structural identity of a cached query.
///
/// An ordered sequence of [`KeyPart`]s. Equality is deep comparison of every
/// part; two keys are the same query iff all parts compare equal. The prefix
/// relation ([`QueryKey::starts_with`]) is what invalidation patterns match
/// against.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn root(part: impl Into<KeyPart>) -> Self {
        Self(vec![part.into()])
    }

    /// Extends the key with one more part, consuming and returning it.
    pub fn join(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `prefix` is a leading subsequence of this key. Every key is a
    /// prefix of itself; the empty key is a prefix of everything.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0.iter().zip(prefix.0.iter()).all(|(a, b)| a == b)
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Lifecycle state of a cache entry.
///
/// `Idle` doubles as "logically stale": a marked-stale entry keeps its value
/// but drops back to `Idle` so the next freshness check refetches it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// What happened to a cache entry. Delivered synchronously to per-key
/// listeners and over the broadcast event feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheEventKind {
    /// The entry's value was set or replaced.
    Updated,
    /// A fetch for the entry started.
    FetchStarted,
    /// The entry was marked stale; its value is still readable.
    MarkedStale,
    /// A fetch for the entry exhausted its retries.
    Errored,
    /// The entry was dropped from the store.
    Evicted,
    /// The entry's page list was reset to zero pages.
    PagesReset,
}

#[derive(Clone, Debug)]
pub struct CacheEvent {
    pub key: QueryKey,
    pub kind: CacheEventKind,
}

/// The payload held by a cache entry.
///
/// The cache never looks inside `Single` values; `Pages` is the one shape it
/// understands, and only as far as cursor threading and item-key
/// de-duplication go.
pub enum CachedValue<S>
where
    S: QuerySource,
{
    Single(S::Value),
    Pages(PageSet<S::Item>),
}

impl<S> CachedValue<S>
where
    S: QuerySource,
{
    pub fn as_single(&self) -> Option<&S::Value> {
        match self {
            Self::Single(v) => Some(v),
            Self::Pages(_) => None,
        }
    }

    pub fn as_pages(&self) -> Option<&PageSet<S::Item>> {
        match self {
            Self::Single(_) => None,
            Self::Pages(p) => Some(p),
        }
    }

    pub fn into_single(self) -> Option<S::Value> {
        match self {
            Self::Single(v) => Some(v),
            Self::Pages(_) => None,
        }
    }

    pub fn into_pages(self) -> Option<PageSet<S::Item>> {
        match self {
            Self::Single(_) => None,
            Self::Pages(p) => Some(p),
        }
    }
}

impl<S> Clone for CachedValue<S>
where
    S: QuerySource,
{
    fn clone(&self) -> Self {
        match self {
            Self::Single(v) => Self::Single(v.clone()),
            Self::Pages(p) => Self::Pages(p.clone()),
        }
    }
}

impl<S> Debug for CachedValue<S>
where
    S: QuerySource,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(v) => fmt.debug_tuple("CachedValue::Single").field(v).finish(),
            Self::Pages(p) => fmt.debug_tuple("CachedValue::Pages").field(p).finish(),
        }
    }
}
