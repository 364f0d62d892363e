use crate::cache::SwrCache;
use crate::prelude::*;
use fieldx_plus::fx_plus;
use fieldx_plus::Child;
use std::collections::HashSet;
use std::fmt;
use std::fmt::Display;

/// Opaque continuation token for paginated queries. The source mints it and
/// consumes it; the cache only threads it through.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Cursor {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<String> for Cursor {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One fetched page. `next_cursor == None` is the "no more pages" sentinel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<I> {
    pub items: Vec<I>,
    pub next_cursor: Option<Cursor>,
}

impl<I> Page<I> {
    pub fn new(items: Vec<I>, next_cursor: Option<Cursor>) -> Self {
        Self { items, next_cursor }
    }
}

/// Growable, fetch-ordered list of pages backing an infinite query.
///
/// Page order reflects fetch order. Items are de-duplicated on append by
/// their source-supplied item key, so an item that drifted between two pages
/// because of concurrent writes shows up once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSet<I> {
    pages: Vec<Page<I>>,
}

impl<I> PageSet<I> {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn pages(&self) -> &[Page<I>] {
        &self.pages
    }

    pub fn items(&self) -> impl Iterator<Item = &I> {
        self.pages.iter().flat_map(|p| p.items.iter())
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(|p| p.items.len()).sum()
    }

    /// False once the last fetched page reported the end of the result set.
    /// An empty set has not seen the end yet.
    pub fn has_next_page(&self) -> bool {
        !matches!(self.cursor(), PageCursor::Exhausted)
    }

    pub(crate) fn cursor(&self) -> PageCursor {
        match self.pages.last() {
            None => PageCursor::Initial,
            Some(page) => page
                .next_cursor
                .clone()
                .map_or(PageCursor::Exhausted, PageCursor::Next),
        }
    }

    /// Plain append without de-duplication, for callers rebuilding a page
    /// set themselves (e.g. optimistic transforms).
    pub fn push(&mut self, page: Page<I>) {
        self.pages.push(page);
    }

    pub(crate) fn push_deduped<S>(&mut self, source: &S, page: Page<S::Item>) -> usize
    where
        S: QuerySource<Item = I>,
    {
        let seen: HashSet<S::ItemKey> = self.items().map(|item| source.item_key(item)).collect();
        let items: Vec<S::Item> = page
            .items
            .into_iter()
            .filter(|item| !seen.contains(&source.item_key(item)))
            .collect();
        let appended = items.len();
        self.pages.push(Page {
            items,
            next_cursor: page.next_cursor,
        });
        appended
    }
}

impl<I> Default for PageSet<I> {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuation state of a page set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PageCursor {
    /// No pages fetched yet; the next fetch carries no cursor.
    Initial,
    Next(Cursor),
    Exhausted,
}

/// Outcome of a [`fetch_next_page`](CursorManager::fetch_next_page) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFetch {
    /// A page was fetched; `appended` counts the items that survived
    /// de-duplication.
    Appended { appended: usize },
    /// The last page already reported the end; no call was made.
    NoMorePages,
    /// The query's policy is disabled.
    Disabled,
    /// Another caller was already fetching this key; its page landed instead.
    Deduplicated,
}

/// Models infinite result sets as one growable cache entry per query key.
///
/// The manager only decides which cursor to send; the network path (request
/// de-duplication, retries, error recording) is the registry's.
#[fx_plus(child(SwrCache<S>, rc_strong), sync, rc, default(off))]
pub struct CursorManager<S>
where
    S: QuerySource,
{
}

impl<S> CursorManager<S>
where
    S: QuerySource,
{
    pub async fn fetch_next_page(&self, key: &QueryKey) -> Result<PageFetch, CacheError<S::Error>> {
        let hub = self.parent();
        let registry = hub.registry();
        let Some(policy) = registry.policy_for(key)
        else {
            return Err(CacheError::Unregistered(key.clone()));
        };
        if !policy.enabled {
            return Ok(PageFetch::Disabled);
        }

        let store = hub.store();
        store.ensure_entry(key, &policy);

        let cursor = match store.page_cursor(key) {
            PageCursor::Exhausted => {
                tracing::trace!("[{}] NEXT-PAGE({key}): exhausted", hub.label());
                return Ok(PageFetch::NoMorePages);
            }
            PageCursor::Next(cursor) => Some(cursor),
            PageCursor::Initial => None,
        };

        registry.paged_fetch(key, &policy, cursor).await
    }

    /// Drops all pages, e.g. when the parameters behind the key changed
    /// meaning (a new search term). The next fetch starts from page one.
    pub fn reset_pages(&self, key: &QueryKey) {
        self.parent().store().reset_pages(key);
    }

    pub fn has_next_page(&self, key: &QueryKey) -> bool {
        !matches!(self.parent().store().page_cursor(key), PageCursor::Exhausted)
    }
}
