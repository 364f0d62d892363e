#![cfg(test)]

use super::source::*;
use crate::prelude::*;
use crate::query_key;
use std::time::Duration;

fn overlapping_feed() -> Vec<Page<Post>> {
    pages_of(vec![
        vec![Post::new(1, "a", 0), Post::new(2, "b", 0), Post::new(3, "c", 0)],
        // Post 3 drifted into the second page because of a concurrent write.
        vec![Post::new(3, "c", 0), Post::new(4, "d", 0), Post::new(5, "e", 0)],
    ])
}

#[tokio::test]
async fn pages_append_in_fetch_order_and_dedup_items() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["feed"], quick_policy());
    let key = query_key!["feed", "home"];
    source.put_feed(key.clone(), overlapping_feed());

    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::Appended { appended: 3 }
    );
    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::Appended { appended: 2 }
    );

    let value = cache.peek(&key).unwrap().value.unwrap();
    let pages = value.as_pages().unwrap();
    assert_eq!(pages.pages().len(), 2);
    let ids: Vec<i64> = pages.items().map(|post| post.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(source.page_count(), 2);
}

#[tokio::test]
async fn exhausted_cursor_short_circuits_without_a_call() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["feed"], quick_policy());
    let key = query_key!["feed", "home"];
    source.put_feed(key.clone(), overlapping_feed());

    cache.fetch_next_page(&key).await.unwrap();
    cache.fetch_next_page(&key).await.unwrap();
    assert!(!cache.has_next_page(&key));

    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::NoMorePages
    );
    assert_eq!(source.page_count(), 2);
}

#[tokio::test]
async fn reset_pages_starts_from_page_one() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["feed"], quick_policy());
    let key = query_key!["feed", "home"];
    source.put_feed(key.clone(), overlapping_feed());

    cache.fetch_next_page(&key).await.unwrap();
    cache.fetch_next_page(&key).await.unwrap();

    cache.reset_pages(&key);
    let snapshot = cache.peek(&key).unwrap();
    assert_eq!(snapshot.status, QueryStatus::Idle);
    assert_eq!(snapshot.value.unwrap().as_pages().unwrap().pages().len(), 0);
    assert!(cache.has_next_page(&key));

    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::Appended { appended: 3 }
    );
    assert_eq!(source.page_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_next_page_calls_share_one_fetch() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["feed"], quick_policy());
    let key = query_key!["feed", "home"];
    source.put_feed(key.clone(), overlapping_feed());
    source.set_latency(Duration::from_millis(20));

    let (a, b) = tokio::join!(cache.fetch_next_page(&key), cache.fetch_next_page(&key));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert!(outcomes.contains(&PageFetch::Appended { appended: 3 }));
    assert!(outcomes.contains(&PageFetch::Deduplicated));
    assert_eq!(source.page_count(), 1);
}

#[tokio::test]
async fn disabled_feed_reports_disabled() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["feed"], QueryPolicy::disabled());

    assert_eq!(
        cache.fetch_next_page(&query_key!["feed", "home"]).await.unwrap(),
        PageFetch::Disabled
    );
    assert_eq!(source.page_count(), 0);
}

#[tokio::test]
async fn page_fetch_failure_lands_on_the_entry() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(
        query_key!["feed"],
        QueryPolicy {
            retry: RetryPolicy::none(),
            ..QueryPolicy::default()
        },
    );
    let key = query_key!["feed", "home"];
    source.put_feed(key.clone(), overlapping_feed());
    source.fail_next(key.clone(), 1);

    let err = cache.fetch_next_page(&key).await.unwrap_err();
    assert!(matches!(err, CacheError::Fetch { .. }));
    let snapshot = cache.peek(&key).unwrap();
    assert_eq!(snapshot.status, QueryStatus::Error);
    assert!(snapshot.error.is_some());

    // The next explicit call recovers.
    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::Appended { appended: 3 }
    );
}
