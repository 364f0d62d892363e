#![cfg(feature = "mock")]

//! End-to-end walk through the public surface: a feed-and-likes workload with
//! overlapping cached views of the same posts, kept consistent purely through
//! prefix invalidation and optimistic rollback.

use std::sync::Arc;
use std::time::Duration;
use swr_cache::prelude::*;
use swr_cache::query_key;
use swr_cache::test::source::*;

fn like_in_all_views(post_id: i64) -> MutationPlan<MockSource> {
    let bump = move |value: &CachedValue<MockSource>| match value {
        CachedValue::Single(Payload::Post(post)) if post.id == post_id => {
            let mut post = post.clone();
            post.likes_count += 1;
            CachedValue::Single(Payload::Post(post))
        }
        CachedValue::Single(Payload::PostList(posts)) => {
            let posts = posts
                .iter()
                .map(|post| {
                    let mut post = post.clone();
                    if post.id == post_id {
                        post.likes_count += 1;
                    }
                    post
                })
                .collect();
            CachedValue::Single(Payload::PostList(posts))
        }
        other => other.clone(),
    };

    MutationPlan::new()
        .edit(query_key!["posts", "byId", post_id], bump)
        .edit(query_key!["posts", "recent"], bump)
        .invalidate(query_key!["posts"])
}

fn fixtures(source: &Arc<MockSource>) {
    source.put(
        query_key!["posts", "byId", 1],
        Payload::Post(Post::new(1, "sunrise", 5)),
    );
    source.put(
        query_key!["posts", "recent"],
        Payload::PostList(vec![Post::new(1, "sunrise", 5), Post::new(2, "lunch", 1)]),
    );
    source.put(
        query_key!["users", "top"],
        Payload::Profile(Profile::new(7, "ada", 120)),
    );
    source.put_feed(
        query_key!["feed", "home"],
        pages_of(vec![
            vec![Post::new(1, "sunrise", 5), Post::new(2, "lunch", 1)],
            vec![Post::new(2, "lunch", 1), Post::new(3, "dusk", 0)],
        ]),
    );
}

#[tokio::test(start_paused = true)]
async fn feed_likes_and_follows_stay_consistent() {
    let source = new_source();
    fixtures(&source);
    let cache = SwrCache::builder()
        .name("social")
        .source(Arc::clone(&source))
        .build()
        .unwrap();
    for prefix in [query_key!["posts"], query_key!["users"], query_key!["feed"]] {
        cache.register(prefix, quick_policy());
    }

    // Several views of post 1 are live at once.
    let post_view = cache.query(query_key!["posts", "byId", 1]).await.unwrap();
    let recent_view = cache.query(query_key!["posts", "recent"]).await.unwrap();
    assert_eq!(
        post_view.value().unwrap().as_single().unwrap().post().likes_count,
        5
    );

    // A like that the server rejects: both views bump, then both roll back.
    let rejected = cache
        .run_mutation(like_in_all_views(1), async {
            Err::<(), _>(MockError::network())
        })
        .await;
    assert!(rejected.is_err());
    assert_eq!(
        post_view.value().unwrap().as_single().unwrap().post().likes_count,
        5
    );
    assert_eq!(
        recent_view.value().unwrap().as_single().unwrap().post_list()[0].likes_count,
        5
    );

    // The server accepts the retry and counts 6; the optimistic guess shows
    // first, the invalidation cascade then lands server truth in every
    // subscribed view.
    source.put(
        query_key!["posts", "byId", 1],
        Payload::Post(Post::new(1, "sunrise", 6)),
    );
    source.put(
        query_key!["posts", "recent"],
        Payload::PostList(vec![Post::new(1, "sunrise", 6), Post::new(2, "lunch", 1)]),
    );
    cache
        .run_mutation(like_in_all_views(1), async { Ok::<(), MockError>(()) })
        .await
        .unwrap();
    assert_eq!(
        post_view.value().unwrap().as_single().unwrap().post().likes_count,
        6
    );
    settle().await;
    assert_eq!(
        recent_view.value().unwrap().as_single().unwrap().post_list()[0].likes_count,
        6
    );

    // Infinite feed: overlapping pages render each post once.
    let feed_key = query_key!["feed", "home"];
    cache.fetch_next_page(&feed_key).await.unwrap();
    cache.fetch_next_page(&feed_key).await.unwrap();
    let feed = cache.peek(&feed_key).unwrap().value.unwrap();
    let ids: Vec<i64> = feed.as_pages().unwrap().items().map(|post| post.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(cache.fetch_next_page(&feed_key).await.unwrap(), PageFetch::NoMorePages);

    // A follow only disturbs user views; the post caches stay warm.
    let top_users = cache.query(query_key!["users", "top"]).await.unwrap();
    let fetches_before = source.fetch_count();
    source.put(
        query_key!["users", "top"],
        Payload::Profile(Profile::new(7, "ada", 121)),
    );
    cache
        .run_mutation(
            MutationPlan::new().invalidate(query_key!["users"]),
            async { Ok::<(), MockError>(()) },
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        top_users.value().unwrap().as_single().unwrap().profile().followers,
        121
    );
    // Exactly one refetch happened, for the invalidated user view.
    assert_eq!(source.fetch_count(), fetches_before + 1);
    assert_eq!(
        cache.peek(&query_key!["posts", "byId", 1]).unwrap().status,
        QueryStatus::Success
    );

    cache.close().await;
    assert!(cache.peek(&query_key!["posts", "byId", 1]).is_none());
}

#[tokio::test(start_paused = true)]
async fn search_term_change_resets_pagination() {
    let source = new_source();
    let cache = SwrCache::builder()
        .source(Arc::clone(&source))
        .build()
        .unwrap();
    cache.register(
        query_key!["posts", "search"],
        QueryPolicy {
            stale_after: Duration::from_secs(120),
            retry: RetryPolicy::none(),
            ..QueryPolicy::default()
        },
    );

    let key = query_key!["posts", "search", "sun"];
    source.put_feed(
        key.clone(),
        pages_of(vec![vec![Post::new(1, "sunrise", 6), Post::new(4, "sunset", 9)]]),
    );

    cache.fetch_next_page(&key).await.unwrap();
    assert_eq!(
        cache
            .peek(&key)
            .unwrap()
            .value
            .unwrap()
            .as_pages()
            .unwrap()
            .item_count(),
        2
    );

    // The user keeps typing; the old term's pages are dropped and the fresh
    // term starts from page one.
    cache.reset_pages(&key);
    source.put_feed(
        key.clone(),
        pages_of(vec![vec![Post::new(4, "sunset", 9)]]),
    );
    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::Appended { appended: 1 }
    );
    let items: Vec<i64> = cache
        .peek(&key)
        .unwrap()
        .value
        .unwrap()
        .as_pages()
        .unwrap()
        .items()
        .map(|post| post.id)
        .collect();
    assert_eq!(items, vec![4]);
}
