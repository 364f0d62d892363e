#![cfg(test)]

use super::source::*;
use crate::prelude::*;
use crate::query_key;
use std::sync::Arc;
use tokio::sync::oneshot;

fn bump_likes(value: &CachedValue<MockSource>) -> CachedValue<MockSource> {
    match value {
        CachedValue::Single(Payload::Post(post)) => {
            let mut post = post.clone();
            post.likes_count += 1;
            CachedValue::Single(Payload::Post(post))
        }
        other => other.clone(),
    }
}

#[tokio::test]
async fn failed_like_rolls_back_to_pre_mutation_value() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["posts"], quick_policy());
    let key = query_key!["posts", "byId", 1];
    source.put(key.clone(), Payload::Post(Post::new(1, "sunset", 5)));
    cache.ensure_fresh(&key).await.unwrap();

    let plan = MutationPlan::new().edit(key.clone(), bump_likes);
    let observer = Arc::clone(&cache);
    let observed_key = key.clone();
    let result = cache
        .run_mutation(plan, async move {
            // Read-your-writes: the optimistic bump is visible while the
            // request is in flight.
            let in_flight = observer
                .peek(&observed_key)
                .unwrap()
                .value
                .unwrap();
            assert_eq!(in_flight.as_single().unwrap().post().likes_count, 6);
            Err::<(), _>(MockError::network())
        })
        .await;

    assert!(matches!(result, Err(CacheError::Mutation { .. })));
    let rolled_back = cache.peek(&key).unwrap().value.unwrap();
    assert_eq!(rolled_back.as_single().unwrap().post().likes_count, 5);
}

#[tokio::test(start_paused = true)]
async fn successful_like_is_superseded_by_server_truth() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["posts"], quick_policy());
    let key = query_key!["posts", "byId", 1];
    source.put(key.clone(), Payload::Post(Post::new(1, "sunset", 5)));

    let _subscription = cache.query(key.clone()).await.unwrap();

    // The server counts differently than the optimistic guess.
    source.put(key.clone(), Payload::Post(Post::new(1, "sunset", 9)));

    let plan = MutationPlan::new()
        .edit(key.clone(), bump_likes)
        .invalidate(key.clone());
    cache
        .run_mutation(plan, async { Ok::<(), MockError>(()) })
        .await
        .unwrap();

    // Optimistic value first, authoritative refetch after.
    let optimistic = cache.peek(&key).unwrap().value.unwrap();
    assert_eq!(optimistic.as_single().unwrap().post().likes_count, 6);

    settle().await;
    let confirmed = cache.peek(&key).unwrap().value.unwrap();
    assert_eq!(confirmed.as_single().unwrap().post().likes_count, 9);
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn entries_without_values_are_not_snapshotted() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["posts"], quick_policy());
    let key = query_key!["posts", "byId", 404];

    let plan = MutationPlan::new().edit(key.clone(), bump_likes);
    let result = cache
        .run_mutation(plan, async { Err::<(), _>(MockError::network()) })
        .await;

    assert!(matches!(result, Err(CacheError::Mutation { .. })));
    // The transform never ran, and rollback did not materialize an entry.
    assert!(cache.peek(&key).is_none());
}

#[tokio::test]
async fn mutation_states_progress_to_settled() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["posts"], quick_policy());
    let key = query_key!["posts", "byId", 2];
    source.put(key.clone(), Payload::Post(Post::new(2, "dawn", 0)));
    cache.ensure_fresh(&key).await.unwrap();

    let ok = cache.mutation(MutationPlan::new().edit(key.clone(), bump_likes));
    assert_eq!(ok.state(), MutationState::Pending);
    ok.run(async { Ok::<(), MockError>(()) }).await.unwrap();
    assert_eq!(ok.state(), MutationState::SettledOk);

    let failing = cache.mutation(MutationPlan::new().edit(key.clone(), bump_likes));
    let _ = failing.run(async { Err::<(), _>(MockError::network()) }).await;
    assert_eq!(failing.state(), MutationState::SettledErr);
}

// Two overlapping mutations on one key: each rollback restores the value seen
// at its own start, so the second mutation's failure resurrects the first
// mutation's optimistic bump even though that one failed too. Documented
// behavior, not a desirable one.
#[tokio::test]
async fn racing_rollbacks_restore_their_own_snapshots() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["posts"], quick_policy());
    let key = query_key!["posts", "byId", 3];
    source.put(key.clone(), Payload::Post(Post::new(3, "race", 5)));
    cache.ensure_fresh(&key).await.unwrap();

    let (fail_first, first_gate) = oneshot::channel::<()>();
    let (fail_second, second_gate) = oneshot::channel::<()>();

    let first = cache.mutation(MutationPlan::new().edit(key.clone(), bump_likes));
    let first_task = tokio::spawn(async move {
        first
            .run(async move {
                let _ = first_gate.await;
                Err::<(), _>(MockError::network())
            })
            .await
    });
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    // First optimistic edit applied: 5 -> 6.
    assert_eq!(
        cache.peek(&key).unwrap().value.unwrap().as_single().unwrap().post().likes_count,
        6
    );

    let second = cache.mutation(MutationPlan::new().edit(key.clone(), bump_likes));
    let second_task = tokio::spawn(async move {
        second
            .run(async move {
                let _ = second_gate.await;
                Err::<(), _>(MockError::network())
            })
            .await
    });
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    // Second edit stacked on the first: 6 -> 7.
    assert_eq!(
        cache.peek(&key).unwrap().value.unwrap().as_single().unwrap().post().likes_count,
        7
    );

    // First mutation fails and restores its snapshot: back to 5.
    fail_first.send(()).unwrap();
    let _ = first_task.await.unwrap();
    assert_eq!(
        cache.peek(&key).unwrap().value.unwrap().as_single().unwrap().post().likes_count,
        5
    );

    // Second mutation fails and restores the value it saw at start: 6, the
    // first mutation's optimistic guess, not server truth.
    fail_second.send(()).unwrap();
    let _ = second_task.await.unwrap();
    assert_eq!(
        cache.peek(&key).unwrap().value.unwrap().as_single().unwrap().post().likes_count,
        6
    );
}

#[tokio::test]
async fn page_entries_take_optimistic_edits_too() {
    let source = new_source();
    let cache = new_cache(&source);
    cache.register(query_key!["feed"], quick_policy());
    let key = query_key!["feed", "home"];
    source.put_feed(
        key.clone(),
        pages_of(vec![vec![Post::new(1, "a", 5), Post::new(2, "b", 0)]]),
    );
    cache.fetch_next_page(&key).await.unwrap();

    let plan = MutationPlan::new().edit(key.clone(), |value| match value {
        CachedValue::Pages(pages) => {
            let mut out = PageSet::new();
            for page in pages.pages() {
                let items = page
                    .items
                    .iter()
                    .map(|post| {
                        let mut post = post.clone();
                        if post.id == 1 {
                            post.likes_count += 1;
                        }
                        post
                    })
                    .collect();
                out.push(Page::new(items, page.next_cursor.clone()));
            }
            CachedValue::Pages(out)
        }
        other => other.clone(),
    });

    cache
        .run_mutation(plan, async { Ok::<(), MockError>(()) })
        .await
        .unwrap();

    let pages = cache.peek(&key).unwrap().value.unwrap();
    let pages = pages.as_pages().unwrap();
    assert_eq!(pages.items().find(|p| p.id == 1).unwrap().likes_count, 6);
    assert_eq!(pages.items().find(|p| p.id == 2).unwrap().likes_count, 0);
}
