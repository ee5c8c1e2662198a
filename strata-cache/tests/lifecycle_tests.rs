//! Entry lifecycle: retries, supersession, writes, invalidation, teardown.

use std::time::Duration;

use strata_cache::{CacheConfig, ClearOptions, QueryCache};
use strata_core::{CallbackKind, ExponentialBackoff, RetryDelay, ScopeOptions};
use strata_test_utils::assertions::{assert_fetch_failed, assert_status};
use strata_test_utils::fixtures::no_retry_layer;
use strata_test_utils::{
    init_test_tracing, CallbackRecorder, ConfigLayer, CountingFetcher, FailingFetcher,
    FlakyFetcher, GatedFetcher, QueryKey, QueryNotification, QueryStatus, ScopeStack,
};
use tokio::time::Instant;

async fn settle<V: Clone + Send + Sync + 'static>(cache: &QueryCache<V>, key: &str) {
    while cache.is_fetching(key).unwrap() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_count_is_honored_with_fixed_delay() {
    init_test_tracing();
    let fetcher = FailingFetcher::new("unreachable");
    let recorder = CallbackRecorder::<u32>::new();
    let cache = QueryCache::new(ScopeStack::with_base(
        recorder
            .layer()
            .with_shared_query_fn(fetcher.shared())
            .with_retry(3u32)
            .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(100))),
    ));

    let started = Instant::now();
    let result = cache.fetch_query("k", None, None).await;

    assert_fetch_failed(&result, "unreachable");
    assert_eq!(fetcher.calls(), 4);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let state = cache.get_query_state("k").unwrap().unwrap();
    assert_status(&state, QueryStatus::Error);
    assert_eq!(state.failure_count, 4);
    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.successes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_default_retry_uses_exponential_backoff() {
    let fetcher = FlakyFetcher::new(3, 9u32);
    let cache = QueryCache::new(ScopeStack::with_base(
        ConfigLayer::new().with_shared_query_fn(fetcher.shared()),
    ));

    let started = Instant::now();
    assert_eq!(cache.fetch_query("k", None, None).await.unwrap(), 9);

    // 1s + 2s + 4s between the four attempts.
    assert_eq!(fetcher.calls(), 4);
    assert!(started.elapsed() >= Duration::from_secs(7));
    let state = cache.get_query_state("k").unwrap().unwrap();
    assert_eq!(state.failure_count, 0);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_transitions_reach_subscribers() {
    let fetcher = FlakyFetcher::new(2, 1u32);
    let recorder = CallbackRecorder::<u32>::new();
    let cache = QueryCache::new(ScopeStack::with_base(
        ConfigLayer::new()
            .with_shared_query_fn(fetcher.shared())
            .with_retry(true)
            .with_retry_delay(RetryDelay::Exponential(ExponentialBackoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                multiplier: 2,
            })),
    ));
    cache.subscribe("k", recorder.subscriber()).unwrap();

    cache.fetch_query("k", None, None).await.unwrap();

    let failure_counts: Vec<u32> = recorder
        .notifications()
        .iter()
        .filter_map(|n| n.state().map(|s| s.failure_count))
        .collect();
    assert_eq!(
        recorder.statuses(),
        vec![
            Some(QueryStatus::Loading),
            Some(QueryStatus::Loading),
            Some(QueryStatus::Loading),
            Some(QueryStatus::Success),
        ]
    );
    assert_eq!(failure_counts, vec![0, 1, 2, 0]);
}

#[tokio::test]
async fn test_failure_keeps_previous_data() {
    let fetcher = FailingFetcher::new("down");
    let cache = QueryCache::new(ScopeStack::with_base(no_retry_layer(fetcher.shared::<String>())));

    cache.set_query_data("k", "cached".to_string()).unwrap();
    let result = cache.refetch("k", None).await;

    assert_fetch_failed(&result, "down");
    let state = cache.get_query_state("k").unwrap().unwrap();
    assert_status(&state, QueryStatus::Error);
    assert_eq!(state.data.as_deref(), Some("cached"));
    assert_eq!(state.error.map(|e| e.to_string()).as_deref(), Some("down"));
}

#[tokio::test]
async fn test_fetch_error_is_passed_through_unchanged() {
    #[derive(Debug)]
    struct Quota(u32);
    impl std::fmt::Display for Quota {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "quota exceeded: {}", self.0)
        }
    }
    impl std::error::Error for Quota {}

    let cache = QueryCache::<u32>::new(ScopeStack::with_base(ConfigLayer::new().with_retry(false)));
    let f = strata_core::query_fn(|_k: QueryKey| async { Err::<u32, _>(strata_core::FetchError::new(Quota(7))) });

    let err = cache.fetch_query("k", Some(f), None).await.unwrap_err();
    let source = err.fetch_error().unwrap();
    assert_eq!(source.downcast_ref::<Quota>().map(|q| q.0), Some(7));
}

#[tokio::test]
async fn test_callback_failures_are_isolated() {
    let fetcher = CountingFetcher::new(1u32);
    let cache = QueryCache::new(ScopeStack::with_base(
        no_retry_layer(fetcher.shared())
            .with_on_success(|_: &u32, _: &QueryKey| Err("rejected".into())),
    ));
    let mut errors = cache.callback_errors();
    cache
        .subscribe("k", |n: &QueryNotification<u32>| {
            if n.state().is_some_and(|s| s.is_success()) {
                panic!("subscriber blew up");
            }
        })
        .unwrap();

    assert_eq!(cache.fetch_query("k", None, None).await.unwrap(), 1);
    assert_status(&cache.get_query_state("k").unwrap().unwrap(), QueryStatus::Success);

    let first = errors.try_recv().unwrap();
    let second = errors.try_recv().unwrap();
    assert_eq!(first.kind, CallbackKind::Subscriber);
    assert!(first.message.contains("subscriber blew up"));
    assert_eq!(second.kind, CallbackKind::OnSuccess);
    assert_eq!(second.message, "rejected");
    assert_eq!(second.key, QueryKey::from("k"));
}

#[tokio::test]
async fn test_set_query_data_supersedes_in_flight_execution() {
    let fetcher = GatedFetcher::<String>::new();
    let recorder = CallbackRecorder::new();
    let cache = QueryCache::new(ScopeStack::with_base(
        no_retry_layer(fetcher.shared()).with_on_success(recorder.on_success()),
    ));

    let request = tokio::spawn({
        let cache = cache.clone();
        async move { cache.fetch_query("k", None, None).await }
    });
    fetcher.wait_for_calls(1).await;

    cache.set_query_data("k", "written".to_string()).unwrap();
    assert!(!cache.is_fetching("k").unwrap());
    fetcher.release("late".to_string());

    // The caller still gets its own execution's value.
    assert_eq!(request.await.unwrap().unwrap(), "late");
    assert_eq!(cache.get_query_data("k").unwrap(), Some("written".to_string()));
    assert!(recorder.successes().is_empty());
}

#[tokio::test]
async fn test_superseded_execution_does_not_overwrite_newer_one() {
    let fetcher = GatedFetcher::<String>::new();
    let recorder = CallbackRecorder::new();
    let cache = QueryCache::new(ScopeStack::with_base(
        no_retry_layer(fetcher.shared()).with_on_success(recorder.on_success()),
    ));

    let a = tokio::spawn({
        let cache = cache.clone();
        async move { cache.fetch_query("k", None, None).await }
    });
    fetcher.wait_for_calls(1).await;
    let b = tokio::spawn({
        let cache = cache.clone();
        async move { cache.refetch("k", None).await }
    });
    fetcher.wait_for_calls(2).await;

    fetcher.release_last("b".to_string());
    assert_eq!(b.await.unwrap().unwrap(), "b");
    fetcher.release("a".to_string());
    assert_eq!(a.await.unwrap().unwrap(), "a");

    assert_eq!(cache.get_query_data("k").unwrap(), Some("b".to_string()));
    assert_eq!(recorder.successes(), vec![(QueryKey::from("k"), "b".to_string())]);
}

#[tokio::test]
async fn test_prefetch_swallows_fetch_failures() {
    let fetcher = FailingFetcher::new("offline");
    let cache = QueryCache::<u32>::new(ScopeStack::with_base(no_retry_layer(fetcher.shared::<u32>())));

    cache.prefetch_query("k", None, None).await.unwrap();
    let state = cache.get_query_state("k").unwrap().unwrap();
    assert_status(&state, QueryStatus::Error);

    let missing = QueryCache::<u32>::new(ScopeStack::new());
    assert!(missing.prefetch_query("k", None, None).await.is_err());
}

#[tokio::test]
async fn test_invalidate_without_subscribers_marks_stale() {
    let fetcher = CountingFetcher::new(1u32);
    let cache = QueryCache::new(ScopeStack::with_base(
        no_retry_layer(fetcher.shared()).with_stale_time(Duration::from_secs(3600)),
    ));

    cache.fetch_query("k", None, None).await.unwrap();
    assert!(cache.invalidate("k").unwrap());
    assert!(!cache.invalidate("missing").unwrap());

    let state = cache.get_query_state("k").unwrap().unwrap();
    assert!(state.is_invalidated);
    assert_eq!(state.data, Some(1));
    assert!(!cache.is_fetching("k").unwrap());

    // Invalidated data is never fresh.
    cache.fetch_query("k", None, None).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    assert!(!cache.get_query_state("k").unwrap().unwrap().is_invalidated);
}

#[tokio::test]
async fn test_invalidate_refreshes_subscribed_entry() {
    let fetcher = CountingFetcher::new(1u32);
    let cache = QueryCache::new(ScopeStack::with_base(no_retry_layer(fetcher.shared())));
    let subscription = cache.subscribe("k", |_: &QueryNotification<u32>| {}).unwrap();

    cache.fetch_query("k", None, None).await.unwrap();
    assert!(cache.invalidate("k").unwrap());
    assert!(cache.is_fetching("k").unwrap());
    settle(&cache, "k").await;
    assert_eq!(fetcher.calls(), 2);

    assert!(cache.unsubscribe(&subscription).unwrap());
    cache.invalidate("k").unwrap();
    assert!(!cache.is_fetching("k").unwrap());
}

#[tokio::test]
async fn test_invalidate_refresh_can_be_disabled() {
    let fetcher = CountingFetcher::new(1u32);
    let cache = QueryCache::with_config(
        ScopeStack::with_base(no_retry_layer(fetcher.shared())),
        CacheConfig::new().with_refresh_on_invalidate(false),
    )
    .unwrap();
    cache.subscribe("k", |_: &QueryNotification<u32>| {}).unwrap();

    cache.fetch_query("k", None, None).await.unwrap();
    cache.invalidate("k").unwrap();
    assert!(!cache.is_fetching("k").unwrap());
}

#[test]
fn test_invalidate_outside_runtime_skips_refresh() {
    let cache = QueryCache::new(ScopeStack::with_base(no_retry_layer(
        CountingFetcher::new(1u32).shared(),
    )));
    cache.subscribe("k", |_: &QueryNotification<u32>| {}).unwrap();
    cache.set_query_data("k", 1).unwrap();

    assert!(cache.invalidate("k").unwrap());
    assert!(!cache.is_fetching("k").unwrap());
}

#[tokio::test]
async fn test_window_focus_refetches_stale_subscribed_entries() {
    let fetcher = CountingFetcher::new(1u32);
    let cache = QueryCache::new(ScopeStack::with_base(no_retry_layer(fetcher.shared())));
    cache.subscribe("watched", |_: &QueryNotification<u32>| {}).unwrap();

    cache.fetch_query("watched", None, None).await.unwrap();
    cache.fetch_query("unwatched", None, None).await.unwrap();

    assert_eq!(cache.on_window_focus().unwrap(), 1);
    settle(&cache, "watched").await;
    assert_eq!(fetcher.calls(), 3);

    {
        let _quiet = cache
            .scopes()
            .scope(ConfigLayer::new().with_refetch_on_window_focus(false))
            .unwrap();
        assert_eq!(cache.on_window_focus().unwrap(), 0);
    }
    {
        let _fresh = cache
            .scopes()
            .scope(ConfigLayer::new().with_stale_time(Duration::from_secs(3600)))
            .unwrap();
        assert_eq!(cache.on_window_focus().unwrap(), 0);
    }
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_silent_clear_skips_subscribers() {
    let fetcher = CountingFetcher::new(1u32);
    let recorder = CallbackRecorder::new();
    let cache = QueryCache::new(ScopeStack::with_base(no_retry_layer(fetcher.shared())));
    cache.subscribe("k", recorder.subscriber()).unwrap();

    cache.fetch_query("k", None, None).await.unwrap();
    let before = recorder.notifications().len();

    assert_eq!(cache.clear(ClearOptions::silent()).unwrap(), 1);
    assert_eq!(recorder.notifications().len(), before);
    assert!(cache.is_empty().unwrap());
    assert!(cache.get_query_state("k").unwrap().is_none());

    // Starts over from Idle.
    let fresh = CallbackRecorder::new();
    cache.subscribe("k", fresh.subscriber()).unwrap();
    cache.fetch_query("k", None, None).await.unwrap();
    assert_eq!(
        fresh.statuses(),
        vec![Some(QueryStatus::Loading), Some(QueryStatus::Success)]
    );
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_clear_and_remove_notify_removal() {
    let cache = QueryCache::<u32>::new(ScopeStack::new());
    let recorder = CallbackRecorder::new();
    cache.subscribe("a", recorder.subscriber()).unwrap();
    cache.subscribe("b", recorder.subscriber()).unwrap();

    assert!(cache.remove_query("a").unwrap());
    assert!(!cache.remove_query("a").unwrap());
    assert_eq!(cache.clear(ClearOptions::default()).unwrap(), 1);

    let removed: Vec<QueryKey> = recorder
        .notifications()
        .iter()
        .filter_map(|n| match n {
            QueryNotification::Removed(key) => Some(key.clone()),
            QueryNotification::Updated(_) => None,
        })
        .collect();
    assert_eq!(removed, vec![QueryKey::from("a"), QueryKey::from("b")]);
}

#[tokio::test]
async fn test_clear_discards_in_flight_settlement() {
    let fetcher = GatedFetcher::<u32>::new();
    let recorder = CallbackRecorder::new();
    let cache = QueryCache::new(ScopeStack::with_base(
        no_retry_layer(fetcher.shared()).with_on_success(recorder.on_success()),
    ));

    let request = tokio::spawn({
        let cache = cache.clone();
        async move { cache.fetch_query("k", None, None).await }
    });
    fetcher.wait_for_calls(1).await;
    cache.clear(ClearOptions::silent()).unwrap();
    fetcher.release(5);

    assert_eq!(request.await.unwrap().unwrap(), 5);
    assert!(cache.get_query_data("k").unwrap().is_none());
    assert!(recorder.successes().is_empty());
}

#[tokio::test]
async fn test_unsubscribed_callback_stops_receiving() {
    let cache = QueryCache::<u32>::new(ScopeStack::new());
    let recorder = CallbackRecorder::new();
    let subscription = cache.subscribe("k", recorder.subscriber()).unwrap();

    cache.set_query_data("k", 1).unwrap();
    assert!(cache.unsubscribe(&subscription).unwrap());
    assert!(!cache.unsubscribe(&subscription).unwrap());
    cache.set_query_data("k", 2).unwrap();

    assert_eq!(recorder.notifications().len(), 1);
    assert_eq!(cache.get_query_data("k").unwrap(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_option_documents_configure_a_scope() {
    let fetcher = FailingFetcher::new("down");
    let cache = QueryCache::<u32>::new(ScopeStack::with_base(
        ConfigLayer::new().with_shared_query_fn(fetcher.shared::<u32>()),
    ));

    let document = r#"{ "queries": { "retry": 1, "retryDelay": 5, "staleTime": null } }"#;
    let layer = ScopeOptions::from_json_str(document)
        .unwrap()
        .into_layer::<u32>()
        .unwrap();
    let _scope = cache.scopes().scope(layer).unwrap();

    assert!(cache.fetch_query("k", None, None).await.is_err());
    assert_eq!(fetcher.calls(), 2);
}

#[test]
fn test_zero_error_capacity_is_rejected() {
    let result = QueryCache::<u32>::with_config(
        ScopeStack::new(),
        CacheConfig::new().with_error_channel_capacity(0),
    );
    assert!(matches!(result, Err(strata_core::StrataError::Config(_))));
}

#[tokio::test]
async fn test_panicking_fetch_settles_entry_as_failed() {
    let recorder = CallbackRecorder::<u32>::new();
    let cache = QueryCache::<u32>::new(ScopeStack::with_base(
        recorder.layer().with_retry(false),
    ));
    cache.subscribe("k", recorder.subscriber()).unwrap();
    let boom = strata_core::query_fn(|_k: QueryKey| async {
        if true {
            panic!("fetch exploded");
        }
        Ok::<u32, strata_core::FetchError>(0)
    });

    let result = cache.fetch_query("k", Some(boom), None).await;
    assert_fetch_failed(&result, "fetch function panicked: fetch exploded");
    assert!(!cache.is_fetching("k").unwrap());
    assert_status(&cache.get_query_state("k").unwrap().unwrap(), QueryStatus::Error);

    // Settles like any failure: one on_error, subscribers see Loading then Error.
    assert_eq!(
        recorder.errors(),
        vec![(QueryKey::from("k"), "fetch function panicked: fetch exploded".to_string())]
    );
    assert!(recorder.successes().is_empty());
    assert_eq!(
        recorder.statuses(),
        vec![Some(QueryStatus::Loading), Some(QueryStatus::Error)]
    );

    // The entry is usable again.
    let ok = CountingFetcher::new(4u32);
    assert_eq!(cache.fetch_query("k", Some(ok.shared()), None).await.unwrap(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_fetch_is_retried_by_policy() {
    let recorder = CallbackRecorder::<u32>::new();
    let cache = QueryCache::<u32>::new(ScopeStack::with_base(
        recorder
            .layer()
            .with_retry(2u32)
            .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(5))),
    ));
    let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&attempts);
    let boom = strata_core::query_fn(move |_k: QueryKey| {
        let counter = std::sync::Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                panic!("flaky panic");
            }
            Ok::<u32, strata_core::FetchError>(9)
        }
    });

    assert_eq!(cache.fetch_query("k", Some(boom), None).await.unwrap(), 9);
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert!(recorder.errors().is_empty());
    assert_eq!(recorder.successes(), vec![(QueryKey::from("k"), 9)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notifications_stay_ordered_across_workers() {
    for iteration in 0..500 {
        let recorder = CallbackRecorder::<u32>::new();
        let fetcher = CountingFetcher::new(1u32);
        let cache = QueryCache::new(ScopeStack::with_base(no_retry_layer(fetcher.shared())));
        cache.subscribe("k", recorder.subscriber()).unwrap();

        cache.fetch_query("k", None, None).await.unwrap();

        assert_eq!(
            recorder.statuses(),
            vec![Some(QueryStatus::Loading), Some(QueryStatus::Success)],
            "iteration {iteration}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_deliver_final_state_last() {
    let recorder = CallbackRecorder::<u32>::new();
    let cache = QueryCache::<u32>::new(ScopeStack::new());
    cache.subscribe("k", recorder.subscriber()).unwrap();

    let writers: Vec<_> = (0..16u32)
        .map(|n| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    cache.set_query_data("k", n * 100 + i).unwrap();
                    if i % 10 == 0 {
                        cache.invalidate("k").unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let last = recorder
        .notifications()
        .last()
        .and_then(|n| n.state().cloned())
        .unwrap();
    let state = cache.get_query_state("k").unwrap().unwrap();
    assert_eq!(last.data, state.data);
    assert_eq!(last.is_invalidated, state.is_invalidated);
}
