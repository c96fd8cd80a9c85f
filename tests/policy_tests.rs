//! Integration tests exercising [`Policy`] end-to-end against
//! [`InMemoryBackend`], covering the scenarios called out as testable
//! properties in `spec.md` §8.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cache_policy::{
    CacheBackend, GenerateFuture, GenerateOutcome, GenerateTimeout, InMemoryBackend, Key, Policy,
    RuleOptions, StaleIn,
};

fn counting_generator(
    delay: Duration,
) -> (Arc<AtomicU64>, Arc<dyn Fn(Key) -> GenerateFuture<String> + Send + Sync>) {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    let generate_func: Arc<dyn Fn(Key) -> GenerateFuture<String> + Send + Sync> = Arc::new(move |_key| {
        let calls = Arc::clone(&counter);
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            GenerateOutcome::ok(format!("value-{n}"), None)
        })
    });
    (calls, generate_func)
}

#[tokio::test]
async fn concurrent_gets_for_the_same_id_coalesce_onto_one_generation() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let (calls, generate_func) = counting_generator(Duration::from_millis(100));

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_secs(60));
    options.generate_func = Some(generate_func);
    options.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(5)));

    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let policy = policy.clone();
        handles.push(tokio::spawn(async move { policy.get("k".into()).await }));
    }

    let mut values = Vec::new();
    for h in handles {
        let outcome = h.await.unwrap();
        assert!(outcome.error.is_none());
        values.push(outcome.value.unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "generator must run exactly once");
    assert!(values.iter().all(|v| v == &values[0]), "all callers see the same generation");
    assert_eq!(policy.stats().generates, 1);
}

#[tokio::test]
async fn fresh_entry_is_served_without_invoking_the_generator() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let (calls, generate_func) = counting_generator(Duration::ZERO);

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_secs(60));
    options.generate_func = Some(generate_func);
    options.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(5)));

    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    let first = policy.get("k".into()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = policy.get("k".into()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second get must be a fresh hit, not a regeneration");
    assert_eq!(first.value, second.value);

    let stats = policy.stats();
    assert_eq!(stats.gets, 2);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn stale_entry_is_served_immediately_once_stale_timeout_elapses() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let (calls, generate_func) = counting_generator(Duration::from_secs(5));

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_secs(60));
    options.stale_in = Some(StaleIn::Millis(Duration::from_millis(50)));
    options.stale_timeout = Some(Duration::from_millis(100));
    options.generate_func = Some(generate_func);
    options.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(10)));

    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    let primed = policy.get("k".into()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(75)).await;

    let started = std::time::Instant::now();
    let stale = policy.get("k".into()).await;
    let waited = started.elapsed();

    assert_eq!(stale.value, primed.value, "stale fallback serves the previously cached value");
    assert!(waited >= Duration::from_millis(90) && waited < Duration::from_millis(400), "waited={waited:?}");
    assert_eq!(policy.stats().stales, 1);
}

#[tokio::test]
async fn a_newer_generation_cycle_is_not_hijacked_by_a_stale_cycles_late_generator() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    // Call #1 (the stale cycle's generator) finishes *after* call #2 (the
    // next cycle's own generator) has already started but *before* call #2
    // finishes, so call #1's late completion has a chance to race call #2's
    // still-open pending entry.
    let generate_func: Arc<dyn Fn(Key) -> GenerateFuture<String> + Send + Sync> = Arc::new(move |_key| {
        let calls = Arc::clone(&counter);
        Box::pin(async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(if n == 1 { Duration::from_millis(150) } else { Duration::from_millis(250) }).await;
            GenerateOutcome::ok(format!("value-{n}"), None)
        })
    });

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_millis(80));
    options.stale_in = Some(StaleIn::Millis(Duration::from_millis(15)));
    options.stale_timeout = Some(Duration::from_millis(20));
    options.generate_func = Some(generate_func);
    // Disabled so the second (miss) cycle has no fallback timer of its own
    // and depends solely on its own generator completing.
    options.generate_timeout = Some(GenerateTimeout::Disabled);

    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    policy.set(Key::Scalar("k".into()), "primed".into(), Some(Duration::from_millis(80))).await.unwrap();

    // get A: a stale hit. Its stale-fallback resolves quickly while its
    // generator (call #1) keeps running in the background.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let a = policy.get("k".into()).await;
    assert_eq!(a.value.as_deref(), Some("primed"));

    // Wait past the backend entry's real ttl so the next get is a genuine
    // miss (not another stale hit), starting a brand-new cycle (call #2)
    // while call #1 is still in flight.
    tokio::time::sleep(Duration::from_millis(65)).await;

    let started = std::time::Instant::now();
    let b = policy.get("k".into()).await;
    let waited = started.elapsed();

    assert_eq!(
        b.value.as_deref(),
        Some("value-2"),
        "get B must resolve with its own cycle's generated value, not the earlier \
         cycle's late generator result hijacking its pending entry"
    );
    assert!(
        waited >= Duration::from_millis(200),
        "get B must wait for its own generator (call #2, ~250ms) rather than being \
         resolved early by call #1 completing at ~150ms; waited={waited:?}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn miss_surfaces_server_timeout_when_the_generator_outlasts_generate_timeout() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let (_calls, generate_func) = counting_generator(Duration::from_secs(5));

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_secs(60));
    options.generate_func = Some(generate_func);
    options.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_millis(50)));

    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    let started = std::time::Instant::now();
    let outcome = policy.get("k".into()).await;
    let waited = started.elapsed();

    assert!(outcome.value.is_none());
    assert!(matches!(outcome.error, Some(cache_policy::PolicyError::ServerTimeout)));
    assert!(waited < Duration::from_millis(300), "waited={waited:?}");
}

#[tokio::test]
async fn drop_on_error_evicts_a_stale_entry_and_suppresses_the_stale_fallback() {
    let backend = Arc::new(InMemoryBackend::<String>::new());

    let generate_func: Arc<dyn Fn(Key) -> GenerateFuture<String> + Send + Sync> = Arc::new(|_key| {
        Box::pin(async {
            GenerateOutcome::err(cache_policy::PolicyError::Generate("boom".into()))
        })
    });

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_secs(60));
    options.stale_in = Some(StaleIn::Millis(Duration::from_millis(10)));
    options.stale_timeout = Some(Duration::from_millis(20));
    options.generate_func = Some(generate_func);
    options.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(5)));
    options.drop_on_error = Some(true);

    let policy: Policy<String> = Policy::new(options, Some(backend.clone()), "seg").unwrap();

    policy
        .set(Key::Scalar("k".into()), "primed".into(), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = policy.get("k".into()).await;
    assert!(outcome.value.is_none(), "dropOnError must not surface the stale value");
    assert!(outcome.error.is_some());

    assert!(backend.get("seg", "k").await.unwrap().is_none(), "entry must have been dropped");
}

#[tokio::test]
async fn drop_on_error_false_surfaces_the_stale_value_alongside_the_error() {
    let backend = Arc::new(InMemoryBackend::<String>::new());

    let generate_func: Arc<dyn Fn(Key) -> GenerateFuture<String> + Send + Sync> = Arc::new(|_key| {
        Box::pin(async {
            GenerateOutcome::err(cache_policy::PolicyError::Generate("boom".into()))
        })
    });

    let mut options: RuleOptions<String> = RuleOptions::default();
    options.expires_in = Some(Duration::from_secs(60));
    options.stale_in = Some(StaleIn::Millis(Duration::from_millis(10)));
    options.stale_timeout = Some(Duration::from_millis(500));
    options.generate_func = Some(generate_func);
    options.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(5)));
    options.drop_on_error = Some(false);

    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    policy
        .set(Key::Scalar("k".into()), "primed".into(), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = policy.get("k".into()).await;
    assert_eq!(outcome.value.as_deref(), Some("primed"));
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn set_then_get_round_trips_through_the_policy() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let options: RuleOptions<String> = RuleOptions::default();
    let policy: Policy<String> = Policy::new(options, Some(backend), "seg").unwrap();

    policy.set("k".into(), "v".into(), Some(Duration::from_secs(30))).await.unwrap();
    let outcome = policy.get("k".into()).await;
    assert_eq!(outcome.value.as_deref(), Some("v"));
    assert!(outcome.cached.is_some());

    policy.drop("k".into()).await.unwrap();
    let after_drop = policy.get("k".into()).await;
    assert!(after_drop.value.is_none());
}

#[tokio::test]
async fn empty_rule_with_no_backend_always_misses_without_erroring() {
    let options: RuleOptions<String> = RuleOptions::default();
    let policy: Policy<String> = Policy::new(options, None, "seg").unwrap();

    let outcome = policy.get("k".into()).await;
    assert!(outcome.value.is_none());
    assert!(outcome.error.is_none());
    assert!(!policy.is_ready().await);
}

#[tokio::test]
async fn rules_hot_swap_applies_to_subsequent_gets() {
    let backend = Arc::new(InMemoryBackend::<String>::new());
    let (calls_a, generate_a) = counting_generator(Duration::ZERO);

    let mut options_a: RuleOptions<String> = RuleOptions::default();
    options_a.expires_in = Some(Duration::from_secs(60));
    options_a.generate_func = Some(generate_a);
    options_a.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(5)));

    let policy: Policy<String> = Policy::new(options_a, Some(backend), "seg").unwrap();
    policy.get("k".into()).await;
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);

    let (calls_b, generate_b) = counting_generator(Duration::ZERO);
    let mut options_b: RuleOptions<String> = RuleOptions::default();
    options_b.expires_in = Some(Duration::from_secs(60));
    options_b.generate_func = Some(generate_b);
    options_b.generate_timeout = Some(GenerateTimeout::Millis(Duration::from_secs(5)));
    policy.rules(options_b).unwrap();

    policy.drop("k".into()).await.unwrap();
    policy.get("other".into()).await;
    assert_eq!(calls_b.load(Ordering::SeqCst), 1, "hot-swapped rule's generator must run for new ids");
}
