//! Concurrency and thread safety tests for the resilience layer

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use outreach::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DependencyPolicy,
    GuardError, RateLimitConfig, RateLimiter, RateLimiterRegistry, ResilientInvoker,
    TransportError,
};

#[test]
fn concurrent_get_or_create_yields_one_breaker() {
    let registry = Arc::new(CircuitBreakerRegistry::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get_or_create("llm-provider"))
        })
        .collect();

    let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let first = &breakers[0];
    for (i, breaker) in breakers.iter().enumerate().skip(1) {
        assert!(
            Arc::ptr_eq(first, breaker),
            "Thread {i} got a different breaker instance",
        );
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn concurrent_get_or_create_yields_one_limiter() {
    let registry = Arc::new(RateLimiterRegistry::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get_or_create("places-api"))
        })
        .collect();

    let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(limiters.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(registry.all_stats().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn breaker_counters_stay_consistent_under_contention() {
    let breaker = Arc::new(CircuitBreaker::new(
        "datastore",
        CircuitBreakerConfig::default().with_failure_threshold(u32::MAX),
    ));

    let tasks: Vec<_> = (0..200u32)
        .map(|i| {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                let _ = breaker
                    .execute(|| async move {
                        if i % 2 == 0 {
                            Ok(())
                        } else {
                            Err(TransportError::Timeout("slow".into()))
                        }
                    })
                    .await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 200);
    assert_eq!(stats.total_successes, 100);
    assert_eq!(stats.total_failures, 100);
    assert_eq!(stats.state, CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn breaker_opens_exactly_once_under_concurrent_failures() {
    let breaker = Arc::new(CircuitBreaker::new(
        "payments",
        CircuitBreakerConfig::default()
            .with_failure_threshold(5)
            .with_open_timeout(Duration::from_secs(60)),
    ));
    let invoked = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            let invoked = Arc::clone(&invoked);
            tokio::spawn(async move {
                let _ = breaker
                    .execute(|| {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(TransportError::from_status(500, "boom")) }
                    })
                    .await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    let stats = breaker.stats();
    assert_eq!(stats.state, CircuitState::Open);
    // Every call was either invoked or rejected, never both.
    assert_eq!(
        u64::from(invoked.load(Ordering::SeqCst)) + stats.total_rejections,
        50
    );
    assert_eq!(stats.total_failures, u64::from(invoked.load(Ordering::SeqCst)));
    assert!(stats.total_failures >= 5);
    // Only the failures admitted before the trip count toward it; later ones cannot re-trip.
    assert_eq!(stats.consecutive_failures, 5);
    assert!(stats.next_attempt_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquirers_never_exceed_the_window() {
    let limiter = Arc::new(RateLimiter::new(
        "llm-provider",
        RateLimitConfig::default()
            .with_max_requests(3)
            .with_window(Duration::from_secs(1)),
    ));

    let tasks: Vec<_> = (0..9)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(1).await.unwrap();
                tokio::time::Instant::now()
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for task in tasks {
        admitted.push(task.await.unwrap());
    }
    admitted.sort();

    // Any four consecutive admissions must span at least one full window.
    for window in admitted.windows(4) {
        assert!(window[3] - window[0] >= Duration::from_secs(1));
    }
    assert_eq!(limiter.stats().total_admitted, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_invoker_isolates_dependencies() {
    let invoker = Arc::new(ResilientInvoker::new(
        DependencyPolicy::default()
            .without_rate_limit()
            .with_breaker(CircuitBreakerConfig::default().with_failure_threshold(1))
            .with_retry(outreach::RetryConfig::default().with_max_retries(0)),
    ));

    let failing = {
        let invoker = Arc::clone(&invoker);
        tokio::spawn(async move {
            let result: Result<(), GuardError<TransportError>> = invoker
                .run_guarded("places-api", 1, || async {
                    Err(TransportError::from_status(503, "down"))
                })
                .await;
            result
        })
    };
    let healthy = {
        let invoker = Arc::clone(&invoker);
        tokio::spawn(async move {
            let result: Result<u32, GuardError<TransportError>> = invoker
                .run_guarded("datastore", 1, || async { Ok(7) })
                .await;
            result
        })
    };

    assert!(matches!(
        failing.await.unwrap(),
        Err(GuardError::RetryExhausted { attempts: 1, .. })
    ));
    assert_eq!(healthy.await.unwrap().unwrap(), 7);

    assert!(!invoker.breakers().is_healthy("places-api"));
    assert!(invoker.breakers().is_healthy("datastore"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_a_rate_limit_wait() {
    use tokio_util::sync::CancellationToken;

    let invoker = Arc::new(ResilientInvoker::new(DependencyPolicy::default().with_rate_limit(
        RateLimitConfig::default()
            .with_max_requests(1)
            .with_window(Duration::from_secs(60)),
    )));

    invoker
        .run_guarded("llm-provider", 1, || async { Ok::<_, TransportError>(()) })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let invoked = Arc::new(AtomicU32::new(0));
    let waiting = {
        let invoker = Arc::clone(&invoker);
        let token = token.clone();
        let invoked = Arc::clone(&invoked);
        tokio::spawn(async move {
            invoker
                .run_guarded_with_cancel("llm-provider", 1, &token, || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, TransportError>(()) }
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();

    assert!(matches!(waiting.await.unwrap(), Err(GuardError::Cancelled)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    let (_, stats) = &invoker.rate_limit_stats()[0];
    assert_eq!(stats.requests_in_window, 1);
    assert_eq!(invoker.stats("llm-provider").unwrap().total_calls, 1);
}
