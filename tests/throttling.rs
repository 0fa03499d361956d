use futures_util::future::join_all;
use idemio_mediation::eip::throttle::{ThrottleMode, Throttler};
use idemio_mediation::exchange::{Exchange, ExchangeError, Message};
use idemio_mediation::exchange::properties::THROTTLED_FOR;
use idemio_mediation::expression::{constant, header};
use idemio_mediation::processor::Executable;
use idemio_mediation::route::Route;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

fn throttled_route(rate: u64, period: Duration, completions: Arc<Mutex<Vec<Instant>>>) -> Route {
    let throttler = Throttler::builder("burst", constant(rate))
        .period(period)
        .mode(ThrottleMode::AsyncDelayed)
        .runtime(Handle::current())
        .build();
    Route::builder("throttled")
        .step(throttler.into_executable())
        .step(Executable::from_fn("record", move |_| {
            completions.lock().push(Instant::now());
            Ok(())
        }))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_per_period_spaces_a_burst() {
    let completions = Arc::new(Mutex::new(Vec::new()));
    let route = throttled_route(1, Duration::from_millis(100), completions.clone());

    let started = Instant::now();
    let sent: Vec<_> = (0..6).map(|_| route.send(Exchange::new())).collect();
    let results = join_all(sent).await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 6);
    for result in results {
        assert!(!result.unwrap().is_failed());
    }
    assert!(elapsed >= Duration::from_millis(500), "took {:?}", elapsed);
    assert_eq!(completions.lock().len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_never_exceeds_rate_within_a_window() {
    let period = Duration::from_millis(100);
    let completions = Arc::new(Mutex::new(Vec::new()));
    let route = throttled_route(2, period, completions.clone());

    let started = Instant::now();
    let results = join_all((0..10).map(|_| route.send(Exchange::new()))).await;
    assert!(results.into_iter().all(|result| !result.unwrap().is_failed()));
    assert!(started.elapsed() >= Duration::from_millis(400));

    let mut times = completions.lock().clone();
    assert_eq!(times.len(), 10);
    times.sort();
    // Any three consecutive completions span at least one period, minus
    // scheduling jitter on the earlier one.
    for window in times.windows(3) {
        let span = window[2].duration_since(window[0]);
        assert!(span >= period - Duration::from_millis(40), "span {:?}", span);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_correlated_groups_are_throttled_separately() {
    let throttler = Throttler::builder("per-tenant", constant(1))
        .period(Duration::from_secs(60))
        .mode(ThrottleMode::AsyncDelayed)
        .correlation(header("tenant"))
        .build();
    let route = Route::builder("tenants")
        .step(throttler.into_executable())
        .build();

    for tenant in ["a", "b", "c"] {
        let exchange = route
            .send(Exchange::with_message(Message::new(1).with_header("tenant", tenant)))
            .await
            .unwrap();
        assert!(!exchange.is_failed());
        assert!(exchange.properties().get::<Duration>(THROTTLED_FOR).is_none());
    }

    let missing = route.send(Exchange::new()).await.unwrap();
    assert!(matches!(
        missing.failure(),
        Some(ExchangeError::MissingCorrelationKey { .. })
    ));
}
