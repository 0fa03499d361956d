use async_trait::async_trait;
use futures_util::future::join_all;
use idemio_mediation::config::EngineConfig;
use idemio_mediation::context::{ContextState, MediationContext, ShutdownResult};
use idemio_mediation::eip::throttle::{RejectionPolicy, ThrottleMode, Throttler};
use idemio_mediation::exchange::{Exchange, ExchangeError, Message};
use idemio_mediation::expression::constant;
use idemio_mediation::processor::handler::{Handler, HandlerProcessor};
use idemio_mediation::processor::{AsyncCallback, AsyncProcessor, Executable, ProcessorError};
use idemio_mediation::route::{
    ChannelConsumer, Consumer, ConsumerStatus, InFlightScope, Route, RoutePolicy,
    ThrottlingInFlightRoutePolicy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;

struct Sleep {
    duration: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Sleep {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Handler for Sleep {
    async fn exec(&self, _exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// Drops the exchange together with its callback.
struct Lose;

impl AsyncProcessor for Lose {
    fn process_async(&self, _exchange: Exchange, _callback: AsyncCallback) -> bool {
        false
    }

    fn name(&self) -> &str {
        "lose"
    }
}

/// Holds the exchange on a plain thread and hands it back after `delay`,
/// ignoring cancellation.
struct Park {
    delay: Duration,
}

impl AsyncProcessor for Park {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            callback.done(exchange, false);
        });
        false
    }

    fn name(&self) -> &str {
        "park"
    }
}

/// Records the highest per-route in-flight count seen at admission.
#[derive(Default)]
struct PeakInFlight {
    peak: AtomicUsize,
}

impl RoutePolicy for PeakInFlight {
    fn on_exchange_begin(&self, route: &Route, _exchange: &mut Exchange) {
        let current = route.inflight().route_count(route.id());
        self.peak.fetch_max(current, Ordering::SeqCst);
    }
}

fn with_listeners(count: usize) -> (Exchange, Vec<Arc<AtomicUsize>>) {
    let mut exchange = Exchange::new();
    let counters: Vec<_> = (0..count).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for counter in &counters {
        let counter = counter.clone();
        exchange.add_completion_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    (exchange, counters)
}

fn assert_each_once(counters: &[Arc<AtomicUsize>]) {
    for counter in counters {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_listeners_run_exactly_once_on_every_path() {
    let runtime = Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap();
    let handle = runtime.handle().clone();
    let routes = vec![
        Route::builder("sync").step(Executable::from_fn("ok", |_| Ok(()))).build(),
        Route::builder("failure")
            .step(Executable::from_fn("boom", |_| {
                Err(ExchangeError::processing("boom", "failed"))
            }))
            .build(),
        Route::builder("thread-hop")
            .step(HandlerProcessor::with_runtime(Sleep::new(Duration::from_millis(5)), handle.clone())
                .into_executable())
            .build(),
        Route::builder("rejected")
            .step(
                Throttler::builder("reject", constant(1))
                    .period(Duration::from_secs(60))
                    .mode(ThrottleMode::AsyncDelayed)
                    .max_pending(0)
                    .rejection(RejectionPolicy::Reject)
                    .runtime(handle.clone())
                    .build()
                    .into_executable(),
            )
            .build(),
    ];

    for route in &routes {
        for _ in 0..2 {
            let (exchange, counters) = with_listeners(3);
            let exchange = route.process(exchange).unwrap();
            assert!(exchange.state().is_notified());
            drop(exchange);
            assert_each_once(&counters);
        }
        assert_eq!(route.inflight().count(), 0);
    }

    let lost = Route::builder("lost").step(Executable::asynchronous(Lose)).build();
    let (exchange, counters) = with_listeners(3);
    assert!(matches!(
        lost.process(exchange),
        Err(ProcessorError::CallbackDropped { .. })
    ));
    assert_each_once(&counters);
    assert_eq!(lost.inflight().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inflight_policy_pauses_and_resumes_consumer() {
    let context = MediationContext::new("backpressure");
    let sleep = Sleep::new(Duration::from_millis(20));
    let finished = sleep.finished.clone();
    let peak_active = sleep.peak.clone();
    let observed = Arc::new(PeakInFlight::default());
    let route = context
        .add_route(
            Route::builder("bounded")
                .step(HandlerProcessor::new(sleep).into_executable())
                .policy(observed.clone())
                .policy(Arc::new(ThrottlingInFlightRoutePolicy::new(10, 70, InFlightScope::Route))),
        )
        .unwrap();

    let (sender, receiver) = mpsc::channel(128);
    for i in 0..100 {
        sender.send(Message::new(i)).await.unwrap();
    }
    let consumer = ChannelConsumer::new("bounded-consumer", route.clone(), receiver, Handle::current());
    context.add_consumer(consumer.clone());
    context.start().unwrap();

    for _ in 0..500 {
        if finished.load(Ordering::SeqCst) == 100 && context.inflight_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 100);
    assert_eq!(context.inflight_count(), 0);
    assert_eq!(observed.peak.load(Ordering::SeqCst), 10);
    assert!(peak_active.load(Ordering::SeqCst) <= 10);

    assert_eq!(context.shutdown_with(Duration::from_secs(1)).await, ShutdownResult::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_inflight_exchanges() {
    let context = MediationContext::new("graceful");
    let route = context
        .add_route(
            Route::builder("slow")
                .step(HandlerProcessor::new(Sleep::new(Duration::from_millis(50))).into_executable()),
        )
        .unwrap();

    let pending = route.send(Exchange::new());
    assert_eq!(context.inflight_count(), 1);
    assert_eq!(context.shutdown_with(Duration::from_secs(5)).await, ShutdownResult::Complete);
    let exchange = pending.await.unwrap();
    assert!(!exchange.is_failed());
    assert_eq!(context.state(), ContextState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_shutdown_fails_pending_exchanges() {
    let mut config = EngineConfig::default();
    config.shutdown.settle_ms = 1_000;
    let context = MediationContext::with_config("forced", config);
    let route = context
        .add_route(
            Route::builder("stuck")
                .step(HandlerProcessor::new(Sleep::new(Duration::from_secs(30))).into_executable()),
        )
        .unwrap();

    let pending: Vec<_> = (0..3).map(|_| route.send(Exchange::new())).collect();
    let result = context.shutdown_with(Duration::from_millis(50)).await;
    assert_eq!(
        result,
        ShutdownResult::Forced {
            interrupted: 3,
            remaining: 0
        }
    );
    for exchange in join_all(pending).await {
        assert!(matches!(
            exchange.unwrap().failure(),
            Some(ExchangeError::ShutdownForced { .. })
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_shutdown_completes_exchanges_held_by_any_step() {
    let mut config = EngineConfig::default();
    config.shutdown.settle_ms = 100;
    let context = MediationContext::with_config("forced-park", config);
    let route = context
        .add_route(Route::builder("parked").step(Executable::asynchronous(Park {
            delay: Duration::from_millis(400),
        })))
        .unwrap();

    let (exchange, counters) = with_listeners(2);
    let pending = route.send(exchange);
    let result = context.shutdown_with(Duration::from_millis(50)).await;
    assert_eq!(
        result,
        ShutdownResult::Forced {
            interrupted: 1,
            remaining: 0
        }
    );
    assert_each_once(&counters);

    let exchange = pending.await.unwrap();
    assert!(matches!(exchange.failure(), Some(ExchangeError::ShutdownForced { .. })));
    assert!(exchange.state().is_notified());
    assert_eq!(exchange.route_id(), Some("parked"));

    // The step hands its exchange back after the shutdown.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_each_once(&counters);
    assert_eq!(context.inflight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_context_scope_counts_every_route() {
    let context = MediationContext::new("shared-budget");
    let slow = context
        .add_route(
            Route::builder("slow")
                .step(HandlerProcessor::new(Sleep::new(Duration::from_millis(300))).into_executable()),
        )
        .unwrap();
    let processed = Arc::new(AtomicUsize::new(0));
    let p = processed.clone();
    let fed = context
        .add_route(
            Route::builder("fed")
                .step(Executable::from_fn("count", move |_| {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .policy(Arc::new(ThrottlingInFlightRoutePolicy::new(3, 70, InFlightScope::Context))),
        )
        .unwrap();

    let busy: Vec<_> = (0..3).map(|_| slow.send(Exchange::new())).collect();
    assert_eq!(context.inflight_count(), 3);

    let (sender, receiver) = mpsc::channel(8);
    let consumer = ChannelConsumer::new("fed-consumer", fed.clone(), receiver, Handle::current());
    context.add_consumer(consumer.clone());
    context.start().unwrap();

    sender.send(Message::new(1)).await.unwrap();
    for _ in 0..100 {
        if processed.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert_eq!(consumer.status(), ConsumerStatus::Suspended);

    // Stays in the channel while the other route keeps the context busy.
    sender.send(Message::new(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 1);

    for exchange in join_all(busy).await {
        assert!(!exchange.unwrap().is_failed());
    }
    for _ in 0..200 {
        if processed.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(processed.load(Ordering::SeqCst), 2);
    assert_eq!(consumer.status(), ConsumerStatus::Started);

    assert_eq!(context.shutdown_with(Duration::from_secs(1)).await, ShutdownResult::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_shutdown_cancels_blocking_throttle_wait() {
    let mut config = EngineConfig::default();
    config.shutdown.settle_ms = 1_000;
    let context = MediationContext::with_config("blocked", config);
    let route = context
        .add_route(
            Route::builder("throttled").step(
                Throttler::builder("one-per-minute", constant(1))
                    .period(Duration::from_secs(60))
                    .build()
                    .into_executable(),
            ),
        )
        .unwrap();

    assert!(!route.process(Exchange::new()).unwrap().is_failed());
    let blocked = route.clone();
    let waiting = tokio::task::spawn_blocking(move || blocked.process(Exchange::new()));
    for _ in 0..100 {
        if context.inflight_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let result = context.shutdown_with(Duration::from_millis(50)).await;
    assert_eq!(
        result,
        ShutdownResult::Forced {
            interrupted: 1,
            remaining: 0
        }
    );
    let exchange = waiting.await.unwrap().unwrap();
    assert!(matches!(exchange.failure(), Some(ExchangeError::ShutdownForced { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_without_force_leaves_work_running() {
    let mut config = EngineConfig::default();
    config.shutdown.force_on_timeout = false;
    let context = MediationContext::with_config("patient", config);
    let route = context
        .add_route(
            Route::builder("slow")
                .step(HandlerProcessor::new(Sleep::new(Duration::from_millis(200))).into_executable()),
        )
        .unwrap();

    let pending = route.send(Exchange::new());
    assert_eq!(
        context.shutdown_with(Duration::from_millis(20)).await,
        ShutdownResult::Timeout { remaining: 1 }
    );
    assert!(!pending.await.unwrap().is_failed());
}
