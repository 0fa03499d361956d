//! Redelivery of failed steps.
//!
//! A step wrapped by [`Redelivery`] is run again when it fails, up to the
//! policy's limit and after the policy's delay. Only the failed step runs
//! again, with the exchange as the step left it. When redeliveries are
//! exhausted the failure stays on the exchange for the route's error handler.
//!
//! Steps that record their own progress see a redelivered exchange again. An
//! eager idempotent consumer treats it as a duplicate, so wrap its downstream
//! instead of the consumer.

use crate::config::RedeliveryConfig;
use crate::eip::throttle::wait_until;
use crate::exchange::properties::{REDELIVERED, REDELIVERY_COUNTER};
use crate::exchange::{Exchange, ExchangeError};
use crate::processor::{AsyncCallback, AsyncProcessor, Executable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// How often and how late a failed step is redelivered.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    maximum_redeliveries: i32,
    delay: Duration,
    maximum_delay: Duration,
    exponential_backoff: bool,
    backoff_multiplier: f64,
}

impl RedeliveryPolicy {
    /// Policy redelivering up to `maximum_redeliveries` times. A negative
    /// value redelivers until the step succeeds.
    pub fn new(maximum_redeliveries: i32) -> Self {
        Self {
            maximum_redeliveries,
            ..Self::default()
        }
    }

    pub fn from_config(config: &RedeliveryConfig) -> Self {
        Self {
            maximum_redeliveries: config.maximum_redeliveries,
            delay: config.redelivery_delay(),
            maximum_delay: config.maximum_redelivery_delay(),
            exponential_backoff: config.use_exponential_backoff,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn maximum_delay(mut self, maximum_delay: Duration) -> Self {
        self.maximum_delay = maximum_delay;
        self
    }

    /// Multiplies the delay by `multiplier` for every further redelivery.
    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.exponential_backoff = true;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn maximum_redeliveries(&self) -> i32 {
        self.maximum_redeliveries
    }

    pub fn is_enabled(&self) -> bool {
        self.maximum_redeliveries != 0
    }

    /// True when another redelivery is allowed after `done` of them.
    pub fn allows(&self, done: u32) -> bool {
        self.maximum_redeliveries < 0 || i64::from(done) < i64::from(self.maximum_redeliveries)
    }

    /// Delay before redelivery number `redelivery`, counting from 1.
    ///
    /// # Examples
    /// ```rust
    /// use idemio_mediation::route::RedeliveryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RedeliveryPolicy::new(5)
    ///     .delay(Duration::from_millis(100))
    ///     .maximum_delay(Duration::from_millis(350))
    ///     .exponential_backoff(2.0);
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    /// assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    /// ```
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        let cap = self.maximum_delay.max(self.delay);
        if !self.exponential_backoff || redelivery <= 1 {
            return self.delay;
        }
        let exponent = i32::try_from(redelivery - 1).unwrap_or(i32::MAX);
        let nanos = self.delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&RedeliveryConfig::default())
    }
}

/// Step wrapper redelivering the wrapped step according to a policy.
///
/// Delays are timed by a tokio timer when a runtime is available, and the
/// caller returns while the exchange waits. Without a runtime the calling
/// thread sleeps.
pub struct Redelivery {
    inner: Arc<RedeliveryInner>,
}

impl Redelivery {
    pub fn wrap(step: Executable, policy: RedeliveryPolicy) -> Executable {
        Self::with_runtime(step, policy, None)
    }

    pub fn with_runtime(step: Executable, policy: RedeliveryPolicy, runtime: Option<Handle>) -> Executable {
        Executable::Async(Arc::new(Redelivery {
            inner: Arc::new(RedeliveryInner {
                step,
                policy,
                runtime,
            }),
        }))
    }
}

impl AsyncProcessor for Redelivery {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        RedeliveryInner::run(&self.inner, 0, exchange, callback, true)
    }

    fn name(&self) -> &str {
        self.inner.step.name()
    }
}

struct RedeliveryInner {
    step: Executable,
    policy: RedeliveryPolicy,
    runtime: Option<Handle>,
}

type Handoff = Arc<Mutex<Option<(Exchange, AsyncCallback)>>>;

impl RedeliveryInner {
    /// Runs the step after `done` redeliveries. Attempts that finish
    /// synchronously without a delay are redelivered by the loop.
    fn run(
        this: &Arc<Self>,
        mut done: u32,
        mut exchange: Exchange,
        mut callback: AsyncCallback,
        entered_sync: bool,
    ) -> bool {
        let handoff: Handoff = Arc::new(Mutex::new(None));
        loop {
            let slot = Arc::clone(&handoff);
            let resume = Arc::clone(this);
            let continuation = AsyncCallback::new(move |exchange, done_sync| {
                if done_sync {
                    *slot.lock() = Some((exchange, callback));
                } else {
                    RedeliveryInner::resume(&resume, done, exchange, callback);
                }
            });
            this.step.process_async(exchange, continuation);

            let handed_back = handoff.lock().take();
            let Some((mut returned, outer)) = handed_back else {
                return false;
            };
            let Some(delay) = this.next(&mut returned, done) else {
                outer.done(returned, entered_sync);
                return entered_sync;
            };
            done += 1;
            if !delay.is_zero() {
                if let Some(runtime) = this.runtime() {
                    Self::schedule(this, runtime, done, returned, outer, delay);
                    return false;
                }
                wait_until(&mut returned, Instant::now() + delay);
                if returned.is_failed() {
                    outer.done(returned, entered_sync);
                    return entered_sync;
                }
            }
            exchange = returned;
            callback = outer;
        }
    }

    /// Continues after an attempt completed on another thread.
    fn resume(this: &Arc<Self>, done: u32, mut exchange: Exchange, callback: AsyncCallback) {
        let Some(delay) = this.next(&mut exchange, done) else {
            callback.done(exchange, false);
            return;
        };
        if !delay.is_zero() {
            if let Some(runtime) = this.runtime() {
                Self::schedule(this, runtime, done + 1, exchange, callback, delay);
                return;
            }
            wait_until(&mut exchange, Instant::now() + delay);
            if exchange.is_failed() {
                callback.done(exchange, false);
                return;
            }
        }
        Self::run(this, done + 1, exchange, callback, false);
    }

    fn schedule(
        this: &Arc<Self>,
        runtime: Handle,
        done: u32,
        mut exchange: Exchange,
        callback: AsyncCallback,
        delay: Duration,
    ) {
        let this = Arc::clone(this);
        runtime.spawn(async move {
            let cancellation = exchange.cancellation().clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    RedeliveryInner::run(&this, done, exchange, callback, false);
                }
                _ = cancellation.cancelled() => {
                    let uuid = *exchange.uuid();
                    exchange.set_failure(ExchangeError::shutdown_forced(&uuid));
                    callback.done(exchange, false);
                }
            }
        });
    }

    fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    /// Clears the failure when another redelivery is due and returns its delay.
    fn next(&self, exchange: &mut Exchange, done: u32) -> Option<Duration> {
        let failure = exchange.failure()?;
        if matches!(failure, ExchangeError::ShutdownForced { .. })
            || exchange.cancellation().is_cancelled()
        {
            return None;
        }
        if !self.policy.allows(done) {
            if done > 0 {
                log::debug!(
                    "Giving up on exchange {} at '{}' after {} redeliveries",
                    exchange.uuid(),
                    self.step.name(),
                    done
                );
            }
            return None;
        }
        let redelivery = done + 1;
        if let Some(failure) = exchange.take_failure() {
            log::warn!(
                "Redelivering exchange {} to '{}' (attempt {}) after failure: {}",
                exchange.uuid(),
                self.step.name(),
                redelivery,
                failure
            );
        }
        exchange.properties_mut().insert(REDELIVERED, true);
        exchange.properties_mut().insert(REDELIVERY_COUNTER, redelivery);
        Some(self.policy.delay_for(redelivery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls.
    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Executable {
        Executable::from_fn("flaky", move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                return Err(ExchangeError::processing("flaky", "not yet"));
            }
            Ok(())
        })
    }

    #[test]
    fn test_succeeds_after_redeliveries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Redelivery::wrap(
            flaky(2, calls.clone()),
            RedeliveryPolicy::new(3).delay(Duration::ZERO),
        );
        let (sender, receiver) = std::sync::mpsc::channel();
        let returned = step.process_async(
            Exchange::new(),
            AsyncCallback::new(move |exchange, done_sync| {
                sender.send((exchange, done_sync)).unwrap();
            }),
        );
        assert!(returned);
        let (exchange, done_sync) = receiver.recv().unwrap();
        assert!(done_sync);
        assert!(!exchange.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.properties().get::<u32>(REDELIVERY_COUNTER), Some(&2));
        assert_eq!(exchange.properties().get::<bool>(REDELIVERED), Some(&true));
    }

    #[test]
    fn test_exhausted_redeliveries_keep_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Redelivery::wrap(
            flaky(usize::MAX, calls.clone()),
            RedeliveryPolicy::new(2).delay(Duration::ZERO),
        );
        let exchange = step.process(Exchange::new()).unwrap();
        assert!(matches!(exchange.failure(), Some(ExchangeError::Processing { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_disabled_policy_runs_step_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Redelivery::wrap(flaky(usize::MAX, calls.clone()), RedeliveryPolicy::default());
        assert!(step.process(Exchange::new()).unwrap().is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_delay_without_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Redelivery::wrap(
            flaky(2, calls.clone()),
            RedeliveryPolicy::new(2).delay(Duration::from_millis(30)),
        );
        let start = Instant::now();
        assert!(!step.process(Exchange::new()).unwrap().is_failed());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RedeliveryPolicy::new(-1)
            .delay(Duration::from_millis(10))
            .maximum_delay(Duration::from_millis(25))
            .exponential_backoff(2.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(25));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(25));
        assert!(policy.allows(u32::MAX));
        assert!(!RedeliveryPolicy::new(2).allows(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_delay_returns_to_caller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Redelivery::wrap(
            flaky(1, calls.clone()),
            RedeliveryPolicy::new(1).delay(Duration::from_millis(40)),
        );
        let start = Instant::now();
        let exchange = step.process_future(Exchange::new()).await.unwrap();
        assert!(!exchange.is_failed());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_wait_fails_exchange() {
        let step = Redelivery::wrap(
            flaky(usize::MAX, Arc::new(AtomicUsize::new(0))),
            RedeliveryPolicy::new(5).delay(Duration::from_secs(30)),
        );
        let exchange = Exchange::new();
        let token = exchange.cancellation().clone();
        let future = step.process_future(exchange);
        token.cancel();
        let exchange = future.await.unwrap();
        assert!(matches!(exchange.failure(), Some(ExchangeError::ShutdownForced { .. })));
    }
}
