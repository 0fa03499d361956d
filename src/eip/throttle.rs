//! Throttler.
//!
//! Limits the number of exchanges released per period. Each throttle group
//! owns `rate` permits. An arriving exchange takes the permit with the
//! earliest release time, waits until that time if it lies in the future,
//! and the permit is busy again until one period after its own release. This
//! keeps at most `rate` releases in any window of one period, granted in
//! arrival order. Only busy permits are stored, so memory follows the admitted
//! traffic rather than the configured rate.
//!
//! In [`ThrottleMode::Blocking`] the waiting caller sleeps on its own thread.
//! On a multi-thread tokio runtime the wait is moved off the worker with
//! `block_in_place`, on a current-thread runtime it stalls the runtime for the
//! length of the delay. Prefer [`ThrottleMode::AsyncDelayed`] for routes fed
//! by async consumers.

use crate::config::ThrottleConfig;
use crate::exchange::properties::THROTTLED_FOR;
use crate::exchange::{Exchange, ExchangeError};
use crate::expression::{SharedExpression, evaluate_key, evaluate_positive};
use crate::processor::{AsyncCallback, AsyncProcessor, Executable};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const DEFAULT_GROUP: &str = "";
const BLOCKING_POLL: Duration = Duration::from_millis(50);
/// Shortest period a throttler runs with.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    /// The calling thread sleeps until the exchange may proceed.
    #[default]
    Blocking,
    /// The exchange is resumed by a runtime timer and the caller returns.
    AsyncDelayed,
}

/// What happens when a delay cannot be scheduled asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Block the caller for the delay instead.
    #[default]
    CallerRuns,
    /// Fail the exchange with [`ExchangeError::ThrottleRejected`].
    Reject,
}

/// The right to release one exchange at or after `scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    scheduled: Instant,
    sequence: u64,
}

impl Permit {
    pub fn new(scheduled: Instant, sequence: u64) -> Self {
        Self {
            scheduled,
            sequence,
        }
    }

    pub fn scheduled(&self) -> Instant {
        self.scheduled
    }
}

impl Ord for Permit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled
            .cmp(&other.scheduled)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for Permit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Busy permits of one throttle group, earliest release first. Permits that
/// are not busy are implicit.
struct PermitQueue {
    busy: BinaryHeap<Reverse<Permit>>,
    rate: u64,
    sequence: u64,
}

impl PermitQueue {
    fn new(rate: u64) -> Self {
        Self {
            busy: BinaryHeap::new(),
            rate,
            sequence: 0,
        }
    }

    /// Shrinking drops the earliest busy permits first.
    fn resize(&mut self, rate: u64) {
        self.rate = rate;
        while self.busy.len() as u64 > rate {
            self.busy.pop();
        }
    }

    fn expire(&mut self, now: Instant) {
        while matches!(self.busy.peek(), Some(Reverse(permit)) if permit.scheduled <= now) {
            self.busy.pop();
        }
    }

    /// Release time the next exchange would be granted. Takes nothing.
    fn next_release(&mut self, now: Instant) -> Instant {
        self.expire(now);
        if (self.busy.len() as u64) < self.rate {
            return now;
        }
        self.busy
            .peek()
            .map_or(now, |Reverse(permit)| permit.scheduled.max(now))
    }

    /// Takes a permit for a release at `go`, as returned by `next_release`.
    fn commit(&mut self, go: Instant, period: Duration) {
        if self.busy.len() as u64 >= self.rate {
            self.busy.pop();
        }
        self.busy.push(Reverse(Permit::new(go + period, self.sequence)));
        self.sequence = self.sequence.wrapping_add(1);
    }

    #[cfg(test)]
    fn reserve(&mut self, now: Instant, period: Duration) -> Instant {
        let go = self.next_release(now);
        self.commit(go, period);
        go
    }
}

enum Admission {
    Now,
    Block(Instant),
    Timer(Instant, Handle, OwnedSemaphorePermit),
    Rejected,
}

pub struct Throttler {
    name: String,
    rate: SharedExpression,
    correlation: Option<SharedExpression>,
    period: Duration,
    mode: ThrottleMode,
    rejection: RejectionPolicy,
    groups: DashMap<String, Arc<Mutex<PermitQueue>>, FnvBuildHasher>,
    pending: Arc<Semaphore>,
    max_pending: usize,
    runtime: Option<Handle>,
}

impl Throttler {
    /// Creates a throttler releasing at most `rate` exchanges per period.
    ///
    /// # Examples
    /// ```rust
    /// use idemio_mediation::eip::throttle::Throttler;
    /// use idemio_mediation::exchange::Exchange;
    /// use idemio_mediation::expression::constant;
    /// use std::time::Duration;
    ///
    /// let throttler = Throttler::builder("orders", constant(10))
    ///     .period(Duration::from_millis(100))
    ///     .build()
    ///     .into_executable();
    /// let exchange = throttler.process(Exchange::new()).unwrap();
    /// assert!(!exchange.is_failed());
    /// ```
    pub fn builder(name: impl Into<String>, rate: SharedExpression) -> ThrottlerBuilder {
        ThrottlerBuilder {
            name: name.into(),
            rate,
            correlation: None,
            config: ThrottleConfig::default(),
            period: None,
            runtime: None,
        }
    }

    pub fn into_executable(self) -> Executable {
        Executable::Async(Arc::new(self))
    }

    /// Number of delayed exchanges currently waiting on a timer.
    pub fn pending(&self) -> usize {
        self.max_pending.saturating_sub(self.pending.available_permits())
    }

    fn reject(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        log::debug!(
            "Throttler '{}' rejected exchange {}",
            self.name,
            exchange.uuid()
        );
        exchange.set_failure(ExchangeError::throttle_rejected(&self.name));
        callback.done(exchange, true);
        true
    }

    fn block(&self, mut exchange: Exchange, callback: AsyncCallback, until: Instant) -> bool {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| wait_until(&mut exchange, until))
            }
            _ => wait_until(&mut exchange, until),
        }
        callback.done(exchange, true);
        true
    }
}

/// Sleeps the calling thread until `until`, failing the exchange with
/// [`ExchangeError::ShutdownForced`] if it is cancelled first.
pub(crate) fn wait_until(exchange: &mut Exchange, until: Instant) {
    loop {
        if exchange.cancellation().is_cancelled() {
            let uuid = *exchange.uuid();
            exchange.set_failure(ExchangeError::shutdown_forced(&uuid));
            return;
        }
        let now = Instant::now();
        if now >= until {
            return;
        }
        std::thread::sleep((until - now).min(BLOCKING_POLL));
    }
}

impl AsyncProcessor for Throttler {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let rate = match evaluate_positive(self.rate.as_ref(), &exchange) {
            Ok(rate) => rate,
            Err(message) => {
                exchange.set_failure(ExchangeError::invalid_expression(
                    self.rate.describe(),
                    message,
                ));
                callback.done(exchange, true);
                return true;
            }
        };
        let group = match &self.correlation {
            None => String::from(DEFAULT_GROUP),
            Some(expression) => match evaluate_key(expression.as_ref(), &exchange) {
                Some(key) => key,
                None => {
                    exchange.set_failure(ExchangeError::missing_correlation_key(
                        expression.describe(),
                    ));
                    callback.done(exchange, true);
                    return true;
                }
            },
        };

        let now = Instant::now();
        let queue = self
            .groups
            .entry(group)
            .or_insert_with(|| Arc::new(Mutex::new(PermitQueue::new(rate))))
            .clone();
        let admission = {
            let mut queue = queue.lock();
            if queue.rate != rate {
                log::debug!(
                    "Throttler '{}' rate changed from {} to {}",
                    self.name,
                    queue.rate,
                    rate
                );
                queue.resize(rate);
            }
            let go = queue.next_release(now);
            let admission = if go <= now {
                Admission::Now
            } else if self.mode == ThrottleMode::Blocking {
                Admission::Block(go)
            } else {
                let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok());
                match (runtime, self.pending.clone().try_acquire_owned()) {
                    (Some(runtime), Ok(slot)) => Admission::Timer(go, runtime, slot),
                    _ => match self.rejection {
                        RejectionPolicy::CallerRuns => Admission::Block(go),
                        RejectionPolicy::Reject => Admission::Rejected,
                    },
                }
            };
            // A rejected exchange leaves the schedule untouched.
            if !matches!(admission, Admission::Rejected) {
                queue.commit(go, self.period);
            }
            admission
        };

        let go = match admission {
            Admission::Now => {
                callback.done(exchange, true);
                return true;
            }
            Admission::Rejected => return self.reject(exchange, callback),
            Admission::Block(go) | Admission::Timer(go, ..) => go,
        };
        let delay = go.saturating_duration_since(now);
        log::trace!(
            "Throttler '{}' delaying exchange {} by {:?}",
            self.name,
            exchange.uuid(),
            delay
        );
        exchange.properties_mut().insert(THROTTLED_FOR, delay);

        match admission {
            Admission::Timer(go, runtime, slot) => {
                runtime.spawn(async move {
                    let cancellation = exchange.cancellation().clone();
                    tokio::select! {
                        _ = tokio::time::sleep_until(go.into()) => {}
                        _ = cancellation.cancelled() => {
                            let uuid = *exchange.uuid();
                            exchange.set_failure(ExchangeError::shutdown_forced(&uuid));
                        }
                    }
                    drop(slot);
                    callback.done(exchange, false);
                });
                false
            }
            _ => self.block(exchange, callback, go),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct ThrottlerBuilder {
    name: String,
    rate: SharedExpression,
    correlation: Option<SharedExpression>,
    config: ThrottleConfig,
    period: Option<Duration>,
    runtime: Option<Handle>,
}

impl ThrottlerBuilder {
    /// Applies a config section. Later setters override it.
    pub fn config(mut self, config: &ThrottleConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn mode(mut self, mode: ThrottleMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.config.max_pending = max_pending;
        self
    }

    pub fn rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.config.rejection = rejection;
        self
    }

    /// Throttles each distinct value of `expression` independently.
    pub fn correlation(mut self, expression: SharedExpression) -> Self {
        self.correlation = Some(expression);
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// A zero period is raised to [`MIN_PERIOD`].
    pub fn build(self) -> Throttler {
        let mut period = self.period.unwrap_or_else(|| self.config.period());
        if period.is_zero() {
            log::warn!(
                "Throttler '{}' configured with a zero period, using {:?}",
                self.name,
                MIN_PERIOD
            );
            period = MIN_PERIOD;
        }
        Throttler {
            name: self.name,
            rate: self.rate,
            correlation: self.correlation,
            period,
            mode: self.config.mode,
            rejection: self.config.rejection,
            groups: DashMap::with_hasher(FnvBuildHasher::default()),
            pending: Arc::new(Semaphore::new(self.config.max_pending)),
            max_pending: self.config.max_pending,
            runtime: self.runtime,
        }
    }
}
