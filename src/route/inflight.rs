//! In-flight exchange tracking and the in-flight throttling route policy.

use crate::config::InFlightConfig;
use crate::exchange::Exchange;
use crate::route::{ConsumerStatus, PendingExchange, Route, RoutePolicy};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

type ReleaseHook = Box<dyn Fn(&InFlightRepository) -> bool + Send + Sync>;

/// Counts exchanges between route entry and completion, in total and per route.
///
/// Exchanges dispatched by a route also leave their pending completion here,
/// so that a forced shutdown can complete exchanges whose step never hands
/// them back.
pub struct InFlightRepository {
    total: AtomicUsize,
    routes: DashMap<String, Arc<AtomicUsize>, FnvBuildHasher>,
    pending: DashMap<u64, Arc<PendingExchange>, FnvBuildHasher>,
    next_pending: AtomicU64,
    release_hooks: Mutex<Vec<ReleaseHook>>,
    notify: Notify,
}

impl InFlightRepository {
    pub fn new() -> Self {
        Self {
            total: AtomicUsize::new(0),
            routes: DashMap::with_hasher(FnvBuildHasher::default()),
            pending: DashMap::with_hasher(FnvBuildHasher::default()),
            next_pending: AtomicU64::new(0),
            release_hooks: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Tracks one exchange of `route_id` until the guard is dropped.
    pub fn begin(self: &Arc<Self>, route_id: &str) -> InFlightGuard {
        let route = self
            .routes
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        route.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            repository: Arc::clone(self),
            route,
            pending: None,
        }
    }

    /// Runs `hook` after every release until it returns `true`.
    ///
    /// Hooks run on the releasing thread while the hook list is locked. They
    /// must not complete exchanges themselves.
    pub fn on_release(&self, hook: impl Fn(&InFlightRepository) -> bool + Send + Sync + 'static) {
        self.release_hooks.lock().push(Box::new(hook));
    }

    /// Completes every tracked exchange as failed by a forced shutdown.
    /// Returns the number completed here.
    pub(crate) fn force_complete(&self) -> usize {
        let pending: Vec<_> = self.pending.iter().map(|entry| entry.value().clone()).collect();
        pending.iter().filter(|pending| pending.force()).count()
    }

    fn released(&self) {
        let mut hooks = self.release_hooks.lock();
        if !hooks.is_empty() {
            hooks.retain(|hook| !hook(self));
        }
    }

    pub fn count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn route_count(&self, route_id: &str) -> usize {
        self.routes
            .get(route_id)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Waits until nothing is in flight or `timeout` elapses. Returns the
    /// number of exchanges still in flight.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let count = self.count();
            if count == 0 {
                return 0;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return count;
            }
            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining) => return self.count(),
            }
        }
    }
}

impl Default for InFlightRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one in-flight exchange when dropped.
pub struct InFlightGuard {
    repository: Arc<InFlightRepository>,
    route: Arc<AtomicUsize>,
    pending: Option<u64>,
}

impl InFlightGuard {
    /// Keeps the exchange's pending completion until the guard is dropped.
    pub(crate) fn track(&mut self, pending: Arc<PendingExchange>) {
        let key = self.repository.next_pending.fetch_add(1, Ordering::Relaxed);
        self.repository.pending.insert(key, pending);
        self.pending = Some(key);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(key) = self.pending.take() {
            self.repository.pending.remove(&key);
        }
        self.route.fetch_sub(1, Ordering::SeqCst);
        self.repository.total.fetch_sub(1, Ordering::SeqCst);
        self.repository.released();
        self.repository.notify.notify_one();
    }
}

/// Which in-flight count the policy compares against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightScope {
    #[default]
    Route,
    Context,
}

/// Suspends the route's consumer while too many exchanges are in flight.
///
/// The consumer is suspended once the count reaches `max_inflight` and
/// resumed when it drops to `resume_percent` percent of it. Exchanges are
/// never queued or rejected by the policy; suspended consumers leave new work
/// at its source. With [`InFlightScope::Context`] the count includes every
/// route of the context, and a release on any of them may resume the consumer.
pub struct ThrottlingInFlightRoutePolicy {
    max_inflight: usize,
    resume_threshold: usize,
    scope: InFlightScope,
    transition: Arc<Mutex<()>>,
    watching: Arc<AtomicBool>,
}

impl ThrottlingInFlightRoutePolicy {
    pub fn new(max_inflight: usize, resume_percent: u8, scope: InFlightScope) -> Self {
        let max_inflight = max_inflight.max(1);
        let percent = resume_percent.min(100) as usize;
        Self {
            max_inflight,
            resume_threshold: max_inflight * percent / 100,
            scope,
            transition: Arc::new(Mutex::new(())),
            watching: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &InFlightConfig) -> Self {
        Self::new(config.max_inflight, config.resume_percent, config.scope)
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    pub fn resume_threshold(&self) -> usize {
        self.resume_threshold
    }

    fn current(scope: InFlightScope, route: &Route) -> usize {
        match scope {
            InFlightScope::Route => route.inflight().route_count(route.id()),
            InFlightScope::Context => route.inflight().count(),
        }
    }
}

impl ThrottlingInFlightRoutePolicy {
    /// Resumes the suspended consumer once the context-wide count is low enough.
    fn watch_context(&self, route: &Route) {
        if self.watching.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumer = route.consumer().map(|consumer| Arc::downgrade(&consumer));
        let route_id = route.id().to_string();
        let threshold = self.resume_threshold;
        let transition = self.transition.clone();
        let watching = self.watching.clone();
        route.inflight().on_release(move |repository| {
            let _transition = transition.lock();
            let current = repository.count();
            if current > threshold {
                return false;
            }
            if let Some(consumer) = consumer.as_ref().and_then(|consumer| consumer.upgrade()) {
                if consumer.status() == ConsumerStatus::Suspended {
                    log::info!(
                        "Resuming consumer of route '{}': {} exchanges in flight",
                        route_id,
                        current
                    );
                    consumer.resume();
                }
            }
            watching.store(false, Ordering::Release);
            true
        });
    }
}

impl RoutePolicy for ThrottlingInFlightRoutePolicy {
    fn on_exchange_begin(&self, route: &Route, exchange: &mut Exchange) {
        let suspended = {
            let _transition = self.transition.lock();
            let current = Self::current(self.scope, route);
            match route.consumer() {
                Some(consumer)
                    if current >= self.max_inflight
                        && consumer.status() == ConsumerStatus::Started =>
                {
                    log::info!(
                        "Suspending consumer of route '{}': {} exchanges in flight (max {})",
                        route.id(),
                        current,
                        self.max_inflight
                    );
                    consumer.suspend();
                    true
                }
                _ => false,
            }
        };

        if self.scope == InFlightScope::Context {
            // This exchange is still in flight, so its release runs the hook.
            if suspended {
                self.watch_context(route);
            }
            return;
        }

        let route = route.clone();
        let scope = self.scope;
        let threshold = self.resume_threshold;
        let transition = self.transition.clone();
        // Runs after the route released the exchange's in-flight slot.
        exchange.add_completion_listener(move |_| {
            let _transition = transition.lock();
            let current = Self::current(scope, &route);
            if current > threshold {
                return;
            }
            if let Some(consumer) = route.consumer() {
                if consumer.status() == ConsumerStatus::Suspended {
                    log::info!(
                        "Resuming consumer of route '{}': {} exchanges in flight",
                        route.id(),
                        current
                    );
                    consumer.resume();
                }
            }
        });
    }
}
