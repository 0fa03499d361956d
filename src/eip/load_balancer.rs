use crate::exchange::properties::{BROADCAST_FAILURES, FAILOVER_ATTEMPTS};
use crate::exchange::{Exchange, ExchangeError};
use crate::expression::{SharedExpression, evaluate_key};
use crate::processor::{AsyncCallback, AsyncProcessor, Executable};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A destination of a [`LoadBalancer`].
pub trait Target: AsyncProcessor {
    /// Unavailable targets are skipped.
    fn is_available(&self) -> bool {
        true
    }
}

/// Target wrapping a step, which can be stopped and started.
pub struct ProcessorTarget {
    name: String,
    step: Executable,
    started: AtomicBool,
}

impl ProcessorTarget {
    pub fn new(name: impl Into<String>, step: Executable) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            step,
            started: AtomicBool::new(true),
        })
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }
}

impl AsyncProcessor for ProcessorTarget {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.step.process_async(exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Target for ProcessorTarget {
    fn is_available(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub enum LoadBalancePolicy {
    /// Every available target receives its own copy of the exchange.
    Broadcast,
    RoundRobin,
    Random,
    /// Exchanges with the same key go to the same target while the set of
    /// available targets is unchanged.
    Sticky(SharedExpression),
    /// Tries targets in round-robin order until one succeeds. `0` attempts
    /// means every available target once.
    Failover { max_attempts: usize },
}

impl std::fmt::Debug for LoadBalancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancePolicy::Broadcast => write!(f, "Broadcast"),
            LoadBalancePolicy::RoundRobin => write!(f, "RoundRobin"),
            LoadBalancePolicy::Random => write!(f, "Random"),
            LoadBalancePolicy::Sticky(expression) => write!(f, "Sticky({})", expression.describe()),
            LoadBalancePolicy::Failover { max_attempts } => {
                write!(f, "Failover(max_attempts = {})", max_attempts)
            }
        }
    }
}

type SharedTarget = Arc<dyn Target>;

/// Distributes exchanges over a set of targets.
///
/// Targets are held weakly. A target whose owner dropped it disappears from
/// the set on the next dispatch.
pub struct LoadBalancer {
    name: String,
    policy: LoadBalancePolicy,
    targets: RwLock<Vec<Weak<dyn Target>>>,
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, policy: LoadBalancePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            targets: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn add_target(&self, target: &SharedTarget) {
        self.targets.write().push(Arc::downgrade(target));
    }

    pub fn remove_target(&self, target: &SharedTarget) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|weak| match weak.upgrade() {
            Some(existing) => !Arc::ptr_eq(&existing, target),
            None => false,
        });
        targets.len() != before
    }

    /// Live targets, in insertion order.
    pub fn targets(&self) -> Vec<SharedTarget> {
        let (live, dead) = {
            let targets = self.targets.read();
            let live: Vec<SharedTarget> = targets.iter().filter_map(Weak::upgrade).collect();
            let dead = live.len() != targets.len();
            (live, dead)
        };
        if dead {
            self.targets.write().retain(|weak| weak.strong_count() > 0);
            log::debug!("Load balancer '{}' pruned dropped targets", self.name);
        }
        live
    }

    fn available(&self) -> Vec<SharedTarget> {
        self.targets()
            .into_iter()
            .filter(|target| target.is_available())
            .collect()
    }

    pub fn into_executable(self) -> Executable {
        Executable::Async(Arc::new(self))
    }

    fn choose(&self, exchange: &Exchange, available: &[SharedTarget]) -> Result<SharedTarget, ExchangeError> {
        let index = match &self.policy {
            LoadBalancePolicy::RoundRobin | LoadBalancePolicy::Failover { .. } => {
                self.counter.fetch_add(1, Ordering::Relaxed) % available.len()
            }
            LoadBalancePolicy::Random => rand::thread_rng().gen_range(0..available.len()),
            LoadBalancePolicy::Sticky(expression) => {
                let key = evaluate_key(expression.as_ref(), exchange)
                    .ok_or_else(|| ExchangeError::missing_correlation_key(expression.describe()))?;
                let mut hasher = fnv::FnvHasher::default();
                key.hash(&mut hasher);
                (hasher.finish() % available.len() as u64) as usize
            }
            LoadBalancePolicy::Broadcast => 0,
        };
        Ok(available[index].clone())
    }

    fn broadcast(&self, exchange: Exchange, callback: AsyncCallback, targets: Vec<SharedTarget>) -> bool {
        let copies: Vec<Exchange> = targets.iter().map(|_| exchange.copy()).collect();
        let state = Arc::new(Broadcast {
            balancer: self.name.clone(),
            remaining: AtomicUsize::new(targets.len() + 1),
            failures: AtomicUsize::new(0),
            original: Mutex::new(Some((exchange, callback))),
        });
        for (target, copy) in targets.iter().zip(copies) {
            let state = state.clone();
            let target_name = target.name().to_string();
            target.process_async(
                copy,
                AsyncCallback::new(move |copy, _| {
                    if let Some(failure) = copy.failure() {
                        log::warn!(
                            "Broadcast copy {} to '{}' failed: {}",
                            copy.uuid(),
                            target_name,
                            failure
                        );
                        state.failures.fetch_add(1, Ordering::SeqCst);
                    }
                    state.arrive(false);
                }),
            );
        }
        state.arrive(true)
    }
}

/// Join state of a broadcast. The dispatcher holds one arrival of its own so
/// the original cannot complete before every copy has been dispatched.
struct Broadcast {
    balancer: String,
    remaining: AtomicUsize,
    failures: AtomicUsize,
    original: Mutex<Option<(Exchange, AsyncCallback)>>,
}

impl Broadcast {
    fn arrive(&self, dispatcher: bool) -> bool {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        let original = self.original.lock().take();
        if let Some((mut exchange, callback)) = original {
            let failures = self.failures.load(Ordering::SeqCst);
            log::trace!(
                "Broadcast '{}' of exchange {} finished with {} failed copies",
                self.balancer,
                exchange.uuid(),
                failures
            );
            exchange.properties_mut().insert(BROADCAST_FAILURES, failures);
            callback.done(exchange, dispatcher);
        }
        dispatcher
    }
}

impl AsyncProcessor for LoadBalancer {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let available = self.available();
        if available.is_empty() {
            log::debug!("Load balancer '{}' has no available target", self.name);
            exchange.set_failure(ExchangeError::no_available_target(&self.name));
            callback.done(exchange, true);
            return true;
        }
        if let LoadBalancePolicy::Broadcast = self.policy {
            return self.broadcast(exchange, callback, available);
        }
        let start = match self.choose(&exchange, &available) {
            Ok(target) => target,
            Err(e) => {
                exchange.set_failure(e);
                callback.done(exchange, true);
                return true;
            }
        };
        if let LoadBalancePolicy::Failover { max_attempts } = self.policy {
            let offset = available
                .iter()
                .position(|target| Arc::ptr_eq(target, &start))
                .unwrap_or(0);
            let attempts = match max_attempts {
                0 => available.len(),
                n => n.min(available.len()),
            };
            let failover = Arc::new(Failover {
                balancer: self.name.clone(),
                targets: available,
                offset,
                attempts,
            });
            return Failover::run(&failover, 0, exchange, callback, true);
        }
        log::trace!(
            "Load balancer '{}' sends exchange {} to '{}'",
            self.name,
            exchange.uuid(),
            start.name()
        );
        start.process_async(exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Failover {
    balancer: String,
    targets: Vec<SharedTarget>,
    offset: usize,
    attempts: usize,
}

type Handoff = Arc<Mutex<Option<(Exchange, AsyncCallback)>>>;

impl Failover {
    /// Tries targets from `attempt` on. Attempts that finish synchronously
    /// are retried by the loop; a pending attempt resumes on its completing
    /// thread.
    fn run(
        this: &Arc<Failover>,
        mut attempt: usize,
        mut exchange: Exchange,
        mut callback: AsyncCallback,
        entered_sync: bool,
    ) -> bool {
        let handoff: Handoff = Arc::new(Mutex::new(None));
        loop {
            let target = &this.targets[(this.offset + attempt) % this.targets.len()];
            exchange.properties_mut().insert(FAILOVER_ATTEMPTS, attempt + 1);

            let slot = Arc::clone(&handoff);
            let resume = Arc::clone(this);
            let continuation = AsyncCallback::new(move |mut exchange, done_sync| {
                if done_sync {
                    *slot.lock() = Some((exchange, callback));
                } else if resume.retry(&mut exchange, attempt) {
                    Failover::run(&resume, attempt + 1, exchange, callback, false);
                } else {
                    callback.done(exchange, false);
                }
            });
            target.process_async(exchange, continuation);

            let handed_back = handoff.lock().take();
            let Some((mut returned, outer)) = handed_back else {
                return false;
            };
            if !this.retry(&mut returned, attempt) {
                outer.done(returned, entered_sync);
                return entered_sync;
            }
            exchange = returned;
            callback = outer;
            attempt += 1;
        }
    }

    /// Clears the failure of a failed attempt when another one is allowed.
    fn retry(&self, exchange: &mut Exchange, attempt: usize) -> bool {
        if !exchange.is_failed() {
            return false;
        }
        if attempt + 1 >= self.attempts {
            log::debug!(
                "Failover '{}' gave up on exchange {} after {} attempts",
                self.balancer,
                exchange.uuid(),
                attempt + 1
            );
            return false;
        }
        if let Some(failure) = exchange.take_failure() {
            log::warn!(
                "Failover '{}' attempt {} for exchange {} failed, trying next target: {}",
                self.balancer,
                attempt + 1,
                exchange.uuid(),
                failure
            );
        }
        true
    }
}
