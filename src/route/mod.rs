//! Routes: the unit of work around a pipeline.
//!
//! A [`Route`] receives exchanges from a consumer or a direct call, runs them
//! through its pipeline and owns their completion: error handling, exception
//! reporting, completion listeners and finally the caller's callback.

pub mod channel;
pub mod inflight;
pub mod redelivery;

pub use channel::{ChannelConsumer, ChannelEndpointFactory};
pub use inflight::{InFlightRepository, InFlightScope, ThrottlingInFlightRoutePolicy};
pub use redelivery::{Redelivery, RedeliveryPolicy};

use crate::exchange::{CompletionHandle, Exchange, ExchangeError};
use crate::logger::{ExceptionHandler, LoggingExceptionHandler};
use crate::pipeline::Pipeline;
use crate::processor::{AsyncCallback, Executable, ExchangeFuture, ProcessorError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Hooks run around each exchange of a route.
pub trait RoutePolicy: Send + Sync {
    /// Called after the exchange entered the route, before the pipeline runs.
    fn on_exchange_begin(&self, route: &Route, exchange: &mut Exchange);

    /// Called once the exchange completed, before the caller is notified.
    fn on_exchange_done(&self, _route: &Route, _exchange: &Exchange) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Stopped,
    Started,
    Suspended,
}

/// Source of exchanges for a route.
pub trait Consumer: Send + Sync {
    fn start(&self) -> Result<(), RouteError>;

    fn stop(&self);

    /// Stops taking new work from the source without stopping the consumer.
    fn suspend(&self);

    fn resume(&self);

    fn status(&self) -> ConsumerStatus;

    fn name(&self) -> &str;
}

/// Creates consumers and producers from endpoint descriptors.
pub trait EndpointFactory: Send + Sync {
    fn create_consumer(&self, descriptor: &str, route: &Route) -> Result<Arc<dyn Consumer>, RouteError>;

    fn create_producer(&self, descriptor: &str) -> Result<Executable, RouteError>;
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Consumer '{consumer}' could not start. {message}")]
    ConsumerStart { consumer: String, message: String },

    #[error("Endpoint '{descriptor}' is not valid. {message}")]
    InvalidEndpoint { descriptor: String, message: String },
}

impl RouteError {
    #[inline]
    pub(crate) fn consumer_start(consumer: impl Into<String>, msg: impl Into<String>) -> Self {
        RouteError::ConsumerStart {
            consumer: consumer.into(),
            message: msg.into(),
        }
    }

    #[inline]
    pub(crate) fn invalid_endpoint(descriptor: impl Into<String>, msg: impl Into<String>) -> Self {
        RouteError::InvalidEndpoint {
            descriptor: descriptor.into(),
            message: msg.into(),
        }
    }
}

#[derive(Clone)]
pub struct Route {
    inner: Arc<RouteInner>,
}

struct RouteInner {
    id: String,
    pipeline: Executable,
    error_handler: Option<Executable>,
    exception_handler: Arc<dyn ExceptionHandler>,
    policies: Vec<Arc<dyn RoutePolicy>>,
    consumer: RwLock<Option<Weak<dyn Consumer>>>,
    inflight: Arc<InFlightRepository>,
    cancellation: CancellationToken,
    accepting: AtomicBool,
}

impl Route {
    /// Starts building a route.
    ///
    /// # Examples
    /// ```rust
    /// use idemio_mediation::exchange::Exchange;
    /// use idemio_mediation::processor::Executable;
    /// use idemio_mediation::route::Route;
    ///
    /// let route = Route::builder("greeting")
    ///     .step(Executable::from_fn("greet", |exchange: &mut Exchange| {
    ///         let name = exchange.body().as_str().unwrap_or("world").to_string();
    ///         exchange.input_mut().set_body(format!("hello {}", name));
    ///         Ok(())
    ///     }))
    ///     .build();
    /// let exchange = route.process(Exchange::with_body("idemio")).unwrap();
    /// assert_eq!(exchange.body(), "hello idemio");
    /// ```
    pub fn builder(id: impl Into<String>) -> RouteBuilder {
        RouteBuilder {
            id: id.into(),
            steps: Vec::new(),
            error_handler: None,
            exception_handler: None,
            policies: Vec::new(),
            redelivery: None,
            inflight: None,
            cancellation: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn inflight(&self) -> &Arc<InFlightRepository> {
        &self.inner.inflight
    }

    pub fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.inner.consumer.read().as_ref().and_then(Weak::upgrade)
    }

    /// Attaches the consumer feeding this route. The route keeps a weak
    /// reference; the consumer's owner keeps it alive.
    pub fn set_consumer(&self, consumer: &Arc<dyn Consumer>) {
        *self.inner.consumer.write() = Some(Arc::downgrade(consumer));
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Rejects exchanges that arrive from now on.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    /// Runs an exchange through the route.
    ///
    /// The callback is invoked exactly once after the exchange completed. The
    /// return value follows the [`AsyncProcessor`](crate::processor::AsyncProcessor)
    /// contract.
    pub fn dispatch(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let inner = &self.inner;
        exchange.set_route_id(&inner.id);
        exchange.set_cancellation(inner.cancellation.child_token());
        if !self.is_accepting() {
            exchange.set_failure(ExchangeError::rejected(format!(
                "Route '{}' is not accepting exchanges",
                inner.id
            )));
            return self.complete_exchange(exchange, callback, true);
        }
        if let Err(e) = exchange.begin() {
            log::warn!("Route '{}' refused exchange {}: {}", inner.id, exchange.uuid(), e);
            exchange.set_failure(e);
            callback.done(exchange, true);
            return true;
        }

        let mut guard = inner.inflight.begin(&inner.id);
        for policy in &inner.policies {
            policy.on_exchange_begin(self, &mut exchange);
        }
        let pending = Arc::new(PendingExchange {
            route: self.clone(),
            slot: Mutex::new(Some((exchange.completion_handle(), callback))),
        });
        guard.track(pending.clone());
        // Registered last so it is released first.
        exchange.add_completion_listener(move |_| drop(guard));

        log::trace!("Route '{}' started exchange {}", inner.id, exchange.uuid());
        let route = self.clone();
        inner
            .pipeline
            .process_then(exchange, move |exchange, done_sync| {
                route.after_pipeline(exchange, pending, done_sync)
            })
    }

    /// Runs an exchange through the route, blocking until it completes.
    pub fn process(&self, exchange: Exchange) -> Result<Exchange, ProcessorError> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(1);
        self.dispatch(
            exchange,
            AsyncCallback::new(move |exchange, _| {
                let _ = sender.send(exchange);
            }),
        );
        receiver
            .recv()
            .map_err(|_| ProcessorError::callback_dropped(self.id()))
    }

    /// Runs an exchange through the route, resolving once it completes.
    pub fn send(&self, exchange: Exchange) -> ExchangeFuture {
        let (sender, receiver) = oneshot::channel();
        self.dispatch(
            exchange,
            AsyncCallback::new(move |exchange, _| {
                let _ = sender.send(exchange);
            }),
        );
        ExchangeFuture::new(receiver, self.id())
    }

    fn after_pipeline(&self, exchange: Exchange, pending: Arc<PendingExchange>, done_sync: bool) -> bool {
        if exchange.is_failed() && !pending.is_settled() {
            if let Some(error_handler) = &self.inner.error_handler {
                log::debug!(
                    "Route '{}' handing failed exchange {} to '{}'",
                    self.inner.id,
                    exchange.uuid(),
                    error_handler.name()
                );
                let route = self.clone();
                return error_handler.process_then(exchange, move |exchange, handler_sync| {
                    route.finish(&pending, exchange, done_sync && handler_sync)
                });
            }
        }
        self.finish(&pending, exchange, done_sync)
    }

    fn finish(&self, pending: &PendingExchange, exchange: Exchange, done_sync: bool) -> bool {
        match pending.take() {
            Some((_, callback)) => self.complete_exchange(exchange, callback, done_sync),
            None => {
                log::debug!(
                    "Route '{}' discarded exchange {} completed by a forced shutdown",
                    self.inner.id,
                    exchange.uuid()
                );
                done_sync
            }
        }
    }

    fn complete_exchange(&self, mut exchange: Exchange, callback: AsyncCallback, done_sync: bool) -> bool {
        if let Some(failure) = exchange.failure().cloned() {
            let message = format!("Failed delivery for route '{}'", self.inner.id);
            self.inner.exception_handler.handle(&message, &exchange, &failure);
        }
        exchange.complete();
        for policy in &self.inner.policies {
            policy.on_exchange_done(self, &exchange);
        }
        log::trace!(
            "Route '{}' completed exchange {} as {}",
            self.inner.id,
            exchange.uuid(),
            exchange.state()
        );
        callback.done(exchange, done_sync);
        done_sync
    }
}

/// Completion owed to the caller of an exchange in flight.
///
/// Taken exactly once: by the route when the pipeline hands the exchange
/// back, or by a forced shutdown when it does not.
pub(crate) struct PendingExchange {
    route: Route,
    slot: Mutex<Option<(CompletionHandle, AsyncCallback)>>,
}

impl PendingExchange {
    fn take(&self) -> Option<(CompletionHandle, AsyncCallback)> {
        self.slot.lock().take()
    }

    fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Completes the exchange as failed by a forced shutdown. Returns `false`
    /// when it had completed already.
    pub(crate) fn force(&self) -> bool {
        let Some((handle, callback)) = self.take() else {
            return false;
        };
        log::warn!(
            "Route '{}' forcing completion of exchange {}",
            self.route.id(),
            handle.uuid()
        );
        let exchange = handle.into_forced();
        self.route.complete_exchange(exchange, callback, false);
        true
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.inner.id)
            .field("pipeline", &self.inner.pipeline)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

pub struct RouteBuilder {
    id: String,
    steps: Vec<Executable>,
    error_handler: Option<Executable>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    policies: Vec<Arc<dyn RoutePolicy>>,
    redelivery: Option<RedeliveryPolicy>,
    inflight: Option<Arc<InFlightRepository>>,
    cancellation: Option<CancellationToken>,
}

impl RouteBuilder {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn step(mut self, step: Executable) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Executable>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Step run for failed exchanges before they complete. It may clear the
    /// failure with [`Exchange::take_failure`] to mark it handled.
    pub fn error_handler(mut self, handler: Executable) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn RoutePolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Redelivers each failed step before the error handler sees the failure.
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Applies `policy` unless the route set its own.
    pub(crate) fn default_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery.get_or_insert(policy);
        self
    }

    pub(crate) fn inflight(mut self, inflight: Arc<InFlightRepository>) -> Self {
        self.inflight = Some(inflight);
        self
    }

    pub(crate) fn cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn build(self) -> Route {
        let steps = match self.redelivery.filter(RedeliveryPolicy::is_enabled) {
            Some(policy) => self
                .steps
                .into_iter()
                .map(|step| Redelivery::wrap(step, policy.clone()))
                .collect(),
            None => self.steps,
        };
        let pipeline = Pipeline::new(self.id.clone(), steps).into_executable();
        Route {
            inner: Arc::new(RouteInner {
                id: self.id,
                pipeline,
                error_handler: self.error_handler,
                exception_handler: self
                    .exception_handler
                    .unwrap_or_else(|| Arc::new(LoggingExceptionHandler::default())),
                policies: self.policies,
                consumer: RwLock::new(None),
                inflight: self.inflight.unwrap_or_default(),
                cancellation: self.cancellation.unwrap_or_default(),
                accepting: AtomicBool::new(true),
            }),
        }
    }
}
