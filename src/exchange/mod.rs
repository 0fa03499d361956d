pub mod message;
pub mod properties;

pub use message::{Headers, Message};
pub use properties::Properties;

use crate::status::ExchangeState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Whether the producer of an exchange expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExchangePattern {
    #[default]
    #[serde(alias = "in_only", alias = "IN_ONLY")]
    InOnly,
    #[serde(alias = "in_out", alias = "IN_OUT")]
    InOut,
}

/// The unit of work carried through a processor chain.
///
/// An exchange holds the input message, an optional output message, the
/// failure (if any), process-scoped properties and the completion listeners
/// that run once the exchange finishes.
///
/// # Behavior
/// Completion is driven by [`Exchange::complete`]. Listeners run exactly once,
/// in reverse registration order, regardless of the outcome. `complete` needs
/// `&mut self`, so only the single owner of the exchange can run them. If an
/// exchange with pending listeners is dropped without being completed it is
/// failed with [`ExchangeError::Dropped`] and the listeners run from `Drop`.
///
/// The listener list is shared with the route running the exchange, which
/// lets a forced shutdown complete an exchange held by a step that never
/// hands it back.
pub struct Exchange {
    uuid: Uuid,
    created: DateTime<Utc>,
    route_id: Option<String>,
    pattern: ExchangePattern,
    input: Message,
    output: Option<Message>,
    failure: Option<ExchangeError>,
    stopped: bool,
    properties: Properties,
    listeners: SharedListeners,
    state: ExchangeState,
    cancellation: CancellationToken,
}

impl Exchange {
    /// Creates a new exchange with an empty (`null`) body and a random UUID.
    ///
    /// # Examples
    /// ```rust
    /// use idemio_mediation::exchange::Exchange;
    ///
    /// let exchange = Exchange::new();
    /// assert!(exchange.body().is_null());
    /// ```
    pub fn new() -> Self {
        Self::new_with_uuid(Uuid::new_v4())
    }

    /// Creates a new exchange with a specific UUID.
    pub fn new_with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            created: Utc::now(),
            route_id: None,
            pattern: ExchangePattern::default(),
            input: Message::default(),
            output: None,
            failure: None,
            stopped: false,
            properties: Properties::new(),
            listeners: SharedListeners::default(),
            state: ExchangeState::CREATED,
            cancellation: CancellationToken::new(),
        }
    }

    /// Creates a new exchange carrying `message` as its input.
    pub fn with_message(message: Message) -> Self {
        let mut exchange = Self::new();
        exchange.input = message;
        exchange
    }

    /// Creates a new exchange whose input body is `body`.
    pub fn with_body(body: impl Into<Value>) -> Self {
        Self::with_message(Message::new(body))
    }

    /// Creates an independent copy used for fan-out.
    ///
    /// The copy gets a new UUID and shares the messages, pattern, route and
    /// properties of the original. Listeners, failure and the stop flag are
    /// not copied.
    pub fn copy(&self) -> Self {
        let mut copy = Self::new();
        copy.route_id = self.route_id.clone();
        copy.pattern = self.pattern;
        copy.input = self.input.clone();
        copy.output = self.output.clone();
        copy.properties = self.properties.clone();
        copy.cancellation = self.cancellation.clone();
        copy
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn created(&self) -> &DateTime<Utc> {
        &self.created
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub(crate) fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    pub fn set_input(&mut self, input: Message) {
        self.input = input;
    }

    /// Shortcut for the input body.
    pub fn body(&self) -> &Value {
        self.input.body()
    }

    /// Shortcut for an input header.
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.input.header(key)
    }

    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    pub fn output_mut(&mut self) -> Option<&mut Message> {
        self.output.as_mut()
    }

    pub fn set_output(&mut self, output: Message) {
        self.output = Some(output);
    }

    pub fn take_output(&mut self) -> Option<Message> {
        self.output.take()
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn failure(&self) -> Option<&ExchangeError> {
        self.failure.as_ref()
    }

    /// Records a failure. Subsequent processors of the chain are skipped.
    pub fn set_failure(&mut self, failure: ExchangeError) {
        log::trace!("Exchange {} failed: {}", self.uuid, failure);
        self.failure = Some(failure);
    }

    /// Clears the failure, returning it. Used by error handlers and failover.
    pub fn take_failure(&mut self) -> Option<ExchangeError> {
        self.failure.take()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Stops the chain without failing the exchange.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// True when the next processor of a chain may run.
    pub fn should_continue(&self) -> bool {
        !self.stopped && self.failure.is_none()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Token cancelled when the owning context forces shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Registers a listener invoked once when the exchange completes.
    pub fn add_completion_listener(
        &mut self,
        listener: impl FnOnce(&Exchange) + Send + 'static,
    ) {
        self.listeners.lock().push(CompletionListener::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle {
            uuid: self.uuid,
            created: self.created,
            route_id: self.route_id.clone(),
            pattern: self.pattern,
            input: self.input.clone(),
            listeners: self.listeners.clone(),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Moves the exchange into the processor chain.
    pub fn begin(&mut self) -> Result<(), ExchangeError> {
        match self.state.enter_chain() {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => Err(ExchangeError::state_error(
                &self.uuid,
                self.state,
                "A finished exchange cannot re-enter a processor chain",
            )),
        }
    }

    /// Records the terminal outcome and runs the completion listeners.
    ///
    /// Returns `false` when the listeners had already been notified, in which
    /// case nothing runs.
    pub fn complete(&mut self) -> bool {
        if self.state.is_notified() {
            log::warn!("Exchange {} was already completed", self.uuid);
            return false;
        }
        self.state = self.state.finish(self.failure.is_some());
        let listeners = std::mem::take(&mut *self.listeners.lock());
        log::trace!(
            "Completing exchange {} as {} with {} listeners",
            self.uuid,
            self.state,
            listeners.len()
        );
        for listener in listeners.into_iter().rev() {
            let exchange: &Exchange = self;
            if catch_unwind(AssertUnwindSafe(|| listener.invoke(exchange))).is_err() {
                log::error!("Completion listener panicked for exchange {}", self.uuid);
            }
        }
        self.state |= ExchangeState::NOTIFIED;
        true
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("uuid", &self.uuid)
            .field("route_id", &self.route_id)
            .field("pattern", &self.pattern)
            .field("state", &self.state)
            .field("stopped", &self.stopped)
            .field("failure", &self.failure)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.state.is_notified() || self.listeners.lock().is_empty() {
            return;
        }
        log::warn!("Exchange {} dropped before completion", self.uuid);
        if self.failure.is_none() && !self.state.is_terminal() {
            self.failure = Some(ExchangeError::dropped(&self.uuid));
        }
        self.complete();
    }
}

type SharedListeners = Arc<Mutex<Vec<CompletionListener>>>;

/// What is needed to complete an exchange without holding it.
pub(crate) struct CompletionHandle {
    uuid: Uuid,
    created: DateTime<Utc>,
    route_id: Option<String>,
    pattern: ExchangePattern,
    input: Message,
    listeners: SharedListeners,
    cancellation: CancellationToken,
}

impl CompletionHandle {
    pub(crate) fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    /// Rebuilds the exchange failed with [`ExchangeError::ShutdownForced`].
    ///
    /// The rebuilt exchange carries the original input and shares the
    /// listeners, so whichever of the two completes first runs them.
    pub(crate) fn into_forced(self) -> Exchange {
        Exchange {
            uuid: self.uuid,
            created: self.created,
            route_id: self.route_id,
            pattern: self.pattern,
            input: self.input,
            output: None,
            failure: Some(ExchangeError::shutdown_forced(&self.uuid)),
            stopped: false,
            properties: Properties::new(),
            listeners: self.listeners,
            state: ExchangeState::IN_CHAIN,
            cancellation: self.cancellation,
        }
    }
}

/// A one-shot callback run when an exchange completes.
pub struct CompletionListener {
    callback: Box<dyn FnOnce(&Exchange) + Send>,
}

impl CompletionListener {
    pub fn new(callback: impl FnOnce(&Exchange) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn invoke(self, exchange: &Exchange) {
        (self.callback)(exchange);
    }
}

/// Failures recorded on an exchange.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Correlation key expression '{expression}' evaluated to an empty value.")]
    MissingCorrelationKey { expression: String },

    #[error("Expression '{expression}' is invalid. {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("Exchange rejected by throttler '{throttler}'.")]
    ThrottleRejected { throttler: String },

    #[error("Load balancer '{balancer}' has no available target.")]
    NoAvailableTarget { balancer: String },

    #[error("Exchange rejected. {message}")]
    Rejected { message: String },

    #[error("Processor '{processor}' failed. {message}")]
    Processing { processor: String, message: String },

    #[error("Exchange '{uuid}' was failed by a forced shutdown.")]
    ShutdownForced { uuid: Uuid },

    #[error("Exchange '{uuid}' was dropped before completion.")]
    Dropped { uuid: Uuid },

    #[error("Exchange '{uuid}' is in state {state}. {message}")]
    State {
        uuid: Uuid,
        state: String,
        message: String,
    },
}

impl ExchangeError {
    #[inline]
    pub fn missing_correlation_key(expression: impl Into<String>) -> Self {
        ExchangeError::MissingCorrelationKey {
            expression: expression.into(),
        }
    }

    #[inline]
    pub fn invalid_expression(expression: impl Into<String>, msg: impl Into<String>) -> Self {
        ExchangeError::InvalidExpression {
            expression: expression.into(),
            message: msg.into(),
        }
    }

    #[inline]
    pub fn throttle_rejected(throttler: impl Into<String>) -> Self {
        ExchangeError::ThrottleRejected {
            throttler: throttler.into(),
        }
    }

    #[inline]
    pub fn no_available_target(balancer: impl Into<String>) -> Self {
        ExchangeError::NoAvailableTarget {
            balancer: balancer.into(),
        }
    }

    #[inline]
    pub fn rejected(msg: impl Into<String>) -> Self {
        ExchangeError::Rejected {
            message: msg.into(),
        }
    }

    #[inline]
    pub fn processing(processor: impl Into<String>, msg: impl Into<String>) -> Self {
        ExchangeError::Processing {
            processor: processor.into(),
            message: msg.into(),
        }
    }

    #[inline]
    pub const fn shutdown_forced(uuid: &Uuid) -> Self {
        ExchangeError::ShutdownForced { uuid: *uuid }
    }

    #[inline]
    pub const fn dropped(uuid: &Uuid) -> Self {
        ExchangeError::Dropped { uuid: *uuid }
    }

    #[inline]
    pub fn state_error(uuid: &Uuid, state: ExchangeState, msg: impl Into<String>) -> Self {
        ExchangeError::State {
            uuid: *uuid,
            state: state.to_string(),
            message: msg.into(),
        }
    }
}
