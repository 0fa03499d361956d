//! The mediation context.
//!
//! A context owns everything that would otherwise be process-wide: named
//! processors and repositories, routes and their consumers, in-flight
//! tracking and the forced-shutdown signal. Two contexts in one process share
//! nothing.

use crate::config::EngineConfig;
use crate::eip::idempotent::{IdempotentRepository, MemoryIdempotentRepository};
use crate::processor::Executable;
use crate::processor::registry::{ComponentId, Registry, RegistryError};
use crate::route::{
    Consumer, ConsumerStatus, InFlightRepository, RedeliveryPolicy, Route, RouteBuilder, RouteError,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    /// Every exchange completed within the grace period.
    Complete,
    /// The grace period elapsed and pending work was cancelled. Exchanges
    /// whose steps ignored the cancellation were completed by the context.
    /// `remaining` counts those still in flight afterwards.
    Forced { interrupted: usize, remaining: usize },
    /// The grace period elapsed and forcing was disabled.
    Timeout { remaining: usize },
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Context '{name}' is not running.")]
    NotRunning { name: String },
}

impl ContextError {
    #[inline]
    pub(crate) fn not_running(name: impl Into<String>) -> Self {
        ContextError::NotRunning { name: name.into() }
    }
}

pub struct MediationContext {
    name: String,
    config: EngineConfig,
    state: RwLock<ContextState>,
    processors: Registry<Executable>,
    repositories: Registry<dyn IdempotentRepository>,
    routes: Registry<Route>,
    consumers: Mutex<Vec<Arc<dyn Consumer>>>,
    inflight: Arc<InFlightRepository>,
    force: CancellationToken,
}

impl MediationContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, EngineConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(ContextState::Running),
            processors: Registry::new(),
            repositories: Registry::new(),
            routes: Registry::new(),
            consumers: Mutex::new(Vec::new()),
            inflight: Arc::new(InFlightRepository::new()),
            force: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> ContextState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContextState::Running
    }

    pub fn register_processor(&self, id: impl Into<String>, step: Executable) -> Result<(), ContextError> {
        self.processors.register(ComponentId::new(id), Arc::new(step))?;
        Ok(())
    }

    pub fn processor(&self, id: &str) -> Result<Executable, ContextError> {
        let step = self.processors.find_with_id(&ComponentId::new(id))?;
        Ok(step.as_ref().clone())
    }

    pub fn register_repository(
        &self,
        id: impl Into<String>,
        repository: Arc<dyn IdempotentRepository>,
    ) -> Result<(), ContextError> {
        self.repositories.register(ComponentId::new(id), repository)?;
        Ok(())
    }

    pub fn repository(&self, id: &str) -> Result<Arc<dyn IdempotentRepository>, ContextError> {
        Ok(self.repositories.find_with_id(&ComponentId::new(id))?)
    }

    /// Returns the repository registered as `id`, creating a memory
    /// repository sized by the idempotent config section when missing.
    pub fn memory_repository(&self, id: &str) -> Arc<dyn IdempotentRepository> {
        if let Ok(existing) = self.repository(id) {
            return existing;
        }
        let created: Arc<dyn IdempotentRepository> = Arc::new(MemoryIdempotentRepository::with_capacity(
            id,
            self.config.idempotent.repository_capacity,
        ));
        match self.repositories.register(ComponentId::new(id), created.clone()) {
            Ok(()) => created,
            // Lost a race with another registration of the same id.
            Err(_) => self.repository(id).unwrap_or(created),
        }
    }

    /// Builds a route bound to this context's in-flight tracking and
    /// shutdown signal, and registers it.
    pub fn add_route(&self, builder: RouteBuilder) -> Result<Route, ContextError> {
        if !self.is_running() {
            return Err(ContextError::not_running(&self.name));
        }
        let route = builder
            .default_redelivery(RedeliveryPolicy::from_config(&self.config.redelivery))
            .inflight(self.inflight.clone())
            .cancellation(self.force.clone())
            .build();
        self.routes
            .register(ComponentId::new(route.id()), Arc::new(route.clone()))?;
        log::info!("Context '{}' added route '{}'", self.name, route.id());
        Ok(route)
    }

    pub fn route(&self, id: &str) -> Result<Route, ContextError> {
        let route = self.routes.find_with_id(&ComponentId::new(id))?;
        Ok(route.as_ref().clone())
    }

    /// Keeps `consumer` alive with the context and stops it on shutdown.
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) {
        self.consumers.lock().push(consumer);
    }

    /// Starts every consumer that is not running yet.
    pub fn start(&self) -> Result<(), ContextError> {
        if !self.is_running() {
            return Err(ContextError::not_running(&self.name));
        }
        let consumers = self.consumers.lock().clone();
        for consumer in consumers {
            if consumer.status() == ConsumerStatus::Stopped {
                consumer.start()?;
            }
        }
        log::info!("Context '{}' started", self.name);
        Ok(())
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.count()
    }

    /// Shuts down with the configured grace period.
    pub async fn shutdown(&self) -> ShutdownResult {
        self.shutdown_with(self.config.shutdown.timeout()).await
    }

    /// Stops consumers and routes, then waits up to `grace` for in-flight
    /// exchanges. When the grace period elapses and forcing is enabled,
    /// pending work is cancelled and fails with
    /// [`ExchangeError::ShutdownForced`](crate::exchange::ExchangeError::ShutdownForced).
    /// Exchanges not handed back within the settle period are completed here,
    /// running their listeners and notifying their callers. Their steps'
    /// late results are discarded.
    pub async fn shutdown_with(&self, grace: Duration) -> ShutdownResult {
        *self.state.write() = ContextState::Draining;
        log::info!(
            "Context '{}' shutting down with {} exchanges in flight",
            self.name,
            self.inflight.count()
        );
        let consumers = self.consumers.lock().clone();
        for consumer in &consumers {
            consumer.stop();
        }
        for route in self.routes.values() {
            route.stop_accepting();
        }

        let remaining = self.inflight.drain(grace).await;
        let result = if remaining == 0 {
            ShutdownResult::Complete
        } else if self.config.shutdown.force_on_timeout {
            log::warn!(
                "Context '{}' forcing shutdown of {} in-flight exchanges",
                self.name,
                remaining
            );
            self.force.cancel();
            let mut left = self.inflight.drain(self.config.shutdown.settle()).await;
            if left > 0 {
                let completed = self.inflight.force_complete();
                log::warn!(
                    "Context '{}' completed {} exchanges held past the settle period",
                    self.name,
                    completed
                );
                left = self.inflight.count();
            }
            ShutdownResult::Forced {
                interrupted: remaining,
                remaining: left,
            }
        } else {
            log::warn!(
                "Context '{}' shutdown timed out with {} exchanges in flight",
                self.name,
                remaining
            );
            ShutdownResult::Timeout { remaining }
        };

        *self.state.write() = ContextState::Stopped;
        log::info!("Context '{}' stopped: {:?}", self.name, result);
        result
    }
}
