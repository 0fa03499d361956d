use crate::exchange::{Exchange, ExchangeError};
use crate::processor::{AsyncCallback, AsyncProcessor, Executable};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::runtime::Handle;

/// An asynchronous step written as an `async fn`.
///
/// Handlers are adapted to the callback contract by [`HandlerProcessor`],
/// which runs them on a tokio runtime and resumes the chain on the worker
/// thread that finishes them.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn exec(&self, exchange: &mut Exchange) -> Result<(), ExchangeError>;

    fn name(&self) -> &str;
}

pub struct HandlerProcessor {
    handler: Arc<dyn Handler>,
    runtime: Option<Handle>,
}

impl HandlerProcessor {
    /// Runs the handler on the runtime current at the time of processing.
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            runtime: None,
        }
    }

    /// Runs the handler on a specific runtime.
    pub fn with_runtime(handler: impl Handler + 'static, runtime: Handle) -> Self {
        Self {
            handler: Arc::new(handler),
            runtime: Some(runtime),
        }
    }

    pub fn into_executable(self) -> Executable {
        Executable::Async(Arc::new(self))
    }
}

impl AsyncProcessor for HandlerProcessor {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                exchange.set_failure(ExchangeError::processing(
                    self.handler.name(),
                    "No tokio runtime available to run the handler",
                ));
                callback.done(exchange, true);
                return true;
            }
        };
        let handler = self.handler.clone();
        runtime.spawn(async move {
            let cancellation = exchange.cancellation().clone();
            let result = tokio::select! {
                result = handler.exec(&mut exchange) => Some(result),
                _ = cancellation.cancelled() => None,
            };
            match result {
                Some(Ok(())) => {}
                Some(Err(e)) => exchange.set_failure(e),
                None => {
                    log::warn!(
                        "Handler '{}' interrupted by shutdown for exchange {}",
                        handler.name(),
                        exchange.uuid()
                    );
                    let uuid = *exchange.uuid();
                    exchange.set_failure(ExchangeError::shutdown_forced(&uuid));
                }
            }
            callback.done(exchange, false);
        });
        false
    }

    fn name(&self) -> &str {
        self.handler.name()
    }
}
