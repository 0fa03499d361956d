pub mod handler;
pub mod registry;

use crate::exchange::{Exchange, ExchangeError};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Continuation handed to an [`AsyncProcessor`].
///
/// The callback must be invoked exactly once. `done_sync` tells the receiver
/// whether the callback runs on the caller's stack before `process_async`
/// returns (`true`) or later, possibly from another thread (`false`).
pub struct AsyncCallback {
    callback: Box<dyn FnOnce(Exchange, bool) + Send>,
}

impl AsyncCallback {
    pub fn new(callback: impl FnOnce(Exchange, bool) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn done(self, exchange: Exchange, done_sync: bool) {
        (self.callback)(exchange, done_sync);
    }
}

/// Synchronous processing step. Returns once the work is done.
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError>;

    fn name(&self) -> &str;
}

/// Asynchronous processing step.
///
/// `process_async` takes ownership of the exchange and hands it back through
/// the callback. The return value must equal the `done_sync` flag passed to
/// the callback: `true` when the work completed on the calling thread,
/// `false` when it is still pending.
pub trait AsyncProcessor: Send + Sync {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool;

    fn name(&self) -> &str;
}

/// A step of a chain, tagged with the capability it implements.
#[derive(Clone)]
pub enum Executable {
    Sync(Arc<dyn Processor>),
    Async(Arc<dyn AsyncProcessor>),
}

impl Executable {
    pub fn sync(processor: impl Processor + 'static) -> Self {
        Executable::Sync(Arc::new(processor))
    }

    pub fn asynchronous(processor: impl AsyncProcessor + 'static) -> Self {
        Executable::Async(Arc::new(processor))
    }

    /// Wraps a closure as a synchronous step.
    ///
    /// # Examples
    /// ```rust
    /// use idemio_mediation::exchange::Exchange;
    /// use idemio_mediation::processor::Executable;
    ///
    /// let step = Executable::from_fn("uppercase", |exchange: &mut Exchange| {
    ///     let upper = exchange.body().as_str().unwrap_or_default().to_uppercase();
    ///     exchange.input_mut().set_body(upper);
    ///     Ok(())
    /// });
    /// let exchange = step.process(Exchange::with_body("abc")).unwrap();
    /// assert_eq!(exchange.body(), "ABC");
    /// ```
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync + 'static,
    {
        Executable::Sync(Arc::new(FnProcessor {
            name: name.into(),
            f: Box::new(f),
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Executable::Sync(processor) => processor.name(),
            Executable::Async(processor) => processor.name(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Executable::Async(_))
    }

    /// Runs the step with the asynchronous contract.
    ///
    /// Synchronous steps run inline; a returned error is recorded as the
    /// exchange failure and the callback is invoked with `done_sync = true`.
    pub fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        match self {
            Executable::Sync(processor) => {
                let mut exchange = exchange;
                if let Err(e) = processor.process(&mut exchange) {
                    log::debug!(
                        "Processor '{}' failed exchange {}: {}",
                        processor.name(),
                        exchange.uuid(),
                        e
                    );
                    exchange.set_failure(e);
                }
                callback.done(exchange, true);
                true
            }
            Executable::Async(processor) => processor.process_async(exchange, callback),
        }
    }

    /// Runs the step, then `then` with its result.
    ///
    /// When the step finishes synchronously `then` runs on this stack after
    /// the step returned, with `done_sync = true`, and its result is returned.
    /// Otherwise `then` runs on the completing thread with `done_sync = false`
    /// and this returns `false`.
    pub fn process_then<F>(&self, exchange: Exchange, then: F) -> bool
    where
        F: FnOnce(Exchange, bool) -> bool + Send + 'static,
    {
        let handoff: Arc<Mutex<Option<(Exchange, F)>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&handoff);
        self.process_async(
            exchange,
            AsyncCallback::new(move |exchange, done_sync| {
                if done_sync {
                    *slot.lock() = Some((exchange, then));
                } else {
                    then(exchange, false);
                }
            }),
        );
        let handed_back = handoff.lock().take();
        match handed_back {
            Some((exchange, then)) => then(exchange, true),
            None => false,
        }
    }

    /// Runs the step and blocks the calling thread until it is done.
    ///
    /// Asynchronous steps are awaited through a channel. Do not call this from
    /// a single threaded runtime that the asynchronous step needs to make
    /// progress on.
    pub fn process(&self, exchange: Exchange) -> Result<Exchange, ProcessorError> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(1);
        self.process_async(
            exchange,
            AsyncCallback::new(move |exchange, _| {
                let _ = sender.send(exchange);
            }),
        );
        receiver
            .recv()
            .map_err(|_| ProcessorError::callback_dropped(self.name()))
    }

    /// Runs the step and returns a future resolving once it is done.
    pub fn process_future(&self, exchange: Exchange) -> ExchangeFuture {
        let (sender, receiver) = oneshot::channel();
        self.process_async(
            exchange,
            AsyncCallback::new(move |exchange, _| {
                let _ = sender.send(exchange);
            }),
        );
        ExchangeFuture::new(receiver, self.name())
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executable::Sync(processor) => write!(f, "Sync({})", processor.name()),
            Executable::Async(processor) => write!(f, "Async({})", processor.name()),
        }
    }
}

struct FnProcessor {
    name: String,
    f: Box<dyn Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync>,
}

impl Processor for FnProcessor {
    fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        (self.f)(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Future returned by [`Executable::process_future`].
pub struct ExchangeFuture {
    receiver: oneshot::Receiver<Exchange>,
    processor: String,
}

impl ExchangeFuture {
    pub(crate) fn new(receiver: oneshot::Receiver<Exchange>, processor: impl Into<String>) -> Self {
        Self {
            receiver,
            processor: processor.into(),
        }
    }
}

impl Future for ExchangeFuture {
    type Output = Result<Exchange, ProcessorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(exchange)) => Poll::Ready(Ok(exchange)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProcessorError::callback_dropped(
                this.processor.as_str(),
            ))),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Processor '{processor}' dropped its callback without completing the exchange.")]
    CallbackDropped { processor: String },
}

impl ProcessorError {
    #[inline]
    pub fn callback_dropped(processor: impl Into<String>) -> Self {
        ProcessorError::CallbackDropped {
            processor: processor.into(),
        }
    }
}
