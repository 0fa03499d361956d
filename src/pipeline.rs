//! The pipeline engine.
//!
//! A [`Pipeline`] composes an ordered list of [`Executable`] steps into a
//! single [`AsyncProcessor`]. Steps that finish synchronously are chained by
//! an iterative loop, so long synchronous chains run at a constant stack
//! depth. A step that goes pending receives a continuation that resumes the
//! chain at the next index on whichever thread completes the step.

use crate::exchange::Exchange;
use crate::processor::{AsyncCallback, AsyncProcessor, Executable};
use parking_lot::Mutex;
use std::sync::Arc;

/// Hand-off slot between a synchronously completed step and the running loop.
type Handoff = Arc<Mutex<Option<(Exchange, AsyncCallback)>>>;

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    name: String,
    steps: Vec<Executable>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Executable>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                name: name.into(),
                steps,
            }),
        }
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.steps.is_empty()
    }

    pub fn steps(&self) -> &[Executable] {
        &self.inner.steps
    }

    pub fn into_executable(self) -> Executable {
        Executable::Async(Arc::new(self))
    }
}

impl AsyncProcessor for Pipeline {
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        PipelineInner::run(&self.inner, 0, exchange, callback, true)
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

impl PipelineInner {
    /// Runs the chain from `index`.
    ///
    /// `entered_sync` is true when called from the original caller and false
    /// when resumed by a continuation; it is the `done_sync` flag reported to
    /// `callback` if the chain finishes without going pending again.
    fn run(
        inner: &Arc<PipelineInner>,
        mut index: usize,
        mut exchange: Exchange,
        mut callback: AsyncCallback,
        entered_sync: bool,
    ) -> bool {
        let handoff: Handoff = Arc::new(Mutex::new(None));
        loop {
            if index >= inner.steps.len() || !exchange.should_continue() {
                log::trace!(
                    "Pipeline '{}' finished exchange {} at step {}/{}",
                    inner.name,
                    exchange.uuid(),
                    index,
                    inner.steps.len()
                );
                callback.done(exchange, entered_sync);
                return entered_sync;
            }

            let step = &inner.steps[index];
            let next = index + 1;
            log::trace!(
                "Pipeline '{}' running step {} '{}' for exchange {}",
                inner.name,
                index,
                step.name(),
                exchange.uuid()
            );

            let resume = Arc::clone(inner);
            let slot = Arc::clone(&handoff);
            let continuation = AsyncCallback::new(move |exchange, done_sync| {
                if done_sync {
                    *slot.lock() = Some((exchange, callback));
                } else {
                    PipelineInner::run(&resume, next, exchange, callback, false);
                }
            });

            step.process_async(exchange, continuation);

            // The slot is authoritative: a filled slot means the step finished
            // on this thread, whatever it returned.
            let handed_back = handoff.lock().take();
            match handed_back {
                Some((returned, outer)) => {
                    exchange = returned;
                    callback = outer;
                    index = next;
                }
                None => {
                    log::trace!(
                        "Pipeline '{}' step {} '{}' is pending",
                        inner.name,
                        index,
                        step.name()
                    );
                    return false;
                }
            }
        }
    }
}

pub struct PipelineBuilder {
    name: String,
    steps: Vec<Executable>,
}

impl PipelineBuilder {
    pub fn step(mut self, step: Executable) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline::new(self.name, self.steps)
    }
}
