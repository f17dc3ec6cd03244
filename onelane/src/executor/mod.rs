use crate::dispatch::Dispatch;
use crate::queue::Core;
use crate::signal::staged::StagedFuture;
use crate::signal::{Signal, pair};
use crate::task::{Outcome, Shape, Step, TaskError};
use anyhow::{Result, anyhow};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;


/// Acceptance half of a submission: settles once the executor has taken the
/// job into its admitted window. Independent of whether the job later runs
/// to completion or fails; a full window reports itself here as a pending
/// signal, never as an error.
pub type Acceptance = Signal<()>;

/// How many tasks one activation runs before yielding back to the
/// dispatcher, so other runnables sharing it are not starved. The contract
/// is "bounded per activation"; the exact figure is tunable per executor.
pub const DEFAULT_BATCH: u32 = 200;

/// Largest admissible buffer: the window length shares an atomic word with a
/// 48-bit node pointer.
pub const MAX_BUF_LEN: u32 = u16::MAX as u32;

/// Configures an [`Executor`].
pub struct Builder {
    buf_len: u32,
    batch: u32,
    dispatcher: Arc<dyn Dispatch>,
}

impl Builder {
    pub fn new(buf_len: u32, dispatcher: Arc<dyn Dispatch>) -> Builder {
        Builder {
            buf_len,
            batch: DEFAULT_BATCH,
            dispatcher,
        }
    }

    /// Overrides the per-activation task budget.
    ///
    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn batch(mut self, val: u32) -> Builder {
        assert!(val > 0, "batch must be greater than 0");
        self.batch = val;
        self
    }

    /// Creates the configured `Executor`.
    pub fn try_build(self) -> Result<Executor> {
        if self.buf_len == 0 {
            return Err(anyhow!("buffer length must be at least 1"));
        }
        if self.buf_len > MAX_BUF_LEN {
            return Err(anyhow!(
                "buffer length must fit in 16 bits, got {}",
                self.buf_len
            ));
        }
        Ok(Executor {
            core: Arc::new(Core::new(self.buf_len, self.batch, self.dispatcher)),
        })
    }
}

/// Serializes submitted work onto a single logical lane.
///
/// Any number of threads may submit concurrently without blocking; at most
/// one task body executes at any instant, in submission order. A bounded
/// admission window of `buf_len` slots converts "buffer full" into pending
/// acceptance signals instead of blocked producers or dropped tasks.
///
/// Task bodies must not submit to their own executor and then synchronously
/// wait on the outcome: the single consumer cannot run the nested job while
/// the waiting one occupies it, so such a wait deadlocks by design.
#[derive(Clone)]
pub struct Executor {
    core: Arc<Core>,
}

impl Executor {
    /// An executor with `buf_len` admission slots, running its work loop on
    /// `dispatcher`. `buf_len` must be at least 1.
    pub fn try_new(buf_len: u32, dispatcher: Arc<dyn Dispatch>) -> Result<Executor> {
        Builder::new(buf_len, dispatcher).try_build()
    }

    pub fn builder(buf_len: u32, dispatcher: Arc<dyn Dispatch>) -> Builder {
        Builder::new(buf_len, dispatcher)
    }

    /// Fire-and-forget submission. The returned signal settles on admission;
    /// a failing body is logged and swallowed, never reported to the caller.
    pub fn enqueue(&self, f: impl FnOnce() + Send + 'static) -> Acceptance {
        let (accept, acceptance) = pair();
        let body = Shape::Sync(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                let err = TaskError::panicked(payload);
                tracing::warn!(%err, "fire-and-forget task failed");
            }
        }));
        self.core.push(accept, body);
        acceptance
    }

    /// Fire-and-forget submission of a body that starts asynchronous work:
    /// the returned child keeps the task's window slot occupied until it
    /// settles.
    pub fn enqueue_deferred(
        &self,
        f: impl FnOnce() -> Signal<()> + Send + 'static,
    ) -> Acceptance {
        let (accept, acceptance) = pair();
        let body = Shape::Deferred(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(child) => Step::InFlight(child),
                Err(payload) => {
                    let err = TaskError::panicked(payload);
                    tracing::warn!(%err, "fire-and-forget task failed");
                    Step::Done
                }
            }
        }));
        self.core.push(accept, body);
        acceptance
    }

    /// Submits a body and returns its eventual outcome. A panicking body
    /// settles the outcome with the captured failure; the executor is not
    /// poisoned.
    pub fn enqueue_result<T>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Signal<Outcome<T>>
    where
        T: Clone + Send + 'static,
    {
        let (accept, _) = pair();
        let (result, outcome) = pair();
        let body = Shape::Sync(Box::new(move || {
            result.settle(panic::catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::panicked));
        }));
        self.core.push(accept, body);
        outcome
    }

    /// Like [`enqueue_result`], for a body that hands back a future of the
    /// value. The slot stays occupied, and the outcome unsettled, until that
    /// future settles; its failure is the task's failure.
    ///
    /// [`enqueue_result`]: Executor::enqueue_result
    pub fn enqueue_result_deferred<T>(
        &self,
        f: impl FnOnce() -> Signal<Outcome<T>> + Send + 'static,
    ) -> Signal<Outcome<T>>
    where
        T: Clone + Send + 'static,
    {
        let (accept, _) = pair();
        let (result, outcome) = pair();
        let body = Shape::Deferred(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(child) => {
                    let (done, slot) = pair();
                    child.on_settled(move |out| {
                        result.settle(out);
                        done.settle(());
                    });
                    Step::InFlight(slot)
                }
                Err(payload) => {
                    result.settle(Err(TaskError::panicked(payload)));
                    Step::Done
                }
            }
        }));
        self.core.push(accept, body);
        outcome
    }

    /// Submits a body and returns a staged view. The acceptance stage
    /// settles with the result future on admission into *this* executor
    /// (synchronously, when the window had room), and the result stage
    /// settles when the body has run.
    pub fn enqueue_staged<T>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> StagedFuture<T>
    where
        T: Clone + Send + 'static,
    {
        let (accept, admitted) = pair();
        let (result, outcome) = pair();
        let (staged_promise, staged) = StagedFuture::pending();
        let inner = outcome.clone();
        admitted.on_settled(move |()| staged_promise.accept(inner));
        let body = Shape::Sync(Box::new(move || {
            result.settle(panic::catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::panicked));
        }));
        self.core.push(accept, body);
        staged
    }

    /// Submits a body that itself produces a staged value (typically by
    /// submitting to a downstream executor) and wires the inner acceptance
    /// to the returned acceptance. The task's window slot stays occupied
    /// until downstream admits, so backpressure propagates through chains of
    /// executors, and the caller can await "admitted end-to-end". The final
    /// result is wired through without occupying a slot.
    pub fn enqueue_chained<T>(
        &self,
        f: impl FnOnce() -> StagedFuture<T> + Send + 'static,
    ) -> StagedFuture<T>
    where
        T: Clone + Send + 'static,
    {
        let (accept, _) = pair();
        let (outer_promise, outer) = StagedFuture::pending();
        let body = Shape::Deferred(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(inner) => {
                    let (done, slot) = pair();
                    inner.acceptance().on_settled(move |acc| {
                        match acc {
                            Ok(inner_result) => outer_promise.accept(inner_result),
                            Err(cause) => outer_promise.fail(cause),
                        }
                        done.settle(());
                    });
                    Step::InFlight(slot)
                }
                Err(payload) => {
                    outer_promise.fail(TaskError::panicked(payload));
                    Step::Done
                }
            }
        }));
        self.core.push(accept, body);
        outer
    }
}

#[cfg(test)]
impl Executor {
    pub(crate) fn window_len(&self) -> u32 {
        self.core.window_len()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.core.in_flight_count()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.core.is_drained()
    }
}
