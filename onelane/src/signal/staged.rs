use super::{Signal, pair};
use crate::task::{Outcome, TaskError};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A two-stage asynchronous value.
///
/// The *acceptance* stage settles when a downstream system has admitted the
/// work, carrying the result future; the *result* stage settles when the
/// value is produced. Awaiting the `StagedFuture` itself awaits the result
/// stage. The split is what lets backpressure travel through chains of
/// executors: a caller can await "admitted end-to-end" without waiting for
/// the value.
///
/// If acceptance fails, the result fails with the same cause; both stages
/// settle deterministically either way.
pub struct StagedFuture<T: Clone> {
    acceptance: Signal<Outcome<Signal<Outcome<T>>>>,
    result: Signal<Outcome<T>>,
}

impl<T: Clone> Clone for StagedFuture<T> {
    fn clone(&self) -> Self {
        StagedFuture {
            acceptance: self.acceptance.clone(),
            result: self.result.clone(),
        }
    }
}

/// Writer half of a [`StagedFuture`], enforcing the stage contract.
pub struct StagedPromise<T: Clone> {
    accept: super::Promise<Outcome<Signal<Outcome<T>>>>,
    result: super::Promise<Outcome<T>>,
}

impl<T: Clone + Send + 'static> StagedPromise<T> {
    /// Marks the work admitted, wiring `inner` through as the result stage.
    pub fn accept(self, inner: Signal<Outcome<T>>) {
        self.accept.settle(Ok(inner.clone()));
        let result = self.result;
        inner.on_settled(move |out| result.settle(out));
    }

    /// Fails both stages with the same cause.
    pub fn fail(self, cause: TaskError) {
        self.accept.settle(Err(cause.clone()));
        self.result.settle(Err(cause));
    }
}

impl<T: Clone + Send + 'static> StagedFuture<T> {
    /// A fresh, unresolved pair.
    pub fn pending() -> (StagedPromise<T>, StagedFuture<T>) {
        let (accept, acceptance) = pair();
        let (result, result_view) = pair();
        (
            StagedPromise { accept, result },
            StagedFuture {
                acceptance,
                result: result_view,
            },
        )
    }

    /// Wraps an already-admitted result future.
    pub fn ready(result: Signal<Outcome<T>>) -> StagedFuture<T> {
        StagedFuture {
            acceptance: Signal::ready(Ok(result.clone())),
            result,
        }
    }

    /// Both stages settled with `value`.
    pub fn settled(value: T) -> StagedFuture<T> {
        StagedFuture::ready(Signal::ready(Ok(value)))
    }

    /// Builds a staged value from a nested future-of-future: the outer layer
    /// is the acceptance stage, the inner layer produces the result.
    pub fn from_nested(outer: Signal<Outcome<Signal<Outcome<T>>>>) -> StagedFuture<T> {
        let (result, result_view) = pair();
        outer.on_settled(move |acc| match acc {
            Ok(inner) => inner.on_settled(move |out| result.settle(out)),
            Err(cause) => result.settle(Err(cause)),
        });
        StagedFuture {
            acceptance: outer,
            result: result_view,
        }
    }

    /// The acceptance stage: settles with the result future once admitted.
    pub fn acceptance(&self) -> Signal<Outcome<Signal<Outcome<T>>>> {
        self.acceptance.clone()
    }

    /// The result stage as a plain signal.
    pub fn result(&self) -> Signal<Outcome<T>> {
        self.result.clone()
    }

    pub fn is_accepted(&self) -> bool {
        self.acceptance.is_settled()
    }

    /// Runs `f` once the acceptance stage settles.
    pub fn on_accept(&self, f: impl FnOnce(Outcome<Signal<Outcome<T>>>) + Send + 'static) {
        self.acceptance.on_settled(f);
    }

    /// Blocks for the result, for at most `at_most` across *both* stages:
    /// time spent waiting on acceptance is subtracted from the wait on the
    /// inner future.
    pub fn ready_within(&self, at_most: Duration) -> Option<Outcome<T>> {
        let start = Instant::now();
        match self.acceptance.wait_for(at_most)? {
            Ok(inner) => inner.wait_for(at_most.saturating_sub(start.elapsed())),
            Err(cause) => Some(Err(cause)),
        }
    }
}

impl<T: Clone> Future for StagedFuture<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        Pin::new(&mut self.result).poll(cx)
    }
}
