use crate::dispatch::{Dispatch, Job};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Step-driven dispatcher spy: records every submission and runs activations
/// only when the test says so, making scheduling fully deterministic.
pub(crate) struct ManualDispatcher {
    jobs: Mutex<VecDeque<Job>>,
    submitted: AtomicUsize,
}

impl ManualDispatcher {
    pub(crate) fn new() -> Arc<ManualDispatcher> {
        Arc::new(ManualDispatcher {
            jobs: Mutex::new(VecDeque::new()),
            submitted: AtomicUsize::new(0),
        })
    }

    /// Activations waiting to run.
    pub(crate) fn queued(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Total activations ever submitted.
    pub(crate) fn submissions(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Runs the oldest pending activation inline. Returns false when idle.
    pub(crate) fn step(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs activations until none are pending, including ones enqueued
    /// while stepping. Returns how many ran.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.step() {
            ran += 1;
        }
        ran
    }

    /// Drops pending activations unrun, as a failing dispatcher would.
    pub(crate) fn discard_all(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let dropped = jobs.len();
        jobs.clear();
        dropped
    }
}

impl Dispatch for ManualDispatcher {
    fn dispatch(&self, job: Job) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().push_back(job);
    }
}

/// Thread-per-activation dispatcher for concurrency smoke tests. Activations
/// are rare (one per empty-to-non-empty transition or budget yield), so a
/// spawned thread apiece is fine.
pub(crate) struct ThreadDispatcher;

impl Dispatch for ThreadDispatcher {
    fn dispatch(&self, job: Job) {
        let _ = std::thread::spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_dispatcher_steps_in_order() {
        let dispatcher = ManualDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            dispatcher.dispatch(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(dispatcher.queued(), 3);
        assert_eq!(dispatcher.run_all(), 3);
        assert_eq!(dispatcher.submissions(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(!dispatcher.step());
    }
}
