/// A unit of work handed to the dispatcher for eventual execution on some
/// thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The external execution collaborator: anything that can run a [`Job`] on
/// some thread, eventually.
///
/// No ordering is assumed across submissions. An [`Executor`] submits at most
/// one activation of its work loop at a time, so implementations never see
/// two live activations of the same executor.
///
/// A dispatcher that drops or fails to run a job stalls the executor that
/// submitted it: the queue stops draining and its pending futures never
/// resolve. There is no recovery path.
///
/// [`Executor`]: crate::Executor
pub trait Dispatch: Send + Sync + 'static {
    /// Submit a job for eventual execution.
    fn dispatch(&self, job: Job);
}

impl<F> Dispatch for F
where
    F: Fn(Job) + Send + Sync + 'static,
{
    fn dispatch(&self, job: Job) {
        self(job)
    }
}
