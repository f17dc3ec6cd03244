// Public API
pub mod dispatch;
pub use dispatch::{Dispatch, Job};

pub mod executor;
pub use executor::{Acceptance, Builder, Executor};

pub mod signal;
pub use signal::staged::{StagedFuture, StagedPromise};
pub use signal::{Promise, Signal};

pub mod task;
pub use task::{Outcome, TaskError};

// Exports
pub(crate) mod queue;

#[cfg(test)]
pub(crate) mod test_utils;
