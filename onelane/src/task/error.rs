use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A captured task failure.
///
/// Produced when a task body panics, or when an upstream stage of a
/// [`StagedFuture`] fails before the value could be produced. Cheap to clone
/// so that every observer of a result signal sees the same cause.
///
/// [`StagedFuture`]: crate::StagedFuture
#[derive(Clone)]
pub struct TaskError {
    repr: Arc<Repr>,
}

enum Repr {
    Panic(String),
    Failed(String),
}

/// Result of a task body as observed through its result signal.
pub type Outcome<T> = Result<T, TaskError>;

impl TaskError {
    /// Wraps a payload caught from an unwinding task body.
    pub(crate) fn panicked(payload: Box<dyn Any + Send + 'static>) -> TaskError {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_owned()
        };
        TaskError {
            repr: Arc::new(Repr::Panic(message)),
        }
    }

    /// A failure with an explicit cause, for wiring staged values by hand.
    pub fn failed(message: impl Into<String>) -> TaskError {
        TaskError {
            repr: Arc::new(Repr::Failed(message.into())),
        }
    }

    /// Returns true if this failure came from a panicking task body.
    pub fn is_panic(&self) -> bool {
        matches!(*self.repr, Repr::Panic(_))
    }

    fn message(&self) -> &str {
        match &*self.repr {
            Repr::Panic(m) | Repr::Failed(m) => m,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.repr {
            Repr::Panic(m) => write!(f, "task panicked: {m}"),
            Repr::Failed(m) => write!(f, "task failed: {m}"),
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskError")
            .field("panic", &self.is_panic())
            .field("message", &self.message())
            .finish()
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_extraction() {
        let err = TaskError::panicked(Box::new("boom"));
        assert!(err.is_panic());
        assert_eq!(err.to_string(), "task panicked: boom");

        let err = TaskError::panicked(Box::new(String::from("heap boom")));
        assert_eq!(err.to_string(), "task panicked: heap boom");

        let err = TaskError::panicked(Box::new(17u32));
        assert_eq!(err.to_string(), "task panicked: task panicked");
    }

    #[test]
    fn test_failed_is_not_panic() {
        let err = TaskError::failed("downstream rejected");
        assert!(!err.is_panic());
        assert_eq!(err.to_string(), "task failed: downstream rejected");
    }
}
