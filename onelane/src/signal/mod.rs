use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

pub mod staged;

type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// Creates a single-resolution future, returning the writer and reader
/// halves.
///
/// The [`Promise`] settles the value exactly once; any number of [`Signal`]
/// clones observe it, by polling, by blocking, or through a callback.
pub fn pair<T>() -> (Promise<T>, Signal<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending {
            wakers: SmallVec::new(),
            callbacks: SmallVec::new(),
        }),
        settled: Condvar::new(),
    });
    (
        Promise {
            inner: Arc::clone(&inner),
        },
        Signal { inner },
    )
}

enum State<T> {
    Pending {
        wakers: SmallVec<[Waker; 2]>,
        callbacks: SmallVec<[Callback<T>; 2]>,
    },
    Settled(T),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
}

/// Writer half of a single-resolution future.
///
/// Dropping an unsettled `Promise` leaves its observers pending forever; the
/// executor only does so when its dispatcher has failed.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Promise<T> {
    /// Settles the value, waking every observer and running registered
    /// callbacks.
    ///
    /// # Panics
    ///
    /// Settling twice is a programming error and panics.
    pub fn settle(&self, value: T) {
        let (wakers, callbacks) = {
            let mut state = self.inner.state.lock();
            if matches!(*state, State::Settled(_)) {
                panic!("single-resolution signal settled twice");
            }
            match std::mem::replace(&mut *state, State::Settled(value.clone())) {
                State::Pending { wakers, callbacks } => (wakers, callbacks),
                State::Settled(_) => unreachable!(),
            }
        };
        self.inner.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(value.clone());
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Settled(_))
    }
}

/// Reader half of a single-resolution future.
///
/// Cloning is cheap and every clone observes the same settlement. The type
/// implements [`Future`] directly; it can also be observed synchronously
/// through [`peek`], [`wait`] and [`on_settled`].
///
/// [`peek`]: Signal::peek
/// [`wait`]: Signal::wait
/// [`on_settled`]: Signal::on_settled
pub struct Signal<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Signal<T> {
    /// An already-settled signal.
    pub fn ready(value: T) -> Signal<T> {
        Signal {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Settled(value)),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Settled(_))
    }

    /// Returns the settled value, if any.
    pub fn peek(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Settled(value) => Some(value.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Runs `f` with the value once settled. Runs inline, on the caller,
    /// when the signal is already settled; otherwise on whichever thread
    /// settles the promise.
    pub fn on_settled(&self, f: impl FnOnce(T) + Send + 'static) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending { callbacks, .. } => callbacks.push(Box::new(f)),
            State::Settled(value) => {
                let value = value.clone();
                drop(state);
                f(value);
            }
        }
    }

    /// Blocks the calling thread until the signal settles.
    pub fn wait(&self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Settled(value) = &*state {
                return value.clone();
            }
            self.inner.settled.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`, returning `None` on expiry.
    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Settled(value) = &*state {
                return Some(value.clone());
            }
            if self.inner.settled.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Settled(value) => Some(value.clone()),
                    State::Pending { .. } => None,
                };
            }
        }
    }
}

impl<T: Clone> Future for Signal<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Settled(value) => Poll::Ready(value.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    assert_impl_all!(Promise<usize>: Send, Sync);
    assert_impl_all!(Signal<usize>: Send, Sync, Clone);

    #[test]
    fn test_settle_then_observe() {
        let (promise, signal) = pair();
        assert!(!signal.is_settled());
        assert_eq!(signal.peek(), None);

        promise.settle(7usize);
        assert!(promise.is_settled());
        assert_eq!(signal.peek(), Some(7));
        assert_eq!(futures::executor::block_on(signal.clone()), 7);
    }

    #[test]
    fn test_await_settled_from_another_thread() -> Result<()> {
        let (promise, signal) = pair();

        let observer = thread::spawn(move || futures::executor::block_on(signal));
        let settler = thread::spawn(move || promise.settle(42usize));

        assert_eq!(observer.join().unwrap(), 42);
        settler.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_callbacks_run_once_each() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (promise, signal) = pair();

        // Registered before the settlement.
        let h = Arc::clone(&hits);
        signal.on_settled(move |v: usize| {
            h.fetch_add(v, Ordering::SeqCst);
        });

        promise.settle(3);

        // Registered after: runs inline.
        let h = Arc::clone(&hits);
        signal.on_settled(move |v| {
            h.fetch_add(v * 10, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 33);
    }

    #[test]
    #[should_panic(expected = "settled twice")]
    fn test_double_settle_panics() {
        let (promise, _signal) = pair();
        promise.settle(1usize);
        promise.settle(2usize);
    }

    #[test]
    fn test_wait_for_times_out_then_succeeds() {
        let (promise, signal) = pair();
        assert_eq!(signal.wait_for(Duration::from_millis(10)), None::<usize>);

        let settler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.settle(5usize);
        });
        assert_eq!(signal.wait_for(Duration::from_secs(5)), Some(5));
        assert_eq!(signal.wait(), 5);
        settler.join().unwrap();
    }

    #[test]
    fn test_ready_signal() {
        let signal = Signal::ready("done");
        assert!(signal.is_settled());
        assert_eq!(signal.peek(), Some("done"));
    }
}
