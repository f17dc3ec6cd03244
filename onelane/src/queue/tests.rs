use super::*;
use crate::signal::pair;
use crate::test_utils::ManualDispatcher;
use anyhow::Result;
use static_assertions::assert_impl_all;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::atomic::AtomicUsize;
use std::thread;

assert_impl_all!(Core: Send, Sync);

fn noop() -> Shape {
    Shape::Sync(Box::new(|| {}))
}

fn counting(counter: &Arc<AtomicUsize>) -> Shape {
    let counter = Arc::clone(counter);
    Shape::Sync(Box::new(move || {
        counter.fetch_add(1, AtomicOrdering::SeqCst);
    }))
}

#[test]
fn test_window_word_roundtrip() {
    let node = Box::into_raw(Box::new(Node::new(pair().0, noop())));
    let word = pack(37, node);
    assert_eq!(unpack(word), (37, node));
    assert_eq!(unpack(pack(0, ptr::null_mut())), (0, ptr::null_mut()));
    unsafe { drop(Box::from_raw(node)) };
}

#[test]
fn test_first_push_seeds_and_dispatches() -> Result<()> {
    let dispatcher = ManualDispatcher::new();
    let core = Arc::new(Core::new(2, 200, dispatcher.clone()));

    let (accept, acceptance) = pair();
    assert!(core.push(accept, noop()));
    assert!(acceptance.is_settled());
    assert_eq!(core.window_len(), 1);
    assert_eq!(dispatcher.submissions(), 1);
    Ok(())
}

#[test]
fn test_full_window_reports_pending() -> Result<()> {
    let dispatcher = ManualDispatcher::new();
    let core = Arc::new(Core::new(2, 200, dispatcher.clone()));

    let (a1, _) = pair();
    let (a2, _) = pair();
    let (a3, pending) = pair();
    assert!(core.push(a1, noop()));
    assert!(core.push(a2, noop()));
    assert!(!core.push(a3, noop()));
    assert!(!pending.is_settled());
    assert_eq!(core.window_len(), 2);

    // Draining the queue settles the held-back acceptance.
    dispatcher.run_all();
    assert!(pending.is_settled());
    assert!(core.is_drained());
    Ok(())
}

#[test]
fn test_concurrent_producers_drain_completely() -> Result<()> {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 100;

    let dispatcher = ManualDispatcher::new();
    let core = Arc::new(Core::new(4, 200, dispatcher.clone()));
    let executed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let core = Arc::clone(&core);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let (accept, _) = pair();
                    core.push(accept, counting(&executed));
                }
            })
        })
        .collect();

    // Drain on this thread while producers race the intake; every
    // double-settled acceptance or double-run body would panic.
    while executed.load(AtomicOrdering::SeqCst) < THREADS * PER_THREAD {
        dispatcher.run_all();
        std::hint::spin_loop();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    dispatcher.run_all();

    assert_eq!(executed.load(AtomicOrdering::SeqCst), THREADS * PER_THREAD);
    assert!(core.is_drained());
    Ok(())
}
