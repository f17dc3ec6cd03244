use super::{Core, Node, pack, unpack};
use crate::signal::Signal;
use crate::task::Step;
use crossbeam_epoch::{self as epoch, Guard};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Bounded wait while a producer finishes publishing a `next` link. A park,
/// not a yield: the publication is a handful of instructions away.
const LINK_PARK: Duration = Duration::from_nanos(100);

impl Core {
    /// One activation of the work loop. Single-consumer by construction:
    /// only the empty-to-non-empty append, the budget yield and the parked
    /// resume ever submit it, and each guarantees the previous activation
    /// has returned.
    pub(crate) fn run(self: &Arc<Self>) {
        let mut budget = self.batch;
        loop {
            let guard = &epoch::pin();
            let cur = self.head.load(Ordering::Acquire);
            if cur.is_null() {
                return;
            }
            let node = unsafe { &*cur };

            if !node.is_admitted() && !self.gate(cur, guard) {
                // Parked: the next slot release re-dispatches us.
                return;
            }

            // Past the gate, on the only consumer: the payload is ours.
            let shape = unsafe { (*node.shape.get()).take() }.expect("task body run twice");
            let sync_done = match shape.run() {
                Step::Done => true,
                Step::InFlight(child) => {
                    self.track_child(child);
                    false
                }
            };

            let mut next = node.next.load(Ordering::Acquire);
            if next.is_null() {
                if self
                    .tail
                    .compare_exchange(cur, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Drained. Reset head unless a producer already seeded a
                    // fresh list; the last node stays anchored in the window
                    // until the next empty-branch append moves off it.
                    let _ = self.head.compare_exchange(
                        cur,
                        ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.retire_executed(cur, guard);
                    tracing::trace!("work loop drained the queue");
                    return;
                }
                // Lost the race: a producer holds the tail but has not
                // published the link yet.
                loop {
                    next = node.next.load(Ordering::Acquire);
                    if !next.is_null() {
                        break;
                    }
                    std::thread::park_timeout(LINK_PARK);
                }
            }

            self.head.store(next, Ordering::Release);
            self.retire_executed(cur, guard);
            if sync_done {
                self.advance_admitted(1);
            }

            budget -= 1;
            if budget == 0 {
                // Yield so other runnables sharing the dispatcher get a
                // turn; the queue still has work.
                tracing::trace!("work loop budget exhausted, yielding");
                self.dispatch_pass();
                return;
            }
        }
    }

    /// Admission gate: only admitted nodes run. Extends the window itself
    /// while capacity is available; parks when the window is full and every
    /// slot is waiting on in-flight work. Returns false when parked.
    fn gate(self: &Arc<Self>, cur: *mut Node, guard: &Guard) -> bool {
        loop {
            let node = unsafe { &*cur };
            if node.is_admitted() {
                return true;
            }
            let word = self.admitted.load(Ordering::Acquire);
            let (len, anchor) = unpack(word);
            if anchor == cur {
                // A winner is between its window CAS and the acceptance
                // fire; the flag is instructions away.
                std::hint::spin_loop();
                continue;
            }
            if len < self.buf_len {
                let target = self.next_unadmitted(anchor);
                if target.is_null() {
                    std::hint::spin_loop();
                    continue;
                }
                if self.swap_window(word, pack(len + 1, target), guard) {
                    unsafe { &*target }.fire_acceptance();
                }
                continue;
            }

            // Window full. Park, then re-check: a completion that released
            // its slot between our admission check and the park would
            // otherwise be a lost wakeup.
            self.parked.store(true, Ordering::SeqCst);
            if node.is_admitted() || unpack(self.admitted.load(Ordering::SeqCst)).0 < self.buf_len
            {
                if self.parked.swap(false, Ordering::SeqCst) {
                    // Reclaimed our own park token; keep running.
                    continue;
                }
                // A completion already re-dispatched a fresh activation.
                return false;
            }
            tracing::trace!("work loop parked on in-flight slots");
            return false;
        }
    }

    /// Accounts for a started child: it occupies one window slot until it
    /// settles, at which point the slot is credited and a parked activation
    /// is resumed.
    fn track_child(self: &Arc<Self>, child: Signal<()>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let core = Arc::clone(self);
        child.on_settled(move |()| {
            core.in_flight.fetch_sub(1, Ordering::SeqCst);
            core.advance_admitted(1);
            if core.parked.swap(false, Ordering::SeqCst) {
                tracing::trace!("slot released, resuming parked work loop");
                core.dispatch_pass();
            }
        });
    }

    /// Credits `credits` released slots against the window.
    ///
    /// While the window is full each credit slides the anchor forward,
    /// admitting (and settling acceptance for) the next waiting node; with
    /// no successor the length is cut instead, draining below capacity with
    /// nobody to notify. While the window is not full the word is CAS'd to
    /// itself: a deliberate no-op barrier that orders this release against
    /// producers racing to extend the window.
    pub(crate) fn advance_admitted(&self, mut credits: u32) {
        let guard = &epoch::pin();
        while credits > 0 {
            let word = self.admitted.load(Ordering::Acquire);
            let (len, anchor) = unpack(word);
            if len >= self.buf_len {
                let target = self.next_unadmitted(anchor);
                if target.is_null() {
                    if self.swap_window(word, pack(len.saturating_sub(credits), anchor), guard) {
                        return;
                    }
                    continue;
                }
                if self.swap_window(word, pack(len, target), guard) {
                    unsafe { &*target }.fire_acceptance();
                    credits -= 1;
                }
                continue;
            }
            if self
                .admitted
                .compare_exchange(word, word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                credits -= 1;
            }
        }
    }
}
