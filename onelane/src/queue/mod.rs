use crate::dispatch::Dispatch;
use crate::signal::Promise;
use crate::task::Shape;
use crossbeam_epoch::{self as epoch, Guard, Shared};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};

pub(crate) mod worker;

#[cfg(test)]
mod tests;

// Node flag bits. ADMITTED gives an O(1) admission check; EXECUTED and
// RELEASED together hand the node to the collector exactly once: the second
// party to set its bit retires the node.
const ADMITTED: u8 = 1;
const EXECUTED: u8 = 1 << 1;
const RELEASED: u8 = 1 << 2;

// The admitted window is one atomic word: the slot count in the top 16 bits,
// the anchor node in the low 48. Canonical user-space addresses fit; debug
// builds assert it.
const LEN_SHIFT: u32 = 48;
const PTR_MASK: u64 = (1u64 << LEN_SHIFT) - 1;

fn pack(len: u32, node: *mut Node) -> u64 {
    let addr = node as u64;
    debug_assert_eq!(addr & !PTR_MASK, 0, "node address exceeds 48 bits");
    ((len as u64) << LEN_SHIFT) | addr
}

fn unpack(word: u64) -> (u32, *mut Node) {
    ((word >> LEN_SHIFT) as u32, (word & PTR_MASK) as *mut Node)
}

/// One enqueued task. Created by a producer, consumed by the single work
/// loop, then handed to the epoch collector.
pub(crate) struct Node {
    /// Published exactly once; never changed afterwards. Publication is what
    /// makes the node visible to the consumer.
    next: AtomicPtr<Node>,
    flags: AtomicU8,
    accept: Promise<()>,
    shape: UnsafeCell<Option<Shape>>,
}

// Safety: the payload cell is only ever touched by the single consumer pass,
// and only after the admission gate; everything else on the node is atomic.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    fn new(accept: Promise<()>, shape: Shape) -> Node {
        Node {
            next: AtomicPtr::new(ptr::null_mut()),
            flags: AtomicU8::new(0),
            accept,
            shape: UnsafeCell::new(Some(shape)),
        }
    }

    fn is_admitted(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ADMITTED != 0
    }

    /// Marks the node admitted and settles its acceptance. Called exactly
    /// once, by whichever window CAS first covered the node.
    fn fire_acceptance(&self) {
        let prev = self.flags.fetch_or(ADMITTED, Ordering::AcqRel);
        debug_assert_eq!(prev & ADMITTED, 0, "node admitted twice");
        self.accept.settle(());
    }
}

/// Shared state of one executor: the intake list, its three cursors, and the
/// in-flight accounting. Producers touch `tail`, the admitted word and (on
/// the empty branch) `head`; everything else belongs to the consumer pass.
pub(crate) struct Core {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    /// Packed `{len, anchor}` admitted window; see [`pack`].
    admitted: AtomicU64,
    /// Started-but-unfinished children; each holds one window slot.
    in_flight: AtomicUsize,
    /// Set when the pass is waiting for a slot release; the releasing
    /// callback swaps it back and re-dispatches.
    parked: AtomicBool,
    buf_len: u32,
    batch: u32,
    dispatcher: Arc<dyn Dispatch>,
}

impl Core {
    pub(crate) fn new(buf_len: u32, batch: u32, dispatcher: Arc<dyn Dispatch>) -> Core {
        Core {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            admitted: AtomicU64::new(pack(0, ptr::null_mut())),
            in_flight: AtomicUsize::new(0),
            parked: AtomicBool::new(false),
            buf_len,
            batch,
            dispatcher,
        }
    }

    /// Appends a task. Returns whether this call observed the acceptance
    /// settled synchronously; `false` means the window was full and a later
    /// slot release settles it. Never blocks: the append itself is a single
    /// swap, and the admission loop only retries while other parties make
    /// progress.
    pub(crate) fn push(self: &Arc<Self>, accept: Promise<()>, shape: Shape) -> bool {
        let node = Box::into_raw(Box::new(Node::new(accept, shape)));
        let guard = &epoch::pin();

        let prev = self.tail.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            return self.push_empty(node, guard);
        }

        unsafe { (*prev).next.store(node, Ordering::Release) };
        self.try_admit(node, guard)
    }

    /// Empty branch: the list was empty and no pass is active. Seed the
    /// window and `head`, then hand one activation to the dispatcher. The
    /// window CAS can still race slot-release callbacks, hence the loop.
    fn push_empty(self: &Arc<Self>, node: *mut Node, guard: &Guard) -> bool {
        // Seed `head` before touching the window: a slot-release callback
        // that observes the new window must never chase a stale head.
        self.head.store(node, Ordering::Release);
        let admitted_now = loop {
            let word = self.admitted.load(Ordering::Acquire);
            let in_flight = self.in_flight.load(Ordering::SeqCst) as u32;
            let next_word = if in_flight < self.buf_len {
                pack(in_flight + 1, node)
            } else {
                // Every slot is already held by in-flight work; the node
                // waits behind an anchorless window for the next release.
                pack(in_flight, ptr::null_mut())
            };
            if self.swap_window(word, next_word, guard) {
                break in_flight < self.buf_len;
            }
        };
        if admitted_now {
            unsafe { &*node }.fire_acceptance();
        }
        self.dispatch_pass();
        admitted_now
    }

    /// Producer-side admission: extend the window one node at a time until
    /// our node is covered, the window fills up, or someone else covers us.
    fn try_admit(&self, node: *mut Node, guard: &Guard) -> bool {
        loop {
            if unsafe { &*node }.is_admitted() {
                // A concurrent slide covered us; the winner has settled the
                // acceptance. Retrying would double-admit.
                return true;
            }
            let word = self.admitted.load(Ordering::Acquire);
            let (len, anchor) = unpack(word);
            if len >= self.buf_len {
                // Backpressure: the consumer settles acceptance later.
                return false;
            }
            let target = self.next_unadmitted(anchor);
            if target.is_null() {
                // A neighbouring producer has not finished publishing its
                // link yet.
                std::hint::spin_loop();
                continue;
            }
            if self.swap_window(word, pack(len + 1, target), guard) {
                unsafe { &*target }.fire_acceptance();
                if target == node {
                    return true;
                }
            }
        }
    }

    /// The next node the window would cover: the anchor's successor, or the
    /// head of the list while nothing is admitted.
    fn next_unadmitted(&self, anchor: *mut Node) -> *mut Node {
        if anchor.is_null() {
            self.head.load(Ordering::Acquire)
        } else {
            unsafe { &*anchor }.next.load(Ordering::Acquire)
        }
    }

    /// Single CAS point for the admitted word. On success, a node the window
    /// moved off is released towards reclamation.
    fn swap_window(&self, old_word: u64, new_word: u64, guard: &Guard) -> bool {
        if self
            .admitted
            .compare_exchange(old_word, new_word, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let (_, old_anchor) = unpack(old_word);
        let (_, new_anchor) = unpack(new_word);
        if !old_anchor.is_null() && old_anchor != new_anchor {
            self.release_node(old_anchor, guard);
        }
        true
    }

    /// The window moved off `node`: second half of the retire hand-off.
    fn release_node(&self, node: *mut Node, guard: &Guard) {
        let prev = unsafe { &*node }.flags.fetch_or(RELEASED, Ordering::AcqRel);
        debug_assert_eq!(prev & RELEASED, 0, "node released twice");
        if prev & EXECUTED != 0 {
            unsafe { guard.defer_destroy(Shared::from(node as *const Node)) };
        }
    }

    /// The consumer finished `node`: first half of the retire hand-off.
    fn retire_executed(&self, node: *mut Node, guard: &Guard) {
        let prev = unsafe { &*node }.flags.fetch_or(EXECUTED, Ordering::AcqRel);
        debug_assert_eq!(prev & EXECUTED, 0, "node executed twice");
        if prev & RELEASED != 0 {
            unsafe { guard.defer_destroy(Shared::from(node as *const Node)) };
        }
    }

    /// Submits one activation of the work loop to the dispatcher.
    fn dispatch_pass(self: &Arc<Self>) {
        let core = Arc::clone(self);
        tracing::trace!("dispatching work loop activation");
        self.dispatcher.dispatch(Box::new(move || core.run()));
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // Exclusive access: free whatever the retire hand-off has not given
        // to the collector. Nodes with both EXECUTED and RELEASED were
        // already deferred and must not be freed again.
        let (_, anchor) = unpack(*self.admitted.get_mut());
        let mut anchor_seen = false;
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            if cur == anchor {
                anchor_seen = true;
            }
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            let flags = unsafe { (*cur).flags.load(Ordering::Relaxed) };
            if flags & (EXECUTED | RELEASED) != (EXECUTED | RELEASED) {
                unsafe { drop(Box::from_raw(cur)) };
            }
            cur = next;
        }
        // A drained list leaves its last node parked in the window until the
        // next empty-branch append would have released it.
        if !anchor.is_null() && !anchor_seen {
            let flags = unsafe { (*anchor).flags.load(Ordering::Relaxed) };
            if flags & (EXECUTED | RELEASED) == EXECUTED {
                unsafe { drop(Box::from_raw(anchor)) };
            }
        }
    }
}

#[cfg(test)]
impl Core {
    pub(crate) fn window_len(&self) -> u32 {
        unpack(self.admitted.load(Ordering::SeqCst)).0
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.tail.load(Ordering::SeqCst).is_null()
    }
}
