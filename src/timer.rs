//! Timer set: an ordered collection of pending timeouts, keyed by
//! deadline then id, with monotonically increasing ids handed back to
//! callers so a later `handle_timeout(id)` can be correlated.

use crate::manager::SharedManager;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::SystemTime;

/// Identifies one scheduled timeout, unique per multiplexer.
pub type TimeoutId = u64;

/// One pending timeout: the manager it targets, the deadline, and the
/// id the manager will receive in `handle_timeout`.
struct TimeoutEntry {
    manager: SharedManager,
    when: SystemTime,
    id: TimeoutId,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.id == other.id
    }
}
impl Eq for TimeoutEntry {}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline (and,
        // on ties, the lowest id) to pop first, so the comparison here
        // is reversed from the natural "when < other.when" ordering.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.id.cmp(&self.id))
    }
}
impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Set of pending timeouts ordered by deadline; ties are broken by id.
/// Caches the earliest deadline so the multiplexer can use it as the
/// poll wait bound without scanning the heap.
#[derive(Default)]
pub struct TimerSet {
    heap: BinaryHeap<TimeoutEntry>,
    next_id: TimeoutId,
}

impl TimerSet {
    /// Empty timer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `manager` to receive `handle_timeout(id)` at `when`,
    /// returning the allocated id.
    pub fn insert(&mut self, manager: SharedManager, when: SystemTime) -> TimeoutId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(TimeoutEntry { manager, when, id });
        id
    }

    /// The earliest pending deadline, if any.
    pub fn current_timeout(&self) -> Option<SystemTime> {
        self.heap.peek().map(|e| e.when)
    }

    /// Removes and returns every entry whose deadline has passed, in
    /// deadline order. Entries are removed before their callback runs,
    /// so a handler that schedules a new timer during dispatch can
    /// never observe or re-trigger an entry already popped this round.
    pub fn pop_expired(&mut self, now: SystemTime) -> Vec<(SharedManager, TimeoutId)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.when > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked Some above");
            expired.push((entry.manager, entry.id));
        }
        expired
    }

    /// Number of pending timeouts.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether there are no pending timeouts.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
