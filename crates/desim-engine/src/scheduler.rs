//! Event queues.
//!
//! The engine talks to its queue through the [`Scheduler`] trait so the
//! storage can be swapped at construction time. [`HeapScheduler`] is the
//! default; [`MapScheduler`] keeps records in an ordered map and is mostly
//! useful as a cross-check.

use crate::callback::Callback;
use desim_common::{ContextId, EventId, EventKey, VirtualTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// Event Record
// ============================================================================

/// A pending event as stored by a scheduler.
#[derive(Debug)]
pub struct EventRecord {
    /// Ordering key.
    pub key: EventKey,
    /// Context the handler runs in.
    pub context: ContextId,
    /// Handler to invoke when the event fires.
    pub payload: Callback,
}

impl EventRecord {
    /// Create a record.
    pub fn new(key: EventKey, context: ContextId, payload: Callback) -> Self {
        EventRecord {
            key,
            context,
            payload,
        }
    }
}

// ============================================================================
// Scheduler Trait
// ============================================================================

/// Priority queue of pending events, ordered by [`EventKey`].
pub trait Scheduler: Send {
    /// Queue a record. Never drops it.
    fn insert(&mut self, record: EventRecord);

    /// The record with the smallest key.
    fn peek_next(&self) -> Option<&EventRecord>;

    /// Remove and return the record with the smallest key.
    fn remove_next(&mut self) -> Option<EventRecord>;

    /// Remove the record with the given id. `None` if it is not queued.
    fn remove(&mut self, id: EventId) -> Option<EventRecord>;

    /// True if a record with the given id is queued.
    fn contains(&self, id: EventId) -> bool;

    /// Number of queued records.
    fn len(&self) -> usize;

    /// True if nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the next record.
    fn next_time(&self) -> Option<VirtualTime> {
        self.peek_next().map(|record| record.key.time)
    }
}

/// Which [`Scheduler`] implementation an engine uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// [`HeapScheduler`].
    #[default]
    Heap,
    /// [`MapScheduler`].
    Map,
}

impl SchedulerKind {
    /// Construct an empty scheduler of this kind.
    pub fn build(self) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::Heap => Box::new(HeapScheduler::new()),
            SchedulerKind::Map => Box::new(MapScheduler::new()),
        }
    }
}

// ============================================================================
// Heap Scheduler
// ============================================================================

const ROOT: usize = 1;

/// Binary min-heap addressed with 1-based slot numbers.
///
/// Slot `i` lives at `heap[i - 1]`, so the usual `i / 2`, `2 * i` and
/// `2 * i + 1` arithmetic applies. Every slot's key is at least its parent's.
#[derive(Debug, Default)]
pub struct HeapScheduler {
    heap: Vec<EventRecord>,
}

impl HeapScheduler {
    /// Create an empty heap.
    pub fn new() -> Self {
        HeapScheduler { heap: Vec::new() }
    }

    /// Create an empty heap with room for `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        HeapScheduler {
            heap: Vec::with_capacity(capacity),
        }
    }

    fn parent(slot: usize) -> usize {
        slot / 2
    }

    fn left(slot: usize) -> usize {
        slot * 2
    }

    fn right(slot: usize) -> usize {
        slot * 2 + 1
    }

    fn last(&self) -> usize {
        self.heap.len()
    }

    fn key(&self, slot: usize) -> EventKey {
        self.heap[slot - 1].key
    }

    fn is_less(&self, a: usize, b: usize) -> bool {
        self.key(a) < self.key(b)
    }

    fn exch(&mut self, a: usize, b: usize) {
        self.heap.swap(a - 1, b - 1);
    }

    fn bottom_up(&mut self, start: usize) {
        let mut slot = start;
        while slot > ROOT && self.is_less(slot, Self::parent(slot)) {
            let parent = Self::parent(slot);
            self.exch(slot, parent);
            slot = parent;
        }
    }

    fn top_down(&mut self, start: usize) {
        let mut slot = start;
        loop {
            let left = Self::left(slot);
            if left > self.last() {
                break;
            }
            let right = Self::right(slot);
            let mut smallest = slot;
            if self.is_less(left, smallest) {
                smallest = left;
            }
            if right <= self.last() && self.is_less(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.exch(slot, smallest);
            slot = smallest;
        }
    }

    fn position(&self, id: EventId) -> Option<usize> {
        self.heap
            .iter()
            .position(|record| record.key.id == id)
            .map(|index| index + 1)
    }

    #[cfg(test)]
    fn is_heap(&self) -> bool {
        (ROOT + 1..=self.last()).all(|slot| !self.is_less(slot, Self::parent(slot)))
    }
}

impl Scheduler for HeapScheduler {
    fn insert(&mut self, record: EventRecord) {
        self.heap.push(record);
        let last = self.last();
        self.bottom_up(last);
    }

    fn peek_next(&self) -> Option<&EventRecord> {
        self.heap.first()
    }

    fn remove_next(&mut self) -> Option<EventRecord> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.last();
        self.exch(ROOT, last);
        let record = self.heap.pop();
        if !self.heap.is_empty() {
            self.top_down(ROOT);
        }
        record
    }

    fn remove(&mut self, id: EventId) -> Option<EventRecord> {
        let slot = self.position(id)?;
        let last = self.last();
        self.exch(slot, last);
        let record = self.heap.pop();
        if slot <= self.last() {
            if slot > ROOT && self.is_less(slot, Self::parent(slot)) {
                self.bottom_up(slot);
            } else {
                self.top_down(slot);
            }
        }
        record
    }

    fn contains(&self, id: EventId) -> bool {
        self.position(id).is_some()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

// ============================================================================
// Map Scheduler
// ============================================================================

/// Ordered-map scheduler with an id index for O(log n) removal.
#[derive(Debug, Default)]
pub struct MapScheduler {
    events: BTreeMap<EventKey, EventRecord>,
    index: HashMap<EventId, VirtualTime>,
}

impl MapScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        MapScheduler::default()
    }
}

impl Scheduler for MapScheduler {
    fn insert(&mut self, record: EventRecord) {
        self.index.insert(record.key.id, record.key.time);
        self.events.insert(record.key, record);
    }

    fn peek_next(&self) -> Option<&EventRecord> {
        self.events.values().next()
    }

    fn remove_next(&mut self) -> Option<EventRecord> {
        let (key, record) = self.events.pop_first()?;
        self.index.remove(&key.id);
        Some(record)
    }

    fn remove(&mut self, id: EventId) -> Option<EventRecord> {
        let time = self.index.remove(&id)?;
        self.events.remove(&EventKey::new(time, id))
    }

    fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}
