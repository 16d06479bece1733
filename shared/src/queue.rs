//! Tick-indexed priority queue of deferred events.

use crate::event::{Event, ScheduledEvent};
use crate::Tick;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    fire_tick: Tick,
    seq: u64,
    event: Event,
}

// Reversed so the max-heap yields the earliest (fire_tick, seq) first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.fire_tick, other.seq).cmp(&(self.fire_tick, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_tick == other.fire_tick && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Pops entries in non-decreasing fire tick order, ties in insertion order.
///
/// The insertion counter is part of the serialized form so a queue
/// restored from a snapshot keeps ordering new entries after old ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fire_tick: Tick, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            fire_tick,
            seq,
            event,
        });
    }

    /// Removes and returns every entry due at or before `current_tick`.
    pub fn pop_ready(&mut self, current_tick: Tick) -> Vec<ScheduledEvent> {
        let mut ready = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|entry| entry.fire_tick <= current_tick)
        {
            if let Some(entry) = self.heap.pop() {
                ready.push(ScheduledEvent::new(entry.fire_tick, entry.event));
            }
        }
        ready
    }

    pub fn next_fire_tick(&self) -> Option<Tick> {
        self.heap.peek().map(|entry| entry.fire_tick)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pending entries in pop order, without consuming the queue.
    pub fn pending(&self) -> Vec<ScheduledEvent> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|entry| ScheduledEvent::new(entry.fire_tick, entry.event.clone()))
            .collect()
    }
}

/// Equal when both would pop the same entries in the same order.
impl PartialEq for EventQueue {
    fn eq(&self, other: &Self) -> bool {
        self.pending() == other.pending()
    }
}

impl Eq for EventQueue {}
