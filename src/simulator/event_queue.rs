//! Event queue and simulation clock for the simulated machine

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

/// Simulation event
pub struct SimEvent {
    /// Virtual time in seconds.
    pub timestamp: f64,
    pub label: &'static str,
    seq: u64,
    action: Box<dyn FnOnce()>,
}

impl SimEvent {
    pub fn fire(self) {
        (self.action)();
    }
}

impl fmt::Debug for SimEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEvent")
            .field("timestamp", &self.timestamp)
            .field("label", &self.label)
            .field("seq", &self.seq)
            .finish()
    }
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}
impl Eq for SimEvent {}
impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SimEvent {
    // Reversed so the heap pops the earliest event first, FIFO among equals
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .total_cmp(&self.timestamp)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Event queue for simulation
#[derive(Debug, Default)]
pub struct SimEventQueue {
    queue: BinaryHeap<SimEvent>,
    next_seq: u64,
}

impl SimEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: f64, label: &'static str, action: impl FnOnce() + 'static) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(SimEvent {
            timestamp,
            label,
            seq,
            action: Box::new(action),
        });
    }

    /// Remove the earliest event if it is due at or before `until`.
    pub fn pop_due(&mut self, until: f64) -> Option<SimEvent> {
        if self.queue.peek()?.timestamp <= until {
            return self.queue.pop();
        }
        None
    }

    pub fn next_timestamp(&self) -> Option<f64> {
        self.queue.peek().map(|ev| ev.timestamp)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Simulation clock, in seconds. Kept as a float so that it can land on
/// exactly the wake time a caller asked for.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    pub current_time: f64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, dt: f64) {
        self.current_time += dt.max(0.0);
    }

    /// Move forward to `timestamp`; the clock never runs backwards.
    pub fn advance_to(&mut self, timestamp: f64) {
        if timestamp > self.current_time {
            self.current_time = timestamp;
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.current_time
    }
}
