//! Fairness Delay Queue
//!
//! Delayed-dispatch queue behind the fairness delay injector. Local
//! keyboard input is scheduled `system_lag` milliseconds into the
//! future so it experiences latency comparable to phone input; the
//! queue is keyed by due-time and drained by the external driver, so
//! behavior is testable without real waits.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde_json::Value;

use crate::roster::PlayerId;

/// One input event on its way to the downstream pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct InputEvent {
    /// Acting player.
    pub player_id: PlayerId,
    /// Action type, e.g. `PRESS`, `RELEASE`, `TOUCH`.
    pub action: String,
    /// Optional action data (touch coordinates and the like).
    pub payload: Option<Value>,
}

/// A scheduled dispatch. Ordered by due time, then by insertion order
/// so same-deadline events keep their submission order.
#[derive(Debug)]
struct Scheduled {
    due_ms: u64,
    seq: u64,
    input: InputEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first.
        (other.due_ms, other.seq).cmp(&(self.due_ms, self.seq))
    }
}

/// Delayed-dispatch queue keyed by due time.
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
}

impl DelayQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an input for dispatch at `due_ms`. A scheduled dispatch
    /// is never cancelled; it always fires.
    pub fn schedule(&mut self, due_ms: u64, input: InputEvent) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Scheduled { due_ms, seq, input });
    }

    /// Release every input whose due time has passed, earliest first.
    pub fn drain_due(&mut self, now_ms: u64) -> Vec<InputEvent> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.due_ms > now_ms {
                break;
            }
            if let Some(scheduled) = self.heap.pop() {
                due.push(scheduled.input);
            }
        }
        due
    }

    /// Earliest pending due time, if anything is scheduled.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.heap.peek().map(|s| s.due_ms)
    }

    /// Number of pending dispatches.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
