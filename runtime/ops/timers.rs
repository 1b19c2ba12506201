// Copyright 2024-2026 the jsbox authors. MIT license.

//! The isolate's timer queue. The sandbox glue allocates timer ids and
//! parks one async op per armed timer; the queue only tracks deadlines in
//! monotonic order and which op to resolve when each fires or is cleared.
//! Everything here dies on dispose and on namespace soft-deletion.

use jsbox_core::engine::OpId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

struct TimerEntry {
  op: OpId,
  deadline: Instant,
  /// Insertion order breaks deadline ties, keeping firing monotonic.
  seq: u64,
}

#[derive(Default)]
pub struct TimerQueue {
  entries: HashMap<u64, TimerEntry>,
  heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
  next_seq: u64,
}

impl TimerQueue {
  pub fn new() -> TimerQueue {
    TimerQueue::default()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn start(&mut self, timer_id: u64, delay: Duration, op: OpId) {
    let deadline = Instant::now() + delay;
    let seq = self.next_seq;
    self.next_seq += 1;
    self.entries.insert(timer_id, TimerEntry { op, deadline, seq });
    self.heap.push(Reverse((deadline, seq, timer_id)));
  }

  /// Clears one timer, handing back the op to resolve as cancelled.
  pub fn clear(&mut self, timer_id: u64) -> Option<OpId> {
    self.entries.remove(&timer_id).map(|entry| entry.op)
  }

  /// Dispose/soft-dispose: every armed timer is cancelled.
  pub fn clear_all(&mut self) -> Vec<OpId> {
    self.heap.clear();
    self.entries.drain().map(|(_, entry)| entry.op).collect()
  }

  pub fn next_deadline(&self) -> Option<Instant> {
    self
      .entries
      .values()
      .map(|entry| entry.deadline)
      .min()
  }

  /// Pops every timer due at `now`, in deadline-then-insertion order.
  pub fn fire_due(&mut self, now: Instant) -> Vec<OpId> {
    let mut fired = Vec::new();
    while let Some(Reverse((deadline, _seq, timer_id))) = self.heap.peek() {
      if *deadline > now {
        break;
      }
      let timer_id = *timer_id;
      self.heap.pop();
      // Cleared timers leave stale heap entries behind; skip them.
      if let Some(entry) = self.entries.get(&timer_id) {
        if entry.deadline <= now {
          fired.push(self.entries.remove(&timer_id).unwrap().op);
        }
      }
    }
    fired
  }
}
