//! Single-shot timers keyed by absolute time.
//!
//! Every armed timer gets a fresh sequence number that is never reused, so a
//! [`TimerHandle`] doubles as a generation tag: once its timer fired or was
//! cancelled the handle simply stops matching anything. Owners keep an
//! `Option<TimerHandle>` and `take()` it on fire or cancel.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

/// Generation-tagged reference to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Ordered set of pending single-shot timers carrying an event `E`.
#[derive(Debug)]
pub struct TimerQueue<E> {
    queue: BTreeMap<(DateTime<Utc>, u64), E>,
    armed: HashMap<u64, DateTime<Utc>>,
    next_seq: u64,
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            armed: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arm a timer firing at `at`. Timers due at the same instant fire in
    /// the order they were armed.
    pub fn arm(&mut self, at: DateTime<Utc>, event: E) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((at, seq), event);
        self.armed.insert(seq, at);
        TimerHandle(seq)
    }

    /// Cancel a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.armed.remove(&handle.0) {
            Some(at) => self.queue.remove(&(at, handle.0)).is_some(),
            None => false,
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains_key(&handle.0)
    }

    /// When the given timer is due, if it is still armed.
    pub fn deadline(&self, handle: TimerHandle) -> Option<DateTime<Utc>> {
        self.armed.get(&handle.0).copied()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerHandle, E)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), event) = entry.remove_entry();
            self.armed.remove(&seq);
            due.push((TimerHandle(seq), event));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}
