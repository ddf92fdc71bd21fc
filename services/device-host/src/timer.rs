//! Cancellable deadline queue.
//!
//! Every armed timer gets a fresh handle. Cancelling removes the handle from
//! the live set; the ordered index may still hold a stale entry, which is
//! skipped when it comes due. A timer that was cancelled, or replaced by a
//! re-arm, therefore never fires.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

/// Handle to an armed timer. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Armed<T> {
    deadline: DateTime<Utc>,
    payload: T,
}

/// Deadline-ordered timers carrying a payload.
#[derive(Debug)]
pub struct TimerQueue<T> {
    next_generation: u64,
    live: HashMap<u64, Armed<T>>,
    order: BTreeSet<(DateTime<Utc>, u64)>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_generation: 1,
            live: HashMap::new(),
            order: BTreeSet::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer.
    pub fn arm(&mut self, deadline: DateTime<Utc>, payload: T) -> TimerHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.live.insert(generation, Armed { deadline, payload });
        self.order.insert((deadline, generation));
        TimerHandle(generation)
    }

    /// Cancel a timer. Returns the payload if it was still armed.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let armed = self.live.remove(&handle.0)?;
        self.order.remove(&(armed.deadline, handle.0));
        Some(armed.payload)
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.live.contains_key(&handle.0)
    }

    pub fn deadline(&self, handle: TimerHandle) -> Option<DateTime<Utc>> {
        self.live.get(&handle.0).map(|a| a.deadline)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(&(deadline, generation)) = self.order.first() {
            if self.live.contains_key(&generation) {
                return Some(deadline);
            }
            self.order.pop_first();
        }
        None
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerHandle, T)> {
        let mut due = Vec::new();
        while let Some(&(deadline, generation)) = self.order.first() {
            if deadline > now {
                break;
            }
            self.order.pop_first();
            if let Some(armed) = self.live.remove(&generation) {
                due.push((TimerHandle(generation), armed.payload));
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
