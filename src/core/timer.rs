//! Cancellable timers.
//!
//! Every timer in the pipeline is an entry in a [`TimerQueue`]: arming
//! returns a [`TimerHandle`], cancelling invalidates it, and the owner of
//! the queue pops expired events and routes them. The event value carries
//! only identifiers; the state it refers to is looked up again on expiry,
//! so a cancelled or completed operation simply finds nothing to do.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Deadline-ordered queue of timer events.
#[derive(Debug)]
pub struct TimerQueue<E> {
    deadlines: BTreeMap<(Instant, u64), E>,
    armed: HashMap<u64, Instant>,
    next_id: u64,
}

impl<E> TimerQueue<E> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            deadlines: BTreeMap::new(),
            armed: HashMap::new(),
            next_id: 0,
        }
    }

    /// Arm a timer firing at `deadline`.
    pub fn arm(&mut self, deadline: Instant, event: E) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.insert((deadline, id), event);
        self.armed.insert(id, deadline);
        TimerHandle(id)
    }

    /// Disarm a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.armed.remove(&handle.0) {
            Some(deadline) => self.deadlines.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    /// Whether the timer is still pending.
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains_key(&handle.0)
    }

    /// Deadline of a pending timer.
    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.armed.get(&handle.0).copied()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest event due at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<E> {
        let (deadline, id) = *self.deadlines.keys().next()?;
        if deadline > now {
            return None;
        }
        self.armed.remove(&id);
        self.deadlines.remove(&(deadline, id))
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Whether no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.arm(now + Duration::from_millis(30), "c");
        timers.arm(now + Duration::from_millis(10), "a");
        timers.arm(now + Duration::from_millis(20), "b");

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(timers.pop_expired(now), None);

        let later = now + Duration::from_millis(25);
        assert_eq!(timers.pop_expired(later), Some("a"));
        assert_eq!(timers.pop_expired(later), Some("b"));
        assert_eq!(timers.pop_expired(later), None);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let first = timers.arm(now, 1);
        let second = timers.arm(now, 2);

        assert!(timers.cancel(first));
        assert!(!timers.cancel(first));
        assert!(!timers.is_armed(first));
        assert!(timers.is_armed(second));

        assert_eq!(timers.pop_expired(now), Some(2));
        assert!(!timers.cancel(second));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_same_deadline_keeps_arming_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        for i in 0..5 {
            timers.arm(now, i);
        }
        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_expired(now)).collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }
}
