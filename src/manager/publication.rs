//! Publication retransmission schedule.
//!
//! A published message is sent once by the caller; the schedule then
//! hands back the same request `count` more times, `interval` apart, and
//! forgets it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use super::request::SendRequest;
use crate::core::{MessageHandle, TimerHandle, TimerQueue};
use crate::store::Retransmit;

#[derive(Debug)]
struct ScheduledPublication {
    request: SendRequest,
    remaining: u8,
    interval: Duration,
    timer: TimerHandle,
}

/// Pending publication retransmissions.
#[derive(Debug, Default)]
pub struct PublicationSchedule {
    timers: TimerQueue<MessageHandle>,
    scheduled: HashMap<MessageHandle, ScheduledPublication>,
}

impl PublicationSchedule {
    /// Empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the retransmissions of a publication sent at `now`.
    ///
    /// Does nothing when the policy has no retransmissions.
    pub fn schedule(&mut self, handle: MessageHandle, request: SendRequest, retransmit: Retransmit, now: Instant) {
        if retransmit.count == 0 {
            return;
        }
        self.cancel(handle);
        let request = request.retransmitted();
        let timer = self.timers.arm(now + retransmit.interval, handle);
        self.scheduled.insert(
            handle,
            ScheduledPublication {
                request,
                remaining: retransmit.count,
                interval: retransmit.interval,
                timer,
            },
        );
    }

    /// Drop the remaining retransmissions of `handle`.
    pub fn cancel(&mut self, handle: MessageHandle) -> bool {
        match self.scheduled.remove(&handle) {
            Some(publication) => {
                self.timers.cancel(publication.timer);
                true
            }
            None => false,
        }
    }

    /// Number of publications with retransmissions left.
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Earliest retransmission.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Requests due at `now`, re-arming those with retransmissions left.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<(MessageHandle, SendRequest)> {
        let mut due = Vec::new();
        while let Some(handle) = self.timers.pop_expired(now) {
            let Some(publication) = self.scheduled.get_mut(&handle) else {
                continue;
            };
            publication.remaining -= 1;
            due.push((handle, publication.request.clone()));
            trace!(%handle, remaining = publication.remaining, "Publication retransmission");

            if publication.remaining == 0 {
                self.scheduled.remove(&handle);
            } else {
                publication.timer = self.timers.arm(now + publication.interval, handle);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessMessage, Opcode};
    use crate::core::{Address, MeshAddress};

    fn request() -> SendRequest {
        SendRequest::new(
            AccessMessage::new(Opcode::new(0x01).unwrap(), vec![1]),
            MeshAddress::new(Address::new(0xC000)),
        )
    }

    #[test]
    fn test_count_retransmissions_then_stops() {
        let start = Instant::now();
        let mut schedule = PublicationSchedule::new();
        let handle = MessageHandle::from_raw(1);
        schedule.schedule(
            handle,
            request(),
            Retransmit {
                count: 3,
                interval: Duration::from_millis(100),
            },
            start,
        );

        let mut fired = Vec::new();
        while let Some(deadline) = schedule.next_deadline() {
            let due = schedule.poll_timers(deadline);
            assert_eq!(due.len(), 1);
            assert!(due[0].1.retransmit);
            fired.push(deadline - start);
        }
        assert_eq!(
            fired,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_zero_count_schedules_nothing() {
        let mut schedule = PublicationSchedule::new();
        schedule.schedule(MessageHandle::from_raw(1), request(), Retransmit::default(), Instant::now());
        assert!(schedule.next_deadline().is_none());
    }

    #[test]
    fn test_cancel() {
        let mut schedule = PublicationSchedule::new();
        let handle = MessageHandle::from_raw(7);
        let policy = Retransmit {
            count: 2,
            interval: Duration::from_millis(50),
        };
        schedule.schedule(handle, request(), policy, Instant::now());
        assert!(schedule.cancel(handle));
        assert!(!schedule.cancel(handle));
        assert!(schedule.next_deadline().is_none());
    }
}
