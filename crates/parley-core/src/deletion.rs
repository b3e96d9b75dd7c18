//! Delayed deletion.
//!
//! A deletion request carries a delay relative to the deletion message's own
//! timestamp. Requests already due are applied synchronously by the caller;
//! everything else arms exactly one timer per target. A second request for
//! the same target can only pull the deadline forward.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::MessageId;

use crate::error::{CoreError, Result};
use crate::timer::{TimerHandle, TimerQueue};

/// Absolute time a deletion takes effect. Saturates instead of overflowing.
pub fn fire_time(timestamp: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| timestamp.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Due already; the caller tombstones the target now.
    Immediate,
    /// A new timer was armed.
    Armed(TimerHandle),
    /// An earlier or equal deadline is already armed; nothing changed.
    AlreadyArmed,
    /// The existing timer was replaced by an earlier one.
    Rearmed(TimerHandle),
}

#[derive(Debug, Clone, Copy)]
struct PendingDeletion {
    handle: TimerHandle,
    fire_at: DateTime<Utc>,
    /// The deletion message that armed the timer.
    deletion: MessageId,
}

/// Armed deletion timers of one context, keyed by target.
#[derive(Debug, Default)]
pub struct DeletionScheduler {
    pending: HashMap<MessageId, PendingDeletion>,
}

impl DeletionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule deletion of `target` at `fire_at`.
    ///
    /// `event` builds the timer payload and is only called when a timer is
    /// actually armed.
    pub fn schedule<E, F>(
        &mut self,
        timers: &mut TimerQueue<E>,
        target: MessageId,
        deletion: MessageId,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
        event: F,
    ) -> Result<Schedule>
    where
        F: FnOnce() -> E,
    {
        if fire_at <= now {
            self.cancel(timers, &target);
            return Ok(Schedule::Immediate);
        }

        if let Some(existing) = self.pending.get_mut(&target) {
            if existing.fire_at <= fire_at {
                debug!(
                    target = %target.short(),
                    deletion = %deletion.short(),
                    "Deletion already armed"
                );
                return Ok(Schedule::AlreadyArmed);
            }
            timers.cancel(existing.handle);
            let handle = timers.arm(fire_at, event());
            *existing = PendingDeletion {
                handle,
                fire_at,
                deletion,
            };
            debug!(target = %target.short(), at = %fire_at, "Deletion timer moved forward");
            return Ok(Schedule::Rearmed(handle));
        }

        self.pending
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("deletion schedule"))?;
        let handle = timers.arm(fire_at, event());
        self.pending.insert(
            target,
            PendingDeletion {
                handle,
                fire_at,
                deletion,
            },
        );
        debug!(target = %target.short(), at = %fire_at, "Deletion timer armed");
        Ok(Schedule::Armed(handle))
    }

    /// Acknowledge a fired timer. Returns `false` for stale handles, which
    /// the caller must ignore.
    pub fn fired(&mut self, target: &MessageId, handle: TimerHandle) -> bool {
        let current = self
            .pending
            .get(target)
            .map(|entry| entry.handle == handle)
            .unwrap_or(false);
        if current {
            self.pending.remove(target);
        }
        current
    }

    /// Drop the pending deletion of `target`, if any.
    pub fn cancel<E>(&mut self, timers: &mut TimerQueue<E>, target: &MessageId) -> bool {
        match self.pending.remove(target) {
            Some(entry) => {
                timers.cancel(entry.handle);
                debug!(target = %target.short(), "Deletion timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, target: &MessageId) -> bool {
        self.pending.contains_key(target)
    }

    pub fn deadline(&self, target: &MessageId) -> Option<DateTime<Utc>> {
        self.pending.get(target).map(|entry| entry.fire_at)
    }

    /// The deletion message responsible for the armed timer of `target`.
    pub fn requested_by(&self, target: &MessageId) -> Option<MessageId> {
        self.pending.get(target).map(|entry| entry.deletion)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Cancel every armed timer; used when the context goes away.
    pub fn clear<E>(&mut self, timers: &mut TimerQueue<E>) {
        for (_, entry) in self.pending.drain() {
            timers.cancel(entry.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::Digest;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn id(name: &str) -> MessageId {
        MessageId(Digest::of(name.as_bytes()))
    }

    #[test]
    fn test_fire_time_adds_delay() {
        assert_eq!(fire_time(at(100), Duration::from_secs(5)), at(105));
        assert_eq!(fire_time(at(100), Duration::ZERO), at(100));
    }

    #[test]
    fn test_fire_time_saturates() {
        assert_eq!(
            fire_time(at(100), Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_past_deadline_is_immediate() {
        let mut timers = TimerQueue::new();
        let mut scheduler = DeletionScheduler::new();
        let schedule = scheduler
            .schedule(&mut timers, id("t"), id("d"), at(5), at(10), || ())
            .unwrap();
        assert_eq!(schedule, Schedule::Immediate);
        assert!(timers.is_empty());
        assert!(!scheduler.is_scheduled(&id("t")));
    }

    #[test]
    fn test_single_timer_per_target() {
        let mut timers = TimerQueue::new();
        let mut scheduler = DeletionScheduler::new();

        let first = scheduler
            .schedule(&mut timers, id("t"), id("d1"), at(20), at(10), || 1)
            .unwrap();
        assert!(matches!(first, Schedule::Armed(_)));

        let again = scheduler
            .schedule(&mut timers, id("t"), id("d1"), at(20), at(11), || 2)
            .unwrap();
        assert_eq!(again, Schedule::AlreadyArmed);

        let later = scheduler
            .schedule(&mut timers, id("t"), id("d2"), at(30), at(11), || 3)
            .unwrap();
        assert_eq!(later, Schedule::AlreadyArmed);
        assert_eq!(timers.len(), 1);
        assert_eq!(scheduler.requested_by(&id("t")), Some(id("d1")));
    }

    #[test]
    fn test_earlier_request_rearms() {
        let mut timers = TimerQueue::new();
        let mut scheduler = DeletionScheduler::new();
        let Schedule::Armed(old) = scheduler
            .schedule(&mut timers, id("t"), id("d1"), at(30), at(10), || ())
            .unwrap()
        else {
            panic!("expected a new timer");
        };

        let rearmed = scheduler
            .schedule(&mut timers, id("t"), id("d2"), at(15), at(10), || ())
            .unwrap();
        let Schedule::Rearmed(new) = rearmed else {
            panic!("expected rearm, got {rearmed:?}");
        };

        assert!(!timers.is_armed(old));
        assert!(timers.is_armed(new));
        assert_eq!(scheduler.deadline(&id("t")), Some(at(15)));
        assert!(!scheduler.fired(&id("t"), old));
        assert!(scheduler.fired(&id("t"), new));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_cancel_before_fire() {
        let mut timers = TimerQueue::new();
        let mut scheduler = DeletionScheduler::new();
        scheduler
            .schedule(&mut timers, id("t"), id("d"), at(30), at(10), || ())
            .unwrap();

        assert!(scheduler.cancel(&mut timers, &id("t")));
        assert!(!scheduler.cancel(&mut timers, &id("t")));
        assert!(timers.pop_due(at(100)).is_empty());
    }
}
