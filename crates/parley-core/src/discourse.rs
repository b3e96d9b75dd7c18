//! Time-windowed discourse subscriptions.
//!
//! Every (discourse, member) pair has at most one subscription covering
//! `[start, end)`. Renewals only push `end` out, unsubscribes only pull it
//! in, and each subscription owns exactly one expiry timer that removes it
//! when `end` passes.
//!
//! Besides remote state, a discourse may carry a local intent: we want to
//! stay subscribed with a given window, so the engine renews our own
//! subscription before it runs out.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::{DiscourseId, MemberId};

use crate::deletion::fire_time;
use crate::error::{CoreError, Result};
use crate::timer::{TimerHandle, TimerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    timer: Option<TimerHandle>,
}

impl Subscription {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    Extended,
    /// The requested window had already elapsed; nothing changed.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// No subscription for this member.
    Unknown,
    /// Request predates the subscription start and was ignored.
    Stale,
    /// End moved in, subscription still running.
    Shortened,
    /// Clamped end already elapsed; subscription removed.
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct LocalIntent {
    window: Duration,
    renewal: Option<TimerHandle>,
}

#[derive(Debug, Default)]
struct Discourse {
    subscriptions: HashMap<MemberId, Subscription>,
    intent: Option<LocalIntent>,
}

impl Discourse {
    fn is_idle(&self) -> bool {
        self.subscriptions.is_empty() && self.intent.is_none()
    }
}

/// All discourses of one context.
#[derive(Debug, Default)]
pub struct DiscourseManager {
    discourses: HashMap<DiscourseId, Discourse>,
}

impl DiscourseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `member` for `[timestamp, timestamp + window)`, or extend
    /// an existing subscription to the later of both ends.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe<E, F>(
        &mut self,
        timers: &mut TimerQueue<E>,
        id: DiscourseId,
        member: MemberId,
        timestamp: DateTime<Utc>,
        window: Duration,
        now: DateTime<Utc>,
        event: F,
    ) -> Result<SubscribeOutcome>
    where
        F: FnOnce() -> E,
    {
        let end = fire_time(timestamp, window);
        if end <= now {
            debug!(discourse = %id.short(), %member, "Subscription window already elapsed");
            return Ok(SubscribeOutcome::Expired);
        }

        let exhausted = |_| CoreError::Exhausted("discourse subscriptions");

        if !self.discourses.contains_key(&id) {
            self.discourses.try_reserve(1).map_err(exhausted)?;
        }
        let discourse = self.discourses.entry(id).or_default();

        if let Some(subscription) = discourse.subscriptions.get_mut(&member) {
            subscription.end = subscription.end.max(end);
            if let Some(handle) = subscription.timer.take() {
                timers.cancel(handle);
            }
            subscription.timer = Some(timers.arm(subscription.end, event()));
            debug!(discourse = %id.short(), %member, end = %subscription.end, "Subscription extended");
            return Ok(SubscribeOutcome::Extended);
        }

        discourse.subscriptions.try_reserve(1).map_err(exhausted)?;
        let handle = timers.arm(end, event());
        discourse.subscriptions.insert(
            member,
            Subscription {
                start: timestamp,
                end,
                timer: Some(handle),
            },
        );
        debug!(discourse = %id.short(), %member, %end, "Subscription created");
        Ok(SubscribeOutcome::Created)
    }

    /// Shorten `member`'s subscription to end no later than
    /// `timestamp + grace`.
    #[allow(clippy::too_many_arguments)]
    pub fn unsubscribe<E, F>(
        &mut self,
        timers: &mut TimerQueue<E>,
        id: DiscourseId,
        member: MemberId,
        timestamp: DateTime<Utc>,
        grace: Duration,
        now: DateTime<Utc>,
        event: F,
    ) -> UnsubscribeOutcome
    where
        F: FnOnce() -> E,
    {
        let Some(discourse) = self.discourses.get_mut(&id) else {
            return UnsubscribeOutcome::Unknown;
        };
        let Some(subscription) = discourse.subscriptions.get_mut(&member) else {
            return UnsubscribeOutcome::Unknown;
        };

        if timestamp < subscription.start {
            debug!(discourse = %id.short(), %member, "Ignoring stale unsubscribe");
            return UnsubscribeOutcome::Stale;
        }

        subscription.end = subscription.end.min(fire_time(timestamp, grace));
        if let Some(handle) = subscription.timer.take() {
            timers.cancel(handle);
        }

        if subscription.end <= now {
            discourse.subscriptions.remove(&member);
            debug!(discourse = %id.short(), %member, "Subscription removed");
            self.prune(&id);
            return UnsubscribeOutcome::Removed;
        }

        subscription.timer = Some(timers.arm(subscription.end, event()));
        debug!(discourse = %id.short(), %member, end = %subscription.end, "Subscription shortened");
        UnsubscribeOutcome::Shortened
    }

    /// Handle a fired expiry timer. Stale handles are ignored.
    pub fn expired(&mut self, id: &DiscourseId, member: MemberId, handle: TimerHandle) -> bool {
        let Some(discourse) = self.discourses.get_mut(id) else {
            return false;
        };
        let current = discourse
            .subscriptions
            .get(&member)
            .map(|subscription| subscription.timer == Some(handle))
            .unwrap_or(false);
        if !current {
            return false;
        }

        discourse.subscriptions.remove(&member);
        debug!(discourse = %id.short(), %member, "Subscription expired");
        self.prune(id);
        true
    }

    /// Whether our own subscription currently covers `now`.
    pub fn is_open(&self, id: &DiscourseId, self_member: Option<MemberId>, now: DateTime<Utc>) -> bool {
        let Some(member) = self_member else {
            return false;
        };
        self.subscription(id, member)
            .map(|subscription| subscription.contains(now))
            .unwrap_or(false)
    }

    pub fn subscription(&self, id: &DiscourseId, member: MemberId) -> Option<Subscription> {
        self.discourses
            .get(id)?
            .subscriptions
            .get(&member)
            .copied()
    }

    /// Members whose subscription covers `now`.
    pub fn subscribers(&self, id: &DiscourseId, now: DateTime<Utc>) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = self
            .discourses
            .get(id)
            .map(|discourse| {
                discourse
                    .subscriptions
                    .iter()
                    .filter(|(_, subscription)| subscription.contains(now))
                    .map(|(member, _)| *member)
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Record that we want to stay subscribed with `window`.
    pub fn set_intent(&mut self, id: DiscourseId, window: Duration) -> Result<()> {
        if !self.discourses.contains_key(&id) {
            self.discourses
                .try_reserve(1)
                .map_err(|_| CoreError::Exhausted("discourse subscriptions"))?;
        }
        let discourse = self.discourses.entry(id).or_default();
        let renewal = discourse.intent.and_then(|intent| intent.renewal);
        discourse.intent = Some(LocalIntent { window, renewal });
        Ok(())
    }

    /// Forget the local intent and cancel its renewal timer.
    pub fn clear_intent<E>(&mut self, timers: &mut TimerQueue<E>, id: &DiscourseId) -> bool {
        let Some(discourse) = self.discourses.get_mut(id) else {
            return false;
        };
        let Some(intent) = discourse.intent.take() else {
            return false;
        };
        if let Some(handle) = intent.renewal {
            timers.cancel(handle);
        }
        self.prune(id);
        true
    }

    /// Window we want to keep, if we want to stay subscribed.
    pub fn intent(&self, id: &DiscourseId) -> Option<Duration> {
        self.discourses.get(id)?.intent.map(|intent| intent.window)
    }

    /// Replace the renewal timer of the local intent.
    pub fn arm_renewal<E>(
        &mut self,
        timers: &mut TimerQueue<E>,
        id: &DiscourseId,
        at: DateTime<Utc>,
        event: E,
    ) -> Option<TimerHandle> {
        let intent = self.discourses.get_mut(id)?.intent.as_mut()?;
        if let Some(handle) = intent.renewal.take() {
            timers.cancel(handle);
        }
        let handle = timers.arm(at, event);
        intent.renewal = Some(handle);
        Some(handle)
    }

    /// Acknowledge a fired renewal timer; returns the window to renew with.
    pub fn renewal_fired(&mut self, id: &DiscourseId, handle: TimerHandle) -> Option<Duration> {
        let intent = self.discourses.get_mut(id)?.intent.as_mut()?;
        if intent.renewal != Some(handle) {
            return None;
        }
        intent.renewal = None;
        Some(intent.window)
    }

    /// Cancel every timer; used when the context goes away.
    pub fn clear<E>(&mut self, timers: &mut TimerQueue<E>) {
        for (_, discourse) in self.discourses.drain() {
            for subscription in discourse.subscriptions.values() {
                if let Some(handle) = subscription.timer {
                    timers.cancel(handle);
                }
            }
            if let Some(handle) = discourse.intent.and_then(|intent| intent.renewal) {
                timers.cancel(handle);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.discourses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discourses.is_empty()
    }

    fn prune(&mut self, id: &DiscourseId) {
        if self.discourses.get(id).map(Discourse::is_idle).unwrap_or(false) {
            self.discourses.remove(id);
        }
    }
}
