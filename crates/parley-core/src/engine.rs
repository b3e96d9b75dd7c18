//! The reconciliation engine.
//!
//! [`Engine`] is the single writer of all core state. The transport feeds it
//! deliveries, the driver feeds it the current time, and it answers with
//! [`Notification`]s queued for the application. Every handler runs to
//! completion; nothing in here blocks or awaits.
//!
//! Delivery pipeline:
//!
//! 1. resolve the sender through the [`ContactRegistry`];
//! 2. deduplicate by content id (redeliveries may update or delete in place);
//! 3. validate, store as pending, request a missing predecessor;
//! 4. wait for the declared dependency, or finalize right away;
//! 5. finalizing fans out to the tagging index, the deletion scheduler,
//!    the discourse manager and the classifier, then releases waiters in
//!    FIFO order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use parley_shared::constants::MAX_NAME_LEN;
use parley_shared::{
    ContextKey, Delivery, DiscourseId, MalformedReason, Member, MemberId, Message, MessageBody,
    MessageFlags, MessageId, MessageKind, PublicKey, SubscribeFlags, TagKey,
};

use crate::classifier::{distinct_others, ContextType, Transition};
use crate::config::EngineConfig;
use crate::contacts::{Contact, ContactRegistry};
use crate::context::{Context, FileEntry, Invitation};
use crate::deletion::{fire_time, Schedule};
use crate::discourse::{SubscribeOutcome, UnsubscribeOutcome};
use crate::error::{CoreError, Result};
use crate::events::{MessageChange, Notification};
use crate::records::RecordStore;
use crate::resolver::{causal_predecessor, declared_dependency};
use crate::store::{DeliveryState, Grave, StoredMessage};
use crate::tagging::TagEntry;
use crate::timer::TimerQueue;
use crate::transport::Transport;

/// Payload of every timer the engine arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Deletion {
        context: ContextKey,
        target: MessageId,
    },
    SubscriptionExpiry {
        context: ContextKey,
        discourse: DiscourseId,
        member: MemberId,
    },
    Renewal {
        context: ContextKey,
        discourse: DiscourseId,
    },
}

/// Whether messages of `kind` reach the application as chat messages.
fn surfaces(kind: MessageKind) -> bool {
    !kind.is_internal() && !matches!(kind, MessageKind::Subscribe | MessageKind::Talk)
}

pub struct Engine<T, S> {
    config: EngineConfig,
    transport: T,
    records: S,
    registry: ContactRegistry,
    contexts: HashMap<ContextKey, Context>,
    /// Contexts classified as groups.
    groups: HashSet<ContextKey>,
    timers: TimerQueue<TimerEvent>,
    notifications: VecDeque<Notification>,
}

impl<T: Transport, S: RecordStore> Engine<T, S> {
    pub fn new(config: EngineConfig, transport: T, records: S) -> Self {
        Self {
            config,
            transport,
            records,
            registry: ContactRegistry::new(),
            contexts: HashMap::new(),
            groups: HashSet::new(),
            timers: TimerQueue::new(),
            notifications: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn records(&self) -> &S {
        &self.records
    }

    pub fn registry(&self) -> &ContactRegistry {
        &self.registry
    }

    pub fn contact(&self, member: MemberId) -> Option<Arc<Contact>> {
        self.registry.get(member)
    }

    pub fn context(&self, key: &ContextKey) -> Option<&Context> {
        self.contexts.get(key)
    }

    pub fn context_keys(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self.contexts.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn context_type(&self, key: &ContextKey) -> Option<ContextType> {
        self.contexts.get(key).map(Context::kind)
    }

    pub fn is_group(&self, key: &ContextKey) -> bool {
        self.groups.contains(key)
    }

    /// Take every queued notification, oldest first.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Context lifecycle
    // -----------------------------------------------------------------------

    /// Start tracking `key`. Returns `false` if it was already tracked.
    pub fn open_context(&mut self, key: ContextKey) -> Result<bool> {
        if self.contexts.contains_key(&key) {
            return Ok(false);
        }
        self.contexts
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("context table"))?;
        self.contexts.insert(key, Context::new(key));
        info!(context = %key.short(), "Context opened");
        self.publish_record(key);
        Ok(true)
    }

    /// Forget a context entirely. Contacts only referenced by it are
    /// released.
    pub fn leave_context(&mut self, key: &ContextKey) -> bool {
        let Some(mut ctx) = self.contexts.remove(key) else {
            return false;
        };
        let label = ctx.label();
        let contacts = ctx.teardown(&mut self.timers);
        for contact in &contacts {
            contact.detach_direct(*key);
        }
        self.groups.remove(key);
        drop(contacts);
        drop(ctx);

        let released = self.registry.prune();
        if let Err(e) = self.records.retract(&label) {
            self.warn(Some(*key), format!("Retracting {label} failed: {e}"));
        }
        info!(context = %key.short(), released, "Context left");
        true
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    /// Handle one `deliver_message` call of the transport.
    pub fn deliver(&mut self, delivery: Delivery, now: DateTime<Utc>) -> Result<()> {
        let Delivery {
            context: key,
            sender,
            recipient,
            id,
            message,
            flags,
        } = delivery;

        if let Err(reason) = message.validate(&id) {
            warn!(
                context = %key.short(),
                message = %id.short(),
                kind = %message.kind(),
                %reason,
                "Dropping malformed message"
            );
            return Err(reason.into());
        }

        self.open_context(key)?;
        let contact = self.registry.resolve(&sender)?;
        let from_self = flags.sent || self.is_self_key(sender.key);

        let ctx = self
            .contexts
            .get_mut(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        if from_self {
            ctx.set_self_member(sender.id);
        }
        ctx.add_member(Arc::clone(&contact))?;

        if ctx.store.contains(&id) {
            return self.redeliver(key, id, message, flags, now);
        }

        let grave = ctx.store.grave(&id);
        let deleted = flags.deleted || grave.is_some_and(|grave| grave.fire_at <= now);
        let predecessor = causal_predecessor(&message);
        let dependency = declared_dependency(&message);
        let kind = message.kind();

        ctx.store.insert(StoredMessage {
            id,
            sender: contact,
            recipient,
            message,
            flags: MessageFlags {
                sent: from_self,
                updated: false,
                deleted: false,
                ..flags
            },
            state: DeliveryState::Pending,
            received_at: now,
            updated_at: now,
        })?;

        if deleted {
            ctx.store.tombstone(&id, now);
            ctx.store.bury(&id);
            debug!(context = %key.short(), message = %id.short(), "Stored deleted message as tombstone");
            return self.release_dependents(key, id, now);
        }

        if let Some(grave) = grave {
            let armed = ctx.deletions.schedule(
                &mut self.timers,
                id,
                grave.deletion,
                grave.fire_at,
                now,
                || TimerEvent::Deletion {
                    context: key,
                    target: id,
                },
            );
            if let Err(e) = armed {
                ctx.store.withdraw(&id);
                return Err(e);
            }
            debug!(
                context = %key.short(),
                message = %id.short(),
                fire_at = %grave.fire_at,
                "Arrived with a pending deletion"
            );
        }

        let missing_predecessor = predecessor
            .filter(|previous| !ctx.store.contains(previous) && !ctx.store.is_grave(previous));

        let blocked_on = dependency.filter(|dep| !ctx.store.is_resolved(dep));
        let mut fetch = None;
        if let Some(dep) = blocked_on {
            if let Err(e) = ctx.dependencies.enqueue(dep, id) {
                ctx.deletions.cancel(&mut self.timers, &id);
                ctx.store.withdraw(&id);
                return Err(e);
            }
            if !ctx.store.contains(&dep) {
                fetch = Some(dep);
            }
            debug!(
                context = %key.short(),
                message = %id.short(),
                %kind,
                dependency = %dep.short(),
                "Message deferred until dependency resolves"
            );
        }
        if grave.is_some() {
            ctx.store.bury(&id);
        }

        if let Some(previous) = missing_predecessor {
            debug!(context = %key.short(), previous = %previous.short(), "Requesting missing predecessor");
            self.request(key, previous);
        }
        if let Some(dep) = fetch {
            self.request(key, dep);
        }
        if blocked_on.is_some() {
            return Ok(());
        }

        self.finalize(key, id, now)?;
        self.release_dependents(key, id, now)
    }

    /// The transport gave up on `id`. Its waiters are replayed as if it had
    /// resolved; deletions among them leave a grave for it.
    pub fn resolve_missing(&mut self, key: ContextKey, id: MessageId, now: DateTime<Utc>) -> Result<usize> {
        let ctx = self
            .contexts
            .get(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        if ctx.store.contains(&id) {
            return Ok(0);
        }
        let waiting = ctx
            .dependencies
            .snapshot()
            .into_iter()
            .find(|(dep, _)| *dep == id)
            .map(|(_, count)| count)
            .unwrap_or(0);

        info!(context = %key.short(), message = %id.short(), waiting, "Message reported missing");
        self.release_dependents(key, id, now)?;
        Ok(waiting)
    }

    /// Dependency id -> number of parked messages.
    pub fn pending_dependencies(&self, key: &ContextKey) -> Vec<(MessageId, usize)> {
        self.contexts
            .get(key)
            .map(|ctx| ctx.dependencies.snapshot())
            .unwrap_or_default()
    }

    fn redeliver(
        &mut self,
        key: ContextKey,
        id: MessageId,
        message: Message,
        flags: MessageFlags,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(ctx) = self.contexts.get_mut(&key) else {
            return Ok(());
        };
        let Some(record) = ctx.store.get(&id) else {
            return Ok(());
        };

        if record.is_deleted() {
            debug!(context = %key.short(), message = %id.short(), "Ignoring redelivery of tombstone");
            return Ok(());
        }

        if flags.deleted {
            self.tombstone(key, id, now);
            return self.release_dependents(key, id, now);
        }

        if !flags.updated || record.message == message {
            debug!(context = %key.short(), message = %id.short(), "Duplicate delivery ignored");
            return Ok(());
        }

        if record.kind() != message.kind()
            || declared_dependency(&record.message) != declared_dependency(&message)
        {
            warn!(
                context = %key.short(),
                message = %id.short(),
                "Update changes message kind or reference, ignoring"
            );
            return Ok(());
        }
        if let Err(reason) = message.validate(&id) {
            warn!(context = %key.short(), message = %id.short(), %reason, "Dropping malformed update");
            return Err(reason.into());
        }

        let delivered = record.is_delivered();
        let sent = record.is_sent();
        let sender = Arc::clone(&record.sender);
        let kind = record.kind();
        let old_body = record.message.body.clone();
        let new_body = message.body.clone();

        ctx.store.apply_update(&id, message, flags, now);
        debug!(context = %key.short(), message = %id.short(), %kind, "Message updated in place");

        if delivered {
            match (old_body, new_body) {
                (MessageBody::Tag { target, tag: old }, MessageBody::Tag { tag: new, .. }) => {
                    ctx.tagging.remove(&target, &TagKey::of(old.as_deref()), &id);
                    let live = ctx
                        .store
                        .get(&target)
                        .is_some_and(|existing| !existing.is_deleted());
                    if live {
                        ctx.tagging.add(
                            target,
                            TagKey::of(new.as_deref()),
                            TagEntry {
                                message: id,
                                sent_by_self: sent,
                            },
                        )?;
                    }
                }
                (_, MessageBody::Name { name }) => sender.set_nick(name),
                (_, MessageBody::Invite { room }) => ctx.index_invitation(
                    id,
                    Invitation {
                        room,
                        sender: sender.id(),
                    },
                )?,
                (
                    _,
                    MessageBody::File {
                        name,
                        content_hash,
                        size,
                    },
                ) => ctx.index_file(
                    id,
                    FileEntry {
                        name,
                        content_hash,
                        size,
                        sender: sender.id(),
                    },
                )?,
                _ => {}
            }
            if surfaces(kind) {
                self.notify_message(key, id, kind, MessageChange::Updated);
            }
        }
        Ok(())
    }

    /// Replay everything that waited on `resolved`, cascading through
    /// waiters that become resolved in turn.
    fn release_dependents(&mut self, key: ContextKey, resolved: MessageId, now: DateTime<Utc>) -> Result<()> {
        let mut queue = VecDeque::from([resolved]);

        while let Some(dependency) = queue.pop_front() {
            let waiters = match self.contexts.get_mut(&key) {
                Some(ctx) => ctx.dependencies.release(&dependency),
                None => return Ok(()),
            };
            if waiters.is_empty() {
                continue;
            }
            debug!(
                context = %key.short(),
                dependency = %dependency.short(),
                count = waiters.len(),
                "Releasing dependents"
            );

            let mut waiters = waiters.into_iter();
            while let Some(waiter) = waiters.next() {
                match self.finalize(key, waiter, now) {
                    Ok(true) => queue.push_back(waiter),
                    Ok(false) => {}
                    Err(e) => {
                        self.park(key, dependency, std::iter::once(waiter).chain(waiters));
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Put waiters back after a failed release.
    fn park<I>(&mut self, key: ContextKey, dependency: MessageId, waiters: I)
    where
        I: IntoIterator<Item = MessageId>,
    {
        let Some(ctx) = self.contexts.get_mut(&key) else {
            return;
        };
        for waiter in waiters {
            if let Err(e) = ctx.dependencies.enqueue(dependency, waiter) {
                warn!(
                    context = %key.short(),
                    message = %waiter.short(),
                    error = %e,
                    "Lost track of pending message"
                );
            }
        }
    }

    /// Apply the effects of a pending message and mark it delivered.
    /// Returns `false` if there was nothing to finalize.
    fn finalize(&mut self, key: ContextKey, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let Some(ctx) = self.contexts.get_mut(&key) else {
            return Ok(false);
        };
        let Some(record) = ctx.store.get(&id) else {
            return Ok(false);
        };
        if record.is_delivered() || record.is_deleted() {
            return Ok(false);
        }

        let sender = Arc::clone(&record.sender);
        let sent = record.is_sent();
        let timestamp = record.timestamp();
        let body = record.message.body.clone();
        let kind = body.kind();

        let mut membership_changed = false;
        let mut delete_now = None;
        let mut membership = None;
        let mut talk = None;

        match body {
            MessageBody::Join { key: member_key } => {
                ctx.record_join(sender.id(), id)?;
                sender.update_key(member_key);
                membership_changed = true;
            }
            MessageBody::Leave => {
                sender.detach_direct(key);
                ctx.remove_member(sender.id());
            }
            MessageBody::Name { name } => sender.set_nick(name),
            MessageBody::Invite { room } => ctx.index_invitation(
                id,
                Invitation {
                    room,
                    sender: sender.id(),
                },
            )?,
            MessageBody::File {
                name,
                content_hash,
                size,
            } => ctx.index_file(
                id,
                FileEntry {
                    name,
                    content_hash,
                    size,
                    sender: sender.id(),
                },
            )?,
            MessageBody::Delete { target, delay } => {
                let fire_at = fire_time(timestamp, delay);
                match ctx.store.get(&target) {
                    None => {
                        ctx.store.add_grave(
                            target,
                            Grave {
                                fire_at,
                                deletion: id,
                            },
                        )?;
                        debug!(
                            context = %key.short(),
                            target = %target.short(),
                            %fire_at,
                            "Deletion target missing, leaving grave"
                        );
                    }
                    Some(existing) if existing.is_deleted() => {
                        debug!(context = %key.short(), target = %target.short(), "Deletion target already gone");
                    }
                    Some(_) => {
                        let schedule = ctx.deletions.schedule(
                            &mut self.timers,
                            target,
                            id,
                            fire_at,
                            now,
                            || TimerEvent::Deletion {
                                context: key,
                                target,
                            },
                        )?;
                        if schedule == Schedule::Immediate {
                            delete_now = Some(target);
                        }
                    }
                }
            }
            MessageBody::Tag { target, tag } => match ctx.store.get(&target) {
                Some(existing) if !existing.is_deleted() => ctx.tagging.add(
                    target,
                    TagKey::of(tag.as_deref()),
                    TagEntry {
                        message: id,
                        sent_by_self: sent,
                    },
                )?,
                _ => {
                    debug!(context = %key.short(), target = %target.short(), "Tag target gone, not indexing");
                }
            },
            MessageBody::Subscribe {
                discourse,
                window,
                flags,
            } => {
                let member = sender.id();
                let expiry = || TimerEvent::SubscriptionExpiry {
                    context: key,
                    discourse,
                    member,
                };
                if flags.unsubscribe {
                    let outcome = ctx.discourses.unsubscribe(
                        &mut self.timers,
                        discourse,
                        member,
                        timestamp,
                        window,
                        now,
                        expiry,
                    );
                    if outcome == UnsubscribeOutcome::Removed {
                        membership = Some((discourse, member, false));
                    }
                } else {
                    let outcome = ctx.discourses.subscribe(
                        &mut self.timers,
                        discourse,
                        member,
                        timestamp,
                        window,
                        now,
                        expiry,
                    )?;
                    if outcome == SubscribeOutcome::Created {
                        membership = Some((discourse, member, true));
                    }
                    if sent && ctx.discourses.intent(&discourse).is_some() {
                        let at = fire_time(timestamp, self.config.renewal_delay(window));
                        ctx.discourses.arm_renewal(
                            &mut self.timers,
                            &discourse,
                            at,
                            TimerEvent::Renewal {
                                context: key,
                                discourse,
                            },
                        );
                    }
                }
            }
            MessageBody::Talk { discourse, data } => talk = Some((discourse, data)),
            MessageBody::Text { .. }
            | MessageBody::Private { .. }
            | MessageBody::Merge { .. }
            | MessageBody::Request { .. } => {}
        }

        ctx.store.mark_delivered(&id);
        debug!(context = %key.short(), message = %id.short(), %kind, "Message delivered");

        if let Some((discourse, member, subscribed)) = membership {
            self.notifications
                .push_back(Notification::DiscourseMembership {
                    context: key,
                    discourse,
                    member,
                    subscribed,
                });
        }
        if let Some((discourse, data)) = talk {
            self.notifications.push_back(Notification::DiscourseData {
                context: key,
                discourse,
                sender: sender.id(),
                data,
            });
        }
        if surfaces(kind) {
            self.notify_message(key, id, kind, MessageChange::Received);
        }
        if let Some(target) = delete_now {
            self.tombstone(key, target, now);
        }
        if membership_changed {
            if let Err(e) = self.on_membership_changed(key) {
                self.warn(Some(key), format!("Reclassification failed: {e}"));
            }
        }
        Ok(true)
    }

    /// Turn `id` into a tombstone and drop everything derived from it.
    fn tombstone(&mut self, key: ContextKey, id: MessageId, now: DateTime<Utc>) -> bool {
        let Some(ctx) = self.contexts.get_mut(&key) else {
            return false;
        };
        let Some(record) = ctx.store.get(&id) else {
            return false;
        };
        if record.is_deleted() {
            return false;
        }

        let delivered = record.is_delivered();
        let kind = record.kind();
        let tag = match &record.message.body {
            MessageBody::Tag { target, tag } => Some((*target, TagKey::of(tag.as_deref()))),
            _ => None,
        };

        if let Some((target, tag_key)) = tag {
            ctx.tagging.remove(&target, &tag_key, &id);
        }
        let untagged = ctx.tagging.remove_target(&id);
        if untagged > 0 {
            debug!(context = %key.short(), message = %id.short(), untagged, "Dropped tags on deleted message");
        }
        ctx.unindex(&id);
        ctx.deletions.cancel(&mut self.timers, &id);
        ctx.store.tombstone(&id, now);
        debug!(context = %key.short(), message = %id.short(), %kind, "Message tombstoned");

        if delivered && surfaces(kind) {
            self.notify_message(key, id, kind, MessageChange::Deleted);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    /// Enumerate the room's members and reclassify the context.
    pub fn on_membership_changed(&mut self, key: ContextKey) -> Result<ContextType> {
        let current = self
            .context_type(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        let snapshot = match self.transport.enumerate_members(&key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.warn(Some(key), format!("Member enumeration failed: {e}"));
                return Ok(current);
            }
        };
        self.classify(key, &snapshot)
    }

    /// Feed one membership snapshot to the classifier of `key`.
    pub fn classify(&mut self, key: ContextKey, snapshot: &[Member]) -> Result<ContextType> {
        let contacts = snapshot
            .iter()
            .map(|member| self.registry.resolve(member))
            .collect::<Result<Vec<_>>>()?;

        let self_key = Some(self.config.self_key);
        let ctx = self
            .contexts
            .get_mut(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        for contact in contacts {
            ctx.add_member(contact)?;
        }

        let self_member = ctx.self_member();
        let others = distinct_others(snapshot, |member| {
            Some(member.id) == self_member || member.key == self_key
        });
        let keys: Vec<PublicKey> = others.iter().filter_map(|member| member.key).collect();
        let peer = others.first().map(|member| member.id);

        match ctx.classifier.observe(keys.iter())? {
            Some(transition) => {
                self.apply_transition(key, transition, peer)?;
                Ok(transition.to)
            }
            None => Ok(ctx.kind()),
        }
    }

    fn apply_transition(&mut self, key: ContextKey, transition: Transition, peer: Option<MemberId>) -> Result<()> {
        let Some(ctx) = self.contexts.get(&key) else {
            return Ok(());
        };

        match transition.to {
            ContextType::Contact => {
                if let Some(contact) = peer.and_then(|id| ctx.member(id)) {
                    if !contact.attach_direct(key) {
                        debug!(
                            context = %key.short(),
                            member = %contact.id(),
                            "Contact already has a direct context"
                        );
                    }
                }
            }
            ContextType::Group => {
                for contact in ctx.members() {
                    contact.detach_direct(key);
                }
                self.groups
                    .try_reserve(1)
                    .map_err(|_| CoreError::Exhausted("group index"))?;
                self.groups.insert(key);
            }
            ContextType::Unknown => {}
        }

        assert!(
            !(self.groups.contains(&key)
                && ctx.members().any(|contact| contact.direct_context() == Some(key))),
            "context {key} is linked as a contact chat and indexed as a group"
        );

        info!(
            context = %key.short(),
            from = %transition.from,
            to = %transition.to,
            "Context reclassified"
        );
        self.notifications
            .push_back(Notification::ContextClassified {
                context: key,
                from: transition.from,
                to: transition.to,
            });

        let previous = crate::records::context_label(transition.from, &key);
        if let Err(e) = self.records.retract(&previous) {
            self.warn(Some(key), format!("Retracting {previous} failed: {e}"));
        }
        self.publish_record(key);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    /// Run every timer due at `now`. Returns how many had an effect.
    pub fn fire_timers(&mut self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;

        for (handle, event) in self.timers.pop_due(now) {
            match event {
                TimerEvent::Deletion { context, target } => {
                    let current = self
                        .contexts
                        .get_mut(&context)
                        .map(|ctx| ctx.deletions.fired(&target, handle))
                        .unwrap_or(false);
                    if current && self.tombstone(context, target, now) {
                        fired += 1;
                        if let Err(e) = self.release_dependents(context, target, now) {
                            self.warn(Some(context), format!("Releasing dependents of {} failed: {e}", target.short()));
                        }
                    }
                }
                TimerEvent::SubscriptionExpiry {
                    context,
                    discourse,
                    member,
                } => {
                    let expired = self
                        .contexts
                        .get_mut(&context)
                        .map(|ctx| ctx.discourses.expired(&discourse, member, handle))
                        .unwrap_or(false);
                    if expired {
                        self.notifications
                            .push_back(Notification::DiscourseMembership {
                                context,
                                discourse,
                                member,
                                subscribed: false,
                            });
                        fired += 1;
                    }
                }
                TimerEvent::Renewal { context, discourse } => {
                    let window = self
                        .contexts
                        .get_mut(&context)
                        .and_then(|ctx| ctx.discourses.renewal_fired(&discourse, handle));
                    if let Some(window) = window {
                        debug!(context = %context.short(), discourse = %discourse.short(), "Renewing subscription");
                        let body = MessageBody::Subscribe {
                            discourse,
                            window,
                            flags: SubscribeFlags {
                                unsubscribe: false,
                                keep_alive: true,
                            },
                        };
                        if let Err(e) = self.transport.send_message(&context, body) {
                            self.warn(Some(context), format!("Subscription renewal failed: {e}"));
                        }
                        fired += 1;
                    }
                }
            }
        }
        fired
    }

    // -----------------------------------------------------------------------
    // Tagging
    // -----------------------------------------------------------------------

    /// Send a tag for `target`. The index changes once the tag comes back.
    pub fn tag_message(&mut self, key: ContextKey, target: MessageId, tag: Option<&str>) -> Result<()> {
        if !self.contexts.contains_key(&key) {
            return Err(CoreError::UnknownContext(key));
        }
        self.send(
            key,
            MessageBody::Tag {
                target,
                tag: tag.map(str::to_owned),
            },
        )
    }

    /// Retract our active tag on `target` by deleting the tag message.
    pub fn untag_message(&mut self, key: ContextKey, target: MessageId, tag: Option<&str>) -> Result<()> {
        let ctx = self
            .contexts
            .get(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        let active = ctx
            .tagging
            .active(&target, &TagKey::of(tag))
            .ok_or(CoreError::NothingToUntag)?;
        self.send(
            key,
            MessageBody::Delete {
                target: active,
                delay: Duration::ZERO,
            },
        )
    }

    pub fn is_message_tagged(&self, key: &ContextKey, target: &MessageId, tag: Option<&str>) -> bool {
        self.contexts
            .get(key)
            .map(|ctx| ctx.tagging.is_tagged(target, tag))
            .unwrap_or(false)
    }

    /// Values of our active tags on `target`; `None` is the block marker.
    pub fn message_tags(&self, key: &ContextKey, target: &MessageId) -> Vec<Option<String>> {
        let Some(ctx) = self.contexts.get(key) else {
            return Vec::new();
        };
        let mut tags: Vec<Option<String>> = ctx
            .tagging
            .active_entries(target)
            .iter()
            .filter_map(|id| match &ctx.store.get(id)?.message.body {
                MessageBody::Tag { tag, .. } => Some(tag.clone().filter(|value| !value.is_empty())),
                _ => None,
            })
            .collect();
        tags.sort();
        tags
    }

    pub fn tag_contact(&mut self, member: MemberId, context: Option<ContextKey>, tag: Option<&str>) -> Result<()> {
        let (key, join) = self.contact_target(member, context)?;
        self.tag_message(key, join, tag)
    }

    pub fn untag_contact(&mut self, member: MemberId, context: Option<ContextKey>, tag: Option<&str>) -> Result<()> {
        let (key, join) = self.contact_target(member, context)?;
        self.untag_message(key, join, tag)
    }

    pub fn block_contact(&mut self, member: MemberId, context: Option<ContextKey>) -> Result<()> {
        self.tag_contact(member, context, None)
    }

    pub fn unblock_contact(&mut self, member: MemberId, context: Option<ContextKey>) -> Result<()> {
        self.untag_contact(member, context, None)
    }

    /// Whether `member` carries our `tag`. Without a context the contact's
    /// direct chat is checked first, then every context that knows the
    /// member's join.
    pub fn is_contact_tagged(&self, member: MemberId, context: Option<ContextKey>, tag: Option<&str>) -> bool {
        let tagged_in = |key: &ContextKey| {
            self.contexts
                .get(key)
                .and_then(|ctx| {
                    ctx.join_of(member)
                        .map(|join| ctx.tagging.is_tagged(&join, tag))
                })
                .unwrap_or(false)
        };

        if let Some(key) = context {
            return tagged_in(&key);
        }

        let direct = self
            .registry
            .get(member)
            .and_then(|contact| contact.direct_context());
        if let Some(key) = direct {
            if tagged_in(&key) {
                return true;
            }
        }

        self.contexts
            .keys()
            .filter(|key| Some(**key) != direct)
            .any(tagged_in)
    }

    pub fn is_contact_blocked(&self, member: MemberId, context: Option<ContextKey>) -> bool {
        self.is_contact_tagged(member, context, None)
    }

    /// Context and join message a contact-level tag attaches to.
    fn contact_target(&self, member: MemberId, context: Option<ContextKey>) -> Result<(ContextKey, MessageId)> {
        if let Some(key) = context {
            let ctx = self
                .contexts
                .get(&key)
                .ok_or(CoreError::UnknownContext(key))?;
            let join = ctx
                .join_of(member)
                .ok_or(CoreError::NotInContext {
                    member,
                    context: key,
                })?;
            return Ok((key, join));
        }

        let direct = self
            .registry
            .get(member)
            .and_then(|contact| contact.direct_context());
        if let Some(found) = direct.and_then(|key| {
            let join = self.contexts.get(&key)?.join_of(member)?;
            Some((key, join))
        }) {
            return Ok(found);
        }

        self.context_keys()
            .into_iter()
            .find_map(|key| {
                let join = self.contexts.get(&key)?.join_of(member)?;
                Some((key, join))
            })
            .ok_or(CoreError::UnknownMember(member))
    }

    // -----------------------------------------------------------------------
    // Discourses
    // -----------------------------------------------------------------------

    /// Subscribe ourselves to `discourse` and keep the subscription alive
    /// until [`close_discourse`](Self::close_discourse).
    pub fn open_discourse(&mut self, key: ContextKey, discourse: DiscourseId, window: Option<Duration>) -> Result<()> {
        let window = window.unwrap_or(self.config.discourse_window);
        if window.is_zero() {
            return Err(MalformedReason::EmptyWindow.into());
        }
        let ctx = self
            .contexts
            .get_mut(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        ctx.discourses.set_intent(discourse, window)?;
        info!(context = %key.short(), discourse = %discourse.short(), ?window, "Opening discourse");
        self.send(
            key,
            MessageBody::Subscribe {
                discourse,
                window,
                flags: SubscribeFlags {
                    unsubscribe: false,
                    keep_alive: true,
                },
            },
        )
    }

    /// Stop renewing and unsubscribe right away.
    pub fn close_discourse(&mut self, key: ContextKey, discourse: DiscourseId) -> Result<()> {
        let ctx = self
            .contexts
            .get_mut(&key)
            .ok_or(CoreError::UnknownContext(key))?;
        ctx.discourses.clear_intent(&mut self.timers, &discourse);
        info!(context = %key.short(), discourse = %discourse.short(), "Closing discourse");
        self.send(
            key,
            MessageBody::Subscribe {
                discourse,
                window: Duration::ZERO,
                flags: SubscribeFlags {
                    unsubscribe: true,
                    keep_alive: false,
                },
            },
        )
    }

    /// Send `data` as talk chunks. Returns the number of messages sent.
    pub fn write_discourse(&mut self, key: ContextKey, discourse: DiscourseId, data: &[u8]) -> Result<usize> {
        if !self.contexts.contains_key(&key) {
            return Err(CoreError::UnknownContext(key));
        }
        let mut sent = 0;
        for chunk in data.chunks(self.config.talk_chunk_size.max(1)) {
            self.send(
                key,
                MessageBody::Talk {
                    discourse,
                    data: Bytes::copy_from_slice(chunk),
                },
            )?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Whether our own subscription to `discourse` covers `now`.
    pub fn is_discourse_open(&self, key: &ContextKey, discourse: &DiscourseId, now: DateTime<Utc>) -> bool {
        self.contexts
            .get(key)
            .map(|ctx| ctx.discourses.is_open(discourse, ctx.self_member(), now))
            .unwrap_or(false)
    }

    pub fn discourse_subscribers(&self, key: &ContextKey, discourse: &DiscourseId, now: DateTime<Utc>) -> Vec<MemberId> {
        self.contexts
            .get(key)
            .map(|ctx| ctx.discourses.subscribers(discourse, now))
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn set_context_name(&mut self, key: ContextKey, name: Option<String>) -> Result<()> {
        check_name_len(name.as_deref())?;
        self.contexts
            .get_mut(&key)
            .ok_or(CoreError::UnknownContext(key))?
            .set_name(name);
        self.publish_record(key);
        Ok(())
    }

    pub fn set_context_topic(&mut self, key: ContextKey, topic: Option<String>) -> Result<()> {
        check_name_len(topic.as_deref())?;
        self.contexts
            .get_mut(&key)
            .ok_or(CoreError::UnknownContext(key))?
            .set_topic(topic);
        self.publish_record(key);
        Ok(())
    }

    fn publish_record(&mut self, key: ContextKey) {
        let Some(ctx) = self.contexts.get(&key) else {
            return;
        };
        let label = ctx.label();
        let result = ctx
            .record()
            .to_bytes()
            .and_then(|payload| self.records.publish(&label, &payload));
        match result {
            Ok(()) => debug!(context = %key.short(), %label, "Context record published"),
            Err(e) => self.warn(Some(key), format!("Publishing {label} failed: {e}")),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn is_self_key(&self, key: Option<PublicKey>) -> bool {
        key == Some(self.config.self_key)
    }

    fn send(&mut self, key: ContextKey, body: MessageBody) -> Result<()> {
        let kind = body.kind();
        self.transport.send_message(&key, body)?;
        debug!(context = %key.short(), %kind, "Message handed to transport");
        Ok(())
    }

    fn request(&mut self, key: ContextKey, id: MessageId) {
        if let Err(e) = self.transport.request_message(&key, &id) {
            self.warn(Some(key), format!("Requesting {} failed: {e}", id.short()));
        }
    }

    fn notify_message(&mut self, context: ContextKey, message: MessageId, kind: MessageKind, change: MessageChange) {
        self.notifications.push_back(Notification::ChatMessage {
            context,
            message,
            kind,
            change,
        });
    }

    fn warn(&mut self, context: Option<ContextKey>, message: String) {
        warn!(context = ?context.map(|key| key.short()), "{message}");
        self.notifications
            .push_back(Notification::Warning { context, message });
    }
}

fn check_name_len(value: Option<&str>) -> Result<()> {
    match value {
        Some(value) if value.len() > MAX_NAME_LEN => Err(MalformedReason::TooLong {
            field: "name",
            max: MAX_NAME_LEN,
        }
        .into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RecordError, TransportError};
    use parley_shared::Digest;

    #[derive(Default)]
    struct Recorder {
        requested: Vec<MessageId>,
        sent: Vec<MessageBody>,
        members: Vec<Member>,
    }

    impl Transport for Recorder {
        fn request_message(&mut self, _context: &ContextKey, id: &MessageId) -> std::result::Result<(), TransportError> {
            self.requested.push(*id);
            Ok(())
        }

        fn enumerate_members(&mut self, _context: &ContextKey) -> std::result::Result<Vec<Member>, TransportError> {
            Ok(self.members.clone())
        }

        fn send_message(&mut self, _context: &ContextKey, body: MessageBody) -> std::result::Result<(), TransportError> {
            self.sent.push(body);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Labels {
        published: Vec<String>,
        retracted: Vec<String>,
    }

    impl RecordStore for Labels {
        fn publish(&mut self, label: &str, _payload: &[u8]) -> std::result::Result<(), RecordError> {
            self.published.push(label.to_string());
            Ok(())
        }

        fn retract(&mut self, label: &str) -> std::result::Result<(), RecordError> {
            self.retracted.push(label.to_string());
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn room() -> ContextKey {
        ContextKey::from_room_key(b"room")
    }

    fn engine() -> Engine<Recorder, Labels> {
        Engine::new(EngineConfig::new(PublicKey([0xee; 32])), Recorder::default(), Labels::default())
    }

    fn delivery(sender: u64, ts: i64, body: MessageBody) -> (MessageId, Delivery) {
        let message = Message::new(at(ts), None, body);
        let id = message.content_id().unwrap();
        let delivery = Delivery {
            context: room(),
            sender: Member::new(MemberId(sender), Some(PublicKey([sender as u8; 32]))),
            recipient: None,
            id,
            message,
            flags: MessageFlags::default(),
        };
        (id, delivery)
    }

    fn text(sender: u64, ts: i64, text: &str) -> (MessageId, Delivery) {
        delivery(sender, ts, MessageBody::Text { text: text.into() })
    }

    #[test]
    fn test_text_is_surfaced_once() {
        let mut engine = engine();
        let (id, d) = text(1, 10, "hello");
        engine.deliver(d.clone(), at(10)).unwrap();
        engine.deliver(d, at(11)).unwrap();

        let notes = engine.drain_notifications();
        assert_eq!(
            notes,
            vec![Notification::ChatMessage {
                context: room(),
                message: id,
                kind: MessageKind::Text,
                change: MessageChange::Received,
            }]
        );
        assert_eq!(engine.context(&room()).unwrap().store().len(), 1);
    }

    #[test]
    fn test_malformed_is_dropped() {
        let mut engine = engine();
        let (_, d) = delivery(
            1,
            10,
            MessageBody::Tag {
                target: MessageId(Digest::ZERO),
                tag: None,
            },
        );
        assert!(matches!(
            engine.deliver(d, at(10)),
            Err(CoreError::Malformed(MalformedReason::MissingTarget { .. }))
        ));
        assert!(engine.context(&room()).is_none());
        assert!(engine.contact(MemberId(1)).is_none());
        assert!(engine.records().published.is_empty());
        assert!(engine.drain_notifications().is_empty());
    }

    #[test]
    fn test_missing_predecessor_is_requested_but_not_waited_for() {
        let mut engine = engine();
        let previous = MessageId(Digest::of(b"earlier"));
        let message = Message::new(at(10), Some(previous), MessageBody::Text { text: "x".into() });
        let id = message.content_id().unwrap();
        let d = Delivery {
            context: room(),
            sender: Member::new(MemberId(1), None),
            recipient: None,
            id,
            message,
            flags: MessageFlags::default(),
        };

        engine.deliver(d, at(10)).unwrap();
        assert_eq!(engine.transport().requested, vec![previous]);
        assert!(engine.context(&room()).unwrap().store().get(&id).unwrap().is_delivered());
    }

    #[test]
    fn test_update_notifies_once_per_change() {
        let mut engine = engine();
        let (id, mut d) = text(1, 10, "v1");
        engine.deliver(d.clone(), at(10)).unwrap();

        d.message.body = MessageBody::Text { text: "v2".into() };
        d.flags.updated = true;
        engine.deliver(d.clone(), at(11)).unwrap();
        engine.deliver(d, at(12)).unwrap();

        let changes: Vec<MessageChange> = engine
            .drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::ChatMessage { message, change, .. } if message == id => Some(change),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![MessageChange::Received, MessageChange::Updated]);
    }

    #[test]
    fn test_deleted_flag_tombstones_and_blocks_resurrection() {
        let mut engine = engine();
        let (id, mut d) = text(1, 10, "gone soon");
        engine.deliver(d.clone(), at(10)).unwrap();

        d.flags.deleted = true;
        engine.deliver(d.clone(), at(11)).unwrap();

        d.flags = MessageFlags::default();
        engine.deliver(d, at(12)).unwrap();

        let stored = engine.context(&room()).unwrap().store().get(&id).unwrap();
        assert!(stored.is_deleted());
        let changes: Vec<MessageChange> = engine
            .drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::ChatMessage { change, .. } => Some(change),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![MessageChange::Received, MessageChange::Deleted]);
    }

    #[test]
    fn test_delayed_deletion_fires_once() {
        let mut engine = engine();
        let (target, d) = text(1, 10, "ephemeral");
        engine.deliver(d, at(10)).unwrap();
        let (_, del) = delivery(
            1,
            10,
            MessageBody::Delete {
                target,
                delay: Duration::from_secs(30),
            },
        );
        engine.deliver(del.clone(), at(11)).unwrap();
        engine.deliver(del, at(12)).unwrap();

        assert_eq!(engine.next_deadline(), Some(at(40)));
        assert_eq!(engine.fire_timers(at(39)), 0);
        assert_eq!(engine.fire_timers(at(40)), 1);
        assert_eq!(engine.fire_timers(at(100)), 0);
        assert!(engine.context(&room()).unwrap().store().get(&target).unwrap().is_deleted());
    }

    #[test]
    fn test_untag_goes_through_deletion() {
        let mut engine = engine();
        let (target, d) = text(2, 10, "spam");
        engine.deliver(d, at(10)).unwrap();

        engine.tag_message(room(), target, Some("spam")).unwrap();
        let body = engine.transport_mut().sent.pop().unwrap();
        let (tag_id, mut tag) = delivery(1, 11, body);
        tag.flags.sent = true;
        engine.deliver(tag, at(11)).unwrap();
        assert!(engine.is_message_tagged(&room(), &target, Some("spam")));
        assert_eq!(engine.message_tags(&room(), &target), vec![Some("spam".to_string())]);

        engine.untag_message(room(), target, Some("spam")).unwrap();
        assert!(engine.is_message_tagged(&room(), &target, Some("spam")));
        let body = engine.transport_mut().sent.pop().unwrap();
        assert_eq!(
            body,
            MessageBody::Delete {
                target: tag_id,
                delay: Duration::ZERO,
            }
        );

        let (_, mut retraction) = delivery(1, 12, body);
        retraction.flags.sent = true;
        engine.deliver(retraction, at(12)).unwrap();
        assert!(!engine.is_message_tagged(&room(), &target, Some("spam")));
        assert!(matches!(
            engine.untag_message(room(), target, Some("spam")),
            Err(CoreError::NothingToUntag)
        ));
    }

    #[test]
    fn test_contact_block_falls_back_to_any_context() {
        let mut engine = engine();
        let (join, d) = delivery(2, 10, MessageBody::Join { key: None });
        engine.deliver(d, at(10)).unwrap();
        assert!(!engine.is_contact_blocked(MemberId(2), None));

        engine.block_contact(MemberId(2), None).unwrap();
        let body = engine.transport_mut().sent.pop().unwrap();
        assert_eq!(body, MessageBody::Tag { target: join, tag: None });

        let (_, mut tag) = delivery(1, 11, body);
        tag.flags.sent = true;
        engine.deliver(tag, at(11)).unwrap();

        assert!(engine.is_contact_blocked(MemberId(2), None));
        assert!(engine.is_contact_blocked(MemberId(2), Some(room())));
        assert!(matches!(
            engine.block_contact(MemberId(9), None),
            Err(CoreError::UnknownMember(MemberId(9)))
        ));
    }

    #[test]
    fn test_reclassification_republishes_record() {
        let mut engine = engine();
        engine.open_context(room()).unwrap();
        engine.transport_mut().members = vec![
            Member::new(MemberId(1), Some(PublicKey([1; 32]))),
            Member::new(MemberId(2), Some(PublicKey([2; 32]))),
        ];
        let (_, mut own) = text(1, 10, "hi");
        own.flags.sent = true;
        engine.deliver(own, at(10)).unwrap();

        assert_eq!(engine.on_membership_changed(room()).unwrap(), ContextType::Contact);
        let hex = room().0.to_hex();
        assert_eq!(engine.records().retracted, vec![format!("chat_{hex}")]);
        assert_eq!(engine.records().published.last(), Some(&format!("contact_{hex}")));
        assert_eq!(
            engine.contact(MemberId(2)).unwrap().direct_context(),
            Some(room())
        );
    }

    #[test]
    fn test_write_discourse_chunks() {
        let mut engine = Engine::new(
            EngineConfig {
                talk_chunk_size: 4,
                ..EngineConfig::new(PublicKey([0xee; 32]))
            },
            Recorder::default(),
            Labels::default(),
        );
        engine.open_context(room()).unwrap();
        let discourse = DiscourseId([9; 32]);
        assert_eq!(engine.write_discourse(room(), discourse, b"abcdefghij").unwrap(), 3);
        assert_eq!(engine.write_discourse(room(), discourse, b"").unwrap(), 0);
        let sizes: Vec<usize> = engine
            .transport()
            .sent
            .iter()
            .map(|body| match body {
                MessageBody::Talk { data, .. } => data.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_leave_context_releases_contacts() {
        let mut engine = engine();
        let (_, d) = text(5, 10, "bye");
        engine.deliver(d, at(10)).unwrap();
        assert!(engine.contact(MemberId(5)).is_some());

        assert!(engine.leave_context(&room()));
        assert!(engine.contact(MemberId(5)).is_none());
        assert!(!engine.leave_context(&room()));
        assert_eq!(engine.records().retracted.len(), 1);
    }
}
