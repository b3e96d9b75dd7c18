//! Per-context message store.
//!
//! Messages are keyed by content id and kept in arrival order. A record is
//! created on first delivery, updated in place by redeliveries carrying the
//! `updated` flag, and turned into a tombstone on deletion. Tombstones are
//! never removed: they stop late duplicates from resurrecting the message.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use parley_shared::{Message, MessageFlags, MessageId, MessageKind, MemberId};

use crate::contacts::Contact;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Waiting for a declared dependency.
    Pending,
    /// Finalized and visible to the rest of the core.
    Delivered,
}

/// A message as held by the store.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: Arc<Contact>,
    pub recipient: Option<MemberId>,
    pub message: Message,
    pub flags: MessageFlags,
    pub state: DeliveryState,
    /// Local time of the first delivery.
    pub received_at: DateTime<Utc>,
    /// Local time of the last applied change.
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.message.header.timestamp
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.deleted
    }

    pub fn is_delivered(&self) -> bool {
        self.state == DeliveryState::Delivered
    }

    pub fn is_sent(&self) -> bool {
        self.flags.sent
    }
}

/// Deletion recorded for a message that has not arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grave {
    /// When the deletion takes effect.
    pub fire_at: DateTime<Utc>,
    /// The deletion message that requested it.
    pub deletion: MessageId,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: HashMap<MessageId, StoredMessage>,
    arrival: Vec<MessageId>,
    /// Ids with a deletion on record that never arrived.
    graves: HashMap<MessageId, Grave>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &MessageId) -> Option<&StoredMessage> {
        self.messages.get(id)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut StoredMessage> {
        self.messages.get_mut(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// Insert a first delivery. Both indices grow or neither does.
    pub fn insert(&mut self, record: StoredMessage) -> Result<()> {
        debug_assert!(!self.messages.contains_key(&record.id));

        self.messages
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("message store"))?;
        self.arrival
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("message store"))?;

        self.arrival.push(record.id);
        self.messages.insert(record.id, record);
        Ok(())
    }

    /// Undo an [`insert`](Self::insert) whose follow-up bookkeeping failed.
    /// Only pending records can be withdrawn.
    pub fn withdraw(&mut self, id: &MessageId) -> bool {
        match self.messages.get(id) {
            Some(record) if record.state == DeliveryState::Pending => {
                self.messages.remove(id);
                if let Some(pos) = self.arrival.iter().rposition(|entry| entry == id) {
                    self.arrival.remove(pos);
                }
                true
            }
            _ => false,
        }
    }

    /// Whether dependents of `id` may be released.
    pub fn is_resolved(&self, id: &MessageId) -> bool {
        if self.graves.contains_key(id) {
            return true;
        }
        self.messages
            .get(id)
            .map(|record| record.is_delivered() || record.is_deleted())
            .unwrap_or(false)
    }

    pub fn mark_delivered(&mut self, id: &MessageId) -> bool {
        match self.messages.get_mut(id) {
            Some(record) if record.state == DeliveryState::Pending => {
                record.state = DeliveryState::Delivered;
                true
            }
            _ => false,
        }
    }

    /// Apply a redelivery that carries changed content.
    pub fn apply_update(
        &mut self,
        id: &MessageId,
        message: Message,
        flags: MessageFlags,
        now: DateTime<Utc>,
    ) -> bool {
        match self.messages.get_mut(id) {
            Some(record) if !record.is_deleted() => {
                record.message = message;
                record.flags.updated = true;
                record.flags.recent |= flags.recent;
                record.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Turn a message into a tombstone. Returns `false` if it already was one
    /// or is unknown.
    pub fn tombstone(&mut self, id: &MessageId, now: DateTime<Utc>) -> bool {
        match self.messages.get_mut(id) {
            Some(record) if !record.is_deleted() => {
                record.flags.deleted = true;
                record.message.body.redact();
                record.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Remember a deletion of `id` although it never arrived. A second
    /// grave for the same id can only pull the fire time forward. Returns
    /// `false` if nothing changed.
    pub fn add_grave(&mut self, id: MessageId, grave: Grave) -> Result<bool> {
        if self.messages.contains_key(&id) {
            return Ok(false);
        }
        match self.graves.get_mut(&id) {
            Some(existing) if existing.fire_at <= grave.fire_at => Ok(false),
            Some(existing) => {
                *existing = grave;
                Ok(true)
            }
            None => {
                self.graves
                    .try_reserve(1)
                    .map_err(|_| CoreError::Exhausted("grave set"))?;
                self.graves.insert(id, grave);
                Ok(true)
            }
        }
    }

    pub fn grave(&self, id: &MessageId) -> Option<Grave> {
        self.graves.get(id).copied()
    }

    pub fn is_grave(&self, id: &MessageId) -> bool {
        self.graves.contains_key(id)
    }

    /// Called once a grave's message has arrived and its deletion was
    /// applied or scheduled.
    pub fn bury(&mut self, id: &MessageId) -> Option<Grave> {
        self.graves.remove(id)
    }

    /// Messages in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.arrival.iter().filter_map(|id| self.messages.get(id))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
