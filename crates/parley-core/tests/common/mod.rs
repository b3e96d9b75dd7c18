//! Shared fixtures: an in-memory room transport and record store.

#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use parley_core::{
    Engine, EngineConfig, MessageChange, Notification, RecordError, RecordStore, Transport,
    TransportError,
};
use parley_shared::{
    ContextKey, Delivery, Member, MemberId, Message, MessageBody, MessageFlags, MessageId,
    PublicKey,
};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockRoom {
    pub requested: Vec<MessageId>,
    pub sent: Vec<MessageBody>,
    pub members: Vec<Member>,
}

impl Transport for MockRoom {
    fn request_message(&mut self, _context: &ContextKey, id: &MessageId) -> Result<(), TransportError> {
        self.requested.push(*id);
        Ok(())
    }

    fn enumerate_members(&mut self, _context: &ContextKey) -> Result<Vec<Member>, TransportError> {
        Ok(self.members.clone())
    }

    fn send_message(&mut self, _context: &ContextKey, body: MessageBody) -> Result<(), TransportError> {
        self.sent.push(body);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecords {
    pub records: BTreeMap<String, Vec<u8>>,
}

impl RecordStore for MemoryRecords {
    fn publish(&mut self, label: &str, payload: &[u8]) -> Result<(), RecordError> {
        self.records.insert(label.to_string(), payload.to_vec());
        Ok(())
    }

    fn retract(&mut self, label: &str) -> Result<(), RecordError> {
        self.records.remove(label);
        Ok(())
    }
}

pub type TestEngine = Engine<MockRoom, MemoryRecords>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn room() -> ContextKey {
    ContextKey::from_room_key(b"integration-room")
}

pub fn key_of(member: u64) -> PublicKey {
    PublicKey([member as u8; 32])
}

pub fn member(id: u64) -> Member {
    Member::new(MemberId(id), Some(key_of(id)))
}

/// Engine whose own identity is member 1.
pub fn engine() -> TestEngine {
    engine_as(1)
}

/// Engine whose own identity is member `me`.
pub fn engine_as(me: u64) -> TestEngine {
    Engine::new(
        EngineConfig::new(key_of(me)),
        MockRoom::default(),
        MemoryRecords::default(),
    )
}

pub fn delivery(context: ContextKey, sender: u64, ts: i64, body: MessageBody) -> Delivery {
    let message = Message::new(at(ts), None, body);
    let id = message.content_id().unwrap();
    Delivery {
        context,
        sender: member(sender),
        recipient: None,
        id,
        message,
        flags: MessageFlags::default(),
    }
}

pub fn text(sender: u64, ts: i64, body: &str) -> Delivery {
    delivery(room(), sender, ts, MessageBody::Text { text: body.into() })
}

/// Chat message notifications as (id, change) pairs.
pub fn chat_events(notes: &[Notification]) -> Vec<(MessageId, MessageChange)> {
    notes
        .iter()
        .filter_map(|note| match note {
            Notification::ChatMessage {
                message, change, ..
            } => Some((*message, *change)),
            _ => None,
        })
        .collect()
}
