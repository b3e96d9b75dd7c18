use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_NAME_LEN, MAX_TALK_CHUNK};
use crate::error::{MalformedReason, ProtocolError};
use crate::types::{ContextKey, Digest, DiscourseId, Member, MemberId, MessageId, PublicKey};

/// A decoded message as it travels through a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender-reported creation time. Advisory only.
    pub timestamp: DateTime<Utc>,
    /// Causal predecessor in the room's message graph.
    pub previous: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Member entered the room
    Join { key: Option<PublicKey> },

    /// Member left the room
    Leave,

    /// Member changed its display name
    Name { name: Option<String> },

    /// Invitation to another room
    Invite { room: ContextKey },

    /// Plain text
    Text { text: String },

    /// Shared file (content addressed)
    File {
        name: String,
        content_hash: Digest,
        size: u64,
    },

    /// Private message the transport could not open for us
    Private { ciphertext: Bytes },

    /// Request to delete `target` after `delay`
    Delete { target: MessageId, delay: Duration },

    /// Merges a second branch of the message graph
    Merge { parent: MessageId },

    /// Request for a missing message
    Request { target: MessageId },

    /// Annotation of `target`; `None` is the block marker
    Tag {
        target: MessageId,
        tag: Option<String>,
    },

    /// Discourse subscription control
    Subscribe {
        discourse: DiscourseId,
        window: Duration,
        flags: SubscribeFlags,
    },

    /// Chunk of discourse data
    Talk { discourse: DiscourseId, data: Bytes },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeFlags {
    pub unsubscribe: bool,
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Join = 0x01,
    Leave = 0x02,
    Name = 0x03,
    Invite = 0x04,
    Text = 0x05,
    File = 0x06,
    Private = 0x07,
    Delete = 0x08,
    Merge = 0x09,
    Request = 0x0a,
    Tag = 0x0b,
    Subscribe = 0x0c,
    Talk = 0x0d,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Name => "name",
            Self::Invite => "invite",
            Self::Text => "text",
            Self::File => "file",
            Self::Private => "private",
            Self::Delete => "delete",
            Self::Merge => "merge",
            Self::Request => "request",
            Self::Tag => "tag",
            Self::Subscribe => "subscribe",
            Self::Talk => "talk",
        }
    }

    /// Kinds that only steer the message graph and are never shown.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Merge | Self::Request)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Join { .. } => MessageKind::Join,
            Self::Leave => MessageKind::Leave,
            Self::Name { .. } => MessageKind::Name,
            Self::Invite { .. } => MessageKind::Invite,
            Self::Text { .. } => MessageKind::Text,
            Self::File { .. } => MessageKind::File,
            Self::Private { .. } => MessageKind::Private,
            Self::Delete { .. } => MessageKind::Delete,
            Self::Merge { .. } => MessageKind::Merge,
            Self::Request { .. } => MessageKind::Request,
            Self::Tag { .. } => MessageKind::Tag,
            Self::Subscribe { .. } => MessageKind::Subscribe,
            Self::Talk { .. } => MessageKind::Talk,
        }
    }

    /// Drop user content while keeping every id the body references.
    ///
    /// Used when a message becomes a tombstone.
    pub fn redact(&mut self) {
        match self {
            Self::Name { name } => *name = None,
            Self::Text { text } => text.clear(),
            Self::File { name, .. } => name.clear(),
            Self::Private { ciphertext } => *ciphertext = Bytes::new(),
            Self::Tag { tag, .. } => *tag = None,
            Self::Talk { data, .. } => *data = Bytes::new(),
            _ => {}
        }
    }
}

impl Message {
    pub fn new(timestamp: DateTime<Utc>, previous: Option<MessageId>, body: MessageBody) -> Self {
        Self {
            header: MessageHeader {
                timestamp,
                previous,
            },
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    /// BLAKE3 of the bincode encoding.
    pub fn content_id(&self) -> Result<MessageId, ProtocolError> {
        Ok(MessageId(Digest::of(&self.to_bytes()?)))
    }

    /// Kind-specific structural check. `id` is the id the transport
    /// delivered the message under.
    pub fn validate(&self, id: &MessageId) -> Result<(), MalformedReason> {
        let kind = self.kind().as_str();
        let check_target = |target: &MessageId| {
            if target.is_zero() {
                Err(MalformedReason::MissingTarget { kind })
            } else {
                Ok(())
            }
        };

        match &self.body {
            MessageBody::Delete { target, .. } | MessageBody::Tag { target, .. } => {
                check_target(target)?;
                if target == id {
                    return Err(MalformedReason::SelfReference { kind });
                }
            }
            MessageBody::Request { target } => check_target(target)?,
            MessageBody::Merge { parent } => check_target(parent)?,
            MessageBody::Name { name: Some(name) } if name.len() > MAX_NAME_LEN => {
                return Err(MalformedReason::TooLong {
                    field: "name",
                    max: MAX_NAME_LEN,
                });
            }
            MessageBody::Subscribe { window, flags, .. } => {
                if window.is_zero() && !flags.unsubscribe {
                    return Err(MalformedReason::EmptyWindow);
                }
            }
            MessageBody::Talk { data, .. } => {
                if data.is_empty() {
                    return Err(MalformedReason::EmptyTalk);
                }
                if data.len() > MAX_TALK_CHUNK {
                    return Err(MalformedReason::TooLong {
                        field: "talk",
                        max: MAX_TALK_CHUNK,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Per-delivery flags set by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// We sent this message ourselves
    #[serde(default)]
    pub sent: bool,
    /// Delivered only to us
    #[serde(default)]
    pub private: bool,
    /// Part of the live feed rather than history
    #[serde(default)]
    pub recent: bool,
    /// Redelivery carrying changed content
    #[serde(default)]
    pub updated: bool,
    /// Transport already considers the message deleted
    #[serde(default)]
    pub deleted: bool,
}

/// One `deliver_message` call of the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub context: ContextKey,
    pub sender: Member,
    #[serde(default)]
    pub recipient: Option<MemberId>,
    pub id: MessageId,
    pub message: Message,
    #[serde(default)]
    pub flags: MessageFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::new(
            at(1_700_000_000),
            Some(MessageId(Digest::of(b"prev"))),
            MessageBody::Text {
                text: "hello".to_string(),
            },
        );

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();
        assert_eq!(msg, restored);
        assert_eq!(msg.content_id().unwrap(), restored.content_id().unwrap());
    }

    #[test]
    fn test_content_id_changes_with_body() {
        let a = Message::new(at(10), None, MessageBody::Text { text: "a".into() });
        let b = Message::new(at(10), None, MessageBody::Text { text: "b".into() });
        assert_ne!(a.content_id().unwrap(), b.content_id().unwrap());
    }

    #[test]
    fn test_tag_without_target_is_malformed() {
        let msg = Message::new(
            at(10),
            None,
            MessageBody::Tag {
                target: MessageId(Digest::ZERO),
                tag: Some("x".into()),
            },
        );
        let id = msg.content_id().unwrap();
        assert_eq!(
            msg.validate(&id),
            Err(MalformedReason::MissingTarget { kind: "tag" })
        );
    }

    #[test]
    fn test_delete_of_itself_is_malformed() {
        let id = MessageId(Digest::of(b"self"));
        let msg = Message::new(
            at(10),
            None,
            MessageBody::Delete {
                target: id,
                delay: Duration::ZERO,
            },
        );
        assert_eq!(
            msg.validate(&id),
            Err(MalformedReason::SelfReference { kind: "delete" })
        );
    }

    #[test]
    fn test_subscribe_window_rules() {
        let discourse = DiscourseId([7u8; 32]);
        let id = MessageId(Digest::of(b"sub"));
        let empty = Message::new(
            at(10),
            None,
            MessageBody::Subscribe {
                discourse,
                window: Duration::ZERO,
                flags: SubscribeFlags::default(),
            },
        );
        assert_eq!(empty.validate(&id), Err(MalformedReason::EmptyWindow));

        let leave = Message::new(
            at(10),
            None,
            MessageBody::Subscribe {
                discourse,
                window: Duration::ZERO,
                flags: SubscribeFlags {
                    unsubscribe: true,
                    keep_alive: false,
                },
            },
        );
        assert!(leave.validate(&id).is_ok());
    }

    #[test]
    fn test_redact_keeps_references() {
        let target = MessageId(Digest::of(b"t"));
        let mut body = MessageBody::Tag {
            target,
            tag: Some("secret".into()),
        };
        body.redact();
        assert_eq!(body, MessageBody::Tag { target, tag: None });
    }
}
