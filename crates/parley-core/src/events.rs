use bytes::Bytes;
use serde::Serialize;

use parley_shared::{ContextKey, DiscourseId, MemberId, MessageId, MessageKind};

use crate::classifier::ContextType;

/// Everything the core reports to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A message became visible, changed, or was deleted. Fires once per
    /// logical change.
    ChatMessage {
        context: ContextKey,
        message: MessageId,
        kind: MessageKind,
        change: MessageChange,
    },

    /// Data arrived on a discourse.
    DiscourseData {
        context: ContextKey,
        discourse: DiscourseId,
        sender: MemberId,
        data: Bytes,
    },

    /// A member's subscription to a discourse started or ended.
    DiscourseMembership {
        context: ContextKey,
        discourse: DiscourseId,
        member: MemberId,
        subscribed: bool,
    },

    /// A context was promoted.
    ContextClassified {
        context: ContextKey,
        from: ContextType,
        to: ContextType,
    },

    /// A collaborator failed; the core carried on.
    Warning { context: Option<ContextKey>, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChange {
    Received,
    Updated,
    Deleted,
}
