//! The transport seam.
//!
//! The room transport (membership protocol, encryption, wire encoding) lives
//! outside the core. The core only needs to ask for missing messages, list
//! the members of a room and hand over messages it wants sent.

use parley_shared::{ContextKey, Member, MessageBody, MessageId};

use crate::error::TransportError;

pub trait Transport: Send {
    /// Ask the room for message `id`. Fire-and-forget; asking twice is fine.
    fn request_message(&mut self, context: &ContextKey, id: &MessageId)
        -> Result<(), TransportError>;

    /// Current members of the room, ourselves included.
    fn enumerate_members(&mut self, context: &ContextKey) -> Result<Vec<Member>, TransportError>;

    /// Send a message we authored. The transport fills in header fields and
    /// later delivers it back with the `sent` flag.
    fn send_message(&mut self, context: &ContextKey, body: MessageBody)
        -> Result<(), TransportError>;
}
