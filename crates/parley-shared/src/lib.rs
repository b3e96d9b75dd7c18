// Identifiers, the decoded message model and constants shared by every
// parley crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{MalformedReason, ProtocolError};
pub use protocol::{
    Delivery, Message, MessageBody, MessageFlags, MessageHeader, MessageKind, SubscribeFlags,
};
pub use types::{ContextKey, Digest, DiscourseId, Member, MemberId, MessageId, PublicKey, TagKey};
