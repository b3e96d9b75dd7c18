use parley_shared::{ContextKey, MalformedReason, MemberId};
use thiserror::Error;

/// Errors produced by the reconciliation core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The message failed its kind-specific structural check and was dropped.
    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedReason),

    /// An index could not grow; the operation was rolled back.
    #[error("Out of memory while growing {0}")]
    Exhausted(&'static str),

    /// No context exists for the given key.
    #[error("Unknown context: {0}")]
    UnknownContext(ContextKey),

    /// The member is not part of the given context.
    #[error("{member} is not a member of context {context}")]
    NotInContext {
        member: MemberId,
        context: ContextKey,
    },

    /// No context holds a join message for this member.
    #[error("{0} has not joined any known context")]
    UnknownMember(MemberId),

    /// Nothing to retract for the given target/tag pair.
    #[error("No active tag to retract")]
    NothingToUntag,

    /// The transport rejected a request.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The record store rejected a write.
    #[error("Record store error: {0}")]
    Records(#[from] RecordError),

    /// A required setting is missing or unparsable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Room not available: {0}")]
    RoomUnavailable(ContextKey),

    #[error("Transport closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

/// Failure reported by the record store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record store unavailable")]
    Unavailable,

    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Record encoding failed: {0}")]
    Encoding(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
