use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedReason),
}

/// Why a message failed its kind-specific structural check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    #[error("{kind} message has no target")]
    MissingTarget { kind: &'static str },

    #[error("{kind} message targets itself")]
    SelfReference { kind: &'static str },

    #[error("subscription with an empty window")]
    EmptyWindow,

    #[error("talk message without payload")]
    EmptyTalk,

    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },
}
