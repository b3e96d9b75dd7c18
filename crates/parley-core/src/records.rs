//! Context metadata records.
//!
//! The core does not persist anything itself. It computes the label a
//! context's metadata lives under and the JSON payload stored there, and
//! hands both to a [`RecordStore`] supplied by the embedding application.

use serde::{Deserialize, Serialize};

use parley_shared::constants::{LABEL_PREFIX_CHAT, LABEL_PREFIX_CONTACT, LABEL_PREFIX_GROUP};
use parley_shared::ContextKey;

use crate::classifier::ContextType;
use crate::error::RecordError;

/// External store for context metadata.
pub trait RecordStore: Send {
    /// Store `payload` under `label`, replacing what was there.
    fn publish(&mut self, label: &str, payload: &[u8]) -> Result<(), RecordError>;

    /// Remove whatever is stored under `label`.
    fn retract(&mut self, label: &str) -> Result<(), RecordError>;
}

/// Label of a context's metadata record, `"{type}_{hex}"`.
pub fn context_label(kind: ContextType, key: &ContextKey) -> String {
    let prefix = match kind {
        ContextType::Unknown => LABEL_PREFIX_CHAT,
        ContextType::Contact => LABEL_PREFIX_CONTACT,
        ContextType::Group => LABEL_PREFIX_GROUP,
    };
    format!("{}_{}", prefix, key.0.to_hex())
}

/// Payload stored under [`context_label`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub kind: ContextType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub topic: Option<String>,
}

impl ContextRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(|e| RecordError::Encoding(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        serde_json::from_slice(data).map_err(|e| RecordError::Encoding(e.to_string()))
    }
}

/// Record store that keeps nothing. Useful when metadata is not persisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecordStore;

impl RecordStore for NullRecordStore {
    fn publish(&mut self, _label: &str, _payload: &[u8]) -> Result<(), RecordError> {
        Ok(())
    }

    fn retract(&mut self, _label: &str) -> Result<(), RecordError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::Digest;

    #[test]
    fn test_label_per_type() {
        let key = ContextKey(Digest([0xab; 32]));
        let hex = "ab".repeat(32);
        assert_eq!(context_label(ContextType::Unknown, &key), format!("chat_{hex}"));
        assert_eq!(context_label(ContextType::Contact, &key), format!("contact_{hex}"));
        assert_eq!(context_label(ContextType::Group, &key), format!("group_{hex}"));
    }

    #[test]
    fn test_record_payload() {
        let record = ContextRecord {
            kind: ContextType::Group,
            name: Some("friends".into()),
            topic: None,
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"kind":"group","name":"friends"}"#
        );
        assert_eq!(ContextRecord::from_bytes(&bytes).unwrap(), record);
    }
}
