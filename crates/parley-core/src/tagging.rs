//! Tag index.
//!
//! Tags are messages that annotate a target message (or a contact, through
//! the contact's join message). The index maps target -> tag value hash ->
//! tag messages in arrival order. The null tag value is the reserved block
//! marker.
//!
//! Only tags we sent count as active, and per (target, value) only the most
//! recent one does. The index is written solely by the engine while
//! finalizing tag messages and while tombstoning them or their target;
//! retracting a tag goes through a deletion message.

use std::collections::HashMap;

use parley_shared::{MessageId, TagKey};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagEntry {
    pub message: MessageId,
    pub sent_by_self: bool,
}

#[derive(Debug, Default)]
pub struct TaggingIndex {
    targets: HashMap<MessageId, HashMap<TagKey, Vec<TagEntry>>>,
}

impl TaggingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a finalized tag message. Re-adding the same message is a no-op.
    pub fn add(&mut self, target: MessageId, key: TagKey, entry: TagEntry) -> Result<()> {
        let exhausted = |_| CoreError::Exhausted("tag index");

        match self.targets.get_mut(&target) {
            Some(values) => match values.get_mut(&key) {
                Some(entries) => {
                    if entries.iter().any(|e| e.message == entry.message) {
                        return Ok(());
                    }
                    entries.try_reserve(1).map_err(exhausted)?;
                    entries.push(entry);
                }
                None => {
                    values.try_reserve(1).map_err(exhausted)?;
                    let mut entries = Vec::new();
                    entries.try_reserve(1).map_err(exhausted)?;
                    entries.push(entry);
                    values.insert(key, entries);
                }
            },
            None => {
                self.targets.try_reserve(1).map_err(exhausted)?;
                let mut values = HashMap::new();
                values.try_reserve(1).map_err(exhausted)?;
                let mut entries = Vec::new();
                entries.try_reserve(1).map_err(exhausted)?;
                entries.push(entry);
                values.insert(key, entries);
                self.targets.insert(target, values);
            }
        }
        Ok(())
    }

    /// Drop a tag message from the index.
    pub fn remove(&mut self, target: &MessageId, key: &TagKey, message: &MessageId) -> bool {
        let Some(values) = self.targets.get_mut(target) else {
            return false;
        };
        let Some(entries) = values.get_mut(key) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.message != *message);
        let removed = entries.len() != before;

        if entries.is_empty() {
            values.remove(key);
        }
        if values.is_empty() {
            self.targets.remove(target);
        }
        removed
    }

    /// Forget every tag on `target`; used once the target is tombstoned.
    /// Returns the number of tag messages dropped.
    pub fn remove_target(&mut self, target: &MessageId) -> usize {
        self.targets
            .remove(target)
            .map(|values| values.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// The tag message currently in effect for (target, key).
    pub fn active(&self, target: &MessageId, key: &TagKey) -> Option<MessageId> {
        self.targets
            .get(target)?
            .get(key)?
            .iter()
            .rev()
            .find(|entry| entry.sent_by_self)
            .map(|entry| entry.message)
    }

    /// With `None` this answers "is the target blocked".
    pub fn is_tagged(&self, target: &MessageId, tag: Option<&str>) -> bool {
        self.active(target, &TagKey::of(tag)).is_some()
    }

    /// All indexed tag messages for `target`, any author.
    pub fn entries(&self, target: &MessageId) -> Vec<TagEntry> {
        self.targets
            .get(target)
            .map(|values| values.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Active tag messages on `target`, one per tag value.
    pub fn active_entries(&self, target: &MessageId) -> Vec<MessageId> {
        let Some(values) = self.targets.get(target) else {
            return Vec::new();
        };
        values
            .keys()
            .filter_map(|key| self.active(target, key))
            .collect()
    }

    /// Number of targets carrying at least one tag.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}
