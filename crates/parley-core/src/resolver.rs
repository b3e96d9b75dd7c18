//! Dependency resolution.
//!
//! Each message kind declares at most one blocking dependency: deletions and
//! tags depend on their target, merges on their second parent. The causal
//! predecessor is never blocking; if it is missing the engine only asks the
//! transport for it.
//!
//! Messages whose dependency is not yet resolved wait in a per-id bucket.
//! When the id resolves, the whole bucket is released in enqueue order and
//! the bucket is dropped, so waiters added later start a fresh one.

use std::collections::HashMap;

use parley_shared::{Message, MessageBody, MessageId};

use crate::error::{CoreError, Result};

/// The id `message` must wait for before it may be finalized.
pub fn declared_dependency(message: &Message) -> Option<MessageId> {
    match &message.body {
        MessageBody::Delete { target, .. } => Some(*target),
        MessageBody::Tag { target, .. } => Some(*target),
        MessageBody::Merge { parent } => Some(*parent),
        _ => None,
    }
}

/// Best-effort predecessor used for request chaining.
pub fn causal_predecessor(message: &Message) -> Option<MessageId> {
    message.header.previous.filter(|id| !id.is_zero())
}

/// Pending table: dependency id -> waiters in arrival order.
#[derive(Debug, Default)]
pub struct DependencyTable {
    waiting: HashMap<MessageId, Vec<MessageId>>,
}

impl DependencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `waiter` until `dependency` resolves.
    pub fn enqueue(&mut self, dependency: MessageId, waiter: MessageId) -> Result<()> {
        if let Some(bucket) = self.waiting.get_mut(&dependency) {
            bucket
                .try_reserve(1)
                .map_err(|_| CoreError::Exhausted("dependency bucket"))?;
            bucket.push(waiter);
            return Ok(());
        }

        self.waiting
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("dependency table"))?;
        let mut bucket = Vec::new();
        bucket
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("dependency bucket"))?;
        bucket.push(waiter);
        self.waiting.insert(dependency, bucket);
        Ok(())
    }

    /// Remove and return every waiter of `dependency`, oldest first.
    pub fn release(&mut self, dependency: &MessageId) -> Vec<MessageId> {
        self.waiting.remove(dependency).unwrap_or_default()
    }

    pub fn is_waiting_on(&self, dependency: &MessageId) -> bool {
        self.waiting.contains_key(dependency)
    }

    /// Whether `waiter` sits in any bucket.
    pub fn is_pending(&self, waiter: &MessageId) -> bool {
        self.waiting.values().any(|bucket| bucket.contains(waiter))
    }

    /// Dependency id -> number of waiters, for diagnostics.
    pub fn snapshot(&self) -> Vec<(MessageId, usize)> {
        let mut entries: Vec<_> = self
            .waiting
            .iter()
            .map(|(id, bucket)| (*id, bucket.len()))
            .collect();
        entries.sort();
        entries
    }

    /// Total number of parked messages.
    pub fn waiter_count(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use parley_shared::Digest;
    use std::time::Duration;

    fn id(name: &str) -> MessageId {
        MessageId(Digest::of(name.as_bytes()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_declared_dependencies() {
        let target = id("t");
        let delete = Message::new(
            at(1),
            Some(id("p")),
            MessageBody::Delete {
                target,
                delay: Duration::ZERO,
            },
        );
        let tag = Message::new(at(1), None, MessageBody::Tag { target, tag: None });
        let merge = Message::new(at(1), None, MessageBody::Merge { parent: target });
        let text = Message::new(at(1), Some(id("p")), MessageBody::Text { text: "x".into() });

        assert_eq!(declared_dependency(&delete), Some(target));
        assert_eq!(declared_dependency(&tag), Some(target));
        assert_eq!(declared_dependency(&merge), Some(target));
        assert_eq!(declared_dependency(&text), None);
        assert_eq!(causal_predecessor(&text), Some(id("p")));
    }

    #[test]
    fn test_zero_predecessor_is_ignored() {
        let text = Message::new(
            at(1),
            Some(MessageId(Digest::ZERO)),
            MessageBody::Text { text: "x".into() },
        );
        assert_eq!(causal_predecessor(&text), None);
    }

    #[test]
    fn test_release_is_fifo_and_clears_bucket() {
        let mut table = DependencyTable::new();
        let dep = id("dep");
        table.enqueue(dep, id("w1")).unwrap();
        table.enqueue(dep, id("w2")).unwrap();
        table.enqueue(dep, id("w3")).unwrap();
        assert_eq!(table.waiter_count(), 3);
        assert!(table.is_pending(&id("w2")));

        assert_eq!(table.release(&dep), vec![id("w1"), id("w2"), id("w3")]);
        assert!(!table.is_waiting_on(&dep));
        assert!(table.release(&dep).is_empty());

        // A waiter added after the flush starts a new bucket
        table.enqueue(dep, id("w4")).unwrap();
        assert_eq!(table.release(&dep), vec![id("w4")]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_counts() {
        let mut table = DependencyTable::new();
        table.enqueue(id("a"), id("1")).unwrap();
        table.enqueue(id("a"), id("2")).unwrap();
        table.enqueue(id("b"), id("3")).unwrap();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&(id("a"), 2)));
        assert!(snapshot.contains(&(id("b"), 1)));
    }
}
