//! Per-conversation state.
//!
//! A [`Context`] owns everything the engine tracks for one conversation:
//! the message store with its dependency table, the tagging index, armed
//! deletions, discourses, the invitation and file indices, and strong
//! references to the contacts seen in it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use parley_shared::{ContextKey, Digest, MemberId, MessageId};

use crate::classifier::{Classifier, ContextType};
use crate::contacts::Contact;
use crate::deletion::DeletionScheduler;
use crate::discourse::DiscourseManager;
use crate::error::{CoreError, Result};
use crate::records::{context_label, ContextRecord};
use crate::resolver::DependencyTable;
use crate::store::MessageStore;
use crate::tagging::TaggingIndex;
use crate::timer::TimerQueue;

/// A pending invitation to another room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Invitation {
    pub room: ContextKey,
    pub sender: MemberId,
}

/// A file shared in the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub content_hash: Digest,
    pub size: u64,
    pub sender: MemberId,
}

#[derive(Debug)]
pub struct Context {
    key: ContextKey,
    pub(crate) classifier: Classifier,
    self_member: Option<MemberId>,
    members: HashMap<MemberId, Arc<Contact>>,
    /// Latest join message per member; target of contact-level tags.
    joins: HashMap<MemberId, MessageId>,
    pub(crate) store: MessageStore,
    pub(crate) dependencies: DependencyTable,
    pub(crate) tagging: TaggingIndex,
    pub(crate) deletions: DeletionScheduler,
    pub(crate) discourses: DiscourseManager,
    invitations: HashMap<MessageId, Invitation>,
    files: HashMap<MessageId, FileEntry>,
    name: Option<String>,
    topic: Option<String>,
}

impl Context {
    pub fn new(key: ContextKey) -> Self {
        Self {
            key,
            classifier: Classifier::new(),
            self_member: None,
            members: HashMap::new(),
            joins: HashMap::new(),
            store: MessageStore::new(),
            dependencies: DependencyTable::new(),
            tagging: TaggingIndex::new(),
            deletions: DeletionScheduler::new(),
            discourses: DiscourseManager::new(),
            invitations: HashMap::new(),
            files: HashMap::new(),
            name: None,
            topic: None,
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn kind(&self) -> ContextType {
        self.classifier.state()
    }

    pub fn self_member(&self) -> Option<MemberId> {
        self.self_member
    }

    pub(crate) fn set_self_member(&mut self, member: MemberId) {
        self.self_member = Some(member);
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn tagging(&self) -> &TaggingIndex {
        &self.tagging
    }

    pub fn discourses(&self) -> &DiscourseManager {
        &self.discourses
    }

    pub fn deletions(&self) -> &DeletionScheduler {
        &self.deletions
    }

    // -----------------------------------------------------------------------
    // Members
    // -----------------------------------------------------------------------

    /// Keep a strong reference to `contact` for as long as this context
    /// lives or until the member leaves.
    pub(crate) fn add_member(&mut self, contact: Arc<Contact>) -> Result<()> {
        if self.members.contains_key(&contact.id()) {
            return Ok(());
        }
        self.members
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("context members"))?;
        self.members.insert(contact.id(), contact);
        Ok(())
    }

    pub(crate) fn remove_member(&mut self, member: MemberId) -> Option<Arc<Contact>> {
        self.joins.remove(&member);
        self.members.remove(&member)
    }

    pub fn member(&self, member: MemberId) -> Option<&Arc<Contact>> {
        self.members.get(&member)
    }

    pub fn references(&self, member: MemberId) -> bool {
        self.members.contains_key(&member)
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<Contact>> {
        self.members.values()
    }

    pub(crate) fn record_join(&mut self, member: MemberId, message: MessageId) -> Result<()> {
        if !self.joins.contains_key(&member) {
            self.joins
                .try_reserve(1)
                .map_err(|_| CoreError::Exhausted("join index"))?;
        }
        self.joins.insert(member, message);
        Ok(())
    }

    pub fn join_of(&self, member: MemberId) -> Option<MessageId> {
        self.joins.get(&member).copied()
    }

    fn forget_join(&mut self, message: &MessageId) {
        self.joins.retain(|_, join| join != message);
    }

    // -----------------------------------------------------------------------
    // Invitation and file indices
    // -----------------------------------------------------------------------

    pub(crate) fn index_invitation(&mut self, message: MessageId, invitation: Invitation) -> Result<()> {
        self.invitations
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("invitation index"))?;
        self.invitations.insert(message, invitation);
        Ok(())
    }

    pub(crate) fn index_file(&mut self, message: MessageId, file: FileEntry) -> Result<()> {
        self.files
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("file index"))?;
        self.files.insert(message, file);
        Ok(())
    }

    pub fn invitation(&self, message: &MessageId) -> Option<Invitation> {
        self.invitations.get(message).copied()
    }

    pub fn invitations(&self) -> impl Iterator<Item = (&MessageId, &Invitation)> {
        self.invitations.iter()
    }

    pub fn file(&self, message: &MessageId) -> Option<&FileEntry> {
        self.files.get(message)
    }

    pub fn files(&self) -> impl Iterator<Item = (&MessageId, &FileEntry)> {
        self.files.iter()
    }

    /// Drop every secondary index entry derived from `message`.
    pub(crate) fn unindex(&mut self, message: &MessageId) {
        self.invitations.remove(message);
        self.files.remove(message);
        self.forget_join(message);
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub(crate) fn set_topic(&mut self, topic: Option<String>) {
        self.topic = topic;
    }

    /// Label this context's metadata is published under.
    pub fn label(&self) -> String {
        context_label(self.kind(), &self.key)
    }

    pub fn record(&self) -> ContextRecord {
        ContextRecord {
            kind: self.kind(),
            name: self.name.clone(),
            topic: self.topic.clone(),
        }
    }

    /// Cancel every timer this context owns and release its contacts.
    pub(crate) fn teardown<E>(&mut self, timers: &mut TimerQueue<E>) -> Vec<Arc<Contact>> {
        self.deletions.clear(timers);
        self.discourses.clear(timers);
        self.joins.clear();
        self.members.drain().map(|(_, contact)| contact).collect()
    }
}
