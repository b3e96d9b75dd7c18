//! Contact tracking.
//!
//! A [`Contact`] is shared by every context in which the same transport
//! identity appears. Contexts (and the messages they store) hold strong
//! `Arc<Contact>` references; the [`ContactRegistry`] only holds weak ones,
//! so a contact is destroyed as soon as the last context referencing it
//! drops its handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use parley_shared::{ContextKey, Member, MemberId, PublicKey};

use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct ContactState {
    key: Option<PublicKey>,
    nick: Option<String>,
    /// The private two-party context with this contact, if any.
    direct_context: Option<ContextKey>,
}

/// A remote (or local) member, shared across contexts.
#[derive(Debug)]
pub struct Contact {
    id: MemberId,
    state: Mutex<ContactState>,
}

impl Contact {
    fn new(member: &Member) -> Self {
        Self {
            id: member.id,
            state: Mutex::new(ContactState {
                key: member.key,
                ..ContactState::default()
            }),
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn key(&self) -> Option<PublicKey> {
        self.state().key
    }

    /// Record the public key once the transport reports one. A reported key
    /// never gets erased by a later delivery without one.
    pub fn update_key(&self, key: Option<PublicKey>) {
        if let Some(key) = key {
            self.state().key = Some(key);
        }
    }

    pub fn nick(&self) -> Option<String> {
        self.state().nick.clone()
    }

    pub fn set_nick(&self, nick: Option<String>) {
        self.state().nick = nick;
    }

    pub fn direct_context(&self) -> Option<ContextKey> {
        self.state().direct_context
    }

    /// Link `context` as the private conversation with this contact.
    ///
    /// Returns `false` if a different context is already linked.
    pub fn attach_direct(&self, context: ContextKey) -> bool {
        let mut state = self.state();
        match state.direct_context {
            Some(existing) => existing == context,
            None => {
                state.direct_context = Some(context);
                true
            }
        }
    }

    /// Drop the back-reference to `context`. Returns whether it was linked.
    pub fn detach_direct(&self, context: ContextKey) -> bool {
        let mut state = self.state();
        if state.direct_context == Some(context) {
            state.direct_context = None;
            true
        } else {
            false
        }
    }

    // The state is plain data, a poisoned lock still holds a usable value.
    fn state(&self) -> MutexGuard<'_, ContactState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Maps transport identities to live contacts.
#[derive(Debug, Default)]
pub struct ContactRegistry {
    contacts: HashMap<MemberId, Weak<Contact>>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the contact for `member`, creating it if no context currently
    /// references one.
    pub fn resolve(&mut self, member: &Member) -> Result<Arc<Contact>> {
        if let Some(contact) = self.get(member.id) {
            contact.update_key(member.key);
            return Ok(contact);
        }

        self.contacts
            .try_reserve(1)
            .map_err(|_| CoreError::Exhausted("contact registry"))?;

        let contact = Arc::new(Contact::new(member));
        self.contacts.insert(member.id, Arc::downgrade(&contact));
        debug!(member = %member.id, "Created contact");
        Ok(contact)
    }

    /// Look up a live contact.
    pub fn get(&self, id: MemberId) -> Option<Arc<Contact>> {
        self.contacts.get(&id).and_then(Weak::upgrade)
    }

    /// Forget entries whose contact has been destroyed.
    pub fn prune(&mut self) -> usize {
        let before = self.contacts.len();
        self.contacts.retain(|_, weak| weak.strong_count() > 0);
        let removed = before - self.contacts.len();
        if removed > 0 {
            debug!(removed, "Pruned released contacts");
        }
        removed
    }

    /// Number of contacts still referenced by at least one context.
    pub fn live_count(&self) -> usize {
        self.contacts
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
