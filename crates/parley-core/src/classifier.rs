//! Conversation classification.
//!
//! A context starts out `Unknown` and is promoted by membership snapshots:
//! one distinct other public identity makes it a private `Contact`
//! conversation, two or more make it a `Group`. Identities are accumulated
//! across snapshots, so a contact chat whose peer is later replaced still
//! becomes a group. `Group` is terminal.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use parley_shared::{Member, PublicKey};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    #[default]
    Unknown,
    Contact,
    Group,
}

impl ContextType {
    fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Contact => 1,
            Self::Group => 2,
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Contact => f.write_str("contact"),
            Self::Group => f.write_str("group"),
        }
    }
}

/// A promotion produced by [`Classifier::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ContextType,
    pub to: ContextType,
}

/// Type a context should have after seeing `distinct_others` identities.
pub fn classify(current: ContextType, distinct_others: usize) -> ContextType {
    let observed = match distinct_others {
        0 => ContextType::Unknown,
        1 => ContextType::Contact,
        _ => ContextType::Group,
    };
    if observed.rank() > current.rank() {
        observed
    } else {
        current
    }
}

/// Members of `snapshot` that carry a public identity and are not us,
/// deduplicated by identity.
pub fn distinct_others<'a, F>(snapshot: &'a [Member], is_self: F) -> Vec<&'a Member>
where
    F: Fn(&Member) -> bool,
{
    let mut keys = HashSet::new();
    snapshot
        .iter()
        .filter(|member| !is_self(*member))
        .filter(|member| member.key.map(|key| keys.insert(key)).unwrap_or(false))
        .collect()
}

/// Per-context classification state.
#[derive(Debug, Default)]
pub struct Classifier {
    state: ContextType,
    seen: HashSet<PublicKey>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ContextType {
        self.state
    }

    /// Number of distinct other identities seen so far.
    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    /// Feed the non-self identities of one membership snapshot.
    ///
    /// Nothing is recorded if the identity set cannot grow.
    pub fn observe<'a, I>(&mut self, others: I) -> Result<Option<Transition>>
    where
        I: IntoIterator<Item = &'a PublicKey>,
    {
        let fresh: Vec<PublicKey> = others
            .into_iter()
            .filter(|key| !self.seen.contains(*key))
            .copied()
            .collect();

        self.seen
            .try_reserve(fresh.len())
            .map_err(|_| CoreError::Exhausted("classifier identities"))?;
        self.seen.extend(fresh);

        let next = classify(self.state, self.seen.len());
        if next == self.state {
            return Ok(None);
        }

        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        Ok(Some(transition))
    }
}
