//! Known state: how much of a CoValue a party has observed.
//!
//! A known state is a lower bound. Counters only ever grow for a given
//! origin, which is what makes it safe to diff against.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{CoId, SessionId};

/// Transaction count per session.
pub type KnownStateSessions = BTreeMap<SessionId, u32>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    pub sessions: KnownStateSessions,
}

impl KnownState {
    /// Nothing known: no header, no sessions.
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    pub fn session_count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Raise a session counter. Lower values are ignored.
    pub fn set_session_counter(&mut self, session: SessionId, count: u32) {
        let entry = self.sessions.entry(session).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }

    /// Merge another known state into this one, keeping the max per session.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        combine_sessions(&mut self.sessions, &other.sessions);
    }

    /// True when everything in `self` is also covered by `other`.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        if self.header && !other.header {
            return false;
        }
        self.sessions
            .iter()
            .all(|(session, count)| other.session_count(session) >= *count)
    }

    /// True when there is anything at all to know.
    pub fn has_content(&self) -> bool {
        self.header || self.sessions.values().any(|c| *c > 0)
    }
}

/// Max-merge `other` into `target`.
pub fn combine_sessions(target: &mut KnownStateSessions, other: &KnownStateSessions) {
    for (session, count) in other {
        let entry = target.entry(session.clone()).or_insert(0);
        if *count > *entry {
            *entry = *count;
        }
    }
}

/// Sessions of `mine` that are ahead of `theirs`, with `mine`'s counts.
pub fn sessions_to_send(mine: &KnownStateSessions, theirs: &KnownStateSessions) -> KnownStateSessions {
    mine.iter()
        .filter(|(session, count)| theirs.get(*session).copied().unwrap_or(0) < **count)
        .map(|(session, count)| (session.clone(), *count))
        .collect()
}
