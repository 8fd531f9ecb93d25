//! Content messages: chunks of new transactions per session.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::crypto::Signature;
use crate::header::CoValueHeader;
use crate::ids::{CoId, SessionId};
use crate::known_state::{KnownState, KnownStateSessions};
use crate::transaction::Transaction;

/// Delivery priority, derived from the header.
///
/// Serialized as its numeric weight; lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Groups are permission-critical, binary streams can wait.
    pub fn for_header(header: &CoValueHeader) -> Self {
        if header.is_group() {
            Priority::High
        } else if header.meta_type() == Some("binary") {
            Priority::Low
        } else {
            Priority::Medium
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        match priority {
            Priority::High => 0,
            Priority::Medium => 3,
            Priority::Low => 6,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::High),
            3 => Ok(Priority::Medium),
            6 => Ok(Priority::Low),
            other => Err(format!("unknown priority {}", other)),
        }
    }
}

/// New transactions of one session, starting after `after` existing ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

impl SessionNewContent {
    /// Session count once this chunk is applied.
    pub fn end(&self) -> u32 {
        self.after + self.new_transactions.len() as u32
    }

    /// The part of this chunk a receiver that already has `known`
    /// transactions is missing.
    ///
    /// Returns `None` when `after` is beyond `known`: the sender assumed more
    /// than the receiver has and applying would leave a gap.
    pub fn new_transactions_for(&self, known: u32) -> Option<&[Transaction]> {
        if self.after > known {
            return None;
        }
        let skip = (known - self.after) as usize;
        Some(self.new_transactions.get(skip..).unwrap_or(&[]))
    }

    pub fn size(&self) -> usize {
        self.new_transactions.iter().map(Transaction::size).sum()
    }
}

/// A `content` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContentMessage {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub new: IndexMap<SessionId, SessionNewContent>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<KnownStateSessions>,
}

impl NewContentMessage {
    /// An empty message, optionally carrying the header.
    pub fn create(id: CoId, header: &CoValueHeader, include_header: bool) -> Self {
        Self {
            id,
            header: include_header.then(|| header.clone()),
            new: IndexMap::new(),
            priority: Priority::for_header(header),
            expect_content_until: None,
        }
    }

    /// Append one transaction for `session` at index `tx_index`, extending the
    /// session entry or starting it.
    pub fn add_transaction(
        &mut self,
        session: &SessionId,
        tx: Transaction,
        tx_index: u32,
        signature: Signature,
    ) {
        match self.new.get_mut(session) {
            Some(entry) => {
                entry.new_transactions.push(tx);
                entry.last_signature = signature;
            }
            None => {
                self.new.insert(
                    session.clone(),
                    SessionNewContent {
                        after: tx_index,
                        new_transactions: vec![tx],
                        last_signature: signature,
                    },
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    /// Known state a receiver has after applying this message on top of
    /// nothing but what it claims.
    pub fn known_state(&self) -> KnownState {
        let mut state = KnownState::empty(self.id.clone());
        state.header = self.header.is_some();
        for (session, content) in &self.new {
            state.set_session_counter(session.clone(), content.end());
        }
        state
    }

    pub fn size(&self) -> usize {
        self.new.values().map(SessionNewContent::size).sum()
    }

    /// CoValues that must be delivered before this content: the owning group
    /// and, for groups, the parent groups referenced by trusting changes.
    pub fn depended_on(&self, header: &CoValueHeader) -> Vec<CoId> {
        let mut deps = Vec::new();
        if let Some(group) = header.owner_group() {
            deps.push(group.clone());
        }
        if header.is_group() {
            let parents = self
                .new
                .values()
                .flat_map(|content| content.new_transactions.iter())
                .filter_map(|tx| tx.trusting_changes().ok().flatten())
                .flatten()
                .filter_map(|change| {
                    change
                        .get("key")
                        .and_then(|key| key.as_str())
                        .and_then(|key| key.strip_prefix(PARENT_KEY_PREFIX))
                        .and_then(|id| CoId::parse(id).ok())
                });
            for parent in parents {
                if !deps.contains(&parent) {
                    deps.push(parent);
                }
            }
        }
        deps
    }
}

const PARENT_KEY_PREFIX: &str = "parent_";
