//! Group state replay.
//!
//! A group is a map CoValue whose entries assign roles to members, record the
//! current read key, hold read keys sealed for members and reference parent
//! groups. The state is computed by replaying the group's transactions in
//! `(madeAt, txId)` order and accepting only the ones the author was allowed
//! to make at that point.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub use covalue_core::MapOp;
use covalue_core::{unpack_map_changes, AgentId, CoId, KeyId, TransactionId};

use crate::role::{Role, EVERYONE};

const READ_KEY: &str = "readKey";
const PARENT_PREFIX: &str = "parent_";
const CHILD_PREFIX: &str = "child_";
const FOR_SEPARATOR: &str = "_for_";

/// A verified transaction, as seen by permission evaluation.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub id: TransactionId,
    pub author: Option<AgentId>,
    pub made_at: u64,
    /// Parsed changes; `None` for private transactions nobody decrypted.
    pub changes: Option<Vec<Value>>,
    pub private: bool,
    /// Parsed metadata of trusting transactions.
    pub meta: Option<Value>,
}

/// The latest accepted value of a group entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub value: Value,
    pub author: AgentId,
    pub made_at: u64,
    pub tx_id: TransactionId,
}

/// How a child group inherits from a parent: the parent's own roles, or a
/// fixed role for every parent member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRole {
    Extend,
    Fixed(Role),
}

impl ParentRole {
    fn parse(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "extend" => Some(ParentRole::Extend),
            other => other.parse().ok().map(ParentRole::Fixed),
        }
    }
}

#[derive(Debug, Clone)]
struct RoleChange {
    made_at: u64,
    member: String,
    role: Role,
}

/// Access to parent groups while replaying a child.
pub trait GroupLookup {
    /// The state of `id`, or `None` if it is unknown or would form a cycle.
    fn group_state(&self, id: &CoId) -> Option<GroupState>;
}

/// No parent groups available.
pub struct NoGroups;

impl GroupLookup for NoGroups {
    fn group_state(&self, _id: &CoId) -> Option<GroupState> {
        None
    }
}

/// Replayed state of a group.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: CoId,
    roles: BTreeMap<String, Role>,
    history: Vec<RoleChange>,
    entries: BTreeMap<String, GroupEntry>,
    parents: BTreeMap<CoId, ParentRole>,
    valid: BTreeSet<TransactionId>,
}

impl GroupState {
    /// Replay `transactions` of the group `id` bootstrapped by `initial_admin`.
    pub fn replay(
        id: CoId,
        initial_admin: &AgentId,
        transactions: &[TxRecord],
        lookup: &dyn GroupLookup,
    ) -> Self {
        let mut state = GroupState {
            id,
            roles: BTreeMap::new(),
            history: Vec::new(),
            entries: BTreeMap::new(),
            parents: BTreeMap::new(),
            valid: BTreeSet::new(),
        };

        let mut ordered: Vec<&TxRecord> = transactions.iter().collect();
        ordered.sort_by(|a, b| (a.made_at, &a.id).cmp(&(b.made_at, &b.id)));

        for tx in ordered {
            if state.apply(tx, initial_admin, lookup) {
                state.valid.insert(tx.id.clone());
            }
        }
        state
    }

    fn apply(&mut self, tx: &TxRecord, initial_admin: &AgentId, lookup: &dyn GroupLookup) -> bool {
        let Some(author) = &tx.author else {
            debug!(group = %self.id, tx = %tx.id, "Group transaction without an author");
            return false;
        };
        let author_role = self.roles.get(author.as_str()).copied();

        if tx.private {
            // Only admins may write content nobody else can check
            return author_role.map_or(false, Role::can_admin);
        }

        let Some(changes) = &tx.changes else {
            return false;
        };
        let op = match unpack_map_changes(changes) {
            Ok(mut ops) if ops.len() == 1 => ops.remove(0),
            Ok(_) => {
                debug!(group = %self.id, tx = %tx.id, "Group transaction must have exactly one change");
                return false;
            }
            Err(_) => {
                debug!(group = %self.id, tx = %tx.id, "Invalid group change");
                return false;
            }
        };
        let MapOp::Set { key, value } = op else {
            debug!(group = %self.id, tx = %tx.id, "Group transaction must set a value");
            return false;
        };

        let is_admin = author_role.map_or(false, Role::can_admin);

        let accepted = if key == READ_KEY {
            is_admin
        } else if key.contains(FOR_SEPARATOR) {
            // Key revelations: admins for anyone, members for themselves
            let for_self = key.ends_with(&format!("{}{}", FOR_SEPARATOR, author))
                && author_role.map_or(false, |role| role != Role::Revoked);
            is_admin || for_self
        } else if let Some(parent) = key.strip_prefix(PARENT_PREFIX) {
            is_admin && self.extend_parent(parent, &value, tx.made_at, lookup)
        } else if key.starts_with(CHILD_PREFIX) {
            true
        } else {
            self.apply_role_change(&key, &value, author, author_role, initial_admin, tx.made_at)
        };

        if accepted {
            self.entries.insert(
                key,
                GroupEntry {
                    value,
                    author: author.clone(),
                    made_at: tx.made_at,
                    tx_id: tx.id.clone(),
                },
            );
        } else {
            debug!(group = %self.id, tx = %tx.id, author = %author, "Rejected group transaction");
        }
        accepted
    }

    fn apply_role_change(
        &mut self,
        member: &str,
        value: &Value,
        author: &AgentId,
        author_role: Option<Role>,
        initial_admin: &AgentId,
        made_at: u64,
    ) -> bool {
        let Some(role) = value.as_str().and_then(|s| s.parse::<Role>().ok()) else {
            return false;
        };
        if member == EVERYONE && !role.is_assignable_to_everyone() {
            return false;
        }

        let self_bootstrap = author_role.is_none()
            && author == initial_admin
            && member == author.as_str()
            && role == Role::Admin;
        let self_revoke = member == author.as_str() && role == Role::Revoked;

        let allowed = if self_bootstrap || self_revoke {
            true
        } else if author_role == Some(Role::Admin) {
            let demotes_other_admin = self.roles.get(member) == Some(&Role::Admin)
                && role != Role::Admin
                && member != author.as_str();
            !demotes_other_admin
        } else {
            false
        };

        if allowed {
            self.set_role(member, role, made_at);
        }
        allowed
    }

    fn extend_parent(&mut self, parent: &str, value: &Value, made_at: u64, lookup: &dyn GroupLookup) -> bool {
        let Ok(parent_id) = CoId::parse(parent) else {
            return false;
        };
        let Some(mapping) = ParentRole::parse(value) else {
            return false;
        };
        if parent_id == self.id {
            return false;
        }

        if let Some(parent_state) = lookup.group_state(&parent_id) {
            if parent_state.parents.contains_key(&self.id) {
                debug!(group = %self.id, parent = %parent_id, "Circular extend, dropping");
                return false;
            }
            for (member, parent_role) in parent_state.effective_roles() {
                if !parent_role.is_inheritable() {
                    continue;
                }
                let current = self.roles.get(&member).copied();
                let inherited = match mapping {
                    ParentRole::Fixed(role) => role,
                    ParentRole::Extend => parent_role,
                };
                if inherited.is_higher_than(current) {
                    self.set_role(&member, inherited, made_at);
                }
            }
        }
        self.parents.insert(parent_id, mapping);
        true
    }

    fn set_role(&mut self, member: &str, role: Role, made_at: u64) {
        self.roles.insert(member.to_string(), role);
        self.history.push(RoleChange {
            made_at,
            member: member.to_string(),
            role,
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> &CoId {
        &self.id
    }

    /// Current role of `agent`, taking `everyone` into account.
    pub fn role_of(&self, agent: &AgentId) -> Option<Role> {
        let direct = self.roles.get(agent.as_str()).copied();
        if direct == Some(Role::Revoked) {
            return direct;
        }
        Role::max(direct, self.roles.get(EVERYONE).copied())
    }

    /// Role of `agent` as of time `at` (inclusive).
    pub fn role_at(&self, agent: &AgentId, at: u64) -> Option<Role> {
        let mut direct = None;
        let mut everyone = None;
        for change in self.history.iter().filter(|c| c.made_at <= at) {
            if change.member == agent.as_str() {
                direct = Some(change.role);
            } else if change.member == EVERYONE {
                everyone = Some(change.role);
            }
        }
        if direct == Some(Role::Revoked) {
            return direct;
        }
        Role::max(direct, everyone)
    }

    /// Members and their current roles, inherited ones included.
    pub fn effective_roles(&self) -> impl Iterator<Item = (String, Role)> + '_ {
        self.roles.iter().map(|(m, r)| (m.clone(), *r))
    }

    /// True if the transaction was accepted during replay.
    pub fn is_valid(&self, tx_id: &TransactionId) -> bool {
        self.valid.contains(tx_id)
    }

    pub fn valid_transactions(&self) -> &BTreeSet<TransactionId> {
        &self.valid
    }

    pub fn entry(&self, key: &str) -> Option<&GroupEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &GroupEntry)> {
        self.entries.iter()
    }

    /// The current read key.
    pub fn read_key_id(&self) -> Option<KeyId> {
        self.entries
            .get(READ_KEY)
            .and_then(|e| e.value.as_str())
            .and_then(|s| KeyId::parse(s).ok())
    }

    /// Groups this group extends.
    pub fn parent_groups(&self) -> impl Iterator<Item = &CoId> {
        self.parents.keys()
    }

    pub(crate) fn revelation_key(key_id: &KeyId, target: &str) -> String {
        format!("{}{}{}", key_id, FOR_SEPARATOR, target)
    }
}

/// Parent group IDs referenced by a list of group transactions, valid or not.
///
/// Used to discover dependencies before the group itself can be replayed.
pub fn referenced_parent_groups(transactions: &[TxRecord]) -> BTreeSet<CoId> {
    transactions
        .iter()
        .filter_map(|tx| tx.changes.as_ref())
        .flatten()
        .filter_map(|change| change.get("key").and_then(Value::as_str))
        .filter_map(|key| key.strip_prefix(PARENT_PREFIX))
        .filter_map(|id| CoId::parse(id).ok())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use covalue_core::SessionId;
    use serde_json::json;

    pub(crate) fn agent(n: u8) -> AgentId {
        AgentId::parse(format!("sealer_z{n:02}/signer_z{n:02}")).unwrap()
    }

    pub(crate) fn record(author: &AgentId, index: u32, made_at: u64, op: MapOp) -> TxRecord {
        TxRecord {
            id: TransactionId::new(SessionId::new_session(author.as_str(), "s"), index),
            author: Some(author.clone()),
            made_at,
            changes: Some(vec![serde_json::to_value(op).unwrap()]),
            private: false,
            meta: None,
        }
    }

    fn group_id() -> CoId {
        CoId::parse("co_zgroup").unwrap()
    }

    #[test]
    fn test_initial_admin_bootstraps_and_adds_members() {
        let admin = agent(1);
        let writer = agent(2);
        let txs = vec![
            record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")),
            record(&admin, 1, 2, MapOp::set(writer.as_str(), "writer")),
        ];
        let state = GroupState::replay(group_id(), &admin, &txs, &NoGroups);

        assert_eq!(state.role_of(&admin), Some(Role::Admin));
        assert_eq!(state.role_of(&writer), Some(Role::Writer));
        assert_eq!(state.role_at(&writer, 1), None);
        assert_eq!(state.role_at(&writer, 2), Some(Role::Writer));
        assert_eq!(state.valid_transactions().len(), 2);
    }

    #[test]
    fn test_packed_changes_replay() {
        let admin = agent(1);
        let reader = agent(2);
        let mut packed = record(&admin, 1, 2, MapOp::set(reader.as_str(), "reader"));
        packed.changes = Some(vec![json!([1, reader.as_str(), "reader"])]);
        let mut two_ops = record(&admin, 2, 3, MapOp::set("x", "y"));
        two_ops.changes = Some(vec![json!([1, "a", "b"]), json!([1, "c", "d"])]);

        let txs = vec![record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")), packed, two_ops];
        let state = GroupState::replay(group_id(), &admin, &txs, &NoGroups);
        assert_eq!(state.role_of(&reader), Some(Role::Reader));
        assert_eq!(state.valid_transactions().len(), 2);
    }

    #[test]
    fn test_non_admin_cannot_assign_roles() {
        let admin = agent(1);
        let mallory = agent(3);
        let txs = vec![
            record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")),
            record(&mallory, 0, 2, MapOp::set(mallory.as_str(), "admin")),
        ];
        let state = GroupState::replay(group_id(), &admin, &txs, &NoGroups);
        assert_eq!(state.role_of(&mallory), None);
        assert_eq!(state.valid_transactions().len(), 1);
    }

    #[test]
    fn test_admin_cannot_demote_other_admin() {
        let a = agent(1);
        let b = agent(2);
        let txs = vec![
            record(&a, 0, 1, MapOp::set(a.as_str(), "admin")),
            record(&a, 1, 2, MapOp::set(b.as_str(), "admin")),
            record(&b, 0, 3, MapOp::set(a.as_str(), "reader")),
            record(&b, 1, 4, MapOp::set(b.as_str(), "revoked")),
        ];
        let state = GroupState::replay(group_id(), &a, &txs, &NoGroups);
        assert_eq!(state.role_of(&a), Some(Role::Admin));
        assert_eq!(state.role_of(&b), Some(Role::Revoked));
    }

    #[test]
    fn test_everyone_role() {
        let admin = agent(1);
        let txs = vec![
            record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")),
            record(&admin, 1, 2, MapOp::set(EVERYONE, "writer")),
            record(&admin, 2, 3, MapOp::set(EVERYONE, "admin")),
        ];
        let state = GroupState::replay(group_id(), &admin, &txs, &NoGroups);
        assert_eq!(state.role_of(&agent(9)), Some(Role::Writer));
        assert!(!state.is_valid(&txs[2].id));
    }

    #[test]
    fn test_replay_orders_by_made_at() {
        let admin = agent(1);
        let writer = agent(2);
        // Delivered out of order: the member add comes before the bootstrap
        let txs = vec![
            record(&admin, 1, 5, MapOp::set(writer.as_str(), "writer")),
            record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")),
        ];
        let state = GroupState::replay(group_id(), &admin, &txs, &NoGroups);
        assert_eq!(state.role_of(&writer), Some(Role::Writer));
    }

    struct OneParent(GroupState);

    impl GroupLookup for OneParent {
        fn group_state(&self, id: &CoId) -> Option<GroupState> {
            (id == self.0.id()).then(|| self.0.clone())
        }
    }

    #[test]
    fn test_parent_extension_inherits_roles() {
        let admin = agent(1);
        let reader = agent(2);
        let parent_id = CoId::parse("co_zparent").unwrap();
        let parent = GroupState::replay(
            parent_id.clone(),
            &admin,
            &[
                record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")),
                record(&admin, 1, 2, MapOp::set(reader.as_str(), "reader")),
            ],
            &NoGroups,
        );

        let child = GroupState::replay(
            group_id(),
            &admin,
            &[
                record(&admin, 10, 1, MapOp::set(admin.as_str(), "admin")),
                record(&admin, 11, 3, MapOp::set(format!("parent_{}", parent_id), "extend")),
            ],
            &OneParent(parent),
        );
        assert_eq!(child.role_of(&reader), Some(Role::Reader));
        assert_eq!(child.parent_groups().collect::<Vec<_>>(), vec![&parent_id]);
    }

    #[test]
    fn test_referenced_parents() {
        let admin = agent(1);
        let txs = vec![record(&admin, 0, 1, MapOp::set("parent_co_zp", "extend"))];
        let parents = referenced_parent_groups(&txs);
        assert!(parents.contains(&CoId::parse("co_zp").unwrap()));
    }
}
