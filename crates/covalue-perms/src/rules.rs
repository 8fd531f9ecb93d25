//! Per-transaction permission evaluation.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use covalue_core::{CoId, CoValueHeader, Ruleset, TransactionId};

use crate::group::{GroupLookup, GroupState, TxRecord};
use crate::role::Role;

/// Meta key marking a delete transaction: `{"deleted": coId}`.
pub const DELETED_META_KEY: &str = "deleted";

/// True if `tx` is a well-formed delete marker for `id`.
pub fn is_delete_marker(id: &CoId, tx: &TxRecord) -> bool {
    !tx.private
        && tx
            .meta
            .as_ref()
            .and_then(|m| m.get(DELETED_META_KEY))
            .and_then(Value::as_str)
            == Some(id.as_str())
}

/// Compute which of `transactions` are valid under the header's ruleset.
///
/// Group-owned values are evaluated against the owning group's state at each
/// transaction's `madeAt`; a group that cannot be resolved invalidates every
/// transaction of the value until it becomes available.
pub fn determine_valid_transactions(
    id: &CoId,
    header: &CoValueHeader,
    transactions: &[TxRecord],
    lookup: &dyn GroupLookup,
) -> BTreeSet<TransactionId> {
    match &header.ruleset {
        Ruleset::UnsafeAllowAll => transactions.iter().map(|tx| tx.id.clone()).collect(),

        Ruleset::Group { initial_admin } => {
            let (deletes, rest): (Vec<_>, Vec<_>) = transactions
                .iter()
                .cloned()
                .partition(|tx| tx.id.session_id.is_delete_session());
            if !deletes.is_empty() {
                debug!(id = %id, "Groups cannot be deleted, ignoring delete sessions");
            }
            GroupState::replay(id.clone(), initial_admin, &rest, lookup)
                .valid_transactions()
                .clone()
        }

        Ruleset::OwnedByGroup {
            group,
            restrict_deletion,
        } => {
            let Some(state) = lookup.group_state(group) else {
                warn!(id = %id, group = %group, "Owning group not available");
                return BTreeSet::new();
            };
            transactions
                .iter()
                .filter(|tx| owned_tx_is_valid(id, &state, *restrict_deletion, tx))
                .map(|tx| tx.id.clone())
                .collect()
        }
    }
}

fn owned_tx_is_valid(id: &CoId, group: &GroupState, restrict_deletion: bool, tx: &TxRecord) -> bool {
    let Some(author) = &tx.author else {
        return false;
    };
    let role = group.role_at(author, tx.made_at);

    if tx.id.session_id.is_delete_session() {
        if !is_delete_marker(id, tx) {
            debug!(id = %id, tx = %tx.id, "Malformed delete transaction");
            return false;
        }
        return if restrict_deletion {
            role == Some(Role::Admin)
        } else {
            matches!(role, Some(Role::Admin | Role::Writer))
        };
    }

    role.map_or(false, Role::can_write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::tests::{agent, record};
    use crate::group::MapOp;
    use covalue_core::{CoValueType, SessionId, Uniqueness};
    use serde_json::json;

    struct Groups(Vec<GroupState>);

    impl GroupLookup for Groups {
        fn group_state(&self, id: &CoId) -> Option<GroupState> {
            self.0.iter().find(|g| g.id() == id).cloned()
        }
    }

    fn owning_group() -> GroupState {
        let admin = agent(1);
        GroupState::replay(
            CoId::parse("co_zowner").unwrap(),
            &admin,
            &[
                record(&admin, 0, 1, MapOp::set(admin.as_str(), "admin")),
                record(&admin, 1, 10, MapOp::set(agent(2).as_str(), "writer")),
                record(&admin, 2, 10, MapOp::set(agent(3).as_str(), "reader")),
            ],
            &crate::group::NoGroups,
        )
    }

    fn edit(author: u8, index: u32, made_at: u64) -> TxRecord {
        let mut tx = record(&agent(author), index, made_at, MapOp::set("title", "x"));
        tx.id = TransactionId::new(SessionId::new_session(agent(author).as_str(), "doc"), index);
        tx
    }

    fn delete(author: u8, id: &CoId, made_at: u64) -> TxRecord {
        TxRecord {
            id: TransactionId::new(SessionId::new_delete_session(agent(author).as_str(), "1"), 0),
            author: Some(agent(author)),
            made_at,
            changes: Some(vec![]),
            private: false,
            meta: Some(json!({ "deleted": id.as_str() })),
        }
    }

    #[test]
    fn test_owned_by_group_checks_role_at_made_at() {
        let header = CoValueHeader::owned_by_group(
            CoValueType::Comap,
            CoId::parse("co_zowner").unwrap(),
            Uniqueness::Null,
        );
        let id = CoId::parse("co_zdoc").unwrap();
        let txs = vec![edit(2, 0, 5), edit(2, 1, 20), edit(3, 0, 20), edit(1, 0, 2)];

        let valid = determine_valid_transactions(&id, &header, &txs, &Groups(vec![owning_group()]));
        // writer before being added, reader at any time: rejected
        assert!(!valid.contains(&txs[0].id));
        assert!(valid.contains(&txs[1].id));
        assert!(!valid.contains(&txs[2].id));
        assert!(valid.contains(&txs[3].id));
    }

    #[test]
    fn test_missing_group_invalidates_everything() {
        let header = CoValueHeader::owned_by_group(
            CoValueType::Comap,
            CoId::parse("co_zmissing").unwrap(),
            Uniqueness::Null,
        );
        let id = CoId::parse("co_zdoc").unwrap();
        let valid = determine_valid_transactions(&id, &header, &[edit(1, 0, 5)], &Groups(vec![]));
        assert!(valid.is_empty());
    }

    #[test]
    fn test_delete_permissions() {
        let id = CoId::parse("co_zdoc").unwrap();
        let groups = Groups(vec![owning_group()]);
        let mut header = CoValueHeader::owned_by_group(
            CoValueType::Comap,
            CoId::parse("co_zowner").unwrap(),
            Uniqueness::Null,
        );

        let by_writer = delete(2, &id, 50);
        let by_reader = delete(3, &id, 50);
        let valid = determine_valid_transactions(&id, &header, &[by_writer.clone(), by_reader.clone()], &groups);
        assert!(valid.contains(&by_writer.id));
        assert!(!valid.contains(&by_reader.id));

        header.ruleset = Ruleset::OwnedByGroup {
            group: CoId::parse("co_zowner").unwrap(),
            restrict_deletion: true,
        };
        let by_admin = delete(1, &id, 50);
        let valid = determine_valid_transactions(&id, &header, &[by_writer.clone(), by_admin.clone()], &groups);
        assert!(!valid.contains(&by_writer.id));
        assert!(valid.contains(&by_admin.id));
    }

    #[test]
    fn test_delete_marker_must_name_the_value() {
        let id = CoId::parse("co_zdoc").unwrap();
        let other = CoId::parse("co_zother").unwrap();
        assert!(is_delete_marker(&id, &delete(1, &id, 1)));
        assert!(!is_delete_marker(&id, &delete(1, &other, 1)));
    }

    #[test]
    fn test_unsafe_allow_all() {
        let header = CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::Null);
        let id = CoId::parse("co_zopen").unwrap();
        let txs = vec![edit(7, 0, 1), edit(8, 0, 1)];
        let valid = determine_valid_transactions(&id, &header, &txs, &crate::group::NoGroups);
        assert_eq!(valid.len(), 2);
    }
}
