//! Read-side views of CoValue content.
//!
//! Views are computed from the valid transactions of a value: map entries
//! are resolved last-writer-wins by `(madeAt, txId)`, list items are ordered
//! by their insertion anchors and groups are replayed through [`GroupState`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use covalue_core::{
    unpack_changes, unpack_map_changes, AgentId, CoId, KeyId, ListOp, MapOp, SessionId,
    TransactionId,
};
use covalue_perms::{GroupState, ParentRole, Role, TxRecord};

/// Anchors that are not an insertion.
pub(crate) const LIST_START: &str = "start";
pub(crate) const LIST_END: &str = "end";

/// Sorts transactions by `(madeAt, txId)`, keeping only valid ones outside
/// delete sessions.
fn ordered_valid<'a>(records: &'a [TxRecord], valid: &BTreeSet<TransactionId>) -> Vec<&'a TxRecord> {
    let mut ordered: Vec<&TxRecord> = records
        .iter()
        .filter(|tx| valid.contains(&tx.id) && !tx.id.session_id.is_delete_session())
        .collect();
    ordered.sort_by(|a, b| (a.made_at, &a.id).cmp(&(b.made_at, &b.id)));
    ordered
}

/// The latest write of one map key.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub value: Value,
    pub author: Option<AgentId>,
    pub made_at: u64,
    pub tx_id: TransactionId,
}

/// Current content of a map CoValue.
#[derive(Debug, Clone, Default)]
pub struct MapView {
    entries: BTreeMap<String, MapEntry>,
    /// Private transactions that could not be decrypted.
    unreadable: usize,
}

impl MapView {
    /// Fold the `valid` transactions among `records` into map entries.
    pub fn materialize(id: &CoId, records: &[TxRecord], valid: &BTreeSet<TransactionId>) -> Self {
        let mut view = MapView::default();
        for tx in ordered_valid(records, valid) {
            let Some(changes) = &tx.changes else {
                view.unreadable += 1;
                continue;
            };
            for change in changes {
                let op = unpack_map_changes(std::slice::from_ref(change)).map(|mut ops| ops.pop());
                match op {
                    Ok(Some(MapOp::Set { key, value })) => {
                        view.entries.insert(
                            key,
                            MapEntry {
                                value,
                                author: tx.author.clone(),
                                made_at: tx.made_at,
                                tx_id: tx.id.clone(),
                            },
                        );
                    }
                    Ok(Some(MapOp::Del { key })) => {
                        view.entries.remove(&key);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(id = %id, tx = %tx.id, error = %e, "Skipping non-map change"),
                }
            }
        }
        view
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unreadable_count(&self) -> usize {
        self.unreadable
    }
}

/// Identifies one change of one transaction; list anchors point at these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
    #[serde(rename = "changeIdx")]
    pub change_idx: u32,
}

impl OpId {
    fn new(tx: &TransactionId, change_idx: usize) -> Self {
        Self {
            session_id: tx.session_id.clone(),
            tx_index: tx.tx_index,
            change_idx: change_idx as u32,
        }
    }
}

/// Where an insertion hangs off.
enum Anchor {
    Root,
    Op(OpId),
}

fn parse_anchor(anchor: &Value, root: &str) -> Option<Anchor> {
    if anchor.as_str() == Some(root) {
        return Some(Anchor::Root);
    }
    serde_json::from_value(anchor.clone()).ok().map(Anchor::Op)
}

/// Current content of a list CoValue.
///
/// Appends hang after their anchor, prepends before it. Concurrent
/// insertions at the same anchor are ordered by `(madeAt, txId)`: among
/// appends the newest lands closest to the anchor, while items appended to
/// the start keep their order.
#[derive(Debug, Clone, Default)]
pub struct ListView {
    items: Vec<(OpId, Value)>,
    unreadable: usize,
}

impl ListView {
    pub fn materialize(id: &CoId, records: &[TxRecord], valid: &BTreeSet<TransactionId>) -> Self {
        let mut values: HashMap<OpId, Value> = HashMap::new();
        let mut successors: HashMap<OpId, Vec<OpId>> = HashMap::new();
        let mut predecessors: HashMap<OpId, Vec<OpId>> = HashMap::new();
        let mut after_start = Vec::new();
        let mut before_end = Vec::new();
        let mut deleted = BTreeSet::new();
        let mut unreadable = 0;

        for tx in ordered_valid(records, valid) {
            let Some(changes) = &tx.changes else {
                unreadable += 1;
                continue;
            };
            let ops = match unpack_changes(changes) {
                Ok(ops) => ops,
                Err(e) => {
                    debug!(id = %id, tx = %tx.id, error = %e, "Skipping non-list transaction");
                    continue;
                }
            };
            for (idx, op) in ops.into_iter().enumerate() {
                let op_id = OpId::new(&tx.id, idx);
                match op {
                    ListOp::App { value, after } => {
                        match parse_anchor(&after, LIST_START) {
                            Some(Anchor::Root) => after_start.push(op_id.clone()),
                            Some(Anchor::Op(anchor)) => {
                                successors.entry(anchor).or_default().push(op_id.clone())
                            }
                            None => {
                                debug!(id = %id, tx = %tx.id, "Skipping append with a bad anchor");
                                continue;
                            }
                        }
                        values.insert(op_id, value);
                    }
                    ListOp::Pre { value, before } => {
                        match parse_anchor(&before, LIST_END) {
                            Some(Anchor::Root) => before_end.push(op_id.clone()),
                            Some(Anchor::Op(anchor)) => {
                                predecessors.entry(anchor).or_default().push(op_id.clone())
                            }
                            None => {
                                debug!(id = %id, tx = %tx.id, "Skipping prepend with a bad anchor");
                                continue;
                            }
                        }
                        values.insert(op_id, value);
                    }
                    ListOp::Del { insertion } => match serde_json::from_value::<OpId>(insertion) {
                        Ok(target) => {
                            deleted.insert(target);
                        }
                        Err(_) => debug!(id = %id, tx = %tx.id, "Skipping delete of a bad insertion"),
                    },
                }
            }
        }

        let mut items = Vec::with_capacity(values.len());
        for root in after_start.iter().chain(before_end.iter()) {
            // Depth-first: predecessors, then the insertion, then successors
            // newest first.
            let mut stack = vec![(root.clone(), false)];
            while let Some((op_id, predecessors_done)) = stack.pop() {
                if !predecessors_done {
                    if let Some(before) = predecessors.get(&op_id).filter(|p| !p.is_empty()) {
                        stack.push((op_id, true));
                        stack.extend(before.iter().map(|p| (p.clone(), false)));
                        continue;
                    }
                }
                if !deleted.contains(&op_id) {
                    if let Some(value) = values.get(&op_id) {
                        items.push((op_id.clone(), value.clone()));
                    }
                }
                if let Some(after) = successors.get(&op_id) {
                    stack.extend(after.iter().map(|s| (s.clone(), false)));
                }
            }
        }
        ListView { items, unreadable }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index).map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter().map(|(_, value)| value)
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    /// The insertion currently at `index`.
    pub fn op_id(&self, index: usize) -> Option<&OpId> {
        self.items.get(index).map(|(op_id, _)| op_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unreadable_count(&self) -> usize {
        self.unreadable
    }
}

/// Current state of a group CoValue.
#[derive(Debug, Clone)]
pub struct GroupView {
    state: GroupState,
}

impl GroupView {
    pub fn new(state: GroupState) -> Self {
        Self { state }
    }

    pub fn id(&self) -> &CoId {
        self.state.id()
    }

    pub fn role_of(&self, agent: &AgentId) -> Option<Role> {
        self.state.role_of(agent)
    }

    /// Members with a direct or inherited role.
    pub fn members(&self) -> Vec<(String, Role)> {
        self.state.effective_roles().collect()
    }

    pub fn read_key_id(&self) -> Option<KeyId> {
        self.state.read_key_id()
    }

    /// Parents and how their members are mapped into this group.
    pub fn parents(&self) -> Vec<(CoId, Option<ParentRole>)> {
        self.state
            .parent_groups()
            .map(|parent| {
                let role = self
                    .state
                    .entry(&format!("parent_{parent}"))
                    .and_then(|entry| entry.value.as_str())
                    .and_then(|value| match value {
                        "extend" => Some(ParentRole::Extend),
                        role => role.parse().ok().map(ParentRole::Fixed),
                    });
                (parent.clone(), role)
            })
            .collect()
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::SessionId;
    use serde_json::json;

    const AGENT: &str = "sealer_z01/signer_z02";

    fn record(session: &SessionId, index: u32, made_at: u64, changes: Option<Vec<Value>>) -> TxRecord {
        TxRecord {
            id: TransactionId::new(session.clone(), index),
            author: None,
            made_at,
            changes,
            private: false,
            meta: None,
        }
    }

    #[test]
    fn test_last_writer_wins_by_made_at() {
        let id = CoId::parse("co_zmap").unwrap();
        let a = SessionId::new_session(AGENT, "a");
        let b = SessionId::new_session(AGENT, "b");
        let records = vec![
            record(&a, 0, 20, Some(vec![json!({"op": "set", "key": "k", "value": "late"})])),
            record(&b, 0, 10, Some(vec![json!({"op": "set", "key": "k", "value": "early"})])),
            record(&b, 1, 30, Some(vec![json!({"op": "set", "key": "other", "value": 1})])),
        ];
        let valid = records.iter().map(|r| r.id.clone()).collect();

        let view = MapView::materialize(&id, &records, &valid);
        assert_eq!(view.get("k"), Some(&json!("late")));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_invalid_and_unreadable_transactions_are_skipped() {
        let id = CoId::parse("co_zmap").unwrap();
        let s = SessionId::new_session(AGENT, "a");
        let records = vec![
            record(&s, 0, 1, Some(vec![json!({"op": "set", "key": "k", "value": 1})])),
            record(&s, 1, 2, Some(vec![json!({"op": "set", "key": "k", "value": 2})])),
            record(&s, 2, 3, None),
            record(&s, 3, 4, Some(vec![json!({"op": "del", "key": "k"}), json!("noise")])),
        ];
        let mut valid: BTreeSet<TransactionId> = records.iter().map(|r| r.id.clone()).collect();
        valid.remove(&records[1].id);

        let view = MapView::materialize(&id, &records[..3], &valid);
        assert_eq!(view.get("k"), Some(&json!(1)));
        assert_eq!(view.unreadable_count(), 1);

        let view = MapView::materialize(&id, &records, &valid);
        assert!(view.is_empty());
    }

    #[test]
    fn test_packed_map_changes() {
        let id = CoId::parse("co_zmap").unwrap();
        let s = SessionId::new_session(AGENT, "a");
        let records = vec![
            record(&s, 0, 1, Some(vec![json!([1, "a", "x"]), json!([1, "b"])])),
            record(&s, 1, 2, Some(vec![json!([2, "a"])])),
        ];
        let valid = records.iter().map(|r| r.id.clone()).collect();

        let view = MapView::materialize(&id, &records, &valid);
        assert_eq!(view.get("a"), None);
        assert_eq!(view.get("b"), Some(&Value::Null));
    }

    fn op(session: &SessionId, tx_index: u32, change_idx: u32) -> Value {
        serde_json::to_value(OpId {
            session_id: session.clone(),
            tx_index,
            change_idx,
        })
        .unwrap()
    }

    #[test]
    fn test_list_orders_by_anchor() {
        let id = CoId::parse("co_zlist").unwrap();
        let s = SessionId::new_session(AGENT, "a");
        let records = vec![
            // a, b appended to the start as one compacted run
            record(&s, 0, 1, Some(vec![json!(["app", "a", "start", true]), json!("b")])),
            // c, d appended after b, stored newest-first
            record(
                &s,
                1,
                2,
                Some(vec![json!(["app", "d", op(&s, 0, 1)]), json!(["app", "c", op(&s, 0, 1)])]),
            ),
            record(&s, 2, 3, Some(vec![json!(["pre", "z", "end"])])),
            record(&s, 3, 4, Some(vec![json!(["pre", "a0", op(&s, 0, 0)])])),
        ];
        let valid = records.iter().map(|r| r.id.clone()).collect();

        let view = ListView::materialize(&id, &records, &valid);
        assert_eq!(view.to_vec(), vec![json!("a0"), json!("a"), json!("b"), json!("c"), json!("d"), json!("z")]);
    }

    #[test]
    fn test_list_deletes_and_invalid_transactions() {
        let id = CoId::parse("co_zlist").unwrap();
        let s = SessionId::new_session(AGENT, "a");
        let records = vec![
            record(&s, 0, 1, Some(vec![json!(["app", "a", "start"])])),
            record(&s, 1, 2, Some(vec![json!(["app", "b", op(&s, 0, 0)])])),
            record(&s, 2, 3, Some(vec![json!(["del", op(&s, 0, 0)])])),
            record(&s, 3, 4, Some(vec![json!(["app", "rejected", "start"])])),
            record(&s, 4, 5, None),
        ];
        let mut valid: BTreeSet<TransactionId> = records.iter().map(|r| r.id.clone()).collect();
        valid.remove(&records[3].id);

        let view = ListView::materialize(&id, &records, &valid);
        assert_eq!(view.to_vec(), vec![json!("b")]);
        assert_eq!(view.op_id(0).map(|o| o.tx_index), Some(1));
        assert_eq!(view.unreadable_count(), 1);
    }
}
