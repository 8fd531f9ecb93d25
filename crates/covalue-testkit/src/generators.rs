//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use covalue_core::ListOp;

/// Generate a JSON scalar.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::String),
    ]
}

/// Generate a JSON value up to a few levels deep.
pub fn json_value() -> impl Strategy<Value = Value> {
    json_scalar().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(map_key(), inner, 0..4)
                .prop_map(|entries| Value::Object(entries.into_iter().collect())),
        ]
    })
}

/// Generate a map key.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}".prop_map(String::from)
}

/// Generate a list anchor: `"start"`, `"end"` or an insertion reference.
pub fn anchor() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!("start")),
        Just(json!("end")),
        (0u32..4, 0u32..4).prop_map(|(tx, change)| json!({
            "sessionID": "sealer_z1/signer_z2_session_zs",
            "txIndex": tx,
            "changeIdx": change,
        })),
    ]
}

/// Generate one list operation.
pub fn list_op() -> impl Strategy<Value = ListOp> {
    prop_oneof![
        (json_scalar(), anchor()).prop_map(|(value, after)| ListOp::App { value, after }),
        (json_scalar(), anchor()).prop_map(|(value, before)| ListOp::Pre { value, before }),
        anchor().prop_map(|insertion| ListOp::Del { insertion }),
    ]
}

/// Generate a batch of list operations. Half of the batches are append runs
/// on one anchor, the shape the codec compacts.
pub fn list_ops(max_len: usize) -> impl Strategy<Value = Vec<ListOp>> {
    prop_oneof![
        prop::collection::vec(list_op(), 0..=max_len),
        (anchor(), prop::collection::vec(json_scalar(), 2..=max_len.max(2))).prop_map(
            |(after, values)| {
                values
                    .into_iter()
                    .map(|value| ListOp::App {
                        value,
                        after: after.clone(),
                    })
                    .collect()
            }
        ),
    ]
}

/// A sequence of map edits: `Some` sets a key, `None` deletes it.
#[derive(Debug, Clone)]
pub struct MapEdits {
    pub edits: Vec<(String, Option<Value>)>,
}

impl MapEdits {
    /// The map a correct implementation ends up with.
    pub fn expected(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        for (key, value) in &self.edits {
            match value {
                Some(value) => {
                    map.insert(key.clone(), value.clone());
                }
                None => {
                    map.remove(key);
                }
            }
        }
        map
    }
}

/// Size limits for [`MapEdits`].
#[derive(Debug, Clone, Copy)]
pub struct MapEditsParams {
    pub max_edits: usize,
    pub max_keys: usize,
}

impl Default for MapEditsParams {
    fn default() -> Self {
        Self {
            max_edits: 16,
            max_keys: 4,
        }
    }
}

impl Arbitrary for MapEdits {
    type Parameters = MapEditsParams;
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(params: Self::Parameters) -> Self::Strategy {
        let keys: Vec<String> = (0..params.max_keys.max(1)).map(|i| format!("k{i}")).collect();
        let edit = (prop::sample::select(keys), prop::option::weighted(0.8, json_scalar()));
        prop::collection::vec(edit, 0..=params.max_edits)
            .prop_map(|edits| MapEdits { edits })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{pack_changes, stable_stringify, unpack_changes};

    proptest! {
        #[test]
        fn test_packed_ops_unpack_to_the_same_ops(ops in list_ops(6)) {
            let packed = pack_changes(&ops);
            prop_assert_eq!(unpack_changes(&packed).unwrap(), ops);
        }

        #[test]
        fn test_append_runs_pack_to_one_array(ops in list_ops(6)) {
            let packed = pack_changes(&ops);
            let run = match ops.split_first() {
                Some((ListOp::App { after, .. }, rest)) => {
                    !rest.is_empty()
                        && rest.iter().all(|op| matches!(op, ListOp::App { after: a, .. } if a == after))
                }
                _ => false,
            };
            let arrays = packed.iter().filter(|change| change.is_array()).count();
            if run {
                prop_assert_eq!(arrays, 1);
                prop_assert_eq!(packed.len(), ops.len());
                prop_assert_eq!(packed[0][3].clone(), json!(true));
            } else {
                prop_assert_eq!(arrays, ops.len());
            }
        }

        #[test]
        fn test_stable_stringify_ignores_key_order(value in json_value()) {
            let reparsed: Value = serde_json::from_str(&stable_stringify(&value).unwrap()).unwrap();
            prop_assert_eq!(&reparsed, &value);
            prop_assert_eq!(stable_stringify(&reparsed).unwrap(), stable_stringify(&value).unwrap());
        }

        #[test]
        fn test_map_edits_expected_only_has_set_keys(edits in any::<MapEdits>()) {
            let expected = edits.expected();
            for key in expected.keys() {
                let last = edits.edits.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.is_some());
                prop_assert_eq!(last, Some(true));
            }
        }
    }
}
