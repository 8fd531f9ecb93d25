//! Compaction codecs for list and map operations.
//!
//! List operations are packed into positional arrays keyed by their opcode:
//!
//! - `app`: `[op, value, after, compacted]`
//! - `pre`: `[op, value, before, compacted]`
//! - `del`: `[op, insertion, compacted]`
//!
//! Trailing nulls are trimmed. A batch of two or more appends sharing one
//! anchor is further compacted to `[["app", v1, after, true], v2, v3, ...]`.
//!
//! ```text
//! [{op:app, value:a, after:start}, {op:app, value:b, after:start}]
//!     => [["app", "a", "start", true], "b"]
//! ```
//!
//! Map operations use numeric opcodes: `[1, key, value]` for a set and
//! `[2, key]` for a delete, again with trailing nulls trimmed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

const OP_APP: &str = "app";
const OP_PRE: &str = "pre";
const OP_DEL: &str = "del";

const MAP_SET: u64 = 1;
const MAP_DEL: u64 = 2;

/// One list operation. Anchors reference earlier insertions (or `"start"` /
/// `"end"`), kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ListOp {
    #[serde(rename = "app")]
    App {
        #[serde(default)]
        value: Value,
        #[serde(default)]
        after: Value,
    },
    #[serde(rename = "pre")]
    Pre {
        #[serde(default)]
        value: Value,
        #[serde(default)]
        before: Value,
    },
    #[serde(rename = "del")]
    Del {
        #[serde(default)]
        insertion: Value,
    },
}

impl ListOp {
    fn to_array(&self, compacted: bool) -> Value {
        let flag = if compacted { Value::Bool(true) } else { Value::Null };
        let fields = match self {
            ListOp::App { value, after } => {
                vec![OP_APP.into(), value.clone(), after.clone(), flag]
            }
            ListOp::Pre { value, before } => {
                vec![OP_PRE.into(), value.clone(), before.clone(), flag]
            }
            ListOp::Del { insertion } => vec![OP_DEL.into(), insertion.clone(), flag],
        };
        Value::Array(trim_trailing_nulls(fields))
    }

    /// Returns the op and whether it carried the compacted flag.
    fn from_array(arr: &[Value]) -> Result<(Self, bool)> {
        let field = |i: usize| arr.get(i).cloned().unwrap_or(Value::Null);
        let op = match arr.first().and_then(Value::as_str) {
            Some(OP_APP) => ListOp::App {
                value: field(1),
                after: field(2),
            },
            Some(OP_PRE) => ListOp::Pre {
                value: field(1),
                before: field(2),
            },
            Some(OP_DEL) => ListOp::Del {
                insertion: field(1),
            },
            other => {
                return Err(CoreError::MalformedPack(format!(
                    "unknown list op {:?}",
                    other
                )))
            }
        };
        let flag_index = if matches!(op, ListOp::Del { .. }) { 2 } else { 3 };
        let compacted = arr.get(flag_index) == Some(&Value::Bool(true));
        Ok((op, compacted))
    }
}

fn trim_trailing_nulls(mut fields: Vec<Value>) -> Vec<Value> {
    while fields.last() == Some(&Value::Null) {
        fields.pop();
    }
    fields
}

/// Pack a batch of list operations.
pub fn pack_changes(ops: &[ListOp]) -> Vec<Value> {
    if let Some((ListOp::App { after, .. }, rest)) = ops.split_first() {
        let compactable = !rest.is_empty()
            && rest
                .iter()
                .all(|op| matches!(op, ListOp::App { after: a, .. } if a == after));
        if compactable {
            let mut packed = Vec::with_capacity(ops.len());
            packed.push(ops[0].to_array(true));
            packed.extend(rest.iter().filter_map(|op| match op {
                ListOp::App { value, .. } => Some(value.clone()),
                _ => None,
            }));
            return packed;
        }
    }
    ops.iter().map(|op| op.to_array(false)).collect()
}

/// Unpack any of the three shapes: expanded objects, per-op arrays, or the
/// compacted append run.
pub fn unpack_changes(changes: &[Value]) -> Result<Vec<ListOp>> {
    let Some(first) = changes.first() else {
        return Ok(Vec::new());
    };

    let Value::Array(first_arr) = first else {
        return changes
            .iter()
            .map(|change| serde_json::from_value(change.clone()).map_err(CoreError::from))
            .collect();
    };

    let (first_op, compacted) = ListOp::from_array(first_arr)?;
    if compacted && changes.len() > 1 {
        if let ListOp::App { after, .. } = &first_op {
            let after = after.clone();
            let mut ops = Vec::with_capacity(changes.len());
            ops.push(first_op);
            ops.extend(changes[1..].iter().map(|value| ListOp::App {
                value: value.clone(),
                after: after.clone(),
            }));
            return Ok(ops);
        }
    }

    changes
        .iter()
        .map(|change| match change {
            Value::Array(arr) => ListOp::from_array(arr).map(|(op, _)| op),
            other => Err(CoreError::MalformedPack(format!(
                "expected per-op array, got {}",
                other
            ))),
        })
        .collect()
}

/// One map operation, the change format of map-typed CoValues (groups
/// included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum MapOp {
    #[serde(rename = "set")]
    Set {
        key: String,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename = "del")]
    Del { key: String },
}

impl MapOp {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        MapOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MapOp::Set { key, .. } | MapOp::Del { key } => key,
        }
    }

    fn to_array(&self) -> Value {
        let fields = match self {
            MapOp::Set { key, value } => {
                vec![MAP_SET.into(), Value::String(key.clone()), value.clone()]
            }
            MapOp::Del { key } => vec![MAP_DEL.into(), Value::String(key.clone())],
        };
        Value::Array(trim_trailing_nulls(fields))
    }

    fn from_array(arr: &[Value]) -> Result<Self> {
        let key = match arr.get(1) {
            Some(Value::String(key)) => key.clone(),
            other => {
                return Err(CoreError::MalformedPack(format!(
                    "map op key must be a string, got {:?}",
                    other
                )))
            }
        };
        match arr.first().and_then(Value::as_u64) {
            Some(MAP_SET) => Ok(MapOp::Set {
                key,
                value: arr.get(2).cloned().unwrap_or(Value::Null),
            }),
            Some(MAP_DEL) => Ok(MapOp::Del { key }),
            _ => Err(CoreError::MalformedPack(format!(
                "unknown map op {:?}",
                arr.first()
            ))),
        }
    }
}

/// Pack a batch of map operations, one array per op.
pub fn pack_map_changes(ops: &[MapOp]) -> Vec<Value> {
    ops.iter().map(MapOp::to_array).collect()
}

/// Unpack map changes. Expanded `{op, key, value}` objects are accepted as
/// well as packed arrays.
pub fn unpack_map_changes(changes: &[Value]) -> Result<Vec<MapOp>> {
    changes
        .iter()
        .map(|change| match change {
            Value::Array(arr) => MapOp::from_array(arr),
            Value::Object(_) => serde_json::from_value(change.clone()).map_err(CoreError::from),
            other => Err(CoreError::MalformedPack(format!(
                "expected map op, got {}",
                other
            ))),
        })
        .collect()
}
