//! Golden test vectors for deterministic verification.
//!
//! These vectors pin the list pack codec and stable JSON output, so that
//! every implementation exchanging transactions produces identical bytes.

use serde_json::Value;

use covalue_core::{pack_changes, stable_stringify, unpack_changes, ListOp};

/// A list pack codec vector.
#[derive(Debug, Clone)]
pub struct PackVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// Operations in expanded object form (JSON array).
    pub ops: &'static str,
    /// Expected packed form (JSON array).
    pub packed: &'static str,
}

/// A stable stringify vector.
#[derive(Debug, Clone)]
pub struct StringifyVector {
    pub name: &'static str,
    pub input: &'static str,
    pub expected: &'static str,
}

pub fn pack_vectors() -> Vec<PackVector> {
    vec![
        PackVector {
            name: "single append",
            ops: r#"[{"op":"app","value":"a","after":"start"}]"#,
            packed: r#"[["app","a","start"]]"#,
        },
        PackVector {
            name: "append run on one anchor",
            ops: r#"[{"op":"app","value":"a","after":"start"},{"op":"app","value":"b","after":"start"},{"op":"app","value":"c","after":"start"}]"#,
            packed: r#"[["app","a","start",true],"b","c"]"#,
        },
        PackVector {
            name: "appends on different anchors",
            ops: r#"[{"op":"app","value":1,"after":"start"},{"op":"app","value":2,"after":"end"}]"#,
            packed: r#"[["app",1,"start"],["app",2,"end"]]"#,
        },
        PackVector {
            name: "prepend and delete",
            ops: r#"[{"op":"pre","value":"x","before":"end"},{"op":"del","insertion":{"sessionID":"s","txIndex":0,"changeIdx":1}}]"#,
            packed: r#"[["pre","x","end"],["del",{"changeIdx":1,"sessionID":"s","txIndex":0}]]"#,
        },
        PackVector {
            name: "null value keeps its slot",
            ops: r#"[{"op":"app","value":null,"after":"start"}]"#,
            packed: r#"[["app",null,"start"]]"#,
        },
        PackVector {
            name: "missing anchor is trimmed",
            ops: r#"[{"op":"app","value":"x"}]"#,
            packed: r#"[["app","x"]]"#,
        },
    ]
}

pub fn stringify_vectors() -> Vec<StringifyVector> {
    vec![
        StringifyVector {
            name: "flat object",
            input: r#"{"b":1,"a":2}"#,
            expected: r#"{"a":2,"b":1}"#,
        },
        StringifyVector {
            name: "nested objects in arrays",
            input: r#"[{"z":{"y":null,"x":[true,false]}},"s"]"#,
            expected: r#"[{"z":{"x":[true,false],"y":null}},"s"]"#,
        },
        StringifyVector {
            name: "header shape",
            input: r#"{"type":"comap","ruleset":{"type":"unsafeAllowAll"},"meta":null,"uniqueness":"u"}"#,
            expected: r#"{"meta":null,"ruleset":{"type":"unsafeAllowAll"},"type":"comap","uniqueness":"u"}"#,
        },
        StringifyVector {
            name: "escaped strings",
            input: r#"{"k":"line\nbreak \"quoted\""}"#,
            expected: r#"{"k":"line\nbreak \"quoted\""}"#,
        },
    ]
}

fn check_pack(vector: &PackVector) -> bool {
    let (Ok(ops), Ok(packed)) = (
        serde_json::from_str::<Vec<ListOp>>(vector.ops),
        serde_json::from_str::<Vec<Value>>(vector.packed),
    ) else {
        return false;
    };
    pack_changes(&ops) == packed && unpack_changes(&packed).is_ok_and(|unpacked| unpacked == ops)
}

fn check_stringify(vector: &StringifyVector) -> bool {
    serde_json::from_str::<Value>(vector.input)
        .ok()
        .and_then(|value| stable_stringify(&value).ok())
        .is_some_and(|out| out == vector.expected)
}

/// Check every vector, returning each name with whether it passed.
pub fn verify_all_vectors() -> Vec<(&'static str, bool)> {
    let pack = pack_vectors().into_iter().map(|v| (v.name, check_pack(&v)));
    let stringify = stringify_vectors()
        .into_iter()
        .map(|v| (v.name, check_stringify(&v)));
    pack.chain(stringify).collect()
}
