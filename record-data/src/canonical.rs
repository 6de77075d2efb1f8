// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Canonical JSON, the byte-exact form signatures and content hashes are
//! computed over: keys sorted ascending at every level, no insignificant
//! whitespace, shortest round-trip numbers, minimal-escape UTF-8 strings.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::with_capacity(128);
    write_value(&mut out, value);
    out
}

/// SHA-256 over the canonical serialization.
pub fn canonical_digest(value: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_string(value).as_bytes());
    hasher.finalize().into()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders numbers with itoa/ryu, which is the shortest
        // round-trip decimal form.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_at_every_level() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 0, "x": 1}]});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":[{"x":1,"y":0}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let v: Value =
            serde_json::from_str("{ \"a\" : [ 1 , 2 ] , \"b\" : null }")
                .unwrap();
        assert_eq!(to_canonical_string(&v), r#"{"a":[1,2],"b":null}"#);
    }

    #[test]
    fn numbers_shortest_form() {
        let v = json!({"f": 1.5, "i": 10, "n": -3});
        assert_eq!(to_canonical_string(&v), r#"{"f":1.5,"i":10,"n":-3}"#);
    }

    #[test]
    fn minimal_escapes() {
        let v = json!({"s": "a\"b\\c\nd"});
        assert_eq!(to_canonical_string(&v), "{\"s\":\"a\\\"b\\\\c\\nd\"}");

        // non-ASCII passes through unescaped
        let v = json!({"s": "héllo"});
        assert_eq!(to_canonical_string(&v), "{\"s\":\"héllo\"}");
    }

    #[test]
    fn digest_is_stable_under_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(canonical_digest(&a), canonical_digest(&b));
    }
}
