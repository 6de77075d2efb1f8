// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use serde_json::Value;

use crate::canonical::canonical_digest;

/// Prefix of every record soul in the peer graph.
pub const SOUL_PREFIX: &str = "oip:records";

/// Hex characters of the content hash kept in hash-derived souls.
const CONTENT_HASH_LEN: usize = 12;

/// Compute the peer-graph soul for a record.
///
/// With a caller-supplied stable `local_id` the soul is
/// `oip:records:<pubKey>:<localId>`; otherwise it is derived from the
/// content, `oip:records:<pubKey>:h:<first12hex(SHA256(canonical(data)))>`,
/// so republishing identical data lands on the same soul.
pub fn record_soul(
    publisher_pub_key: &str,
    local_id: Option<&str>,
    data: &Value,
) -> String {
    match local_id {
        Some(local_id) => {
            format!("{SOUL_PREFIX}:{publisher_pub_key}:{local_id}")
        }
        None => {
            let digest = canonical_digest(data);
            let hash = &hex::encode(digest)[..CONTENT_HASH_LEN];
            format!("{SOUL_PREFIX}:{publisher_pub_key}:h:{hash}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_id_soul() {
        let soul = record_soul("pkA", Some("draft-1"), &json!({}));
        assert_eq!(soul, "oip:records:pkA:draft-1");
    }

    #[test]
    fn content_soul_is_deterministic() {
        let a = record_soul("pkA", None, &json!({"x": 1, "y": 2}));
        let b = record_soul("pkA", None, &json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("oip:records:pkA:h:"));
        assert_eq!(a.rsplit(':').next().unwrap().len(), 12);
    }

    #[test]
    fn content_soul_differs_per_content() {
        let a = record_soul("pkA", None, &json!({"x": 1}));
        let b = record_soul("pkA", None, &json!({"x": 2}));
        assert_ne!(a, b);
    }
}
