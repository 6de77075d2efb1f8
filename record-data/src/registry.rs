// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The shared discovery soul every node advertises its peer records under.
pub const REGISTRY_SOUL: &str = "oip:registry";

/// A record stub advertised in a node's discovery registry.
///
/// The registry doubles as the deletion registry: a tombstoned record keeps
/// its entry with `deleted` set, so remote nodes observe deletions through
/// the same diff they use for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(rename = "recordType")]
    pub record_type: String,
    #[serde(rename = "creatorPubKey")]
    pub creator_pub_key: String,
    /// Unix seconds of the record's latest write on the advertising node.
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

fn is_false(v: &bool) -> bool {
    !v
}

/// `did -> stub` map returned by a peer's registry endpoint.
pub type RegistryMap = BTreeMap<String, RegistryEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_flags_default_off() {
        let entry: RegistryEntry = serde_json::from_str(
            r#"{"recordType":"post","creatorPubKey":"pk","lastUpdated":17}"#,
        )
        .unwrap();
        assert!(!entry.encrypted);
        assert!(!entry.deleted);

        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("deleted"));
    }

    #[test]
    fn tombstone_round_trip() {
        let entry = RegistryEntry {
            record_type: "post".into(),
            creator_pub_key: "pk".into(),
            last_updated: 17,
            encrypted: false,
            deleted: true,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["deleted"], true);
    }
}
