// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::SystemMeta;

/// The ciphertext parts of an encrypted envelope, all base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherBlob {
    pub encrypted: String,
    pub iv: String,
    pub tag: String,
}

/// What a soul resolves to in the peer graph.
///
/// Exactly one of `data` (plaintext) or `cipher` (AES-GCM parts) is
/// present; `oip.encrypted` mirrors which. Deleting a soul writes a JSON
/// `null` in its place, which the client layer surfaces as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    pub oip: SystemMeta,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<Value>,
    #[serde(flatten, default)]
    pub cipher: Option<CipherBlob>,
}

impl Envelope {
    pub fn plaintext(data: Value, oip: SystemMeta) -> Self {
        Self {
            data: Some(data),
            oip,
            meta: None,
            cipher: None,
        }
    }

    pub fn encrypted(cipher: CipherBlob, mut oip: SystemMeta) -> Self {
        oip.encrypted = true;
        Self {
            data: None,
            oip,
            meta: None,
            cipher: Some(cipher),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;
    use crate::did::{Did, RecordStorage};
    use crate::record::{Creator, VER_SERVER_SIGNED};

    fn meta() -> SystemMeta {
        SystemMeta {
            did: Did::peer("oip:records:pk:local"),
            legacy_id: None,
            record_type: "post".into(),
            storage: RecordStorage::Peer,
            indexed_at: DateTime::UNIX_EPOCH,
            block_height: None,
            creator: Creator {
                pub_key: "pk".into(),
                address: "addr".into(),
            },
            signature: None,
            access: None,
            encrypted: false,
            ver: VER_SERVER_SIGNED.into(),
        }
    }

    #[test]
    fn cipher_parts_flatten_onto_the_envelope() {
        let env = Envelope::encrypted(
            CipherBlob {
                encrypted: "Y3Q=".into(),
                iv: "aXY=".into(),
                tag: "dGFn".into(),
            },
            meta(),
        );
        assert!(env.is_encrypted());

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["encrypted"], "Y3Q=");
        assert_eq!(json["iv"], "aXY=");
        assert_eq!(json["tag"], "dGFn");
        assert_eq!(json["oip"]["encrypted"], true);
        assert!(json.get("data").is_none());

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn plaintext_envelope_has_no_cipher_keys() {
        let env = Envelope::plaintext(json!({"post": {"text": "hi"}}), meta());
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("iv").is_none());
        assert_eq!(json["data"]["post"]["text"], "hi");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert!(!back.is_encrypted());
    }
}
