// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use oip_record_data::canonical::to_canonical_string;

use crate::derivation::record_verifying_key;
use crate::KeyError;

/// Domain prefix mixed into the `KeyIndex` digest.
const KEY_INDEX_DOMAIN: &str = "oip:";

/// `base64url(SHA256(canonicalJson(payload)))`.
pub fn payload_digest(payload: &Value) -> String {
    let digest = Sha256::digest(to_canonical_string(payload).as_bytes());
    BASE64_URL_SAFE_NO_PAD.encode(digest)
}

/// `uint31(SHA256("oip:" + digest))`: the first four digest bytes as a
/// big-endian integer with the sign bit cleared. Always a valid
/// non-hardened BIP32 child index.
pub fn key_index_for_digest(digest: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(KEY_INDEX_DOMAIN.as_bytes());
    hasher.update(digest.as_bytes());
    let out = hasher.finalize();

    u32::from_be_bytes([out[0], out[1], out[2], out[3]]) & 0x7fff_ffff
}

/// Sign raw message bytes; fixed-size signature, base64url-encoded.
pub fn sign_message(key: &SigningKey, message: &[u8]) -> String {
    let signature: Signature = key.sign(message);
    BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
}

/// Sign the canonical JSON of a payload.
pub fn sign_canonical(key: &SigningKey, payload: &Value) -> String {
    sign_message(key, to_canonical_string(payload).as_bytes())
}

/// Verify a base64url signature over raw message bytes.
pub fn verify_message(
    key: &VerifyingKey,
    message: &[u8],
    signature: &str,
) -> Result<(), KeyError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| KeyError::MalformedSignature)?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|_| KeyError::MalformedSignature)?;

    key.verify(message, &signature)
        .map_err(|_| KeyError::BadSignature)
}

/// The client-signed (v0.9, login-less) publish attestation.
///
/// The client never shares a key with the node: it signs the payload with
/// a child of its account xpub, chosen by the payload digest itself, and
/// ships the four tag values. The node re-computes both digest and index
/// before trusting either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSignature {
    #[serde(rename = "creator")]
    pub creator_did: String,
    #[serde(rename = "creatorSig")]
    pub creator_sig: String,
    #[serde(rename = "payloadDigest")]
    pub payload_digest: String,
    #[serde(rename = "keyIndex")]
    pub key_index: u32,
}

impl ClientSignature {
    /// Produce the attestation for a payload, client-side.
    pub fn over(
        payload: &Value,
        creator_did: String,
        account: &crate::NodeIdentity,
    ) -> Result<Self, KeyError> {
        let digest = payload_digest(payload);
        let key_index = key_index_for_digest(&digest);
        let key = account.record_signing_key(key_index)?;
        let creator_sig =
            sign_message(&key, to_canonical_string(payload).as_bytes());

        Ok(Self {
            creator_did,
            creator_sig,
            payload_digest: digest,
            key_index,
        })
    }

    /// Verify the attestation against the payload and the creator's
    /// account xpub (from their DID document). Every check must pass;
    /// any failure means the payload is not submitted.
    pub fn verify(
        &self,
        payload: &Value,
        account_xpub: &str,
    ) -> Result<(), KeyError> {
        let digest = payload_digest(payload);
        if digest != self.payload_digest {
            return Err(KeyError::BadSignature);
        }

        let key_index = key_index_for_digest(&digest);
        if key_index != self.key_index {
            return Err(KeyError::BadSignature);
        }

        let key = record_verifying_key(account_xpub, key_index)?;
        verify_message(
            &key,
            to_canonical_string(payload).as_bytes(),
            &self.creator_sig,
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::NodeIdentity;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon \
                          abandon abandon abandon abandon abandon about";

    #[test]
    fn digest_ignores_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(payload_digest(&a), payload_digest(&b));
    }

    #[test]
    fn key_index_is_31_bit() {
        for digest in ["x", "y", "a-longer-digest-value"] {
            assert!(key_index_for_digest(digest) < (1 << 31));
        }
        // stable across calls
        assert_eq!(key_index_for_digest("x"), key_index_for_digest("x"));
    }

    #[test]
    fn sign_verify_round_trip() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let payload = json!({"basic": {"name": "Draft"}});

        let sig = sign_canonical(id.signing_key(), &payload);
        verify_message(
            &id.verifying_key(),
            to_canonical_string(&payload).as_bytes(),
            &sig,
        )
        .unwrap();
    }

    #[test]
    fn client_signature_round_trip() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let payload = json!({"post": {"text": "hello"}});

        let attestation = ClientSignature::over(
            &payload,
            id.creator_did().to_string(),
            &id,
        )
        .unwrap();

        attestation.verify(&payload, &id.account_xpub()).unwrap();
    }

    #[test]
    fn one_byte_alteration_is_rejected() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let payload = json!({"post": {"text": "hello"}});
        let attestation = ClientSignature::over(
            &payload,
            id.creator_did().to_string(),
            &id,
        )
        .unwrap();

        let altered = json!({"post": {"text": "hellp"}});
        assert!(attestation.verify(&altered, &id.account_xpub()).is_err());
    }

    #[test]
    fn tampered_key_index_is_rejected() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let payload = json!({"post": {"text": "hello"}});
        let mut attestation = ClientSignature::over(
            &payload,
            id.creator_did().to_string(),
            &id,
        )
        .unwrap();

        attestation.key_index ^= 1;
        assert!(attestation.verify(&payload, &id.account_xpub()).is_err());
    }

    #[test]
    fn wrong_xpub_is_rejected() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let other =
            NodeIdentity::from_mnemonic_account(PHRASE, 1).unwrap();
        let payload = json!({"post": {"text": "hello"}});
        let attestation = ClientSignature::over(
            &payload,
            id.creator_did().to_string(),
            &id,
        )
        .unwrap();

        assert!(attestation
            .verify(&payload, &other.account_xpub())
            .is_err());
    }
}
