// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use bip32::{ChildNumber, DerivationPath, Prefix, XPrv, XPub};
use bip39::{Language, Mnemonic, MnemonicType, Seed};
use k256::ecdsa::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use oip_record_data::did::Did;

use crate::KeyError;

/// The BIP44-style purpose level reserved for OIP keys.
pub const OIP_PURPOSE: u32 = 176800;

/// A node's signing identity, derived from a BIP39 recovery phrase.
///
/// The identity key lives at `m/176800'/0'/0'/0/0` and names the creator:
/// `creatorDid = did:ledger:base64url(SHA256(publicKey))`. Record-signing
/// keys are children of the account node `m/176800'/0'/<account>'`, so a
/// verifier holding only the account xpub can re-derive any record key
/// from its 31-bit `KeyIndex`.
pub struct NodeIdentity {
    identity: XPrv,
    account: XPrv,
}

impl NodeIdentity {
    /// Derive the identity from a recovery phrase, account 0.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, KeyError> {
        Self::from_mnemonic_account(phrase, 0)
    }

    pub fn from_mnemonic_account(
        phrase: &str,
        account: u32,
    ) -> Result<Self, KeyError> {
        let mnemonic = Mnemonic::from_phrase(phrase, Language::English)
            .map_err(|_| KeyError::InvalidMnemonicPhrase)?;
        let seed = Zeroizing::new(Seed::new(&mnemonic, "").as_bytes().to_vec());

        let identity_path: DerivationPath =
            format!("m/{OIP_PURPOSE}'/0'/0'/0/0")
                .parse()
                .map_err(|_| KeyError::InvalidMnemonicPhrase)?;
        let identity = XPrv::derive_from_path(&seed, &identity_path)?;

        let account_path: DerivationPath =
            format!("m/{OIP_PURPOSE}'/0'/{account}'")
                .parse()
                .map_err(|_| KeyError::InvalidMnemonicPhrase)?;
        let account = XPrv::derive_from_path(&seed, &account_path)?;

        Ok(Self { identity, account })
    }

    /// Generate a fresh 12-word phrase. The caller owns persisting it.
    pub fn generate_phrase() -> String {
        Mnemonic::new(MnemonicType::Words12, Language::English)
            .phrase()
            .to_string()
    }

    pub fn signing_key(&self) -> &SigningKey {
        self.identity.private_key()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.identity.public_key().public_key()
    }

    /// Compressed SEC1 public key, hex-encoded. This is the `pubKey` that
    /// travels in record metadata and soul names.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_sec1_bytes())
    }

    /// Short address form of the public key, used for creator filtering.
    pub fn address(&self) -> String {
        let digest = Sha256::digest(self.verifying_key().to_sec1_bytes());
        hex::encode(&digest[..20])
    }

    pub fn creator_did(&self) -> Did {
        creator_did_for_key(&self.verifying_key())
    }

    /// The account-level extended public key, `xpub...` encoded. Published
    /// in the creator's DID document for client-signed verification.
    pub fn account_xpub(&self) -> String {
        self.account.public_key().to_string(Prefix::XPUB)
    }

    /// Record-signing child at a (non-hardened) 31-bit key index.
    pub fn record_signing_key(
        &self,
        key_index: u32,
    ) -> Result<SigningKey, KeyError> {
        let child = ChildNumber::new(key_index, false)?;
        Ok(self.account.derive_child(child)?.private_key().clone())
    }
}

/// Derive the creator DID of a public key.
pub fn creator_did_for_key(key: &VerifyingKey) -> Did {
    let digest = Sha256::digest(key.to_sec1_bytes());
    Did::ledger(BASE64_URL_SAFE_NO_PAD.encode(digest))
}

/// Re-derive a record verifying key from an account xpub and a key index.
pub fn record_verifying_key(
    account_xpub: &str,
    key_index: u32,
) -> Result<VerifyingKey, KeyError> {
    let xpub: XPub =
        account_xpub.parse().map_err(|_| KeyError::InvalidXpub)?;
    let child = ChildNumber::new(key_index, false)?;
    Ok(*xpub.derive_child(child)?.public_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon \
                          abandon abandon abandon abandon abandon about";

    #[test]
    fn derivation_is_deterministic() {
        let a = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let b = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        assert_eq!(a.creator_did(), b.creator_did());
        assert_eq!(a.account_xpub(), b.account_xpub());
    }

    #[test]
    fn creator_did_shape() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let did = id.creator_did();
        assert_eq!(did.to_string().split(':').nth(1), Some("ledger"));
        // base64url of a sha256 digest, unpadded
        assert_eq!(did.id().len(), 43);
        assert!(!did.id().contains('='));
    }

    #[test]
    fn xpub_rederives_record_keys() {
        let id = NodeIdentity::from_mnemonic(PHRASE).unwrap();
        let xpub = id.account_xpub();

        for key_index in [0u32, 1, 0x7fff_ffff] {
            let sk = id.record_signing_key(key_index).unwrap();
            let pk = record_verifying_key(&xpub, key_index).unwrap();
            assert_eq!(sk.verifying_key(), &pk);
        }
    }

    #[test]
    fn bad_phrase_is_rejected() {
        assert!(matches!(
            NodeIdentity::from_mnemonic("not a phrase"),
            Err(KeyError::InvalidMnemonicPhrase)
        ));
    }

    #[test]
    fn accounts_are_independent() {
        let a = NodeIdentity::from_mnemonic_account(PHRASE, 0).unwrap();
        let b = NodeIdentity::from_mnemonic_account(PHRASE, 1).unwrap();
        assert_ne!(a.account_xpub(), b.account_xpub());
        // the identity key is account-independent
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }
}
