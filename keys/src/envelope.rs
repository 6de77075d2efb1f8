// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use aes_gcm::aead::Aead;
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::KeyError;

/// Length of the per-user random salt generated at registration.
pub const USER_SALT_LEN: usize = 32;

const PBKDF2_ROUNDS: u32 = 100_000;
const USER_DOMAIN: &[u8] = b"oip-gun-encryption";
const ORG_DOMAIN: &[u8] = b"oip-organization-encryption";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A derived AES-256-GCM envelope key. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; 32]);

impl AsRef<[u8]> for EnvelopeKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Derive the per-user envelope key: PBKDF2-HMAC-SHA256 over the owner's
/// public key concatenated with their registration salt. The salt is only
/// retrievable by the owner, so only the owner (on any node) can derive
/// this key.
pub fn derive_user_key(owner_pub_key: &str, salt: &[u8]) -> EnvelopeKey {
    let mut password =
        Vec::with_capacity(owner_pub_key.len() + salt.len());
    password.extend_from_slice(owner_pub_key.as_bytes());
    password.extend_from_slice(salt);

    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&password, USER_DOMAIN, PBKDF2_ROUNDS, &mut out);
    password.zeroize();
    EnvelopeKey(out)
}

/// Derive the organization envelope key from the organization DID alone.
///
/// Deliberately a function of public data: every node can decrypt and
/// index organization records; visibility is enforced at query time, not
/// by the key.
pub fn derive_organization_key(organization_did: &str) -> EnvelopeKey {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        organization_did.as_bytes(),
        ORG_DOMAIN,
        PBKDF2_ROUNDS,
        &mut out,
    );
    EnvelopeKey(out)
}

/// The raw parts of an encrypted envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Encrypt an envelope body under a derived key; fresh random nonce.
pub fn encrypt_envelope(
    key: &EnvelopeKey,
    plaintext: &[u8],
) -> Result<Sealed, KeyError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let nonce = Aes256Gcm::generate_nonce(OsRng);

    let mut combined = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| KeyError::Decryption)?;

    // the aead output is ciphertext || tag; the wire carries them apart
    let tag = combined.split_off(combined.len() - TAG_LEN);
    Ok(Sealed {
        iv: nonce.to_vec(),
        ciphertext: combined,
        tag,
    })
}

/// Decrypt an envelope body. Fails closed on any mismatch.
pub fn decrypt_envelope(
    key: &EnvelopeKey,
    sealed: &Sealed,
) -> Result<Vec<u8>, KeyError> {
    if sealed.iv.len() != NONCE_LEN || sealed.tag.len() != TAG_LEN {
        return Err(KeyError::MalformedCiphertext);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let nonce = Nonce::from_slice(&sealed.iv);

    let mut combined =
        Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);

    cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| KeyError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn encrypt_and_decrypt() {
        let mut salt = [0u8; USER_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key = derive_user_key("02abc", &salt);

        let sealed = encrypt_envelope(&key, b"secret body").unwrap();
        assert_eq!(sealed.iv.len(), NONCE_LEN);
        assert_eq!(sealed.tag.len(), TAG_LEN);

        let plain = decrypt_envelope(&key, &sealed).unwrap();
        assert_eq!(plain, b"secret body");
    }

    #[test]
    fn random_nonce_is_applied() {
        let key = derive_organization_key("did:ledger:ORG");
        let a = encrypt_envelope(&key, b"same").unwrap();
        let b = encrypt_envelope(&key, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn organization_key_is_deterministic_across_nodes() {
        // derived from the public DID alone; no shared secret involved
        let n1 = derive_organization_key("did:ledger:ORG");
        let n2 = derive_organization_key("did:ledger:ORG");

        let sealed = encrypt_envelope(&n1, b"org data").unwrap();
        assert_eq!(decrypt_envelope(&n2, &sealed).unwrap(), b"org data");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let key = derive_user_key("02abc", &[1u8; USER_SALT_LEN]);
        let other = derive_user_key("02abc", &[2u8; USER_SALT_LEN]);

        let sealed = encrypt_envelope(&key, b"secret").unwrap();
        assert!(matches!(
            decrypt_envelope(&other, &sealed),
            Err(KeyError::Decryption)
        ));
    }

    #[test]
    fn tampered_tag_fails_closed() {
        let key = derive_organization_key("did:ledger:ORG");
        let mut sealed = encrypt_envelope(&key, b"secret").unwrap();
        sealed.tag[0] ^= 0xff;
        assert!(decrypt_envelope(&key, &sealed).is_err());
    }
}
