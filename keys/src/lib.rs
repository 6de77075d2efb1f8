// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Identity and cryptography for OIP nodes: BIP39/BIP32 key derivation,
//! creator DIDs, ECDSA record signatures (both the server-signed 0.8 and
//! the login-less client-signed 0.9 scheme), and the AES-256-GCM envelope
//! encryption used for private and organization records in the peer graph.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

mod derivation;
mod envelope;
mod signing;

pub use derivation::{
    creator_did_for_key, NodeIdentity, OIP_PURPOSE,
};
pub use envelope::{
    decrypt_envelope, derive_organization_key, derive_user_key,
    encrypt_envelope, EnvelopeKey, Sealed, USER_SALT_LEN,
};
pub use signing::{
    key_index_for_digest, payload_digest, sign_canonical, sign_message,
    verify_message, ClientSignature,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid recovery phrase")]
    InvalidMnemonicPhrase,
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid extended public key")]
    InvalidXpub,
    #[error("signature verification failed")]
    BadSignature,
    #[error("malformed signature encoding")]
    MalformedSignature,
    #[error("envelope decryption failed")]
    Decryption,
    #[error("malformed ciphertext encoding")]
    MalformedCiphertext,
}

impl From<bip32::Error> for KeyError {
    fn from(e: bip32::Error) -> Self {
        KeyError::Derivation(e.to_string())
    }
}
