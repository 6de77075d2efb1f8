// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod http;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use oip_keys::{decrypt_envelope, encrypt_envelope, EnvelopeKey, Sealed};
use oip_record_data::envelope::{CipherBlob, Envelope};
use oip_record_data::registry::{RegistryEntry, RegistryMap, REGISTRY_SOUL};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("peer graph transport: {0}")]
    Network(String),
    #[error("unexpected peer graph response: {0}")]
    BadResponse(String),
    #[error("peer graph rejected put: {0}")]
    Rejected(String),
    #[error("envelope cipher: {0}")]
    Cipher(String),
}

/// The mutable peer graph, keyed by opaque souls.
///
/// `put(soul, None)` writes a JSON `null`, which is the graph's deletion
/// idiom; `get` distinguishes a missing soul (`Ok(None)`) from transport
/// failure.
#[async_trait]
pub trait PeerGraph: Send + Sync + 'static {
    async fn get(&self, soul: &str) -> Result<Option<Value>, GraphError>;

    async fn put(
        &self,
        soul: &str,
        data: Option<&Value>,
    ) -> Result<(), GraphError>;

    /// The peer's discovery registry.
    async fn registry(&self) -> Result<RegistryMap, GraphError>;
}

/// Fetch a soul and decode it as a record envelope.
pub async fn get_envelope<G: PeerGraph + ?Sized>(
    graph: &G,
    soul: &str,
) -> Result<Option<Envelope>, GraphError> {
    match graph.get(soul).await? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| GraphError::BadResponse(e.to_string())),
    }
}

pub async fn put_envelope<G: PeerGraph + ?Sized>(
    graph: &G,
    soul: &str,
    envelope: &Envelope,
) -> Result<(), GraphError> {
    let value = serde_json::to_value(envelope)
        .map_err(|e| GraphError::BadResponse(e.to_string()))?;
    graph.put(soul, Some(&value)).await
}

/// Tombstone a soul.
pub async fn delete_soul<G: PeerGraph + ?Sized>(
    graph: &G,
    soul: &str,
) -> Result<(), GraphError> {
    graph.put(soul, None).await
}

/// Merge one stub into the shared discovery registry. The graph merges
/// per key, so concurrent advertisers do not clobber each other.
pub async fn advertise<G: PeerGraph + ?Sized>(
    graph: &G,
    did: &str,
    entry: &RegistryEntry,
) -> Result<(), GraphError> {
    let mut partial = IndexMap::new();
    partial.insert(did.to_string(), entry);
    let value = serde_json::to_value(&partial)
        .map_err(|e| GraphError::BadResponse(e.to_string()))?;
    graph.put(REGISTRY_SOUL, Some(&value)).await
}

/// Encrypt an envelope's data section into wire cipher parts.
pub fn seal_data(
    key: &EnvelopeKey,
    data: &Value,
) -> Result<CipherBlob, GraphError> {
    let plaintext = serde_json::to_vec(data)
        .map_err(|e| GraphError::Cipher(e.to_string()))?;
    let sealed = encrypt_envelope(key, &plaintext)
        .map_err(|e| GraphError::Cipher(e.to_string()))?;

    Ok(CipherBlob {
        encrypted: BASE64_STANDARD.encode(sealed.ciphertext),
        iv: BASE64_STANDARD.encode(sealed.iv),
        tag: BASE64_STANDARD.encode(sealed.tag),
    })
}

/// Decrypt wire cipher parts back into the envelope's data section.
pub fn open_data(
    key: &EnvelopeKey,
    cipher: &CipherBlob,
) -> Result<Value, GraphError> {
    let decode = |s: &str| {
        BASE64_STANDARD
            .decode(s)
            .map_err(|e| GraphError::Cipher(e.to_string()))
    };
    let sealed = Sealed {
        iv: decode(&cipher.iv)?,
        ciphertext: decode(&cipher.encrypted)?,
        tag: decode(&cipher.tag)?,
    };

    let plaintext = decrypt_envelope(key, &sealed)
        .map_err(|e| GraphError::Cipher(e.to_string()))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| GraphError::Cipher(e.to_string()))
}

/// Bounded FIFO cache of souls the graph answered 404 for.
///
/// A hit means "known missing, recently": the client returns `None`
/// without touching the network. Entries expire after the TTL; when the
/// cache is full the oldest entry is evicted first.
pub struct MissCache {
    inner: Mutex<IndexMap<String, Instant>>,
    capacity: usize,
    ttl: Duration,
}

impl MissCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(IndexMap::new()),
            capacity,
            ttl,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }

    /// Whether the soul is known missing and the entry is still fresh.
    pub fn is_missing(&self, soul: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(soul) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                inner.shift_remove(soul);
                false
            }
            None => false,
        }
    }

    pub fn record_miss(&self, soul: &str) {
        let mut inner = self.inner.lock();
        inner.insert(soul.to_string(), Instant::now());
        while inner.len() > self.capacity {
            inner.shift_remove_index(0);
        }
    }

    /// A put makes the soul exist again.
    pub fn forget(&self, soul: &str) {
        self.inner.lock().shift_remove(soul);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_cache_hits_until_ttl() {
        let cache = MissCache::new(10, Duration::from_secs(60));
        assert!(!cache.is_missing("soul1"));

        cache.record_miss("soul1");
        assert!(cache.is_missing("soul1"));

        cache.forget("soul1");
        assert!(!cache.is_missing("soul1"));
    }

    #[test]
    fn miss_cache_expires_entries() {
        let cache = MissCache::new(10, Duration::from_millis(0));
        cache.record_miss("soul1");
        // ttl zero: the entry is already stale and gets pruned on lookup
        assert!(!cache.is_missing("soul1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn miss_cache_evicts_oldest_first() {
        let cache = MissCache::new(3, Duration::from_secs(60));
        for soul in ["a", "b", "c", "d"] {
            cache.record_miss(soul);
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.is_missing("a"), "oldest entry evicted");
        assert!(cache.is_missing("d"));
    }

    #[test]
    fn seal_open_round_trip() {
        let key = oip_keys::derive_organization_key("did:ledger:ORG");
        let data = serde_json::json!({"post": {"text": "for members"}});

        let blob = seal_data(&key, &data).unwrap();
        assert_ne!(blob.encrypted, data.to_string());

        let opened = open_data(&key, &blob).unwrap();
        assert_eq!(opened, data);
    }
}
