// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! In-memory ledger and peer-graph doubles for service and scenario
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use oip_record_data::canonical::canonical_digest;
use oip_record_data::registry::{RegistryMap, REGISTRY_SOUL};

use crate::ledger::{ItemKind, LedgerApi, LedgerError, LedgerItem, Tag};
use crate::peergraph::{GraphError, PeerGraph};

/// A deterministic in-memory ledger.
///
/// Submissions derive their transaction id from the payload content, so
/// publishing the same record twice lands on the same did.
#[derive(Clone, Default)]
pub struct MockLedger {
    inner: Arc<MockLedgerInner>,
}

#[derive(Default)]
struct MockLedgerInner {
    items: Mutex<Vec<LedgerItem>>,
    submitted: Mutex<Vec<(ItemKind, Value, Vec<Tag>)>>,
    fail_transport: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_item(&self, item: LedgerItem) {
        self.inner.items.lock().push(item);
    }

    pub fn submitted(&self) -> Vec<(ItemKind, Value, Vec<Tag>)> {
        self.inner.submitted.lock().clone()
    }

    pub fn set_fail_transport(&self, fail: bool) {
        self.inner.fail_transport.store(fail, Ordering::SeqCst);
    }

    pub fn tx_id_for(payload: &Value) -> String {
        hex::encode(canonical_digest(payload))[..12].to_string()
    }

    /// Mirror a submission back as a confirmed ledger item, the way the
    /// chain would surface it to readers.
    pub fn confirm_submissions_at(&self, block: u64) {
        let submitted = self.inner.submitted.lock().clone();
        let mut items = self.inner.items.lock();
        for (position, (kind, payload, tags)) in
            submitted.into_iter().enumerate()
        {
            let tx_id = Self::tx_id_for(&payload);
            if items.iter().any(|i| i.tx_id == tx_id) {
                continue;
            }
            items.push(LedgerItem {
                block,
                position: position as u32,
                tx_id,
                kind,
                raw: payload,
                tags,
            });
        }
    }
}

#[async_trait]
impl LedgerApi for MockLedger {
    async fn tip(&self) -> Result<u64, LedgerError> {
        if self.inner.fail_transport.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("mock down".into()));
        }
        Ok(self
            .inner
            .items
            .lock()
            .iter()
            .map(|i| i.block)
            .max()
            .unwrap_or(0))
    }

    async fn query(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerItem>, LedgerError> {
        if self.inner.fail_transport.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("mock down".into()));
        }
        let mut items: Vec<LedgerItem> = self
            .inner
            .items
            .lock()
            .iter()
            .filter(|i| i.block >= from && i.block <= to)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.block, i.position));
        Ok(items)
    }

    async fn submit(
        &self,
        kind: ItemKind,
        payload: &Value,
        tags: &[Tag],
    ) -> Result<String, LedgerError> {
        if self.inner.fail_transport.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("mock down".into()));
        }
        self.inner.submitted.lock().push((
            kind,
            payload.clone(),
            tags.to_vec(),
        ));
        Ok(Self::tx_id_for(payload))
    }
}

/// An in-memory peer graph with the registry's merge-per-key semantics.
#[derive(Clone, Default)]
pub struct MockGraph {
    inner: Arc<MockGraphInner>,
}

#[derive(Default)]
struct MockGraphInner {
    souls: Mutex<HashMap<String, Value>>,
    gets: AtomicUsize,
    fail_gets: AtomicBool,
}

impl MockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soul(&self, soul: &str) -> Option<Value> {
        self.inner.souls.lock().get(soul).cloned()
    }

    pub fn insert_raw(&self, soul: &str, value: Value) {
        self.inner.souls.lock().insert(soul.to_string(), value);
    }

    /// How many network `get`s the graph has served.
    pub fn get_count(&self) -> usize {
        self.inner.gets.load(Ordering::SeqCst)
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.inner.fail_gets.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerGraph for MockGraph {
    async fn get(&self, soul: &str) -> Result<Option<Value>, GraphError> {
        self.inner.gets.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_gets.load(Ordering::SeqCst) {
            return Err(GraphError::Network("mock down".into()));
        }
        Ok(self.inner.souls.lock().get(soul).cloned())
    }

    async fn put(
        &self,
        soul: &str,
        data: Option<&Value>,
    ) -> Result<(), GraphError> {
        let mut souls = self.inner.souls.lock();
        match data {
            None => {
                souls.insert(soul.to_string(), Value::Null);
            }
            Some(value) => {
                // the graph merges objects per key instead of replacing
                let merged = match (souls.get(soul), value) {
                    (
                        Some(Value::Object(existing)),
                        Value::Object(update),
                    ) => {
                        let mut merged = existing.clone();
                        for (k, v) in update {
                            merged.insert(k.clone(), v.clone());
                        }
                        Value::Object(merged)
                    }
                    _ => value.clone(),
                };
                souls.insert(soul.to_string(), merged);
            }
        }
        Ok(())
    }

    async fn registry(&self) -> Result<RegistryMap, GraphError> {
        match self.inner.souls.lock().get(REGISTRY_SOUL) {
            None => Ok(RegistryMap::new()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| GraphError::BadResponse(e.to_string())),
        }
    }
}
