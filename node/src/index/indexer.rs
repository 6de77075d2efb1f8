// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The ingestion transaction.
//!
//! Every record and template, whichever stream produced it, commits
//! through here: template-directory lookup, codec validation, idempotency
//! on `(did, signature)`, and the pending buffer that holds records whose
//! template has not arrived yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use oip_record_data::codec::{self, CodecError};
use oip_record_data::did::{Did, RecordStorage};
use oip_record_data::record::{Creator, Record, SystemMeta};
use oip_record_data::template::TemplateDirectory;

use crate::events::{EventBus, RecordEvent};
use crate::index::store::{SearchStore, StoreError, StoredRecord};
use crate::index::{
    IndexError, IngestItem, IngestOutcome, LedgerRecordMeta,
    LEDGER_CHECKPOINT,
};

/// Store write retry policy: jittered exponential backoff.
const WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

struct IngestState {
    /// Records parked until their template commits, keyed by the missing
    /// template's name or did string.
    pending: HashMap<String, Vec<IngestItem>>,
    /// Highest fully committed ledger block.
    ledger_checkpoint: i64,
    /// Once an item is parked in the dead-letter queue the checkpoint no
    /// longer advances; a restart replays the stream from the parked
    /// block and ingestion is idempotent.
    checkpoint_frozen: bool,
}

/// The single committer of the search store.
pub struct Indexer {
    store: SearchStore,
    directory: Arc<RwLock<TemplateDirectory>>,
    state: Mutex<IngestState>,
    events: EventBus,
}

impl Indexer {
    /// Open the indexer over a store, warming the template directory from
    /// previously committed templates.
    pub async fn new(
        store: SearchStore,
        events: EventBus,
    ) -> Result<Self, IndexError> {
        let mut directory = TemplateDirectory::new();
        for template in store.templates().await? {
            directory.insert(template);
        }
        info!(
            event = "indexer_started",
            templates = directory.len(),
        );

        let ledger_checkpoint =
            store.checkpoint(LEDGER_CHECKPOINT).await?.unwrap_or(0);

        Ok(Self {
            store,
            directory: Arc::new(RwLock::new(directory)),
            state: Mutex::new(IngestState {
                pending: HashMap::new(),
                ledger_checkpoint,
                checkpoint_frozen: false,
            }),
            events,
        })
    }

    /// The shared template directory; reads take a snapshot lock, only
    /// this indexer writes.
    pub fn directory(&self) -> Arc<RwLock<TemplateDirectory>> {
        self.directory.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &SearchStore {
        &self.store
    }

    /// Ingest one item. Items are serialized: there is exactly one
    /// committer per index, so mapping updates and document writes never
    /// interleave.
    pub async fn ingest(
        &self,
        item: IngestItem,
    ) -> Result<IngestOutcome, IndexError> {
        let mut state = self.state.lock().await;
        self.process(&mut state, item).await
    }

    async fn process(
        &self,
        state: &mut IngestState,
        item: IngestItem,
    ) -> Result<IngestOutcome, IndexError> {
        match item {
            IngestItem::Template { template, block } => {
                if let Err(e) = template.check() {
                    warn!(
                        event = "template_dropped",
                        template = %template.name,
                        reason = %e,
                    );
                    return Ok(IngestOutcome::Dropped(e.to_string()));
                }

                let payload = json!({"template": &template});
                if let Err(e) =
                    self.write_retried(|| self.store.put_template(&template)).await
                {
                    return self
                        .park(state, Some(template.did.clone()), payload, e)
                        .await;
                }

                self.directory.write().insert(template.clone());
                self.events.publish(RecordEvent::TemplateCommitted {
                    did: template.did.clone(),
                    name: template.name.clone(),
                });
                info!(
                    event = "template_committed",
                    did = %template.did,
                    name = %template.name,
                );
                self.advance_checkpoint(state, block).await?;

                // flush whatever was waiting on this template
                let mut drained = Vec::new();
                for key in [template.name.clone(), template.did.to_string()] {
                    if let Some(items) = state.pending.remove(&key) {
                        drained.extend(items);
                    }
                }
                for item in drained {
                    let outcome = self.process_record(state, item).await?;
                    debug!(event = "pending_drained", outcome = ?outcome);
                }

                Ok(IngestOutcome::Committed(template.did))
            }
            other => self.process_record(state, other).await,
        }
    }

    async fn process_record(
        &self,
        state: &mut IngestState,
        item: IngestItem,
    ) -> Result<IngestOutcome, IndexError> {
        match item {
            IngestItem::LedgerRecord { compressed, meta } => {
                let expanded = {
                    let directory = self.directory.read();
                    codec::expand(&compressed, &directory)
                };
                match expanded {
                    Ok(data) => {
                        let block = meta.block;
                        let record = match build_ledger_record(data, &meta) {
                            Ok(r) => r,
                            Err(reason) => {
                                warn!(
                                    event = "record_dropped",
                                    tx_id = %meta.tx_id,
                                    reason = %reason,
                                );
                                self.advance_checkpoint(state, Some(block))
                                    .await?;
                                return Ok(IngestOutcome::Dropped(reason));
                            }
                        };
                        let outcome =
                            self.commit_record(state, record, compressed).await?;
                        if outcome.advances_stream() {
                            self.advance_checkpoint(state, Some(block)).await?;
                        }
                        Ok(outcome)
                    }
                    Err(CodecError::UnknownTemplate(key)) => {
                        debug!(
                            event = "record_parked",
                            tx_id = %meta.tx_id,
                            missing_template = %key,
                        );
                        state
                            .pending
                            .entry(key)
                            .or_default()
                            .push(IngestItem::LedgerRecord { compressed, meta });
                        Ok(IngestOutcome::Parked)
                    }
                    Err(e) => {
                        warn!(
                            event = "record_dropped",
                            tx_id = %meta.tx_id,
                            reason = %e,
                        );
                        self.advance_checkpoint(state, Some(meta.block)).await?;
                        Ok(IngestOutcome::Dropped(e.to_string()))
                    }
                }
            }

            IngestItem::Record { record } => {
                let validated = {
                    let directory = self.directory.read();
                    codec::validate(&record.data, &directory)
                };
                match validated {
                    Ok(()) => {
                        let raw = record.data.to_json();
                        self.commit_record(state, record, raw).await
                    }
                    Err(CodecError::UnknownTemplate(key)) => {
                        debug!(
                            event = "record_parked",
                            did = %record.oip.did,
                            missing_template = %key,
                        );
                        state
                            .pending
                            .entry(key)
                            .or_default()
                            .push(IngestItem::Record { record });
                        Ok(IngestOutcome::Parked)
                    }
                    Err(e) => {
                        warn!(
                            event = "record_dropped",
                            did = %record.oip.did,
                            reason = %e,
                        );
                        Ok(IngestOutcome::Dropped(e.to_string()))
                    }
                }
            }

            IngestItem::Deletion { did, block } => {
                let removed = self.store.remove_record(&did.to_string()).await?;
                self.store
                    .append_deletion(&did.to_string(), Utc::now().timestamp())
                    .await?;
                if removed {
                    info!(event = "record_deleted", did = %did);
                }
                self.events
                    .publish(RecordEvent::Deleted { did: did.clone() });
                self.advance_checkpoint(state, block).await?;
                Ok(IngestOutcome::Deleted(did))
            }

            IngestItem::Template { .. } => unreachable!("handled by process"),
        }
    }

    /// Idempotency gate plus the actual document write.
    async fn commit_record(
        &self,
        state: &mut IngestState,
        record: Record,
        raw: Value,
    ) -> Result<IngestOutcome, IndexError> {
        let did = record.oip.did.clone();
        let existing = self.store.get_record(&did.to_string()).await?;

        let replaced = match &existing {
            None => false,
            Some(existing) => {
                if existing.signature == record.oip.signature {
                    debug!(event = "record_duplicate", did = %did);
                    return Ok(IngestOutcome::AlreadyCommitted(did));
                }
                // peer records are mutable in place; ledger records only
                // move forward with the chain
                let newer_block = record
                    .oip
                    .block_height
                    .map(|h| h as i64)
                    .zip(existing.block_height)
                    .map(|(new, old)| new > old)
                    .unwrap_or(record.oip.block_height.is_some());
                if record.oip.storage != RecordStorage::Peer && !newer_block {
                    return Ok(IngestOutcome::Dropped(
                        "stale ledger replacement".into(),
                    ));
                }
                true
            }
        };

        let stored = StoredRecord::from_record(&record)?;
        if let Err(e) =
            self.write_retried(|| self.store.upsert_record(&stored)).await
        {
            return self.park(state, Some(did), raw, e).await;
        }

        self.events.publish(RecordEvent::Committed {
            did: did.clone(),
            record_type: record.oip.record_type.clone(),
            storage: record.oip.storage,
        });
        info!(
            event = "record_committed",
            did = %did,
            record_type = %record.oip.record_type,
            replaced,
        );

        if replaced {
            Ok(IngestOutcome::Replaced(did))
        } else {
            Ok(IngestOutcome::Committed(did))
        }
    }

    /// Dead-letter a persistently failing item and freeze the checkpoint.
    async fn park(
        &self,
        state: &mut IngestState,
        did: Option<Did>,
        payload: Value,
        error: StoreError,
    ) -> Result<IngestOutcome, IndexError> {
        warn!(
            event = "dead_letter",
            did = did.as_ref().map(ToString::to_string),
            reason = %error,
        );
        state.checkpoint_frozen = true;

        let did_str = did.as_ref().map(ToString::to_string);
        self.store
            .park_dead_letter(
                did_str.as_deref(),
                &error.to_string(),
                &payload,
                Utc::now().timestamp(),
            )
            .await?;

        Ok(IngestOutcome::Failed(error.to_string()))
    }

    async fn advance_checkpoint(
        &self,
        state: &mut IngestState,
        block: Option<u64>,
    ) -> Result<(), IndexError> {
        let Some(block) = block else { return Ok(()) };
        let block = block as i64;

        if state.checkpoint_frozen || block <= state.ledger_checkpoint {
            return Ok(());
        }

        self.store.set_checkpoint(LEDGER_CHECKPOINT, block).await?;
        state.ledger_checkpoint = block;
        Ok(())
    }

    async fn write_retried<F, Fut>(&self, mut op: F) -> Result<(), StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < WRITE_ATTEMPTS => {
                    attempt += 1;
                    let backoff = BACKOFF_BASE
                        .saturating_mul(1 << attempt)
                        .min(BACKOFF_CAP)
                        + jitter();
                    warn!(
                        event = "store_write_retry",
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %e,
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Assemble the system metadata for a record lifted off the ledger.
fn build_ledger_record(
    data: oip_record_data::record::RecordData,
    meta: &LedgerRecordMeta,
) -> Result<Record, String> {
    let record_type = data
        .iter()
        .next()
        .map(|(name, _)| name.clone())
        .ok_or_else(|| "record has no sections".to_string())?;

    let pub_key = meta.creator_pub_key.clone().unwrap_or_default();
    let address = if pub_key.is_empty() {
        String::new()
    } else {
        derive_address(&pub_key)
    };

    Ok(Record {
        oip: SystemMeta {
            did: Did::ledger(&meta.tx_id),
            legacy_id: Some(meta.tx_id.clone()),
            record_type,
            storage: RecordStorage::Ledger,
            indexed_at: Utc::now(),
            block_height: Some(meta.block),
            creator: Creator { pub_key, address },
            signature: meta.signature.clone(),
            access: meta.access.clone(),
            encrypted: false,
            ver: meta.ver.clone(),
        },
        data,
    })
}

/// Short address of a (hex) public key: first 20 bytes of its SHA-256.
pub fn derive_address(pub_key: &str) -> String {
    let bytes = hex::decode(pub_key)
        .unwrap_or_else(|_| pub_key.as_bytes().to_vec());
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..20])
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use oip_record_data::record::RecordData;
    use oip_record_data::template::{FieldDef, FieldKind, Template};

    fn template(name: &str, did: &str) -> Template {
        let mut fields = IndexMap::new();
        fields.insert("name".to_string(), FieldDef::new(0, FieldKind::String));
        fields.insert(
            "text".to_string(),
            FieldDef::new(1, FieldKind::String),
        );
        Template {
            did: did.parse().unwrap(),
            name: name.into(),
            creator_did: "did:ledger:creator".parse().unwrap(),
            fields,
            created_height: 1,
            signature: None,
            creator_pub_key: "pk".into(),
        }
    }

    fn ledger_meta(tx_id: &str, block: u64, sig: &str) -> LedgerRecordMeta {
        LedgerRecordMeta {
            tx_id: tx_id.into(),
            block,
            creator_did: None,
            creator_pub_key: Some("02ab".into()),
            signature: Some(sig.into()),
            ver: "0.8.0".into(),
            access: None,
        }
    }

    async fn indexer() -> Indexer {
        let store = SearchStore::open_in_memory().await.unwrap();
        Indexer::new(store, EventBus::new()).await.unwrap()
    }

    #[tokio::test]
    async fn record_waits_for_its_template() {
        let idx = indexer().await;

        let compressed = json!([{"0": "Draft", "t": "did:ledger:tmpl-post"}]);
        let outcome = idx
            .ingest(IngestItem::LedgerRecord {
                compressed,
                meta: ledger_meta("tx1", 10, "sig1"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Parked);
        assert!(idx.store().get_record("did:ledger:tx1").await.unwrap().is_none());
        // a parked record does not advance the checkpoint
        assert_eq!(
            idx.store().checkpoint(LEDGER_CHECKPOINT).await.unwrap(),
            None
        );

        // the template arrives; the pending buffer drains
        idx.ingest(IngestItem::Template {
            template: template("post", "did:ledger:tmpl-post"),
            block: Some(11),
        })
        .await
        .unwrap();

        let row = idx
            .store()
            .get_record("did:ledger:tx1")
            .await
            .unwrap()
            .expect("drained after template commit");
        assert_eq!(row.record_type, "post");
        assert_eq!(row.name, "Draft");
        assert_eq!(
            idx.store().checkpoint(LEDGER_CHECKPOINT).await.unwrap(),
            Some(11)
        );
    }

    #[tokio::test]
    async fn duplicate_signature_is_idempotent() {
        let idx = indexer().await;
        idx.ingest(IngestItem::Template {
            template: template("post", "did:ledger:tmpl-post"),
            block: Some(1),
        })
        .await
        .unwrap();

        let compressed = json!([{"0": "A", "t": "did:ledger:tmpl-post"}]);
        let first = idx
            .ingest(IngestItem::LedgerRecord {
                compressed: compressed.clone(),
                meta: ledger_meta("tx1", 2, "sig1"),
            })
            .await
            .unwrap();
        assert!(matches!(first, IngestOutcome::Committed(_)));

        let second = idx
            .ingest(IngestItem::LedgerRecord {
                compressed,
                meta: ledger_meta("tx1", 3, "sig1"),
            })
            .await
            .unwrap();
        assert!(matches!(second, IngestOutcome::AlreadyCommitted(_)));
    }

    #[tokio::test]
    async fn ledger_replacement_requires_newer_block() {
        let idx = indexer().await;
        idx.ingest(IngestItem::Template {
            template: template("post", "did:ledger:tmpl-post"),
            block: Some(1),
        })
        .await
        .unwrap();

        let compressed = json!([{"0": "A", "t": "did:ledger:tmpl-post"}]);
        idx.ingest(IngestItem::LedgerRecord {
            compressed: compressed.clone(),
            meta: ledger_meta("tx1", 10, "sig1"),
        })
        .await
        .unwrap();

        // same did, older block, different signature: dropped
        let stale = idx
            .ingest(IngestItem::LedgerRecord {
                compressed: compressed.clone(),
                meta: ledger_meta("tx1", 5, "sig2"),
            })
            .await
            .unwrap();
        assert!(matches!(stale, IngestOutcome::Dropped(_)));

        // newer block replaces
        let newer = idx
            .ingest(IngestItem::LedgerRecord {
                compressed,
                meta: ledger_meta("tx1", 20, "sig3"),
            })
            .await
            .unwrap();
        assert!(matches!(newer, IngestOutcome::Replaced(_)));
    }

    #[tokio::test]
    async fn schema_violation_drops_and_advances() {
        let idx = indexer().await;
        let mut t = template("post", "did:ledger:tmpl-post");
        t.fields
            .insert("count".to_string(), FieldDef::new(2, FieldKind::Long));
        idx.ingest(IngestItem::Template {
            template: t,
            block: Some(1),
        })
        .await
        .unwrap();

        // "count" is a long; a string is a type mismatch
        let compressed =
            json!([{"2": "many", "t": "did:ledger:tmpl-post"}]);
        let outcome = idx
            .ingest(IngestItem::LedgerRecord {
                compressed,
                meta: ledger_meta("tx9", 9, "sig"),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Dropped(_)));
        assert_eq!(
            idx.store().checkpoint(LEDGER_CHECKPOINT).await.unwrap(),
            Some(9)
        );
    }

    #[tokio::test]
    async fn deletion_removes_and_registers() {
        let idx = indexer().await;
        idx.ingest(IngestItem::Template {
            template: template("post", "did:ledger:tmpl-post"),
            block: Some(1),
        })
        .await
        .unwrap();

        let mut section = IndexMap::new();
        section.insert("name".to_string(), "Draft".into());
        let mut data = RecordData::new();
        data.insert_section("post", section);

        let record = Record {
            oip: SystemMeta {
                did: Did::peer("oip:records:pk:d1"),
                legacy_id: None,
                record_type: "post".into(),
                storage: RecordStorage::Peer,
                indexed_at: Utc::now(),
                block_height: None,
                creator: Creator {
                    pub_key: "pk".into(),
                    address: "addr".into(),
                },
                signature: Some("s".into()),
                access: None,
                encrypted: false,
                ver: "0.8.0".into(),
            },
            data,
        };

        idx.ingest(IngestItem::Record { record }).await.unwrap();
        assert_eq!(idx.store().count_records().await.unwrap(), 1);

        let outcome = idx
            .ingest(IngestItem::Deletion {
                did: Did::peer("oip:records:pk:d1"),
                block: None,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Deleted(_)));
        assert_eq!(idx.store().count_records().await.unwrap(), 0);
        assert!(idx
            .store()
            .is_deleted("did:peer:oip:records:pk:d1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn peer_records_replace_in_place() {
        let idx = indexer().await;
        idx.ingest(IngestItem::Template {
            template: template("post", "did:ledger:tmpl-post"),
            block: Some(1),
        })
        .await
        .unwrap();

        let make = |sig: &str, text: &str| {
            let mut section = IndexMap::new();
            section.insert("text".to_string(), text.into());
            let mut data = RecordData::new();
            data.insert_section("post", section);
            Record {
                oip: SystemMeta {
                    did: Did::peer("oip:records:pk:d1"),
                    legacy_id: None,
                    record_type: "post".into(),
                    storage: RecordStorage::Peer,
                    indexed_at: Utc::now(),
                    block_height: None,
                    creator: Creator {
                        pub_key: "pk".into(),
                        address: "addr".into(),
                    },
                    signature: Some(sig.into()),
                    access: None,
                    encrypted: false,
                    ver: "0.8.0".into(),
                },
                data,
            }
        };

        idx.ingest(IngestItem::Record {
            record: make("sig1", "v1"),
        })
        .await
        .unwrap();
        let outcome = idx
            .ingest(IngestItem::Record {
                record: make("sig2", "v2"),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Replaced(_)));

        // same did throughout
        assert_eq!(idx.store().count_records().await.unwrap(), 1);
        let row = idx
            .store()
            .get_record("did:peer:oip:records:pk:d1")
            .await
            .unwrap()
            .unwrap();
        assert!(row.body.contains("v2"));
    }
}
