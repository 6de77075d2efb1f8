// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The keep-up-to-date loop over the permanent ledger.
//!
//! Reads everything strictly after the persisted checkpoint in bounded
//! block windows and forwards the items, one at a time and in
//! `(block, position)` order, into the indexer's work queue. The
//! checkpoint itself is advanced by the indexer after commit, so a crash
//! anywhere in this loop replays rather than skips.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use oip_record_data::queue::AsyncQueue;
use oip_record_data::record::{VER_CLIENT_SIGNED, VER_SERVER_SIGNED};

use crate::index::store::SearchStore;
use crate::index::{
    IngestEnvelope, IngestItem, LedgerRecordMeta, LEDGER_CHECKPOINT,
};
use crate::ledger::{
    ItemKind, LedgerApi, LedgerError, LedgerItem, RecordPayload,
    TemplatePayload, INDEX_METHOD_OIP, TAG_CREATOR, TAG_CREATOR_SIG,
    TAG_INDEX_METHOD, TAG_VER,
};
use crate::peergraph::PeerGraph;
use crate::LongLivedService;

/// Transient-error retry policy: exponential backoff from 500 ms capped
/// at 30 s, at most 6 attempts.
const RETRY_ATTEMPTS: u32 = 6;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Params {
    /// How often to poll the ledger tip.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Blocks fetched per query window.
    #[serde(default = "default_batch_blocks")]
    pub batch_blocks: u64,
}

const fn default_batch_blocks() -> u64 {
    50
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for Params {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_blocks: default_batch_blocks(),
        }
    }
}

/// The ledger reader service.
pub struct LedgerSrv {
    queue: AsyncQueue<IngestEnvelope>,
    conf: Params,
}

impl LedgerSrv {
    pub fn new(conf: Params, queue: AsyncQueue<IngestEnvelope>) -> Self {
        info!("LedgerSrv::new with conf: {:?}", conf);
        Self { queue, conf }
    }

    /// One catch-up pass: read everything strictly after the checkpoint
    /// up to the tip observed at the start of the pass.
    pub async fn catch_up<L: LedgerApi>(
        &self,
        ledger: &Arc<RwLock<L>>,
        store: &SearchStore,
    ) -> anyhow::Result<()> {
        let checkpoint = store
            .checkpoint(LEDGER_CHECKPOINT)
            .await?
            .unwrap_or(0)
            .max(0) as u64;

        let tip = {
            let ledger = ledger.clone();
            with_backoff("tip", move || {
                let ledger = ledger.clone();
                async move { ledger.read().await.tip().await }
            })
            .await
        };
        let tip = match tip {
            Ok(tip) => tip,
            Err(e) => {
                // non-fatal: the checkpoint stays put, next tick retries
                warn!(event = "ledger_unreachable", reason = %e);
                return Ok(());
            }
        };

        if tip <= checkpoint {
            return Ok(());
        }

        let mut from = checkpoint + 1;
        while from <= tip {
            let to = (from + self.conf.batch_blocks - 1).min(tip);

            let window = {
                let ledger = ledger.clone();
                with_backoff("query", move || {
                    let ledger = ledger.clone();
                    async move { ledger.read().await.query(from, to).await }
                })
                .await
            };
            let items = match window {
                Ok(items) => items,
                Err(e) => {
                    warn!(
                        event = "ledger_window_failed",
                        from, to, reason = %e,
                    );
                    return Ok(());
                }
            };

            for item in items {
                let Some(ingest) = to_ingest_item(item) else {
                    continue;
                };
                // a full queue blocks us here; that is the backpressure
                self.queue.send(IngestEnvelope::new(ingest)).await?;
            }

            from = to + 1;
        }

        Ok(())
    }
}

#[async_trait]
impl<L: LedgerApi, G: PeerGraph> LongLivedService<L, G> for LedgerSrv {
    async fn execute(
        &mut self,
        ledger: Arc<RwLock<L>>,
        _graph: Arc<RwLock<G>>,
        store: SearchStore,
    ) -> anyhow::Result<usize> {
        info!("ledger reader started");
        let mut ticker = tokio::time::interval(self.conf.poll_interval);

        loop {
            ticker.tick().await;
            ledger.write().await.recycle_if_due();
            self.catch_up(&ledger, &store).await?;
        }
    }

    fn name(&self) -> &'static str {
        "ledger_reader"
    }
}

/// Convert a raw ledger item into indexer work. Items that are not OIP
/// transactions, or carry a wire version this node does not speak, are
/// skipped with a warning.
pub fn to_ingest_item(item: LedgerItem) -> Option<IngestItem> {
    if item.tag(TAG_INDEX_METHOD) != Some(INDEX_METHOD_OIP) {
        return None;
    }

    let ver = item.tag(TAG_VER).unwrap_or_default().to_string();
    if ver != VER_SERVER_SIGNED && ver != VER_CLIENT_SIGNED {
        warn!(event = "unknown_wire_version", tx_id = %item.tx_id, %ver);
        return None;
    }

    let creator_did = item
        .tag(TAG_CREATOR)
        .and_then(|c| c.parse().ok());

    match item.kind {
        ItemKind::Template => {
            let payload: TemplatePayload =
                match serde_json::from_value(item.raw) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            event = "template_unparsable",
                            tx_id = %item.tx_id,
                            reason = %e,
                        );
                        return None;
                    }
                };

            let creator_did = creator_did?;
            Some(IngestItem::Template {
                template: oip_record_data::template::Template {
                    did: oip_record_data::did::Did::ledger(&item.tx_id),
                    name: payload.name,
                    creator_did,
                    fields: payload.fields,
                    created_height: item.block,
                    signature: payload.signature,
                    creator_pub_key: payload
                        .creator_pub_key
                        .unwrap_or_default(),
                },
                block: Some(item.block),
            })
        }
        ItemKind::Record => {
            let payload: RecordPayload =
                match serde_json::from_value(item.raw) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            event = "record_unparsable",
                            tx_id = %item.tx_id,
                            reason = %e,
                        );
                        return None;
                    }
                };

            // v0.9 transactions carry the signature as a tag instead
            let signature = payload.signature.or_else(|| {
                item.tags
                    .iter()
                    .find(|t| t.name == TAG_CREATOR_SIG)
                    .map(|t| t.value.clone())
            });

            Some(IngestItem::LedgerRecord {
                compressed: payload.record,
                meta: LedgerRecordMeta {
                    tx_id: item.tx_id,
                    block: item.block,
                    creator_did,
                    creator_pub_key: payload.creator_pub_key,
                    signature,
                    ver,
                    access: payload.access,
                },
            })
        }
    }
}

async fn with_backoff<T, F, Fut>(
    label: &str,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let backoff =
                    RETRY_BASE.saturating_mul(1 << attempt).min(RETRY_CAP);
                warn!(
                    event = "ledger_retry",
                    op = label,
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ledger::Tag;

    fn oip_tags(ver: &str) -> Vec<Tag> {
        vec![
            Tag::new(TAG_INDEX_METHOD, INDEX_METHOD_OIP),
            Tag::new(TAG_VER, ver),
            Tag::new(TAG_CREATOR, "did:ledger:creator"),
        ]
    }

    #[test]
    fn non_oip_items_are_skipped() {
        let item = LedgerItem {
            block: 1,
            position: 0,
            tx_id: "tx".into(),
            kind: ItemKind::Record,
            raw: json!({"record": []}),
            tags: vec![Tag::new(TAG_VER, "0.8.0")],
        };
        assert!(to_ingest_item(item).is_none());
    }

    #[test]
    fn unknown_wire_version_is_skipped() {
        let item = LedgerItem {
            block: 1,
            position: 0,
            tx_id: "tx".into(),
            kind: ItemKind::Record,
            raw: json!({"record": []}),
            tags: oip_tags("0.7.0"),
        };
        assert!(to_ingest_item(item).is_none());
    }

    #[test]
    fn both_wire_versions_are_accepted() {
        for ver in [VER_SERVER_SIGNED, VER_CLIENT_SIGNED] {
            let item = LedgerItem {
                block: 3,
                position: 1,
                tx_id: "tx3".into(),
                kind: ItemKind::Record,
                raw: json!({
                    "record": [{"0": "x", "t": "did:ledger:tmpl"}],
                    "signature": "sig",
                }),
                tags: oip_tags(ver),
            };
            let ingest = to_ingest_item(item).expect("accepted");
            match ingest {
                IngestItem::LedgerRecord { meta, .. } => {
                    assert_eq!(meta.ver, ver);
                    assert_eq!(meta.block, 3);
                }
                other => panic!("unexpected item {other:?}"),
            }
        }
    }

    #[test]
    fn v09_signature_tag_is_picked_up() {
        let mut tags = oip_tags(VER_CLIENT_SIGNED);
        tags.push(Tag::new(TAG_CREATOR_SIG, "tag-sig"));

        let item = LedgerItem {
            block: 3,
            position: 0,
            tx_id: "tx".into(),
            kind: ItemKind::Record,
            raw: json!({"record": []}),
            tags,
        };
        match to_ingest_item(item).unwrap() {
            IngestItem::LedgerRecord { meta, .. } => {
                assert_eq!(meta.signature.as_deref(), Some("tag-sig"));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn template_items_become_templates() {
        let item = LedgerItem {
            block: 2,
            position: 0,
            tx_id: "tmpl-tx".into(),
            kind: ItemKind::Template,
            raw: json!({
                "name": "post",
                "fieldsInTemplate": {
                    "text": {"index": 0, "type": "string"}
                }
            }),
            tags: oip_tags(VER_SERVER_SIGNED),
        };
        match to_ingest_item(item).unwrap() {
            IngestItem::Template { template, block } => {
                assert_eq!(template.name, "post");
                assert_eq!(template.did.to_string(), "did:ledger:tmpl-tx");
                assert_eq!(block, Some(2));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }
}
