// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};

use oip_record_data::queue::AsyncQueue;

use crate::index::indexer::Indexer;
use crate::index::store::SearchStore;
use crate::index::{
    IngestAck, IngestEnvelope, IngestItem, IngestOutcome,
    INGEST_QUEUE_CAPACITY,
};
use crate::ledger::LedgerApi;
use crate::peergraph::PeerGraph;
use crate::LongLivedService;

/// Drains the bounded work queue into the [`Indexer`].
///
/// Within the queue, items keep their source order; producers that need
/// per-item results attach an ack queue to their envelopes.
pub struct IndexerSrv {
    queue: AsyncQueue<IngestEnvelope>,
    indexer: Arc<Indexer>,
}

impl IndexerSrv {
    pub fn new(indexer: Arc<Indexer>) -> Self {
        Self {
            queue: AsyncQueue::bounded(INGEST_QUEUE_CAPACITY, "ingest"),
            indexer,
        }
    }

    /// A producer handle onto the work queue.
    pub fn queue(&self) -> AsyncQueue<IngestEnvelope> {
        self.queue.clone()
    }
}

#[async_trait]
impl<L: LedgerApi, G: PeerGraph> LongLivedService<L, G> for IndexerSrv {
    async fn execute(
        &mut self,
        _ledger: Arc<RwLock<L>>,
        _graph: Arc<RwLock<G>>,
        _store: SearchStore,
    ) -> anyhow::Result<usize> {
        loop {
            let envelope = self.queue.recv().await?;

            let did = item_did(&envelope.item);
            let outcome = match self.indexer.ingest(envelope.item).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(event = "ingest_error", reason = %e);
                    IngestOutcome::Failed(e.to_string())
                }
            };
            debug!(event = "ingested", outcome = ?outcome);

            if let Some(ack) = envelope.ack {
                let _ = ack
                    .send(IngestAck {
                        did,
                        advanced: outcome.advances_stream(),
                    })
                    .await;
            }
        }
    }

    fn name(&self) -> &'static str {
        "indexer"
    }
}

fn item_did(item: &IngestItem) -> Option<oip_record_data::did::Did> {
    match item {
        IngestItem::Template { template, .. } => Some(template.did.clone()),
        IngestItem::LedgerRecord { .. } => None,
        IngestItem::Record { record } => Some(record.oip.did.clone()),
        IngestItem::Deletion { did, .. } => Some(did.clone()),
    }
}
