// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod indexer;
pub mod service;
pub mod store;

use serde_json::Value;
use thiserror::Error;

use oip_record_data::access::AccessControl;
use oip_record_data::codec::CodecError;
use oip_record_data::did::Did;
use oip_record_data::queue::AsyncQueue;
use oip_record_data::record::Record;
use oip_record_data::template::Template;

use crate::index::store::StoreError;

/// Capacity of the indexer's work queue. A full queue blocks the stream
/// producers, which is the only backpressure between them and the store.
pub const INGEST_QUEUE_CAPACITY: usize = 256;

/// Checkpoint name of the highest fully committed ledger block.
pub const LEDGER_CHECKPOINT: &str = "ledger_height";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// Metadata a ledger transaction carries alongside its compressed record.
#[derive(Debug, Clone)]
pub struct LedgerRecordMeta {
    pub tx_id: String,
    pub block: u64,
    pub creator_did: Option<Did>,
    pub creator_pub_key: Option<String>,
    pub signature: Option<String>,
    pub ver: String,
    pub access: Option<AccessControl>,
}

/// One unit of work for the indexer.
#[derive(Debug, Clone)]
pub enum IngestItem {
    /// A template observed on the ledger or published locally.
    Template {
        template: Template,
        block: Option<u64>,
    },
    /// A compressed record straight off the ledger stream.
    LedgerRecord {
        compressed: Value,
        meta: LedgerRecordMeta,
    },
    /// An already-expanded record: a publish, or a peer-graph envelope.
    Record { record: Record },
    /// A tombstone observed in a deletion registry.
    Deletion { did: Did, block: Option<u64> },
}

impl IngestItem {
    /// The originating ledger block, for checkpoint advancement.
    pub fn block(&self) -> Option<u64> {
        match self {
            IngestItem::Template { block, .. } => *block,
            IngestItem::LedgerRecord { meta, .. } => Some(meta.block),
            IngestItem::Record { .. } => None,
            IngestItem::Deletion { block, .. } => *block,
        }
    }
}

/// What became of one ingested item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Committed(Did),
    Replaced(Did),
    /// Identical `(did, signature)` already committed; idempotent no-op.
    AlreadyCommitted(Did),
    /// Parked until the referenced template commits.
    Parked,
    /// Schema violation; the item was dropped and the stream advances.
    Dropped(String),
    /// Store failure after retries; parked in the dead-letter queue, the
    /// stream checkpoint no longer advances.
    Failed(String),
    Deleted(Did),
}

impl IngestOutcome {
    /// Whether the producing stream may advance past this item.
    pub fn advances_stream(&self) -> bool {
        !matches!(self, IngestOutcome::Failed(_))
    }
}

/// An item plus the optional ack queue its producer is waiting on. The
/// sync engine uses acks to hold a peer's watermark back when any of the
/// cycle's items failed.
#[derive(Clone)]
pub struct IngestEnvelope {
    pub item: IngestItem,
    pub ack: Option<AsyncQueue<IngestAck>>,
}

impl IngestEnvelope {
    pub fn new(item: IngestItem) -> Self {
        Self { item, ack: None }
    }

    pub fn with_ack(item: IngestItem, ack: AsyncQueue<IngestAck>) -> Self {
        Self {
            item,
            ack: Some(ack),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestAck {
    pub did: Option<Did>,
    pub advanced: bool,
}
