// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod http;
pub mod reader;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use oip_record_data::access::AccessControl;
use oip_record_data::template::FieldDef;

// Transaction tag names, case-sensitive on the wire.
pub const TAG_INDEX_METHOD: &str = "Index-Method";
pub const TAG_VER: &str = "Ver";
pub const TAG_CONTENT_TYPE: &str = "Content-Type";
pub const TAG_CREATOR: &str = "Creator";
pub const TAG_CREATOR_SIG: &str = "CreatorSig";
pub const TAG_PAYLOAD_DIGEST: &str = "PayloadDigest";
pub const TAG_KEY_INDEX: &str = "KeyIndex";

pub const INDEX_METHOD_OIP: &str = "OIP";
pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger transport: {0}")]
    Transport(String),
    #[error("unexpected ledger response: {0}")]
    BadResponse(String),
    #[error("ledger rejected transaction: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Whether a retry can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Template,
    Record,
}

/// One indexable transaction lifted off the permanent ledger.
///
/// Items are totally ordered by `(block, position)`; the order is stable
/// across runs, so re-reading a window yields the same sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerItem {
    pub block: u64,
    pub position: u32,
    #[serde(rename = "txId")]
    pub tx_id: String,
    pub kind: ItemKind,
    pub raw: Value,
    pub tags: Vec<Tag>,
}

impl LedgerItem {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

/// The payload of a record transaction: the compressed sections plus the
/// creator's signature over the canonical data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPayload {
    pub record: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    #[serde(
        rename = "creatorPubKey",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub creator_pub_key: Option<String>,
    #[serde(
        rename = "accessControl",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub access: Option<AccessControl>,
}

/// The payload of a template transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatePayload {
    pub name: String,
    #[serde(rename = "fieldsInTemplate")]
    pub fields: IndexMap<String, FieldDef>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    #[serde(
        rename = "creatorPubKey",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub creator_pub_key: Option<String>,
}

/// The permanent ledger, seen as a gateway: a tip height, an ordered
/// query window, and transaction submission.
#[async_trait]
pub trait LedgerApi: Send + Sync + 'static {
    async fn tip(&self) -> Result<u64, LedgerError>;

    /// All indexable items with `from <= block <= to`, ordered by
    /// `(block, position)`.
    async fn query(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerItem>, LedgerError>;

    /// Submit a transaction; returns its id.
    async fn submit(
        &self,
        kind: ItemKind,
        payload: &Value,
        tags: &[Tag],
    ) -> Result<String, LedgerError>;

    /// Recreate the underlying connection pool if it has aged out.
    /// Clients without pools ignore this.
    fn recycle_if_due(&mut self) {}
}
