// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Client-initiated publishing.
//!
//! A publish is synchronous end-to-end: sign, dispatch to the ledger or
//! the peer graph, and commit to the local index before returning. The
//! `submitted -> confirmed` transition is never waited on here; the
//! ledger reader observes it later and the indexer's idempotency rule
//! reconciles the two copies.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use oip_keys::{
    derive_organization_key, derive_user_key, ClientSignature, NodeIdentity,
};
use oip_record_data::access::{AccessControl, AccessLevel};
use oip_record_data::codec::{self, CodecError};
use oip_record_data::did::{Did, RecordStorage};
use oip_record_data::envelope::Envelope;
use oip_record_data::record::{
    Creator, FieldValue, Record, RecordData, SystemMeta, VER_CLIENT_SIGNED,
    VER_SERVER_SIGNED,
};
use oip_record_data::registry::RegistryEntry;
use oip_record_data::soul::record_soul;

use crate::index::indexer::Indexer;
use crate::index::{IngestItem, IngestOutcome};
use crate::ledger::{
    ItemKind, LedgerApi, LedgerError, RecordPayload, TemplatePayload, Tag,
    CONTENT_TYPE_JSON, INDEX_METHOD_OIP, TAG_CONTENT_TYPE, TAG_CREATOR,
    TAG_CREATOR_SIG, TAG_INDEX_METHOD, TAG_KEY_INDEX, TAG_PAYLOAD_DIGEST,
    TAG_VER,
};
use crate::peergraph::{
    advertise, delete_soul, put_envelope, seal_data, GraphError, PeerGraph,
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("index commit failed: {0}")]
    Index(String),
}

/// Lifecycle of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Draft,
    Signed,
    Submitted,
    Confirmed,
    Rejected,
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishState::Draft => "draft",
            PublishState::Signed => "signed",
            PublishState::Submitted => "submitted",
            PublishState::Confirmed => "confirmed",
            PublishState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub storage: Option<RecordStorage>,
    pub access: Option<AccessControl>,
    /// Stable soul suffix for peer records; omitted means content-hash.
    pub local_id: Option<String>,
    /// The owner's registration salt, required to encrypt `private`
    /// records. Only the owner's session can supply it.
    pub owner_salt: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub did: Did,
    pub storage: RecordStorage,
    pub encrypted: bool,
    pub state: PublishState,
}

pub struct Publisher<L: LedgerApi, G: PeerGraph> {
    identity: NodeIdentity,
    ledger: Arc<RwLock<L>>,
    graph: Arc<RwLock<G>>,
    indexer: Arc<Indexer>,
}

impl<L: LedgerApi, G: PeerGraph> Publisher<L, G> {
    pub fn new(
        identity: NodeIdentity,
        ledger: Arc<RwLock<L>>,
        graph: Arc<RwLock<G>>,
        indexer: Arc<Indexer>,
    ) -> Self {
        Self {
            identity,
            ledger,
            graph,
            indexer,
        }
    }

    /// Publish a server-signed (v0.8) record.
    pub async fn publish(
        &self,
        data: RecordData,
        record_type: &str,
        options: PublishOptions,
    ) -> Result<PublishReceipt, PublishError> {
        if data.section(record_type).is_none() {
            return Err(PublishError::BadRequest(format!(
                "record has no {record_type} section"
            )));
        }
        self.validate(&data)?;
        debug!(event = "publish_state", state = %PublishState::Draft);

        let data_json = data.to_json();
        let signature =
            oip_keys::sign_canonical(self.identity.signing_key(), &data_json);
        debug!(event = "publish_state", state = %PublishState::Signed);

        let storage = options.storage.unwrap_or(RecordStorage::Ledger);
        match storage {
            RecordStorage::Ledger => {
                self.publish_to_ledger(data, record_type, signature, options)
                    .await
            }
            RecordStorage::Peer => {
                self.publish_to_peer(data, record_type, signature, options)
                    .await
            }
        }
    }

    async fn publish_to_ledger(
        &self,
        data: RecordData,
        record_type: &str,
        signature: String,
        options: PublishOptions,
    ) -> Result<PublishReceipt, PublishError> {
        let compressed = {
            let directory = self.indexer.directory();
            let directory = directory.read();
            codec::compress(&data, &directory)?
        };

        let payload = RecordPayload {
            record: compressed,
            signature: Some(signature.clone()),
            creator_pub_key: Some(self.identity.public_key_hex()),
            access: options.access.clone(),
        };
        let payload = serde_json::to_value(&payload)
            .map_err(|e| PublishError::BadRequest(e.to_string()))?;

        let tags = vec![
            Tag::new(TAG_INDEX_METHOD, INDEX_METHOD_OIP),
            Tag::new(TAG_VER, VER_SERVER_SIGNED),
            Tag::new(TAG_CONTENT_TYPE, CONTENT_TYPE_JSON),
            Tag::new(TAG_CREATOR, self.identity.creator_did().to_string()),
        ];

        let tx_id = self
            .ledger
            .read()
            .await
            .submit(ItemKind::Record, &payload, &tags)
            .await?;
        debug!(event = "publish_state", state = %PublishState::Submitted);

        let did = Did::ledger(&tx_id);
        let record = Record {
            oip: SystemMeta {
                did: did.clone(),
                legacy_id: Some(tx_id),
                record_type: record_type.into(),
                storage: RecordStorage::Ledger,
                indexed_at: Utc::now(),
                block_height: None,
                creator: self.creator(),
                signature: Some(signature),
                access: options.access,
                encrypted: false,
                ver: VER_SERVER_SIGNED.into(),
            },
            data,
        };
        self.commit(record).await?;

        info!(event = "published", did = %did, storage = "ledger");
        Ok(PublishReceipt {
            did,
            storage: RecordStorage::Ledger,
            encrypted: false,
            state: PublishState::Submitted,
        })
    }

    async fn publish_to_peer(
        &self,
        data: RecordData,
        record_type: &str,
        signature: String,
        options: PublishOptions,
    ) -> Result<PublishReceipt, PublishError> {
        let data_json = data.to_json();
        let pub_key = self.identity.public_key_hex();
        let soul =
            record_soul(&pub_key, options.local_id.as_deref(), &data_json);
        let did = Did::peer(&soul);

        let level = options.access.as_ref().map(|a| a.level);
        let encrypted = matches!(
            level,
            Some(AccessLevel::Private) | Some(AccessLevel::Organization)
        );

        let mut envelope_meta = SystemMeta {
            did: did.clone(),
            legacy_id: None,
            record_type: record_type.into(),
            storage: RecordStorage::Peer,
            indexed_at: Utc::now(),
            block_height: None,
            creator: self.creator(),
            signature: Some(signature),
            access: options.access.clone(),
            encrypted: false,
            ver: VER_SERVER_SIGNED.into(),
        };

        let envelope = match level {
            Some(AccessLevel::Private) => {
                let owner = options
                    .access
                    .as_ref()
                    .and_then(|a| a.owner_pub_key.clone())
                    .unwrap_or_else(|| pub_key.clone());
                let salt = options.owner_salt.as_deref().ok_or_else(|| {
                    PublishError::BadRequest(
                        "private records need the owner salt".into(),
                    )
                })?;
                let key = derive_user_key(&owner, salt);
                Envelope::encrypted(
                    seal_data(&key, &data_json)?,
                    envelope_meta.clone(),
                )
            }
            Some(AccessLevel::Organization) => {
                let org_did = options
                    .access
                    .as_ref()
                    .and_then(|a| a.organization_did.as_ref())
                    .ok_or_else(|| {
                        PublishError::BadRequest(
                            "organization records need organizationDid"
                                .into(),
                        )
                    })?;
                let key = derive_organization_key(&org_did.to_string());
                Envelope::encrypted(
                    seal_data(&key, &data_json)?,
                    envelope_meta.clone(),
                )
            }
            _ => Envelope::plaintext(data_json, envelope_meta.clone()),
        };

        {
            let graph = self.graph.read().await;
            put_envelope(&*graph, &soul, &envelope).await?;
            advertise(
                &*graph,
                &did.to_string(),
                &RegistryEntry {
                    record_type: record_type.into(),
                    creator_pub_key: pub_key,
                    last_updated: Utc::now().timestamp(),
                    encrypted,
                    deleted: false,
                },
            )
            .await?;
        }
        debug!(event = "publish_state", state = %PublishState::Submitted);

        // the local index always holds the plaintext copy
        envelope_meta.encrypted = false;
        let record = Record {
            oip: envelope_meta,
            data,
        };
        self.commit(record).await?;

        info!(event = "published", did = %did, storage = "peer", encrypted);
        Ok(PublishReceipt {
            did,
            storage: RecordStorage::Peer,
            encrypted,
            state: PublishState::Confirmed,
        })
    }

    /// Publish a new template to the ledger.
    pub async fn publish_template(
        &self,
        payload: TemplatePayload,
    ) -> Result<Did, PublishError> {
        let fields_json = serde_json::to_value(&payload.fields)
            .map_err(|e| PublishError::BadRequest(e.to_string()))?;
        let signature = oip_keys::sign_canonical(
            self.identity.signing_key(),
            &fields_json,
        );

        let payload = TemplatePayload {
            signature: Some(signature.clone()),
            creator_pub_key: Some(self.identity.public_key_hex()),
            ..payload
        };
        let raw = serde_json::to_value(&payload)
            .map_err(|e| PublishError::BadRequest(e.to_string()))?;

        let tags = vec![
            Tag::new(TAG_INDEX_METHOD, INDEX_METHOD_OIP),
            Tag::new(TAG_VER, VER_SERVER_SIGNED),
            Tag::new(TAG_CONTENT_TYPE, CONTENT_TYPE_JSON),
            Tag::new(TAG_CREATOR, self.identity.creator_did().to_string()),
        ];
        let tx_id = self
            .ledger
            .read()
            .await
            .submit(ItemKind::Template, &raw, &tags)
            .await?;

        let template = oip_record_data::template::Template {
            did: Did::ledger(&tx_id),
            name: payload.name,
            creator_did: self.identity.creator_did(),
            fields: payload.fields,
            created_height: 0,
            signature: Some(signature),
            creator_pub_key: self.identity.public_key_hex(),
        };
        let did = template.did.clone();

        match self
            .indexer
            .ingest(IngestItem::Template {
                template,
                block: None,
            })
            .await
        {
            Ok(IngestOutcome::Dropped(reason)) => {
                return Err(PublishError::BadRequest(reason))
            }
            Ok(_) => {}
            Err(e) => return Err(PublishError::Index(e.to_string())),
        }

        info!(event = "template_published", did = %did);
        Ok(did)
    }

    /// Publish a client-signed (v0.9, login-less) record.
    ///
    /// Every verification step must pass before the ledger sees the
    /// payload; on success this node pays the fee from its own wallet.
    pub async fn publish_client_signed(
        &self,
        payload: Value,
        attestation: ClientSignature,
    ) -> Result<PublishReceipt, PublishError> {
        let xpub = self
            .resolve_creator_xpub(&attestation.creator_did)
            .await
            .ok_or(PublishError::InvalidSignature)?;
        attestation
            .verify(&payload, &xpub)
            .map_err(|_| PublishError::InvalidSignature)?;

        let data: RecordData = serde_json::from_value(payload)
            .map_err(|e| PublishError::BadRequest(e.to_string()))?;
        let record_type = data
            .iter()
            .next()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                PublishError::BadRequest("record has no sections".into())
            })?;
        self.validate(&data)?;

        let compressed = {
            let directory = self.indexer.directory();
            let directory = directory.read();
            codec::compress(&data, &directory)?
        };
        let wire = serde_json::to_value(&RecordPayload {
            record: compressed,
            signature: Some(attestation.creator_sig.clone()),
            creator_pub_key: None,
            access: None,
        })
        .map_err(|e| PublishError::BadRequest(e.to_string()))?;

        let tags = vec![
            Tag::new(TAG_INDEX_METHOD, INDEX_METHOD_OIP),
            Tag::new(TAG_VER, VER_CLIENT_SIGNED),
            Tag::new(TAG_CONTENT_TYPE, CONTENT_TYPE_JSON),
            Tag::new(TAG_CREATOR, attestation.creator_did.clone()),
            Tag::new(TAG_CREATOR_SIG, attestation.creator_sig.clone()),
            Tag::new(TAG_PAYLOAD_DIGEST, attestation.payload_digest.clone()),
            Tag::new(TAG_KEY_INDEX, attestation.key_index.to_string()),
        ];
        let tx_id = self
            .ledger
            .read()
            .await
            .submit(ItemKind::Record, &wire, &tags)
            .await?;
        debug!(event = "publish_state", state = %PublishState::Submitted);

        let did = Did::ledger(&tx_id);
        let record = Record {
            oip: SystemMeta {
                did: did.clone(),
                legacy_id: Some(tx_id),
                record_type,
                storage: RecordStorage::Ledger,
                indexed_at: Utc::now(),
                block_height: None,
                creator: Creator {
                    pub_key: String::new(),
                    address: attestation.creator_did.clone(),
                },
                signature: Some(attestation.creator_sig),
                access: None,
                encrypted: false,
                ver: VER_CLIENT_SIGNED.into(),
            },
            data,
        };
        self.commit(record).await?;

        info!(event = "published", did = %did, ver = VER_CLIENT_SIGNED);
        Ok(PublishReceipt {
            did,
            storage: RecordStorage::Ledger,
            encrypted: false,
            state: PublishState::Submitted,
        })
    }

    /// Cooperative tombstone for a peer record: null out the soul, mark
    /// the registry stub deleted, remove the local copy. Remote nodes
    /// observe the deletion on their next sync cycle.
    pub async fn delete_record(
        &self,
        did: &Did,
    ) -> Result<(), PublishError> {
        if did.storage() != RecordStorage::Peer {
            return Err(PublishError::BadRequest(
                "only peer records can be deleted".into(),
            ));
        }

        let existing = self
            .indexer
            .store()
            .get_record(&did.to_string())
            .await
            .map_err(|e| PublishError::Index(e.to_string()))?;
        let record_type = existing
            .map(|r| r.record_type)
            .unwrap_or_else(|| "unknown".into());

        {
            let graph = self.graph.read().await;
            delete_soul(&*graph, did.id()).await?;
            advertise(
                &*graph,
                &did.to_string(),
                &RegistryEntry {
                    record_type,
                    creator_pub_key: self.identity.public_key_hex(),
                    last_updated: Utc::now().timestamp(),
                    encrypted: false,
                    deleted: true,
                },
            )
            .await?;
        }

        self.indexer
            .ingest(IngestItem::Deletion {
                did: did.clone(),
                block: None,
            })
            .await
            .map_err(|e| PublishError::Index(e.to_string()))?;

        info!(event = "record_tombstoned", did = %did);
        Ok(())
    }

    fn validate(&self, data: &RecordData) -> Result<(), PublishError> {
        let directory = self.indexer.directory();
        let directory = directory.read();
        codec::validate(data, &directory).map_err(|e| match e {
            CodecError::UnknownTemplate(name) => PublishError::BadRequest(
                format!("unknown template: {name}"),
            ),
            other => PublishError::Codec(other),
        })
    }

    async fn commit(&self, record: Record) -> Result<(), PublishError> {
        match self.indexer.ingest(IngestItem::Record { record }).await {
            Ok(IngestOutcome::Failed(reason)) => {
                Err(PublishError::Index(reason))
            }
            Ok(IngestOutcome::Dropped(reason)) => {
                Err(PublishError::BadRequest(reason))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(PublishError::Index(e.to_string())),
        }
    }

    fn creator(&self) -> Creator {
        Creator {
            pub_key: self.identity.public_key_hex(),
            address: self.identity.address(),
        }
    }

    /// The creator's account xpub, from the DID document record this
    /// index holds for them.
    async fn resolve_creator_xpub(&self, creator_did: &str) -> Option<String> {
        let row = self
            .indexer
            .store()
            .get_record(creator_did)
            .await
            .ok()??;
        let record = row.to_record().ok()?;

        for (_, section) in record.data.iter() {
            for key in ["xpub", "accountXpub"] {
                if let Some(FieldValue::Str(xpub)) = section.get(key) {
                    return Some(xpub.clone());
                }
            }
        }
        None
    }
}
