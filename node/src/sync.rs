// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The peer synchronization engine.
//!
//! Each cycle reads every configured peer's discovery registry, diffs it
//! against the local index and per-peer watermark, and fetches what is
//! new under bounded request concurrency. Envelopes this node can decrypt
//! go straight to the indexer; per-user envelopes wait in the decryption
//! queue for their owner's next login. Deletions are processed at most
//! once per reprocessing window, however many peers keep advertising
//! them.

pub mod conf;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use oip_keys::{derive_organization_key, derive_user_key, EnvelopeKey};
use oip_record_data::access::AccessLevel;
use oip_record_data::did::{Did, RecordStorage};
use oip_record_data::envelope::Envelope;
use oip_record_data::queue::AsyncQueue;
use oip_record_data::record::Record;

use crate::index::indexer::Indexer;
use crate::index::store::SearchStore;
use crate::index::{IngestAck, IngestEnvelope, IngestItem};
use crate::ledger::LedgerApi;
use crate::monitor::MemoryPressure;
use crate::peergraph::{get_envelope, open_data, GraphError, PeerGraph};
use crate::LongLivedService;

/// A cycle taking longer than this many intervals is aborted.
const CYCLE_DEADLINE_FACTOR: u32 = 10;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub peers: usize,
    pub fetched: usize,
    pub committed: usize,
    pub deletions: usize,
    pub suppressed_deletions: usize,
    pub queued_decryptions: usize,
    pub failures: usize,
}

/// Builds one peer-graph client per peer per cycle; dropping it at cycle
/// end is what releases the pooled response buffers.
pub type PeerFactory<P> = Box<dyn Fn(&str) -> P + Send + Sync>;

pub struct SyncSrv<P: PeerGraph> {
    conf: conf::Params,
    ingest: AsyncQueue<IngestEnvelope>,
    make_peer: PeerFactory<P>,
    pressure: MemoryPressure,
    /// did -> when its deletion was last processed. Pruned each cycle.
    processed_deletions: HashMap<String, Instant>,
}

impl<P: PeerGraph> SyncSrv<P> {
    pub fn new(
        conf: conf::Params,
        ingest: AsyncQueue<IngestEnvelope>,
        make_peer: PeerFactory<P>,
        pressure: MemoryPressure,
    ) -> Self {
        info!("SyncSrv::new with conf: {:?}", conf);
        Self {
            conf,
            ingest,
            make_peer,
            pressure,
            processed_deletions: HashMap::new(),
        }
    }

    /// One full synchronization pass over every configured peer.
    pub async fn run_cycle(
        &mut self,
        store: &SearchStore,
    ) -> anyhow::Result<CycleStats> {
        let mut stats = CycleStats::default();
        // the same did is never processed twice within one cycle, no
        // matter how many peers advertise it
        let mut cycle_seen: HashSet<String> = HashSet::new();

        let permits = if self.pressure.is_high() {
            (self.conf.max_concurrent_requests / 2).max(1)
        } else {
            self.conf.max_concurrent_requests
        };

        let peers = self.conf.peers.clone();
        for peer_url in &peers {
            stats.peers += 1;
            if let Err(e) = self
                .sync_peer(store, peer_url, permits, &mut cycle_seen, &mut stats)
                .await
            {
                warn!(event = "peer_sync_failed", peer = %peer_url, reason = %e);
                stats.failures += 1;
            }
        }

        self.prune_processed();
        Ok(stats)
    }

    async fn sync_peer(
        &mut self,
        store: &SearchStore,
        peer_url: &str,
        permits: usize,
        cycle_seen: &mut HashSet<String>,
        stats: &mut CycleStats,
    ) -> anyhow::Result<()> {
        // fresh client per peer per cycle
        let client = Arc::new((self.make_peer)(peer_url));

        let registry = match client.registry().await {
            Ok(registry) => registry,
            Err(e) => {
                store.bump_peer_health(peer_url, -1).await?;
                warn!(
                    event = "registry_unreachable",
                    peer = %peer_url,
                    reason = %e,
                );
                stats.failures += 1;
                return Ok(());
            }
        };

        let watermark = store.peer_watermark(peer_url).await?;
        let mut peer_ok = true;
        let mut processed_high_water = watermark;

        let acks: AsyncQueue<IngestAck> =
            AsyncQueue::unbounded("sync_acks");
        let mut pending_acks = 0usize;

        let semaphore = Arc::new(Semaphore::new(permits));
        let mut fetches: JoinSet<(
            String,
            i64,
            Result<Option<Envelope>, GraphError>,
        )> = JoinSet::new();

        for (did_str, entry) in &registry {
            if cycle_seen.contains(did_str) {
                continue;
            }

            let Ok(did) = did_str.parse::<Did>() else {
                warn!(event = "registry_bad_did", did = %did_str);
                continue;
            };
            if did.storage() != RecordStorage::Peer {
                continue;
            }

            if entry.deleted {
                if self.deletion_suppressed(did_str) {
                    stats.suppressed_deletions += 1;
                    continue;
                }
                self.processed_deletions
                    .insert(did_str.clone(), Instant::now());
                cycle_seen.insert(did_str.clone());

                self.ingest
                    .send(IngestEnvelope::with_ack(
                        IngestItem::Deletion { did, block: None },
                        acks.clone(),
                    ))
                    .await?;
                pending_acks += 1;
                stats.deletions += 1;
                continue;
            }

            // a recently processed deletion suppresses re-fetching until
            // the reprocessing window elapses
            if store.is_deleted(did_str).await?
                && self.deletion_suppressed(did_str)
            {
                stats.suppressed_deletions += 1;
                continue;
            }

            let known = store.get_record(did_str).await?.is_some();
            if known && entry.last_updated <= watermark {
                processed_high_water =
                    processed_high_water.max(entry.last_updated);
                continue;
            }

            cycle_seen.insert(did_str.clone());

            let soul = did.id().to_string();
            let did_str = did_str.clone();
            let last_updated = entry.last_updated;
            let client = client.clone();
            let permit = semaphore.clone().acquire_owned().await?;

            fetches.spawn(async move {
                let result = get_envelope(client.as_ref(), &soul).await;
                drop(permit);
                (did_str, last_updated, result)
            });
        }

        while let Some(joined) = fetches.join_next().await {
            let (did_str, last_updated, result) = joined?;
            match result {
                Err(e) => {
                    warn!(
                        event = "envelope_fetch_failed",
                        did = %did_str,
                        reason = %e,
                    );
                    stats.failures += 1;
                    peer_ok = false;
                }
                // listed in a registry but gone from the graph: not an
                // error, just a weaker peer
                Ok(None) => {
                    store.bump_peer_health(peer_url, -1).await?;
                }
                Ok(Some(envelope)) => {
                    stats.fetched += 1;
                    match self
                        .handle_envelope(store, &did_str, envelope, &acks)
                        .await
                    {
                        Ok(Handled::Queued) => {
                            pending_acks += 1;
                            stats.committed += 1;
                            processed_high_water =
                                processed_high_water.max(last_updated);
                        }
                        Ok(Handled::AwaitingOwner) => {
                            stats.queued_decryptions += 1;
                            processed_high_water =
                                processed_high_water.max(last_updated);
                        }
                        Ok(Handled::Dropped) => {}
                        Err(e) => {
                            warn!(
                                event = "envelope_rejected",
                                did = %did_str,
                                reason = %e,
                            );
                            stats.failures += 1;
                            peer_ok = false;
                        }
                    }
                }
            }
        }

        for _ in 0..pending_acks {
            let ack = acks.recv().await?;
            if !ack.advanced {
                peer_ok = false;
            }
        }

        // the watermark only moves on a clean pass; any mid-cycle
        // failure keeps it put so the next cycle retries the remainder
        if peer_ok && processed_high_water > watermark {
            store
                .set_peer_watermark(peer_url, processed_high_water)
                .await?;
        }

        Ok(())
    }

    async fn handle_envelope(
        &self,
        store: &SearchStore,
        did_str: &str,
        envelope: Envelope,
        acks: &AsyncQueue<IngestAck>,
    ) -> anyhow::Result<Handled> {
        if !envelope.is_encrypted() {
            let Some(data) = envelope.data.clone() else {
                return Ok(Handled::Dropped);
            };
            let record = Record {
                oip: envelope.oip,
                data: serde_json::from_value(data)?,
            };
            self.ingest
                .send(IngestEnvelope::with_ack(
                    IngestItem::Record { record },
                    acks.clone(),
                ))
                .await?;
            return Ok(Handled::Queued);
        }

        let access = envelope.oip.access.clone();
        match access.as_ref().map(|a| a.level) {
            Some(AccessLevel::Organization) => {
                let Some(org_did) = access
                    .as_ref()
                    .and_then(|a| a.organization_did.as_ref())
                else {
                    return Ok(Handled::Dropped);
                };
                // the organization key is derivable from the public DID
                // alone, so remote nodes index these without any secret
                let key = derive_organization_key(&org_did.to_string());
                match decrypt_envelope_record(&envelope, &key) {
                    Ok(record) => {
                        self.ingest
                            .send(IngestEnvelope::with_ack(
                                IngestItem::Record { record },
                                acks.clone(),
                            ))
                            .await?;
                        Ok(Handled::Queued)
                    }
                    Err(e) => {
                        warn!(
                            event = "organization_decrypt_failed",
                            did = %did_str,
                            reason = %e,
                        );
                        Ok(Handled::Dropped)
                    }
                }
            }
            // per-user envelopes wait for the owner's next login
            _ => {
                let owner = access
                    .as_ref()
                    .and_then(|a| a.owner_pub_key.clone())
                    .unwrap_or_else(|| envelope.oip.creator.pub_key.clone());
                store
                    .enqueue_decryption(
                        did_str,
                        &owner,
                        &serde_json::to_string(&envelope)?,
                        Utc::now().timestamp(),
                    )
                    .await?;
                Ok(Handled::AwaitingOwner)
            }
        }
    }

    fn deletion_suppressed(&self, did: &str) -> bool {
        self.processed_deletions
            .get(did)
            .is_some_and(|at| at.elapsed() < self.conf.reprocess_window)
    }

    /// Drop suppression entries whose window elapsed; rebuilding the map
    /// (rather than retaining in place) actually releases the strings.
    fn prune_processed(&mut self) {
        let window = self.conf.reprocess_window;
        let retained: HashMap<String, Instant> = self
            .processed_deletions
            .drain()
            .filter(|(_, at)| at.elapsed() < window)
            .collect();
        self.processed_deletions = retained;
    }
}

enum Handled {
    Queued,
    AwaitingOwner,
    Dropped,
}

/// Decrypt an envelope and reassemble the plaintext record.
fn decrypt_envelope_record(
    envelope: &Envelope,
    key: &EnvelopeKey,
) -> anyhow::Result<Record> {
    let cipher = envelope
        .cipher
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("envelope has no cipher parts"))?;
    let data = open_data(key, cipher)?;

    let mut oip = envelope.oip.clone();
    oip.encrypted = false;
    Ok(Record {
        oip,
        data: serde_json::from_value(data)?,
    })
}

#[async_trait]
impl<L: LedgerApi, G: PeerGraph, P: PeerGraph> LongLivedService<L, G>
    for SyncSrv<P>
{
    async fn execute(
        &mut self,
        _ledger: Arc<RwLock<L>>,
        _graph: Arc<RwLock<G>>,
        store: SearchStore,
    ) -> anyhow::Result<usize> {
        info!("sync engine started");
        let mut ticker = tokio::time::interval(self.conf.interval);
        let deadline = self.conf.interval * CYCLE_DEADLINE_FACTOR;

        loop {
            ticker.tick().await;

            match tokio::time::timeout(deadline, self.run_cycle(&store)).await
            {
                Ok(Ok(stats)) => {
                    info!(
                        event = "sync_cycle_done",
                        peers = stats.peers,
                        fetched = stats.fetched,
                        committed = stats.committed,
                        deletions = stats.deletions,
                        suppressed = stats.suppressed_deletions,
                        queued_decryptions = stats.queued_decryptions,
                        failures = stats.failures,
                    );
                }
                Ok(Err(e)) => {
                    warn!(event = "sync_cycle_failed", reason = %e);
                }
                Err(_) => {
                    warn!(event = "sync_cycle_timeout", ?deadline);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "sync_engine"
    }
}

/// Drains a user's decryption queue after login, when their envelope key
/// can finally be derived.
pub struct DecryptionWorker {
    store: SearchStore,
    indexer: Arc<Indexer>,
}

impl DecryptionWorker {
    pub fn new(store: SearchStore, indexer: Arc<Indexer>) -> Self {
        Self { store, indexer }
    }

    /// Decrypt and index everything pending for the owner. Returns how
    /// many records were committed; rows that fail to decrypt are marked
    /// `failed` and left for inspection.
    pub async fn drain_owner(
        &self,
        owner_pub_key: &str,
        salt: &[u8],
    ) -> anyhow::Result<usize> {
        let key = derive_user_key(owner_pub_key, salt);
        let pending = self.store.pending_decryptions(owner_pub_key).await?;
        let mut drained = 0usize;

        for row in pending {
            let attempt: anyhow::Result<()> = async {
                let envelope: Envelope =
                    serde_json::from_str(&row.envelope_json)?;
                let record = decrypt_envelope_record(&envelope, &key)?;
                self.indexer
                    .ingest(IngestItem::Record { record })
                    .await?;
                Ok(())
            }
            .await;

            match attempt {
                Ok(()) => {
                    self.store
                        .set_decryption_status(&row.did, "decrypted")
                        .await?;
                    drained += 1;
                }
                Err(e) => {
                    warn!(
                        event = "decryption_failed",
                        did = %row.did,
                        reason = %e,
                    );
                    self.store
                        .set_decryption_status(&row.did, "failed")
                        .await?;
                }
            }
        }

        Ok(drained)
    }
}
