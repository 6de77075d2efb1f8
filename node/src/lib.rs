// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod events;
pub mod index;
pub mod ledger;
pub mod monitor;
pub mod peergraph;
pub mod publisher;
pub mod query;
pub mod sync;
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::index::store::SearchStore;
use crate::ledger::LedgerApi;
use crate::peergraph::PeerGraph;

/// Service runs one of the node's long-running loops (ledger reader,
/// indexer, sync engine, memory monitor) against the shared runtime
/// context. There are no ambient singletons: every client and store a
/// service touches is handed to it here, which makes client recreation a
/// first-class operation instead of a global callback.
#[async_trait]
pub trait LongLivedService<L: LedgerApi, G: PeerGraph>: Send + Sync {
    async fn execute(
        &mut self,
        ledger: Arc<RwLock<L>>,
        graph: Arc<RwLock<G>>,
        store: SearchStore,
    ) -> anyhow::Result<usize>;

    /// Returns service name.
    fn name(&self) -> &'static str;
}

/// The node aggregate: the ledger client, the local peer-graph client and
/// the search store, shared by all services.
pub struct Node<L: LedgerApi, G: PeerGraph> {
    ledger: Arc<RwLock<L>>,
    graph: Arc<RwLock<G>>,
    store: SearchStore,
}

impl<L: LedgerApi, G: PeerGraph> Clone for Node<L, G> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            graph: self.graph.clone(),
            store: self.store.clone(),
        }
    }
}

impl<L: LedgerApi, G: PeerGraph> Node<L, G> {
    pub fn new(ledger: L, graph: G, store: SearchStore) -> Self {
        Self {
            ledger: Arc::new(RwLock::new(ledger)),
            graph: Arc::new(RwLock::new(graph)),
            store,
        }
    }

    pub fn ledger(&self) -> Arc<RwLock<L>> {
        self.ledger.clone()
    }

    pub fn graph(&self) -> Arc<RwLock<G>> {
        self.graph.clone()
    }

    pub fn store(&self) -> SearchStore {
        self.store.clone()
    }

    /// Sets up and runs a list of services.
    pub async fn spawn_all(
        &self,
        service_list: Vec<Box<dyn LongLivedService<L, G>>>,
    ) -> anyhow::Result<()> {
        let mut set = JoinSet::new();
        set.spawn(async {
            signal(SignalKind::interrupt())?.recv().await;
            Ok(2)
        });

        for mut s in service_list.into_iter() {
            let ledger = self.ledger.clone();
            let graph = self.graph.clone();
            let store = self.store.clone();

            let name = s.name();
            info!("starting service {}", name);

            set.spawn(async move { s.execute(ledger, graph, store).await });
        }

        // Wait for all spawned services to terminate with a result code or
        // an error. Result code 2 aborts all services; it is produced by
        // the SIGINT handler.
        while let Some(res) = set.join_next().await {
            if let Ok(r) = res {
                match r {
                    Ok(rcode) => {
                        if rcode == 2 {
                            set.abort_all();
                        }
                    }
                    Err(e) => {
                        error!("service terminated with err {}", e);
                    }
                }
            }
        }

        info!("shutdown ...");

        Ok(())
    }
}
