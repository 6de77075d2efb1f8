// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use oip_keys::NodeIdentity;
use oip_node::index::indexer::Indexer;
use oip_node::index::service::IndexerSrv;
use oip_node::index::store::SearchStore;
use oip_node::ledger::http::HttpLedger;
use oip_node::ledger::reader::LedgerSrv;
use oip_node::monitor::{MemoryPressure, MonitorSrv};
use oip_node::peergraph::http::HttpPeerGraph;
use oip_node::peergraph::MissCache;
use oip_node::sync::SyncSrv;
use oip_node::{events::EventBus, LongLivedService, Node};

mod config;
use config::Config;

/// Exit code for unrecoverable misconfiguration.
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "oip-node", about = "OIP record indexing node")]
pub(crate) struct Args {
    /// Configuration file path
    #[arg(short, long, env = "OIP_CONFIG_TOML")]
    pub(crate) config: Option<PathBuf>,

    /// Output log level
    #[arg(long)]
    pub(crate) log_level: Option<String>,

    /// Database directory path
    #[arg(long)]
    pub(crate) db_path: Option<PathBuf>,

    /// Path to the node's BIP39 recovery phrase
    #[arg(long, env = "OIP_MNEMONIC_PATH")]
    pub(crate) mnemonic_path: Option<PathBuf>,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    configure_log(&config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime to build")
        .block_on(async {
            let store =
                match SearchStore::create_or_open(config.db_path()).await {
                    Ok(store) => store,
                    Err(e) => {
                        error!("search store unreachable: {e}");
                        std::process::exit(EXIT_FATAL);
                    }
                };

            let identity = match load_identity(&config) {
                Ok(identity) => identity,
                Err(e) => {
                    error!("signing key unavailable: {e}");
                    std::process::exit(EXIT_FATAL);
                }
            };
            info!(
                event = "node_identity",
                creator = %identity.creator_did(),
            );

            let events = EventBus::new();
            let indexer =
                match Indexer::new(store.clone(), events.clone()).await {
                    Ok(indexer) => Arc::new(indexer),
                    Err(e) => {
                        error!("index bootstrap failed: {e}");
                        std::process::exit(EXIT_FATAL);
                    }
                };

            let indexer_srv = IndexerSrv::new(indexer.clone());
            let queue = indexer_srv.queue();

            let pressure = MemoryPressure::default();
            let misses = Arc::new(MissCache::with_defaults());

            let sync_misses = misses.clone();
            let sync_srv = SyncSrv::new(
                config.sync.clone(),
                queue.clone(),
                Box::new(move |url| {
                    HttpPeerGraph::new(url, sync_misses.clone())
                }),
                pressure.clone(),
            );

            type Services = dyn LongLivedService<HttpLedger, HttpPeerGraph>;
            let service_list: Vec<Box<Services>> = vec![
                Box::new(indexer_srv),
                Box::new(LedgerSrv::new(config.reader.clone(), queue)),
                Box::new(sync_srv),
                Box::new(MonitorSrv::new(pressure)),
            ];

            let ledger = HttpLedger::new(config.ledger_endpoint());
            let graph = HttpPeerGraph::new(config.graph_endpoint(), misses);

            if let Err(e) =
                Node::new(ledger, graph, store).spawn_all(service_list).await
            {
                tracing::error!("node terminated with err: {}", e);
                Err(e)
            } else {
                Ok(())
            }
        })
}

fn load_identity(config: &Config) -> anyhow::Result<NodeIdentity> {
    let phrase = match config.mnemonic_path() {
        Some(path) => std::fs::read_to_string(path)?,
        None => std::env::var("OIP_MNEMONIC")
            .map_err(|_| anyhow::anyhow!("no mnemonic configured"))?,
    };
    Ok(NodeIdentity::from_mnemonic(phrase.trim())?)
}

fn configure_log(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(config.log_level())
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}
