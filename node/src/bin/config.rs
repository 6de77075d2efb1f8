// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use oip_node::ledger::reader;
use oip_node::sync::conf as sync_conf;

/// Default log_level.
const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_DB_PATH: &str = "./oip-data";
const DEFAULT_LEDGER_ENDPOINT: &str = "http://127.0.0.1:1984";
const DEFAULT_GRAPH_ENDPOINT: &str = "http://127.0.0.1:8765";

#[derive(Serialize, Deserialize, Clone, Default)]
pub(crate) struct Config {
    log_level: Option<String>,
    db_path: Option<PathBuf>,
    mnemonic_path: Option<PathBuf>,

    #[serde(default)]
    pub(crate) ledger: LedgerConfig,
    #[serde(default)]
    pub(crate) graph: GraphConfig,
    #[serde(default)]
    pub(crate) sync: sync_conf::Params,
    #[serde(default)]
    pub(crate) reader: reader::Params,
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub(crate) struct LedgerConfig {
    endpoint: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub(crate) struct GraphConfig {
    endpoint: Option<String>,
}

impl Config {
    pub(crate) fn load(args: &crate::Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => {
                let toml = std::fs::read_to_string(path)?;
                toml::from_str(&toml)?
            }
            None => Config::default(),
        };

        // CLI flags win over the file
        if let Some(log_level) = &args.log_level {
            config.log_level = Some(log_level.clone());
        }
        if let Some(db_path) = &args.db_path {
            config.db_path = Some(db_path.clone());
        }
        if let Some(mnemonic_path) = &args.mnemonic_path {
            config.mnemonic_path = Some(mnemonic_path.clone());
        }

        Ok(config)
    }

    pub(crate) fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub(crate) fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
    }

    pub(crate) fn mnemonic_path(&self) -> Option<&PathBuf> {
        self.mnemonic_path.as_ref()
    }

    pub(crate) fn ledger_endpoint(&self) -> &str {
        self.ledger
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_LEDGER_ENDPOINT)
    }

    pub(crate) fn graph_endpoint(&self) -> &str {
        self.graph
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_GRAPH_ENDPOINT)
    }
}
