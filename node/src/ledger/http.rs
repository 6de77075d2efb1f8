// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::ledger::{
    ItemKind, LedgerApi, LedgerError, LedgerItem, Tag,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled connections against the gateway are dropped and rebuilt on this
/// schedule to bound external buffer accumulation.
const POOL_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// HTTP client for the ledger gateway.
pub struct HttpLedger {
    base_url: String,
    client: reqwest::Client,
    client_created: Instant,
}

#[derive(Deserialize)]
struct TipResponse {
    height: u64,
}

#[derive(Deserialize)]
struct QueryResponse {
    items: Vec<LedgerItem>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "txId")]
    tx_id: Option<String>,
    error: Option<String>,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_slash(base_url.into()),
            client: build_client(),
            client_created: Instant::now(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, LedgerError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Transport(format!(
                "{url}: http {status}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::BadResponse(e.to_string()))
    }
}

#[async_trait]
impl LedgerApi for HttpLedger {
    async fn tip(&self) -> Result<u64, LedgerError> {
        let tip: TipResponse = self.get_json("/tip").await?;
        Ok(tip.height)
    }

    async fn query(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerItem>, LedgerError> {
        let resp: QueryResponse = self
            .get_json(&format!("/query?from={from}&to={to}"))
            .await?;

        // enforce the contract ordering locally as well; gateways differ
        let mut items = resp.items;
        items.sort_by_key(|i| (i.block, i.position));
        Ok(items)
    }

    async fn submit(
        &self,
        kind: ItemKind,
        payload: &Value,
        tags: &[Tag],
    ) -> Result<String, LedgerError> {
        let url = format!("{}/submit", self.base_url);
        let body = json!({
            "kind": kind,
            "payload": payload,
            "tags": tags,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Transport(format!(
                "{url}: http {status}"
            )));
        }

        let resp: SubmitResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::BadResponse(e.to_string()))?;

        match (resp.tx_id, resp.error) {
            (Some(tx_id), _) => Ok(tx_id),
            (None, Some(error)) => Err(LedgerError::Rejected(error)),
            (None, None) => Err(LedgerError::BadResponse(
                "submit response missing txId".into(),
            )),
        }
    }

    /// Drop the pooled client and start a fresh one once it has aged out.
    fn recycle_if_due(&mut self) {
        if self.client_created.elapsed() >= POOL_MAX_AGE {
            debug!(event = "ledger_client_recycled");
            self.client = build_client();
            self.client_created = Instant::now();
        }
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .expect("default client configuration is valid")
}

fn trim_slash(mut s: String) -> String {
    while s.ends_with('/') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let ledger = HttpLedger::new("http://gateway.example/");
        assert_eq!(ledger.base_url, "http://gateway.example");
    }
}
