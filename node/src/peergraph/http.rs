// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use oip_record_data::registry::RegistryMap;

use crate::peergraph::{GraphError, MissCache, PeerGraph};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// `get` retries non-404 failures this many extra times; 404 never
/// retries.
const GET_RETRIES: u32 = 2;
/// `put` attempts in total.
const PUT_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// HTTP client for one peer graph relay.
///
/// Cheap to construct: the sync engine builds a fresh one per peer per
/// cycle so pooled response buffers are actually released, while the 404
/// cache is shared across recreations.
pub struct HttpPeerGraph {
    base_url: String,
    client: reqwest::Client,
    misses: Arc<MissCache>,
}

#[derive(Deserialize)]
struct PutResponse {
    success: bool,
    error: Option<String>,
}

impl HttpPeerGraph {
    pub fn new(base_url: impl Into<String>, misses: Arc<MissCache>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Self {
            base_url,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("default client configuration is valid"),
            misses,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_once(
        &self,
        soul: &str,
    ) -> Result<Option<Value>, GraphError> {
        let url = format!("{}/get", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("soul", soul)])
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        // Read the status before the body is consumed: a missing soul is
        // an answer, not an error, and must be decided while the response
        // is still whole.
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            self.misses.record_miss(soul);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GraphError::Network(format!("{url}: http {status}")));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| GraphError::BadResponse(e.to_string()))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl PeerGraph for HttpPeerGraph {
    async fn get(&self, soul: &str) -> Result<Option<Value>, GraphError> {
        if self.misses.is_missing(soul) {
            debug!(event = "miss_cache_hit", soul);
            return Ok(None);
        }

        let mut attempt = 0;
        loop {
            match self.get_once(soul).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < GET_RETRIES => {
                    attempt += 1;
                    warn!(
                        event = "graph_get_retry",
                        soul,
                        attempt,
                        reason = %e,
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn put(
        &self,
        soul: &str,
        data: Option<&Value>,
    ) -> Result<(), GraphError> {
        let url = format!("{}/put", self.base_url);
        let body = json!({
            "soul": soul,
            "data": data,
        });

        let mut attempt = 0;
        loop {
            let result = async {
                let response = self
                    .client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| GraphError::Network(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(GraphError::Network(format!(
                        "{url}: http {status}"
                    )));
                }

                let resp: PutResponse = response
                    .json()
                    .await
                    .map_err(|e| GraphError::BadResponse(e.to_string()))?;

                if !resp.success {
                    return Err(GraphError::Rejected(
                        resp.error.unwrap_or_else(|| "unknown".into()),
                    ));
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => {
                    self.misses.forget(soul);
                    return Ok(());
                }
                Err(e @ GraphError::Network(_))
                    if attempt + 1 < PUT_ATTEMPTS =>
                {
                    attempt += 1;
                    warn!(
                        event = "graph_put_retry",
                        soul,
                        attempt,
                        reason = %e,
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn registry(&self) -> Result<RegistryMap, GraphError> {
        let url = format!("{}/registry", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // a peer that has advertised nothing yet
            return Ok(RegistryMap::new());
        }
        if !status.is_success() {
            return Err(GraphError::Network(format!("{url}: http {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| GraphError::BadResponse(e.to_string()))
    }
}
