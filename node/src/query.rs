// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod resolver;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use oip_record_data::access::{Organization, Principal};
use oip_record_data::template::TemplateDirectory;

use crate::index::store::{
    SearchRequest, SearchStore, SortColumn, StoredRecord,
};
use crate::query::resolver::MAX_RESOLVE_DEPTH;

pub const MAX_LIMIT: i64 = 500;
pub const DEFAULT_LIMIT: i64 = 20;

/// Raw result sets may be served from cache for this long. Access
/// filtering always runs after the cache lookup, so the cache never
/// leaks across principals.
const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("bad query: {0}")]
    BadQuery(String),
    #[error("transient query failure: {0}")]
    Transient(String),
    #[error("access denied")]
    AccessDenied,
}

/// The structured query surface; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecordQuery {
    pub did: Option<String>,
    #[serde(rename = "recordType")]
    pub record_type: Option<String>,
    pub storage: Option<String>,
    /// Backward-compatible alias for `storage`.
    pub source: Option<String>,
    pub search: Option<String>,
    /// `AND` (default) or `OR`; applies to search terms and tags alike.
    #[serde(rename = "searchMatchMode")]
    pub search_match_mode: Option<String>,
    /// Comma-separated tag filter.
    pub tags: Option<String>,
    pub creator: Option<String>,
    /// `<field>:asc|desc`; defaults to `date:desc`.
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(rename = "resolveDepth")]
    pub resolve_depth: Option<u8>,
    #[serde(rename = "includeSigs")]
    pub include_sigs: Option<bool>,
}

/// One page of query results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryPage {
    #[serde(rename = "totalRecords")]
    pub total_records: i64,
    pub records: Vec<Value>,
    #[serde(rename = "appliedFilters")]
    pub applied_filters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
}

struct CacheEntry {
    at: Instant,
    total: i64,
    rows: Arc<Vec<StoredRecord>>,
}

/// TTL cache over raw result sets, keyed by the normalized request.
struct QueryCache {
    inner: Mutex<HashMap<String, CacheEntry>>,
}

impl QueryCache {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<(i64, Arc<Vec<StoredRecord>>)> {
        let inner = self.inner.lock();
        let entry = inner.get(key)?;
        (entry.at.elapsed() < CACHE_TTL)
            .then(|| (entry.total, entry.rows.clone()))
    }

    fn insert(&self, key: String, total: i64, rows: Arc<Vec<StoredRecord>>) {
        let mut inner = self.inner.lock();
        inner.retain(|_, e| e.at.elapsed() < CACHE_TTL);
        if inner.len() >= CACHE_CAPACITY {
            if let Some(oldest) = inner
                .iter()
                .min_by_key(|(_, e)| e.at)
                .map(|(k, _)| k.clone())
            {
                inner.remove(&oldest);
            }
        }
        inner.insert(
            key,
            CacheEntry {
                at: Instant::now(),
                total,
                rows,
            },
        );
    }
}

/// Translates structured queries into search-store requests and applies
/// visibility and reference resolution on the way out.
pub struct QueryEngine {
    store: SearchStore,
    directory: Arc<RwLock<TemplateDirectory>>,
    cache: QueryCache,
}

impl QueryEngine {
    pub fn new(
        store: SearchStore,
        directory: Arc<RwLock<TemplateDirectory>>,
    ) -> Self {
        Self {
            store,
            directory,
            cache: QueryCache::new(),
        }
    }

    pub async fn query(
        &self,
        query: &RecordQuery,
        caller: &Principal,
    ) -> Result<QueryPage, QueryError> {
        let request = normalize(query)?;
        let depth = query.resolve_depth.unwrap_or(0);
        let include_sigs = query.include_sigs.unwrap_or(true);

        let key = serde_json::to_string(&request)
            .map_err(|e| QueryError::Transient(e.to_string()))?;

        let (total, rows) = match self.cache.get(&key) {
            Some(hit) => {
                debug!(event = "query_cache_hit");
                hit
            }
            None => {
                let (total, rows) = self
                    .store
                    .search(&request)
                    .await
                    .map_err(|e| QueryError::Transient(e.to_string()))?;
                let rows = Arc::new(rows);
                self.cache.insert(key, total, rows.clone());
                (total, rows)
            }
        };

        // Visibility runs per caller, strictly after the cache.
        let mut visible = Vec::with_capacity(rows.len());
        let mut stripped = 0usize;
        for row in rows.iter() {
            if self.visible_to(row, caller).await? {
                visible.push(row.clone());
            } else {
                stripped += 1;
            }
        }

        // A DID-targeted query that only matched records the caller may
        // not see is a 403, carrying nothing further.
        if query.did.is_some() && visible.is_empty() && stripped > 0 {
            return Err(QueryError::AccessDenied);
        }

        let mut records = Vec::with_capacity(visible.len());
        for row in &visible {
            let record = row
                .to_record()
                .map_err(|e| QueryError::Transient(e.to_string()))?;
            records.push(
                serde_json::to_value(record)
                    .map_err(|e| QueryError::Transient(e.to_string()))?,
            );
        }

        let resolution = if depth > 0 {
            let outcome = resolver::resolve_references(
                &self.store,
                &self.directory,
                &mut records,
                depth,
            )
            .await
            .map_err(|e| QueryError::Transient(e.to_string()))?;
            Some(outcome.to_json(depth))
        } else {
            None
        };

        if !include_sigs {
            for record in &mut records {
                strip_signatures(record);
            }
        }

        Ok(QueryPage {
            total_records: total - stripped as i64,
            records,
            applied_filters: applied_filters(query, &request, depth),
            resolution,
        })
    }

    async fn visible_to(
        &self,
        row: &StoredRecord,
        caller: &Principal,
    ) -> Result<bool, QueryError> {
        match row.access_level.as_deref() {
            None | Some("public") => Ok(true),
            Some("private") => Ok(caller
                .pub_key
                .as_deref()
                .is_some_and(|pk| Some(pk) == row.access_owner.as_deref())),
            Some("organization") => {
                let Some(org_did) = row.access_org.as_deref() else {
                    return Ok(false);
                };
                let Some(org_row) = self
                    .store
                    .get_record(org_did)
                    .await
                    .map_err(|e| QueryError::Transient(e.to_string()))?
                else {
                    return Ok(false);
                };
                let Ok(org_record) = org_row.to_record() else {
                    return Ok(false);
                };
                let Some(org) = Organization::from_record(&org_record)
                else {
                    return Ok(false);
                };
                Ok(org.admits(caller))
            }
            Some(_) => Ok(false),
        }
    }
}

/// Validate a raw query into a search request. Malformed input never
/// reaches the store.
fn normalize(query: &RecordQuery) -> Result<SearchRequest, QueryError> {
    let storage = match query
        .storage
        .as_deref()
        .or(query.source.as_deref())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        None | Some("all") => None,
        Some("ledger") => Some("ledger".to_string()),
        Some("peer") => Some("peer".to_string()),
        Some(other) => {
            return Err(QueryError::BadQuery(format!(
                "unknown storage: {other}"
            )))
        }
    };

    let all_terms = match query
        .search_match_mode
        .as_deref()
        .map(str::to_ascii_uppercase)
        .as_deref()
    {
        None | Some("AND") => true,
        Some("OR") => false,
        Some(other) => {
            return Err(QueryError::BadQuery(format!(
                "unknown searchMatchMode: {other}"
            )))
        }
    };

    let search_terms = query
        .search
        .as_deref()
        .map(|s| {
            s.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let tags = query
        .tags
        .as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let (sort, ascending) = parse_sort(query.sort_by.as_deref())?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(0..=MAX_LIMIT).contains(&limit) {
        return Err(QueryError::BadQuery(format!(
            "limit must be between 0 and {MAX_LIMIT}"
        )));
    }

    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(QueryError::BadQuery("offset must be >= 0".into()));
    }

    if let Some(depth) = query.resolve_depth {
        if depth > MAX_RESOLVE_DEPTH {
            return Err(QueryError::BadQuery(format!(
                "resolveDepth must be at most {MAX_RESOLVE_DEPTH}"
            )));
        }
    }

    Ok(SearchRequest {
        did: query.did.clone(),
        record_type: query.record_type.clone(),
        storage,
        search_terms,
        search_all_terms: all_terms,
        tags,
        all_tags: all_terms,
        creator: query.creator.clone(),
        sort,
        ascending,
        limit,
        offset,
    })
}

fn parse_sort(
    sort_by: Option<&str>,
) -> Result<(SortColumn, bool), QueryError> {
    let Some(sort_by) = sort_by else {
        return Ok((SortColumn::IndexedAt, false));
    };

    let (field, direction) = sort_by
        .split_once(':')
        .unwrap_or((sort_by, "desc"));

    let column = match field {
        "date" | "indexedAt" => SortColumn::IndexedAt,
        "name" => SortColumn::Name,
        "blockHeight" | "block" => SortColumn::BlockHeight,
        "recordType" => SortColumn::RecordType,
        other => {
            return Err(QueryError::BadQuery(format!(
                "unknown sort field: {other}"
            )))
        }
    };

    let ascending = match direction {
        "asc" => true,
        "desc" => false,
        other => {
            return Err(QueryError::BadQuery(format!(
                "unknown sort direction: {other}"
            )))
        }
    };

    Ok((column, ascending))
}

fn applied_filters(
    query: &RecordQuery,
    request: &SearchRequest,
    depth: u8,
) -> Value {
    let mut filters = serde_json::Map::new();
    if let Some(did) = &query.did {
        filters.insert("did".into(), json!(did));
    }
    if let Some(record_type) = &request.record_type {
        filters.insert("recordType".into(), json!(record_type));
    }
    filters.insert(
        "storage".into(),
        json!(request.storage.as_deref().unwrap_or("all")),
    );
    if !request.search_terms.is_empty() {
        filters.insert("search".into(), json!(query.search));
        filters.insert(
            "searchMatchMode".into(),
            json!(if request.search_all_terms { "AND" } else { "OR" }),
        );
    }
    if !request.tags.is_empty() {
        filters.insert("tags".into(), json!(request.tags));
    }
    if let Some(creator) = &request.creator {
        filters.insert("creator".into(), json!(creator));
    }
    filters.insert("limit".into(), json!(request.limit));
    filters.insert("offset".into(), json!(request.offset));
    filters.insert("resolveDepth".into(), json!(depth));
    Value::Object(filters)
}

/// Remove signature fields, including from embedded resolved records.
fn strip_signatures(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(oip)) = map.get_mut("oip") {
                oip.remove("signature");
            }
            for v in map.values_mut() {
                strip_signatures(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_signatures(v);
            }
        }
        _ => {}
    }
}
