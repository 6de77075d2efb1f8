// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Bounded recursive expansion of `dref` fields at query time.
//!
//! Targets are pre-fetched breadth-first in `IN` batches, then embedded
//! depth-first with a visited set: the shallowest binding of a DID wins
//! and every later occurrence becomes a reference-only stub, so the
//! output is always a tree even over cyclic references.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use oip_record_data::template::{FieldKind, TemplateDirectory};

use crate::index::store::{SearchStore, StoreError};

/// Depths of 4 and beyond are rejected at query validation.
pub const MAX_RESOLVE_DEPTH: u8 = 3;

/// The side channel reported next to resolved records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Referenced DIDs that are not in the index; left in place as
    /// strings.
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn to_json(&self, depth: u8) -> Value {
        json!({
            "depth": depth,
            "unresolvedReferences": self.unresolved,
        })
    }
}

/// Expand `dref` fields of `records` in place up to `depth`.
pub async fn resolve_references(
    store: &SearchStore,
    directory: &Arc<RwLock<TemplateDirectory>>,
    records: &mut [Value],
    depth: u8,
) -> Result<Resolution, StoreError> {
    if depth == 0 || records.is_empty() {
        return Ok(Resolution::default());
    }

    // Breadth-first pre-fetch of every DID reachable within `depth`.
    let mut resolved: HashMap<String, Value> = HashMap::new();
    let mut unresolved: HashSet<String> = HashSet::new();

    let mut frontier: HashSet<String> = {
        let directory = directory.read();
        records
            .iter()
            .flat_map(|r| collect_refs(r, &directory))
            .collect()
    };

    for _ in 0..depth {
        let wanted: Vec<String> = frontier
            .iter()
            .filter(|did| !resolved.contains_key(*did))
            .cloned()
            .collect();
        if wanted.is_empty() {
            break;
        }

        let rows = store.get_records_by_dids(&wanted).await?;
        let mut found: HashSet<String> = HashSet::new();
        let mut next_frontier = HashSet::new();

        for row in rows {
            let record = row.to_record()?;
            let value = serde_json::to_value(&record)?;
            {
                let directory = directory.read();
                next_frontier.extend(collect_refs(&value, &directory));
            }
            found.insert(row.did.clone());
            resolved.insert(row.did, value);
        }

        for did in wanted {
            if !found.contains(&did) {
                unresolved.insert(did);
            }
        }
        frontier = next_frontier;
    }

    // Depth-first embedding under a shared visited set; the records
    // already in the page are roots and may only reappear as stubs.
    let mut visited: HashSet<String> = records
        .iter()
        .filter_map(|r| r["oip"]["did"].as_str().map(str::to_string))
        .collect();

    {
        let directory = directory.read();
        for record in records.iter_mut() {
            embed(record, &directory, &resolved, &mut visited, depth);
        }
    }

    let mut unresolved: Vec<String> = unresolved.into_iter().collect();
    unresolved.sort();
    Ok(Resolution { unresolved })
}

/// All DIDs referenced by the record's `dref` fields.
fn collect_refs(record: &Value, directory: &TemplateDirectory) -> Vec<String> {
    let mut out = Vec::new();
    let Some(sections) = record["data"].as_object() else {
        return out;
    };

    for (section_name, fields) in sections {
        let Some(template) = directory.by_name(section_name) else {
            continue;
        };
        let Some(fields) = fields.as_object() else { continue };

        for (field_name, value) in fields {
            let Some(def) = template.fields.get(field_name) else {
                continue;
            };
            if !matches!(def.kind.scalar(), FieldKind::DRef) {
                continue;
            }
            match value {
                Value::String(did) => out.push(did.clone()),
                Value::Array(items) => out.extend(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                ),
                _ => {}
            }
        }
    }
    out
}

fn embed(
    record: &mut Value,
    directory: &TemplateDirectory,
    resolved: &HashMap<String, Value>,
    visited: &mut HashSet<String>,
    depth_remaining: u8,
) {
    if depth_remaining == 0 {
        return;
    }

    let Some(sections) = record["data"].as_object_mut() else {
        return;
    };

    for (section_name, fields) in sections.iter_mut() {
        let Some(template) = directory.by_name(section_name) else {
            continue;
        };
        let Some(fields) = fields.as_object_mut() else { continue };

        for (field_name, value) in fields.iter_mut() {
            let Some(def) = template.fields.get(field_name) else {
                continue;
            };
            if !matches!(def.kind.scalar(), FieldKind::DRef) {
                continue;
            }

            match value {
                Value::String(_) => {
                    substitute(value, directory, resolved, visited, depth_remaining);
                }
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if item.is_string() {
                            substitute(
                                item,
                                directory,
                                resolved,
                                visited,
                                depth_remaining,
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn substitute(
    slot: &mut Value,
    directory: &TemplateDirectory,
    resolved: &HashMap<String, Value>,
    visited: &mut HashSet<String>,
    depth_remaining: u8,
) {
    let Some(did) = slot.as_str().map(str::to_string) else {
        return;
    };

    if visited.contains(&did) {
        *slot = json!({"did": did, "stub": true});
        return;
    }

    let Some(target) = resolved.get(&did) else {
        // missing from the index; leave the DID string in place
        return;
    };

    visited.insert(did);
    let mut embedded = target.clone();
    embed(
        &mut embedded,
        directory,
        resolved,
        visited,
        depth_remaining - 1,
    );
    *slot = embedded;
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::events::EventBus;
    use crate::index::indexer::Indexer;
    use crate::index::{IngestItem, IngestOutcome};
    use chrono::Utc;
    use oip_record_data::did::{Did, RecordStorage};
    use oip_record_data::record::{
        Creator, Record, RecordData, SystemMeta,
    };
    use oip_record_data::template::{FieldDef, Template};

    fn post_template() -> Template {
        let mut fields = IndexMap::new();
        fields.insert("name".to_string(), FieldDef::new(0, FieldKind::String));
        fields.insert(
            "ref".to_string(),
            FieldDef::new(1, FieldKind::Repeated(Box::new(FieldKind::DRef))),
        );
        Template {
            did: "did:ledger:tmpl-post".parse().unwrap(),
            name: "post".into(),
            creator_did: "did:ledger:creator".parse().unwrap(),
            fields,
            created_height: 1,
            signature: None,
            creator_pub_key: "pk".into(),
        }
    }

    fn post(did: &str, name: &str, refs: &[&str]) -> Record {
        let mut section = IndexMap::new();
        section.insert("name".to_string(), name.into());
        section.insert(
            "ref".to_string(),
            oip_record_data::record::FieldValue::List(
                refs.iter().map(|r| (*r).into()).collect(),
            ),
        );
        let mut data = RecordData::new();
        data.insert_section("post", section);

        Record {
            oip: SystemMeta {
                did: did.parse().unwrap(),
                legacy_id: None,
                record_type: "post".into(),
                storage: RecordStorage::Ledger,
                indexed_at: Utc::now(),
                block_height: Some(1),
                creator: Creator {
                    pub_key: "pk".into(),
                    address: "addr".into(),
                },
                signature: Some(format!("sig-{did}")),
                access: None,
                encrypted: false,
                ver: "0.8.0".into(),
            },
            data,
        }
    }

    async fn seeded_indexer(records: &[Record]) -> Indexer {
        let store = crate::index::store::SearchStore::open_in_memory()
            .await
            .unwrap();
        let idx = Indexer::new(store, EventBus::new()).await.unwrap();
        idx.ingest(IngestItem::Template {
            template: post_template(),
            block: Some(1),
        })
        .await
        .unwrap();
        for record in records {
            let outcome = idx
                .ingest(IngestItem::Record {
                    record: record.clone(),
                })
                .await
                .unwrap();
            assert!(matches!(outcome, IngestOutcome::Committed(_)));
        }
        idx
    }

    async fn page_for(idx: &Indexer, did: &str) -> Vec<Value> {
        let row = idx.store().get_record(did).await.unwrap().unwrap();
        vec![serde_json::to_value(row.to_record().unwrap()).unwrap()]
    }

    #[tokio::test]
    async fn cycle_resolves_to_a_tree_with_stub() {
        let idx = seeded_indexer(&[
            post("did:ledger:A", "A", &["did:ledger:B"]),
            post("did:ledger:B", "B", &["did:ledger:C"]),
            post("did:ledger:C", "C", &["did:ledger:A"]),
        ])
        .await;

        let mut page = page_for(&idx, "did:ledger:A").await;
        let resolution = resolve_references(
            idx.store(),
            &idx.directory(),
            &mut page,
            3,
        )
        .await
        .unwrap();
        assert!(resolution.unresolved.is_empty());

        let a = &page[0];
        let b = &a["data"]["post"]["ref"][0];
        assert_eq!(b["oip"]["did"], "did:ledger:B");

        let c = &b["data"]["post"]["ref"][0];
        assert_eq!(c["oip"]["did"], "did:ledger:C");

        // the cycle back to A is cut with a reference-only stub
        let back = &c["data"]["post"]["ref"][0];
        assert_eq!(*back, json!({"did": "did:ledger:A", "stub": true}));
    }

    #[tokio::test]
    async fn depth_zero_is_untouched() {
        let idx = seeded_indexer(&[
            post("did:ledger:A", "A", &["did:ledger:B"]),
            post("did:ledger:B", "B", &[]),
        ])
        .await;

        let mut page = page_for(&idx, "did:ledger:A").await;
        let before = page.clone();
        resolve_references(idx.store(), &idx.directory(), &mut page, 0)
            .await
            .unwrap();
        assert_eq!(page, before);
    }

    #[tokio::test]
    async fn depth_limits_expansion() {
        let idx = seeded_indexer(&[
            post("did:ledger:A", "A", &["did:ledger:B"]),
            post("did:ledger:B", "B", &["did:ledger:C"]),
            post("did:ledger:C", "C", &[]),
        ])
        .await;

        let mut page = page_for(&idx, "did:ledger:A").await;
        resolve_references(idx.store(), &idx.directory(), &mut page, 1)
            .await
            .unwrap();

        let b = &page[0]["data"]["post"]["ref"][0];
        assert_eq!(b["oip"]["did"], "did:ledger:B");
        // depth exhausted: B's reference stays a plain DID string
        assert_eq!(b["data"]["post"]["ref"][0], "did:ledger:C");
    }

    #[tokio::test]
    async fn missing_reference_is_flagged_not_fatal() {
        let idx = seeded_indexer(&[post(
            "did:ledger:A",
            "A",
            &["did:ledger:nowhere"],
        )])
        .await;

        let mut page = page_for(&idx, "did:ledger:A").await;
        let resolution = resolve_references(
            idx.store(),
            &idx.directory(),
            &mut page,
            2,
        )
        .await
        .unwrap();

        assert_eq!(resolution.unresolved, vec!["did:ledger:nowhere"]);
        assert_eq!(page[0]["data"]["post"]["ref"][0], "did:ledger:nowhere");
    }

    #[tokio::test]
    async fn shared_target_embeds_once() {
        let idx = seeded_indexer(&[
            post(
                "did:ledger:A",
                "A",
                &["did:ledger:B", "did:ledger:B"],
            ),
            post("did:ledger:B", "B", &[]),
        ])
        .await;

        let mut page = page_for(&idx, "did:ledger:A").await;
        resolve_references(idx.store(), &idx.directory(), &mut page, 2)
            .await
            .unwrap();

        let refs = page[0]["data"]["post"]["ref"].as_array().unwrap();
        assert_eq!(refs[0]["oip"]["did"], "did:ledger:B");
        assert_eq!(refs[1], json!({"did": "did:ledger:B", "stub": true}));
    }
}
