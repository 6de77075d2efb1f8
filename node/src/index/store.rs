// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The sqlite-backed search store.
//!
//! One database file holds the searchable record index plus the node's
//! durable bookkeeping: stream checkpoints, the deletion registry, the
//! decryption queue, dead letters and per-peer sync watermarks.

use std::path::Path;
use std::str::FromStr;

use chrono::DateTime;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::info;

use oip_record_data::access::{AccessControl, AccessLevel};
use oip_record_data::did::Did;
use oip_record_data::record::{Creator, FieldValue, Record, SystemMeta};
use oip_record_data::template::Template;

/// The name of the search store database file.
const STORE_DB_NAME: &str = "index.sqlite3";

/// Largest `IN (...)` batch a single lookup request may carry.
pub const MAX_BATCH_DIDS: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// A record as it lies in the `records` table, with the derived search
/// columns alongside the full expanded data.
#[derive(Debug, Clone, FromRow)]
pub struct StoredRecord {
    pub did: String,
    pub legacy_id: Option<String>,
    pub record_type: String,
    pub storage: String,
    pub indexed_at: i64,
    pub block_height: Option<i64>,
    pub creator_pub_key: String,
    pub creator_address: String,
    pub signature: Option<String>,
    pub access_level: Option<String>,
    pub access_owner: Option<String>,
    pub access_org: Option<String>,
    pub encrypted: bool,
    pub ver: String,
    pub name: String,
    pub description: String,
    /// Flat `,tag1,tag2,` form, matched with `LIKE`.
    pub tags: String,
    /// Concatenated textual body fields, matched by full-text search.
    pub body: String,
    pub data_json: String,
}

impl StoredRecord {
    pub fn from_record(record: &Record) -> Result<Self, StoreError> {
        let oip = &record.oip;

        let mut name = String::new();
        let mut description = String::new();
        let mut tags = Vec::new();
        let mut body = Vec::new();

        for (_, section) in record.data.iter() {
            for (field, value) in section {
                match (field.as_str(), value) {
                    ("name", FieldValue::Str(s)) if name.is_empty() => {
                        name = s.clone();
                    }
                    ("description", FieldValue::Str(s))
                        if description.is_empty() =>
                    {
                        description = s.clone();
                    }
                    ("tagItems" | "tags", FieldValue::List(items)) => {
                        tags.extend(
                            items
                                .iter()
                                .filter_map(FieldValue::as_str)
                                .map(str::to_string),
                        );
                    }
                    (_, FieldValue::Str(s)) => body.push(s.clone()),
                    (_, FieldValue::List(items)) => body.extend(
                        items
                            .iter()
                            .filter_map(FieldValue::as_str)
                            .map(str::to_string),
                    ),
                    _ => {}
                }
            }
        }

        let flat_tags = if tags.is_empty() {
            String::new()
        } else {
            format!(",{},", tags.join(","))
        };

        Ok(Self {
            did: oip.did.to_string(),
            legacy_id: oip.legacy_id.clone(),
            record_type: oip.record_type.clone(),
            storage: oip.storage.as_str().into(),
            indexed_at: oip.indexed_at.timestamp(),
            block_height: oip.block_height.map(|h| h as i64),
            creator_pub_key: oip.creator.pub_key.clone(),
            creator_address: oip.creator.address.clone(),
            signature: oip.signature.clone(),
            access_level: oip
                .access
                .as_ref()
                .map(|a| level_str(a.level).into()),
            access_owner: oip
                .access
                .as_ref()
                .and_then(|a| a.owner_pub_key.clone()),
            access_org: oip
                .access
                .as_ref()
                .and_then(|a| a.organization_did.as_ref())
                .map(ToString::to_string),
            encrypted: oip.encrypted,
            ver: oip.ver.clone(),
            name,
            description,
            tags: flat_tags,
            body: body.join(" "),
            data_json: serde_json::to_string(&record.data)?,
        })
    }

    pub fn to_record(&self) -> Result<Record, StoreError> {
        let did: Did = self
            .did
            .parse()
            .map_err(|_| Self::corrupt("did", &self.did))?;
        let storage = self
            .storage
            .parse()
            .map_err(|_| Self::corrupt("storage", &self.storage))?;

        let access = match self.access_level.as_deref() {
            None => None,
            Some(level) => Some(AccessControl {
                level: parse_level(level)
                    .ok_or_else(|| Self::corrupt("access_level", level))?,
                owner_pub_key: self.access_owner.clone(),
                organization_did: self
                    .access_org
                    .as_deref()
                    .map(str::parse)
                    .transpose()
                    .map_err(|_| Self::corrupt("access_org", ""))?,
                shared_with: None,
            }),
        };

        Ok(Record {
            oip: SystemMeta {
                did,
                legacy_id: self.legacy_id.clone(),
                record_type: self.record_type.clone(),
                storage,
                indexed_at: DateTime::from_timestamp(self.indexed_at, 0)
                    .ok_or_else(|| {
                        Self::corrupt("indexed_at", &self.did)
                    })?,
                block_height: self.block_height.map(|h| h as u64),
                creator: Creator {
                    pub_key: self.creator_pub_key.clone(),
                    address: self.creator_address.clone(),
                },
                signature: self.signature.clone(),
                access,
                encrypted: self.encrypted,
                ver: self.ver.clone(),
            },
            data: serde_json::from_str(&self.data_json)?,
        })
    }

    pub fn tag_list(&self) -> Vec<&str> {
        self.tags
            .split(',')
            .filter(|t| !t.is_empty())
            .collect()
    }

    fn corrupt(column: &str, value: &str) -> StoreError {
        StoreError::Corrupt(format!("{column}: {value}"))
    }
}

fn level_str(level: AccessLevel) -> &'static str {
    match level {
        AccessLevel::Public => "public",
        AccessLevel::Private => "private",
        AccessLevel::Organization => "organization",
    }
}

fn parse_level(s: &str) -> Option<AccessLevel> {
    match s {
        "public" => Some(AccessLevel::Public),
        "private" => Some(AccessLevel::Private),
        "organization" => Some(AccessLevel::Organization),
        _ => None,
    }
}

/// Sortable columns, whitelisted so query input never reaches the SQL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize,
)]
pub enum SortColumn {
    #[default]
    IndexedAt,
    Name,
    BlockHeight,
    RecordType,
}

impl SortColumn {
    fn column(&self) -> &'static str {
        match self {
            SortColumn::IndexedAt => "indexed_at",
            SortColumn::Name => "name",
            SortColumn::BlockHeight => "block_height",
            SortColumn::RecordType => "record_type",
        }
    }
}

/// A fully validated search against the records table.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SearchRequest {
    pub did: Option<String>,
    pub record_type: Option<String>,
    pub storage: Option<String>,
    pub search_terms: Vec<String>,
    pub search_all_terms: bool,
    pub tags: Vec<String>,
    pub all_tags: bool,
    pub creator: Option<String>,
    pub sort: SortColumn,
    pub ascending: bool,
    pub limit: i64,
    pub offset: i64,
}

/// A pending row of the decryption queue.
#[derive(Debug, Clone, FromRow)]
pub struct DecryptionRow {
    pub did: String,
    pub owner_pub_key: String,
    pub envelope_json: String,
    pub enqueued_at: i64,
    pub status: String,
}

#[derive(Debug, Clone, FromRow)]
struct TemplateRow {
    template_did: String,
    name: String,
    creator_did: String,
    fields_json: String,
    created_height: i64,
    signature: Option<String>,
    creator_pub_key: String,
}

impl TemplateRow {
    fn into_template(self) -> Result<Template, StoreError> {
        Ok(Template {
            did: self.template_did.parse().map_err(|_| {
                StoreError::Corrupt(format!(
                    "template did: {}",
                    self.template_did
                ))
            })?,
            name: self.name,
            creator_did: self.creator_did.parse().map_err(|_| {
                StoreError::Corrupt(format!(
                    "creator did: {}",
                    self.creator_did
                ))
            })?,
            fields: serde_json::from_str(&self.fields_json)?,
            created_height: self.created_height as u64,
            signature: self.signature,
            creator_pub_key: self.creator_pub_key,
        })
    }
}

/// The search store handle. Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SearchStore {
    pool: SqlitePool,
}

impl SearchStore {
    /// Create or open the store under the given base folder and run the
    /// embedded migrations.
    pub async fn create_or_open<P: AsRef<Path>>(
        base_path: P,
    ) -> Result<Self, StoreError> {
        let path = base_path.as_ref().join(STORE_DB_NAME);
        info!("Opening search store in {path:?}");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// An in-memory store for tests; a single connection keeps the
    /// database alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    // --- templates ---

    pub async fn put_template(
        &self,
        template: &Template,
    ) -> Result<(), StoreError> {
        let fields_json = serde_json::to_string(&template.fields)?;
        let mapping_json =
            serde_json::to_string(&template.search_mapping())?;

        sqlx::query(
            r#"INSERT INTO templates
               (template_did, name, creator_did, fields_json, mapping_json,
                created_height, signature, creator_pub_key)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(template_did) DO NOTHING"#,
        )
        .bind(template.did.to_string())
        .bind(&template.name)
        .bind(template.creator_did.to_string())
        .bind(fields_json)
        .bind(mapping_json)
        .bind(template.created_height as i64)
        .bind(&template.signature)
        .bind(&template.creator_pub_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn templates(&self) -> Result<Vec<Template>, StoreError> {
        let rows = sqlx::query_as::<_, TemplateRow>(
            r#"SELECT template_did, name, creator_did, fields_json,
                      created_height, signature, creator_pub_key
               FROM templates ORDER BY created_height"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TemplateRow::into_template).collect()
    }

    // --- records ---

    pub async fn upsert_record(
        &self,
        record: &StoredRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO records
               (did, legacy_id, record_type, storage, indexed_at,
                block_height, creator_pub_key, creator_address, signature,
                access_level, access_owner, access_org, encrypted, ver,
                name, description, tags, body, data_json)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(did) DO UPDATE SET
                 legacy_id = excluded.legacy_id,
                 record_type = excluded.record_type,
                 storage = excluded.storage,
                 block_height = excluded.block_height,
                 creator_pub_key = excluded.creator_pub_key,
                 creator_address = excluded.creator_address,
                 signature = excluded.signature,
                 access_level = excluded.access_level,
                 access_owner = excluded.access_owner,
                 access_org = excluded.access_org,
                 encrypted = excluded.encrypted,
                 ver = excluded.ver,
                 name = excluded.name,
                 description = excluded.description,
                 tags = excluded.tags,
                 body = excluded.body,
                 data_json = excluded.data_json"#,
        )
        .bind(&record.did)
        .bind(&record.legacy_id)
        .bind(&record.record_type)
        .bind(&record.storage)
        .bind(record.indexed_at)
        .bind(record.block_height)
        .bind(&record.creator_pub_key)
        .bind(&record.creator_address)
        .bind(&record.signature)
        .bind(&record.access_level)
        .bind(&record.access_owner)
        .bind(&record.access_org)
        .bind(record.encrypted)
        .bind(&record.ver)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.tags)
        .bind(&record.body)
        .bind(&record.data_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch by primary or legacy identifier.
    pub async fn get_record(
        &self,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query_as::<_, StoredRecord>(
            r#"SELECT * FROM records WHERE did = ? OR legacy_id = ?"#,
        )
        .bind(id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Batch fetch, split into `IN` lookups of at most
    /// [`MAX_BATCH_DIDS`] identifiers per request.
    pub async fn get_records_by_dids(
        &self,
        dids: &[String],
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let mut out = Vec::with_capacity(dids.len());

        for chunk in dids.chunks(MAX_BATCH_DIDS) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT * FROM records WHERE did IN (");
            let mut sep = qb.separated(", ");
            for did in chunk {
                sep.push_bind(did);
            }
            qb.push(")");

            let rows = qb
                .build_query_as::<StoredRecord>()
                .fetch_all(&self.pool)
                .await?;
            out.extend(rows);
        }

        Ok(out)
    }

    pub async fn remove_record(&self, did: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM records WHERE did = ?")
            .bind(did)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn count_records(&self) -> Result<i64, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Run a validated search; returns the total match count and one page.
    pub async fn search(
        &self,
        req: &SearchRequest,
    ) -> Result<(i64, Vec<StoredRecord>), StoreError> {
        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM records WHERE 1=1");
        push_filters(&mut count_qb, req);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        if req.limit == 0 {
            return Ok((total, Vec::new()));
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM records WHERE 1=1");
        push_filters(&mut qb, req);

        qb.push(" ORDER BY ")
            .push(req.sort.column())
            .push(if req.ascending { " ASC" } else { " DESC" })
            .push(", did ASC");
        qb.push(" LIMIT ").push_bind(req.limit);
        qb.push(" OFFSET ").push_bind(req.offset);

        let rows = qb
            .build_query_as::<StoredRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok((total, rows))
    }

    // --- checkpoints ---

    pub async fn checkpoint(
        &self,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT value FROM checkpoints WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    pub async fn set_checkpoint(
        &self,
        name: &str,
        value: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO checkpoints (name, value) VALUES (?, ?)
               ON CONFLICT(name) DO UPDATE SET value = excluded.value"#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- deletion registry ---

    pub async fn append_deletion(
        &self,
        did: &str,
        deleted_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO deletions (did, deleted_at) VALUES (?, ?)
               ON CONFLICT(did) DO NOTHING"#,
        )
        .bind(did)
        .bind(deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_deleted(&self, did: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM deletions WHERE did = ?",
        )
        .bind(did)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn deletions(
        &self,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT seq, did FROM deletions ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- decryption queue ---

    pub async fn enqueue_decryption(
        &self,
        did: &str,
        owner_pub_key: &str,
        envelope_json: &str,
        enqueued_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO decryption_queue
               (did, owner_pub_key, envelope_json, enqueued_at, status)
               VALUES (?, ?, ?, ?, 'pending')
               ON CONFLICT(did) DO UPDATE SET
                 envelope_json = excluded.envelope_json,
                 enqueued_at = excluded.enqueued_at,
                 status = 'pending'"#,
        )
        .bind(did)
        .bind(owner_pub_key)
        .bind(envelope_json)
        .bind(enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_decryptions(
        &self,
        owner_pub_key: &str,
    ) -> Result<Vec<DecryptionRow>, StoreError> {
        let rows = sqlx::query_as::<_, DecryptionRow>(
            r#"SELECT * FROM decryption_queue
               WHERE owner_pub_key = ? AND status = 'pending'
               ORDER BY enqueued_at"#,
        )
        .bind(owner_pub_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_decryption_status(
        &self,
        did: &str,
        status: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE decryption_queue SET status = ? WHERE did = ?")
            .bind(status)
            .bind(did)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- dead letters ---

    pub async fn park_dead_letter(
        &self,
        did: Option<&str>,
        reason: &str,
        payload: &Value,
        failed_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO dead_letters (did, reason, payload, failed_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(did)
        .bind(reason)
        .bind(payload.to_string())
        .bind(failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- peers ---

    pub async fn peer_watermark(
        &self,
        peer_url: &str,
    ) -> Result<i64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT last_updated FROM peers WHERE peer_url = ?",
        )
        .bind(peer_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.unwrap_or(0))
    }

    pub async fn set_peer_watermark(
        &self,
        peer_url: &str,
        last_updated: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO peers (peer_url, last_updated) VALUES (?, ?)
               ON CONFLICT(peer_url) DO UPDATE
               SET last_updated = excluded.last_updated"#,
        )
        .bind(peer_url)
        .bind(last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn bump_peer_health(
        &self,
        peer_url: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO peers (peer_url, health) VALUES (?, ?)
               ON CONFLICT(peer_url) DO UPDATE
               SET health = peers.health + excluded.health"#,
        )
        .bind(peer_url)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn peer_health(
        &self,
        peer_url: &str,
    ) -> Result<i64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT health FROM peers WHERE peer_url = ?",
        )
        .bind(peer_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.unwrap_or(0))
    }
}

/// Append the request's WHERE clauses. Shared by the page and the count
/// query so `totalRecords` always agrees with the filter set.
fn push_filters(qb: &mut QueryBuilder<Sqlite>, req: &SearchRequest) {
    if let Some(did) = &req.did {
        qb.push(" AND (did = ")
            .push_bind(did.clone())
            .push(" OR legacy_id = ")
            .push_bind(did.clone())
            .push(")");
    }
    if let Some(record_type) = &req.record_type {
        qb.push(" AND record_type = ").push_bind(record_type.clone());
    }
    if let Some(storage) = &req.storage {
        qb.push(" AND storage = ").push_bind(storage.clone());
    }
    if let Some(creator) = &req.creator {
        qb.push(" AND (creator_address = ")
            .push_bind(creator.clone())
            .push(" OR creator_pub_key = ")
            .push_bind(creator.clone())
            .push(")");
    }

    if !req.search_terms.is_empty() {
        let join = if req.search_all_terms { " AND " } else { " OR " };
        qb.push(" AND (");
        for (i, term) in req.search_terms.iter().enumerate() {
            if i > 0 {
                qb.push(join);
            }
            let pattern = format!("%{}%", escape_like(term));
            qb.push("(name LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR description LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR body LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        qb.push(")");
    }

    if !req.tags.is_empty() {
        let join = if req.all_tags { " AND " } else { " OR " };
        qb.push(" AND (");
        for (i, tag) in req.tags.iter().enumerate() {
            if i > 0 {
                qb.push(join);
            }
            let pattern = format!("%,{},%", escape_like(tag));
            qb.push("tags LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\'");
        }
        qb.push(")");
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use oip_record_data::did::RecordStorage;
    use oip_record_data::record::RecordData;
    use oip_record_data::template::{FieldDef, FieldKind};

    fn record(did: &str, name: &str, tags: &[&str]) -> StoredRecord {
        let mut section = IndexMap::new();
        section.insert(
            "name".to_string(),
            FieldValue::Str(name.to_string()),
        );
        section.insert(
            "tagItems".to_string(),
            FieldValue::List(
                tags.iter().map(|t| FieldValue::Str(t.to_string())).collect(),
            ),
        );
        let mut data = RecordData::new();
        data.insert_section("basic", section);

        let record = Record {
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
                signature: Some("sig".into()),
                access: None,
                encrypted: false,
                ver: "0.8.0".into(),
            },
            data,
        };
        StoredRecord::from_record(&record).unwrap()
    }

    #[tokio::test]
    async fn record_round_trip() {
        let store = SearchStore::open_in_memory().await.unwrap();
        let stored = record("did:ledger:tx1", "Greek Chicken", &["greek"]);
        store.upsert_record(&stored).await.unwrap();

        let row = store.get_record("did:ledger:tx1").await.unwrap().unwrap();
        assert_eq!(row.name, "Greek Chicken");
        assert_eq!(row.tag_list(), vec!["greek"]);

        let record = row.to_record().unwrap();
        assert_eq!(record.oip.record_type, "post");
        assert_eq!(
            record.data.section("basic").unwrap()["name"],
            FieldValue::Str("Greek Chicken".into())
        );
    }

    #[tokio::test]
    async fn legacy_id_resolves() {
        let store = SearchStore::open_in_memory().await.unwrap();
        let mut stored = record("did:ledger:tx2", "A", &[]);
        stored.legacy_id = Some("tx2".into());
        store.upsert_record(&stored).await.unwrap();

        assert!(store.get_record("tx2").await.unwrap().is_some());
        assert!(store.get_record("did:ledger:tx2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_filters_and_pagination() {
        let store = SearchStore::open_in_memory().await.unwrap();
        store
            .upsert_record(&record("did:ledger:a", "Greek Chicken", &["greek"]))
            .await
            .unwrap();
        store
            .upsert_record(&record("did:ledger:b", "Roast Lamb", &["greek"]))
            .await
            .unwrap();
        let mut peer = record("did:peer:soul1", "Greek Salad", &["salad"]);
        peer.storage = "peer".into();
        store.upsert_record(&peer).await.unwrap();

        // full-text
        let (total, rows) = store
            .search(&SearchRequest {
                search_terms: vec!["greek".into()],
                search_all_terms: true,
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        // storage filter
        let (total, rows) = store
            .search(&SearchRequest {
                storage: Some("peer".into()),
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].did, "did:peer:soul1");

        // tags
        let (total, _) = store
            .search(&SearchRequest {
                tags: vec!["greek".into(), "salad".into()],
                all_tags: false,
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        let (total, _) = store
            .search(&SearchRequest {
                tags: vec!["greek".into(), "salad".into()],
                all_tags: true,
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 0);

        // limit 0 returns only the well-formed total
        let (total, rows) = store
            .search(&SearchRequest {
                limit: 0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn checkpoints_and_deletions() {
        let store = SearchStore::open_in_memory().await.unwrap();

        assert_eq!(store.checkpoint("ledger_height").await.unwrap(), None);
        store.set_checkpoint("ledger_height", 42).await.unwrap();
        store.set_checkpoint("ledger_height", 43).await.unwrap();
        assert_eq!(
            store.checkpoint("ledger_height").await.unwrap(),
            Some(43)
        );

        store.append_deletion("did:peer:soul1", 100).await.unwrap();
        store.append_deletion("did:peer:soul1", 200).await.unwrap();
        assert!(store.is_deleted("did:peer:soul1").await.unwrap());
        let deletions = store.deletions().await.unwrap();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].1, "did:peer:soul1");
    }

    #[tokio::test]
    async fn decryption_queue_flow() {
        let store = SearchStore::open_in_memory().await.unwrap();
        store
            .enqueue_decryption("did:peer:s1", "pkA", "{}", 1)
            .await
            .unwrap();
        store
            .enqueue_decryption("did:peer:s2", "pkB", "{}", 2)
            .await
            .unwrap();

        let pending = store.pending_decryptions("pkA").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].did, "did:peer:s1");

        store
            .set_decryption_status("did:peer:s1", "decrypted")
            .await
            .unwrap();
        assert!(store.pending_decryptions("pkA").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn peer_bookkeeping() {
        let store = SearchStore::open_in_memory().await.unwrap();
        assert_eq!(store.peer_watermark("http://n2").await.unwrap(), 0);

        store.set_peer_watermark("http://n2", 1000).await.unwrap();
        assert_eq!(store.peer_watermark("http://n2").await.unwrap(), 1000);

        store.bump_peer_health("http://n2", -1).await.unwrap();
        store.bump_peer_health("http://n2", -1).await.unwrap();
        assert_eq!(store.peer_health("http://n2").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn batch_fetch_by_dids() {
        let store = SearchStore::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .upsert_record(&record(
                    &format!("did:ledger:t{i}"),
                    "r",
                    &[],
                ))
                .await
                .unwrap();
        }

        let dids: Vec<String> = (0..5)
            .map(|i| format!("did:ledger:t{i}"))
            .chain(std::iter::once("did:ledger:missing".to_string()))
            .collect();
        let rows = store.get_records_by_dids(&dids).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn template_round_trip() {
        let store = SearchStore::open_in_memory().await.unwrap();
        let mut fields = IndexMap::new();
        fields.insert("name".to_string(), FieldDef::new(0, FieldKind::String));
        let template = Template {
            did: "did:ledger:tmpl1".parse().unwrap(),
            name: "basic".into(),
            creator_did: "did:ledger:creator".parse().unwrap(),
            fields,
            created_height: 5,
            signature: None,
            creator_pub_key: "pk".into(),
        };

        store.put_template(&template).await.unwrap();
        // immutable once committed
        store.put_template(&template).await.unwrap();

        let templates = store.templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0], template);
    }

    #[tokio::test]
    async fn dead_letters_park_payloads() {
        let store = SearchStore::open_in_memory().await.unwrap();
        store
            .park_dead_letter(
                Some("did:ledger:x"),
                "store write failed",
                &json!({"raw": true}),
                99,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = SearchStore::create_or_open(dir.path()).await.unwrap();
            store
                .upsert_record(&record("did:ledger:keep", "Kept", &[]))
                .await
                .unwrap();
            store.set_checkpoint("ledger_height", 12).await.unwrap();
        }

        let store = SearchStore::create_or_open(dir.path()).await.unwrap();
        assert!(store.get_record("did:ledger:keep").await.unwrap().is_some());
        assert_eq!(
            store.checkpoint("ledger_height").await.unwrap(),
            Some(12)
        );
    }
}
