// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessControl;
use crate::did::{Did, RecordStorage};

/// Record format version written by this node for server-signed records.
pub const VER_SERVER_SIGNED: &str = "0.8.0";
/// Record format version for client-signed (login-less) records.
pub const VER_CLIENT_SIGNED: &str = "0.9.0";

/// A single field value as it appears in an expanded record section.
///
/// The sum is untagged on the wire: a section is plain JSON. `dref` values
/// are carried as their DID string, `enum` values as their label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "bool",
            FieldValue::Uint(_) | FieldValue::Int(_) => "integer",
            FieldValue::Float(_) => "number",
            FieldValue::Str(_) => "string",
            FieldValue::List(_) => "array",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.into())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// `fieldName -> value` within one template section.
pub type SectionValues = IndexMap<String, FieldValue>;

/// The data part of an expanded record: `templateName -> section`.
#[derive(
    Debug, Clone, PartialEq, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordData(pub IndexMap<String, SectionValues>);

impl RecordData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self, template: &str) -> Option<&SectionValues> {
        self.0.get(template)
    }

    pub fn insert_section(
        &mut self,
        template: impl Into<String>,
        section: SectionValues,
    ) {
        self.0.insert(template.into(), section);
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&String, &SectionValues)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The JSON value signatures are computed over.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("record data is valid json")
    }
}

/// The record creator: public key and derived address.
#[derive(
    Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub struct Creator {
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    pub address: String,
}

/// System metadata attached to every committed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMeta {
    pub did: Did,
    /// Legacy transaction identifier carried by ledger records for backward
    /// compatibility. Accepted on queries, never emitted as canonical.
    #[serde(
        rename = "didTx",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub legacy_id: Option<String>,
    #[serde(rename = "recordType")]
    pub record_type: String,
    pub storage: RecordStorage,
    #[serde(rename = "indexedAt")]
    pub indexed_at: DateTime<Utc>,
    #[serde(
        rename = "blockHeight",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub block_height: Option<u64>,
    pub creator: Creator,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    #[serde(
        rename = "accessControl",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub access: Option<AccessControl>,
    /// Set on peer-graph envelopes whose data section is encrypted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    pub ver: String,
}

fn is_false(v: &bool) -> bool {
    !v
}

/// An expanded record: system metadata plus one section per template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub oip: SystemMeta,
    pub data: RecordData,
}

impl Record {
    pub fn did(&self) -> &Did {
        &self.oip.did
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_untagged_round_trip() {
        let section: SectionValues = serde_json::from_str(
            r#"{"name":"Greek Chicken","servings":8,"rating":4.5,
                "vegan":false,"tags":["greek","grill"]}"#,
        )
        .unwrap();

        assert_eq!(section["name"], FieldValue::Str("Greek Chicken".into()));
        assert_eq!(section["servings"], FieldValue::Uint(8));
        assert_eq!(section["rating"], FieldValue::Float(4.5));
        assert_eq!(section["vegan"], FieldValue::Bool(false));
        assert_eq!(
            section["tags"],
            FieldValue::List(vec!["greek".into(), "grill".into()])
        );

        let json = serde_json::to_value(&section).unwrap();
        assert_eq!(json["servings"], serde_json::json!(8));
    }

    #[test]
    fn negative_integers_parse_as_int() {
        let v: FieldValue = serde_json::from_str("-42").unwrap();
        assert_eq!(v, FieldValue::Int(-42));
    }

    #[test]
    fn record_serde_shape() {
        let mut data = RecordData::new();
        let mut basic = SectionValues::new();
        basic.insert("name".into(), "Draft".into());
        data.insert_section("basic", basic);

        let record = Record {
            oip: SystemMeta {
                did: Did::ledger("tx1"),
                legacy_id: Some("tx1".into()),
                record_type: "post".into(),
                storage: RecordStorage::Ledger,
                indexed_at: DateTime::<Utc>::MIN_UTC,
                block_height: Some(7),
                creator: Creator {
                    pub_key: "pk".into(),
                    address: "addr".into(),
                },
                signature: None,
                access: None,
                encrypted: false,
                ver: VER_SERVER_SIGNED.into(),
            },
            data,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["oip"]["did"], "did:ledger:tx1");
        assert_eq!(json["oip"]["recordType"], "post");
        assert_eq!(json["oip"]["storage"], "ledger");
        assert_eq!(json["data"]["basic"]["name"], "Draft");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
