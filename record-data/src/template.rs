// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::did::Did;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown field type: {0}")]
    UnknownFieldKind(String),
    #[error("repeated fields cannot nest")]
    NestedRepeated,
    #[error("duplicate field index {index} in template {template}")]
    DuplicateIndex { template: String, index: u32 },
    #[error("enum field {0} has no enum values")]
    MissingEnumValues(String),
}

/// The wire type of a template field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Long,
    Uint64,
    Float,
    Bool,
    Enum,
    DRef,
    Repeated(Box<FieldKind>),
}

impl FieldKind {
    /// The scalar kind, unwrapping one level of `repeated`.
    pub fn scalar(&self) -> &FieldKind {
        match self {
            FieldKind::Repeated(inner) => inner,
            other => other,
        }
    }

    pub fn is_repeated(&self) -> bool {
        matches!(self, FieldKind::Repeated(_))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String => f.write_str("string"),
            FieldKind::Long => f.write_str("long"),
            FieldKind::Uint64 => f.write_str("uint64"),
            FieldKind::Float => f.write_str("float"),
            FieldKind::Bool => f.write_str("bool"),
            FieldKind::Enum => f.write_str("enum"),
            FieldKind::DRef => f.write_str("dref"),
            FieldKind::Repeated(inner) => write!(f, "repeated {inner}"),
        }
    }
}

impl FromStr for FieldKind {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(inner) = s.strip_prefix("repeated ") {
            let inner: FieldKind = inner.trim().parse()?;
            if inner.is_repeated() {
                return Err(TemplateError::NestedRepeated);
            }
            return Ok(FieldKind::Repeated(Box::new(inner)));
        }

        match s {
            "string" => Ok(FieldKind::String),
            "long" => Ok(FieldKind::Long),
            "uint64" => Ok(FieldKind::Uint64),
            "float" => Ok(FieldKind::Float),
            "bool" => Ok(FieldKind::Bool),
            "enum" => Ok(FieldKind::Enum),
            "dref" => Ok(FieldKind::DRef),
            other => Err(TemplateError::UnknownFieldKind(other.into())),
        }
    }
}

impl Serialize for FieldKind {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldKind {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A single field of a template: the compact ledger key (`index`), the wire
/// type, and the ordinal table for `enum` fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(rename = "enumValues", skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
}

impl FieldDef {
    pub fn new(index: u32, kind: FieldKind) -> Self {
        Self {
            index,
            kind,
            enum_values: None,
        }
    }

    pub fn with_enum_values(index: u32, values: Vec<String>) -> Self {
        Self {
            index,
            kind: FieldKind::Enum,
            enum_values: Some(values),
        }
    }

    /// Ordinal of an enum label under this field's table.
    pub fn enum_ordinal(&self, label: &str) -> Option<u64> {
        self.enum_values
            .as_ref()?
            .iter()
            .position(|v| v == label)
            .map(|p| p as u64)
    }

    pub fn enum_label(&self, ordinal: u64) -> Option<&str> {
        self.enum_values
            .as_ref()?
            .get(ordinal as usize)
            .map(String::as_str)
    }
}

/// How a field is mapped into the search store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// Free text, also indexed as an exact keyword.
    TextKeyword,
    Keyword,
    Long,
    Float,
    Boolean,
}

/// A named, immutable schema authored by a creator.
///
/// Once committed a template is append-only observable: there are no
/// in-place edits, and its field indices never change meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub did: Did,
    pub name: String,
    #[serde(rename = "creatorDid")]
    pub creator_did: Did,
    /// Ordered `fieldName -> FieldDef` mapping. Order is the author's; the
    /// compact key is the per-field `index`, not the position.
    #[serde(rename = "fieldsInTemplate")]
    pub fields: IndexMap<String, FieldDef>,
    #[serde(rename = "createdHeight", default)]
    pub created_height: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    #[serde(rename = "creatorPubKey", default)]
    pub creator_pub_key: String,
}

impl Template {
    /// Checks the per-template invariant that field indices are unique, and
    /// that every enum field carries its ordinal table.
    pub fn check(&self) -> Result<(), TemplateError> {
        let mut seen = HashSet::with_capacity(self.fields.len());
        for (name, def) in &self.fields {
            if !seen.insert(def.index) {
                return Err(TemplateError::DuplicateIndex {
                    template: self.name.clone(),
                    index: def.index,
                });
            }
            if matches!(def.kind.scalar(), FieldKind::Enum)
                && def.enum_values.is_none()
            {
                return Err(TemplateError::MissingEnumValues(name.clone()));
            }
        }
        Ok(())
    }

    pub fn field_by_index(&self, index: u32) -> Option<(&str, &FieldDef)> {
        self.fields
            .iter()
            .find(|(_, def)| def.index == index)
            .map(|(name, def)| (name.as_str(), def))
    }

    /// Derive the search-store field mapping for this template.
    pub fn search_mapping(&self) -> IndexMap<String, MappingKind> {
        self.fields
            .iter()
            .map(|(name, def)| {
                let kind = match def.kind.scalar() {
                    FieldKind::String => MappingKind::TextKeyword,
                    FieldKind::Enum => MappingKind::Keyword,
                    FieldKind::DRef => MappingKind::Keyword,
                    FieldKind::Long | FieldKind::Uint64 => MappingKind::Long,
                    FieldKind::Float => MappingKind::Float,
                    FieldKind::Bool => MappingKind::Boolean,
                    FieldKind::Repeated(_) => unreachable!("scalar()"),
                };
                (name.clone(), kind)
            })
            .collect()
    }
}

/// In-memory directory of committed templates.
///
/// Section names on records refer to templates by name; the compressed wire
/// form refers to them by did (`"t"` key). Template names are not globally
/// unique, so by-name lookup returns the template committed at the greatest
/// height.
#[derive(Debug, Default, Clone)]
pub struct TemplateDirectory {
    by_did: HashMap<Did, Arc<Template>>,
    by_name: HashMap<String, Arc<Template>>,
}

impl TemplateDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: Template) -> Arc<Template> {
        let template = Arc::new(template);
        self.by_did
            .insert(template.did.clone(), template.clone());

        match self.by_name.get(&template.name) {
            Some(prev) if prev.created_height > template.created_height => {}
            _ => {
                self.by_name
                    .insert(template.name.clone(), template.clone());
            }
        }
        template
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Template>> {
        self.by_name.get(name)
    }

    pub fn by_did(&self, did: &Did) -> Option<&Arc<Template>> {
        self.by_did.get(did)
    }

    pub fn contains(&self, did: &Did) -> bool {
        self.by_did.contains_key(did)
    }

    pub fn len(&self) -> usize {
        self.by_did.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_did.is_empty()
    }
}
