// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Schema-driven record compression and expansion.
//!
//! The ledger path stores records in a field-index-keyed form to keep the
//! per-byte cost down; readers expand them back to field-named sections
//! against the template directory. All operations here are pure and never
//! perform I/O.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::did::Did;
use crate::record::{FieldValue, RecordData, SectionValues};
use crate::template::{FieldDef, FieldKind, TemplateDirectory};

/// The key under which a compressed section carries its template did.
const TEMPLATE_KEY: &str = "t";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("unknown field {field} in template {template}")]
    UnknownField { template: String, field: String },
    #[error(
        "type mismatch for {template}.{field}: expected {expected}, got {got}"
    )]
    TypeMismatch {
        template: String,
        field: String,
        expected: String,
        got: String,
    },
    #[error("field {field} is not a valid did: {value}")]
    BadDid { field: String, value: String },
    #[error("malformed compressed record: {0}")]
    BadCompressed(String),
}

impl CodecError {
    fn mismatch(
        template: &str,
        field: &str,
        def: &FieldDef,
        value: &FieldValue,
    ) -> Self {
        CodecError::TypeMismatch {
            template: template.into(),
            field: field.into(),
            expected: def.kind.to_string(),
            got: value.type_name().into(),
        }
    }
}

/// Compress an expanded record into its field-index-keyed wire form.
///
/// Each section becomes `{ "<fieldIndex>": value, ..., "t": templateDid }`.
/// `enum` labels are emitted as their ordinal; `dref` values stay DID
/// strings.
pub fn compress(
    data: &RecordData,
    templates: &TemplateDirectory,
) -> Result<Value, CodecError> {
    let mut sections = Vec::with_capacity(data.0.len());

    for (template_name, section) in data.iter() {
        let template = templates
            .by_name(template_name)
            .ok_or_else(|| CodecError::UnknownTemplate(template_name.clone()))?;

        let mut out = Map::with_capacity(section.len() + 1);
        for (field_name, value) in section {
            let def = template.fields.get(field_name).ok_or_else(|| {
                CodecError::UnknownField {
                    template: template_name.clone(),
                    field: field_name.clone(),
                }
            })?;

            check_value(template_name, field_name, def, &def.kind, value)?;
            let wire =
                compress_value(template_name, field_name, def, &def.kind, value)?;
            out.insert(def.index.to_string(), wire);
        }
        out.insert(
            TEMPLATE_KEY.into(),
            Value::String(template.did.to_string()),
        );
        sections.push(Value::Object(out));
    }

    Ok(Value::Array(sections))
}

/// Expand a compressed record back into field-named sections.
///
/// Indices the template does not know are preserved under their numeric
/// string key, so a reader behind on templates never loses data.
pub fn expand(
    compressed: &Value,
    templates: &TemplateDirectory,
) -> Result<RecordData, CodecError> {
    let sections = compressed.as_array().ok_or_else(|| {
        CodecError::BadCompressed("expected an array of sections".into())
    })?;

    let mut data = RecordData::new();
    for section in sections {
        let obj = section.as_object().ok_or_else(|| {
            CodecError::BadCompressed("section is not an object".into())
        })?;

        let template_did = obj
            .get(TEMPLATE_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CodecError::BadCompressed(
                    "section is missing the template key".into(),
                )
            })?;
        let template_did: Did = template_did.parse().map_err(|_| {
            CodecError::BadCompressed(format!(
                "bad template did: {template_did}"
            ))
        })?;
        let template = templates.by_did(&template_did).ok_or_else(|| {
            CodecError::UnknownTemplate(template_did.to_string())
        })?;

        let mut out = SectionValues::with_capacity(obj.len());
        for (key, wire) in obj {
            if key == TEMPLATE_KEY {
                continue;
            }
            let index: u32 = key.parse().map_err(|_| {
                CodecError::BadCompressed(format!(
                    "non-numeric field key: {key}"
                ))
            })?;

            match template.field_by_index(index) {
                Some((field_name, def)) => {
                    let value = expand_value(
                        &template.name,
                        field_name,
                        def,
                        &def.kind,
                        wire,
                    )?;
                    out.insert(field_name.to_string(), value);
                }
                // Forward compatibility: keep the raw value under its
                // numeric key.
                None => {
                    let value = serde_json::from_value(wire.clone())
                        .map_err(|e| {
                            CodecError::BadCompressed(e.to_string())
                        })?;
                    out.insert(key.clone(), value);
                }
            }
        }
        data.insert_section(template.name.clone(), out);
    }

    Ok(data)
}

/// Validate an expanded record against the template directory without
/// touching the wire form. Reference fields are checked for DID syntax
/// only, never dereferenced.
pub fn validate(
    data: &RecordData,
    templates: &TemplateDirectory,
) -> Result<(), CodecError> {
    for (template_name, section) in data.iter() {
        let template = templates
            .by_name(template_name)
            .ok_or_else(|| CodecError::UnknownTemplate(template_name.clone()))?;

        for (field_name, value) in section {
            let def = template.fields.get(field_name).ok_or_else(|| {
                CodecError::UnknownField {
                    template: template_name.clone(),
                    field: field_name.clone(),
                }
            })?;
            check_value(template_name, field_name, def, &def.kind, value)?;
        }
    }
    Ok(())
}

fn check_value(
    template: &str,
    field: &str,
    def: &FieldDef,
    kind: &FieldKind,
    value: &FieldValue,
) -> Result<(), CodecError> {
    match kind {
        FieldKind::String => match value {
            FieldValue::Str(_) => Ok(()),
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        // `long` admits any integer that fits a signed 64-bit value.
        FieldKind::Long => match value {
            FieldValue::Int(_) => Ok(()),
            FieldValue::Uint(v) if *v <= i64::MAX as u64 => Ok(()),
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        FieldKind::Uint64 => match value {
            FieldValue::Uint(_) => Ok(()),
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        // `float` admits any JSON number.
        FieldKind::Float => match value {
            FieldValue::Float(_)
            | FieldValue::Int(_)
            | FieldValue::Uint(_) => Ok(()),
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        FieldKind::Bool => match value {
            FieldValue::Bool(_) => Ok(()),
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        FieldKind::Enum => match value {
            FieldValue::Str(label) if def.enum_ordinal(label).is_some() => {
                Ok(())
            }
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        FieldKind::DRef => match value {
            FieldValue::Str(s) if Did::is_valid_syntax(s) => Ok(()),
            FieldValue::Str(s) => Err(CodecError::BadDid {
                field: field.into(),
                value: s.clone(),
            }),
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
        FieldKind::Repeated(inner) => match value {
            FieldValue::List(items) => {
                for item in items {
                    check_value(template, field, def, inner, item)?;
                }
                Ok(())
            }
            _ => Err(CodecError::mismatch(template, field, def, value)),
        },
    }
}

fn compress_value(
    template: &str,
    field: &str,
    def: &FieldDef,
    kind: &FieldKind,
    value: &FieldValue,
) -> Result<Value, CodecError> {
    match (kind, value) {
        (FieldKind::Enum, FieldValue::Str(label)) => {
            let ordinal = def.enum_ordinal(label).ok_or_else(|| {
                CodecError::mismatch(template, field, def, value)
            })?;
            Ok(Value::from(ordinal))
        }
        (FieldKind::Repeated(inner), FieldValue::List(items)) => {
            let wire = items
                .iter()
                .map(|item| {
                    compress_value(template, field, def, inner, item)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(wire))
        }
        (_, value) => Ok(serde_json::to_value(value)
            .expect("field value is valid json")),
    }
}

fn expand_value(
    template: &str,
    field: &str,
    def: &FieldDef,
    kind: &FieldKind,
    wire: &Value,
) -> Result<FieldValue, CodecError> {
    let mismatch = || CodecError::TypeMismatch {
        template: template.into(),
        field: field.into(),
        expected: kind.to_string(),
        got: wire_type_name(wire).into(),
    };

    match kind {
        FieldKind::Enum => {
            let ordinal = wire.as_u64().ok_or_else(mismatch)?;
            let label = def.enum_label(ordinal).ok_or_else(mismatch)?;
            Ok(FieldValue::Str(label.into()))
        }
        FieldKind::Repeated(inner) => {
            let items = wire.as_array().ok_or_else(mismatch)?;
            let expanded = items
                .iter()
                .map(|item| expand_value(template, field, def, inner, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FieldValue::List(expanded))
        }
        _ => {
            let value: FieldValue = serde_json::from_value(wire.clone())
                .map_err(|_| mismatch())?;
            check_value(template, field, def, kind, &value)?;
            Ok(value)
        }
    }
}

fn wire_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use crate::template::Template;

    fn directory() -> TemplateDirectory {
        let mut dir = TemplateDirectory::new();

        let mut basic = IndexMap::new();
        basic.insert("name".into(), FieldDef::new(0, FieldKind::String));
        basic.insert("language".into(), FieldDef::new(1, FieldKind::String));
        basic.insert("date".into(), FieldDef::new(2, FieldKind::Long));
        basic.insert(
            "tagItems".into(),
            FieldDef::new(3, FieldKind::Repeated(Box::new(FieldKind::String))),
        );
        dir.insert(Template {
            did: Did::ledger("tmpl-basic"),
            name: "basic".into(),
            creator_did: Did::ledger("creator"),
            fields: basic,
            created_height: 1,
            signature: None,
            creator_pub_key: "pk".into(),
        });

        let mut recipe = IndexMap::new();
        recipe.insert(
            "prep_time_mins".into(),
            FieldDef::new(0, FieldKind::Long),
        );
        recipe.insert(
            "cook_time_mins".into(),
            FieldDef::new(1, FieldKind::Long),
        );
        recipe.insert("servings".into(), FieldDef::new(2, FieldKind::Uint64));
        recipe.insert(
            "course".into(),
            FieldDef::with_enum_values(
                3,
                vec!["starter".into(), "main".into(), "dessert".into()],
            ),
        );
        recipe.insert(
            "ingredients".into(),
            FieldDef::new(4, FieldKind::Repeated(Box::new(FieldKind::DRef))),
        );
        dir.insert(Template {
            did: Did::ledger("tmpl-recipe"),
            name: "recipe".into(),
            creator_did: Did::ledger("creator"),
            fields: recipe,
            created_height: 2,
            signature: None,
            creator_pub_key: "pk".into(),
        });

        dir
    }

    fn greek_chicken() -> RecordData {
        serde_json::from_value(json!({
            "basic": {
                "name": "Greek Chicken",
                "language": "en",
                "date": 1656486000i64,
                "tagItems": ["greek", "grill"]
            },
            "recipe": {
                "prep_time_mins": 10,
                "cook_time_mins": 12,
                "servings": 8,
                "course": "main",
                "ingredients": ["did:ledger:ing1", "did:ledger:ing2"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn compress_emits_indices_and_template_dids() {
        let dir = directory();
        let compressed = compress(&greek_chicken(), &dir).unwrap();

        let sections = compressed.as_array().unwrap();
        assert_eq!(sections.len(), 2);

        let basic = &sections[0];
        assert_eq!(basic["0"], "Greek Chicken");
        assert_eq!(basic["2"], json!(1656486000i64));
        assert_eq!(basic["3"], json!(["greek", "grill"]));
        assert_eq!(basic["t"], "did:ledger:tmpl-basic");

        let recipe = &sections[1];
        // enum label travels as its ordinal
        assert_eq!(recipe["3"], json!(1));
        assert_eq!(recipe["4"], json!(["did:ledger:ing1", "did:ledger:ing2"]));
        assert_eq!(recipe["t"], "did:ledger:tmpl-recipe");
    }

    #[test]
    fn expand_round_trips() {
        let dir = directory();
        let original = greek_chicken();

        let compressed = compress(&original, &dir).unwrap();
        let expanded = expand(&compressed, &dir).unwrap();
        assert_eq!(expanded, original);

        // and compressing the expansion reproduces the wire form
        let recompressed = compress(&expanded, &dir).unwrap();
        assert_eq!(recompressed, compressed);
    }

    #[test]
    fn expand_preserves_unknown_indices() {
        let dir = directory();
        let compressed = json!([{
            "0": "Greek Chicken",
            "99": {"future": true},
            "t": "did:ledger:tmpl-basic"
        }]);

        let expanded = expand(&compressed, &dir).unwrap();
        let basic = expanded.section("basic").unwrap();
        assert_eq!(basic["name"], FieldValue::Str("Greek Chicken".into()));
        assert!(basic.contains_key("99"));
    }

    #[test]
    fn validate_accepts_numeric_widening_for_float_only() {
        let dir = directory();

        let ok: RecordData = serde_json::from_value(json!({
            "recipe": {"prep_time_mins": 10}
        }))
        .unwrap();
        validate(&ok, &dir).unwrap();

        // long rejects a fractional number
        let bad: RecordData = serde_json::from_value(json!({
            "recipe": {"prep_time_mins": 10.5}
        }))
        .unwrap();
        assert!(matches!(
            validate(&bad, &dir),
            Err(CodecError::TypeMismatch { .. })
        ));

        // uint64 rejects a negative integer
        let bad: RecordData = serde_json::from_value(json!({
            "recipe": {"servings": -1}
        }))
        .unwrap();
        assert!(matches!(
            validate(&bad, &dir),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn validate_checks_dref_syntax_without_dereferencing() {
        let dir = directory();

        // A dref to a nonexistent record is fine; only syntax counts.
        let ok: RecordData = serde_json::from_value(json!({
            "recipe": {"ingredients": ["did:ledger:never-published"]}
        }))
        .unwrap();
        validate(&ok, &dir).unwrap();

        let bad: RecordData = serde_json::from_value(json!({
            "recipe": {"ingredients": ["not-a-did"]}
        }))
        .unwrap();
        assert!(matches!(validate(&bad, &dir), Err(CodecError::BadDid { .. })));
    }

    #[test]
    fn validate_accepts_empty_repeated() {
        let dir = directory();
        let data: RecordData = serde_json::from_value(json!({
            "recipe": {"ingredients": []}
        }))
        .unwrap();
        validate(&data, &dir).unwrap();
    }

    #[test]
    fn unknown_field_and_template_errors() {
        let dir = directory();

        let unknown_field: RecordData = serde_json::from_value(json!({
            "recipe": {"oven_temp": 200}
        }))
        .unwrap();
        assert!(matches!(
            compress(&unknown_field, &dir),
            Err(CodecError::UnknownField { .. })
        ));

        let unknown_template: RecordData = serde_json::from_value(json!({
            "spaceship": {"name": "x"}
        }))
        .unwrap();
        assert!(matches!(
            validate(&unknown_template, &dir),
            Err(CodecError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn enum_label_outside_table_is_a_mismatch() {
        let dir = directory();
        let data: RecordData = serde_json::from_value(json!({
            "recipe": {"course": "midnight-snack"}
        }))
        .unwrap();
        assert!(matches!(
            validate(&data, &dir),
            Err(CodecError::TypeMismatch { .. })
        ));
    }
}
