//! Tuple Record Schemas
//!
//! A [`RecordSchema`] is the logical layout of a TUPLE topic: an ordered list of
//! uniquely named, typed fields. Schemas are immutable once built and are shared
//! between records via `Arc`.
//!
//! ## Structural Hash
//!
//! Every schema carries a stable 64-bit structural hash computed from the field
//! names, types and nullability (comments are ignored). The hash is what the
//! schema cache keys on, so two independently constructed schemas with the same
//! layout resolve to the same version id.
//!
//! ## Control-Plane JSON
//!
//! The service exchanges schemas as
//! `{"fields":[{"name":"id","type":"BIGINT","notnull":true,"comment":""}]}`;
//! [`RecordSchema::from_json`] and [`RecordSchema::to_json`] convert that form.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Column types supported by TUPLE topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Bigint,
    String,
    Boolean,
    Double,
    Timestamp,
    Decimal,
    Integer,
    Float,
    Tinyint,
    Smallint,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Bigint => "BIGINT",
            FieldType::String => "STRING",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Double => "DOUBLE",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Decimal => "DECIMAL",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Tinyint => "TINYINT",
            FieldType::Smallint => "SMALLINT",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed column value.
///
/// `Timestamp` is microseconds since the Unix epoch. `Decimal` keeps its exact
/// textual form.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bigint(i64),
    String(String),
    Boolean(bool),
    Double(f64),
    Timestamp(i64),
    Decimal(String),
    Integer(i32),
    Float(f32),
    Tinyint(i8),
    Smallint(i16),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bigint(_) => FieldType::Bigint,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Timestamp(_) => FieldType::Timestamp,
            FieldValue::Decimal(_) => FieldType::Decimal,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Tinyint(_) => FieldType::Tinyint,
            FieldValue::Smallint(_) => FieldType::Smallint,
        }
    }
}

/// One column of a [`RecordSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub comment: String,
}

impl Field {
    /// Create a nullable field with no comment.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            comment: String::new(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Ordered, uniquely named set of fields describing a TUPLE record.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    fields: Vec<Field>,
    hash: u64,
}

impl RecordSchema {
    /// Build a schema, validating field names.
    ///
    /// Names must be unique, non-empty, Avro-legal identifiers
    /// (`[A-Za-z_][A-Za-z0-9_]*`) and must not collide with the reserved
    /// attribute column.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::InvalidSchema("schema has no fields".to_string()));
        }

        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            validate_field_name(&field.name)?;
            if !seen.insert(field.name.to_ascii_lowercase()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }

        let hash = structural_hash(&fields);
        Ok(Self { fields, hash })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Stable hash over names, types and nullability.
    pub fn structural_hash(&self) -> u64 {
        self.hash
    }

    /// Return a copy of this schema with `field` appended.
    pub fn with_field(&self, field: Field) -> Result<Self> {
        let mut fields = self.fields.clone();
        fields.push(field);
        Self::new(fields)
    }

    /// Parse the control-plane JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: JsonSchema = serde_json::from_str(json)?;
        let fields = parsed
            .fields
            .into_iter()
            .map(|f| Field {
                name: f.name,
                field_type: f.field_type,
                nullable: !f.notnull,
                comment: f.comment,
            })
            .collect();
        Self::new(fields)
    }

    /// Render the control-plane JSON form.
    pub fn to_json(&self) -> String {
        let json = JsonSchema {
            fields: self
                .fields
                .iter()
                .map(|f| JsonField {
                    name: f.name.clone(),
                    field_type: f.field_type,
                    notnull: !f.nullable,
                    comment: f.comment.clone(),
                })
                .collect(),
        };
        // A struct of strings, bools and unit enums always serializes.
        serde_json::to_string(&json).unwrap_or_default()
    }
}

impl PartialEq for RecordSchema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for RecordSchema {}

#[derive(Serialize, Deserialize)]
struct JsonSchema {
    fields: Vec<JsonField>,
}

#[derive(Serialize, Deserialize)]
struct JsonField {
    name: String,
    #[serde(rename = "type")]
    field_type: FieldType,
    #[serde(default)]
    notnull: bool,
    #[serde(default)]
    comment: String,
}

fn validate_field_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if !valid {
        return Err(Error::InvalidSchema(format!("illegal field name '{name}'")));
    }
    if name == crate::wire::ATTRIBUTE_FIELD {
        return Err(Error::InvalidSchema(format!("field name '{name}' is reserved")));
    }
    Ok(())
}

fn structural_hash(fields: &[Field]) -> u64 {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(field.field_type.as_str().as_bytes());
        hasher.update([field.nullable as u8, b';']);
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> RecordSchema {
        RecordSchema::new(vec![
            Field::new("id", FieldType::Bigint).not_null(),
            Field::new("name", FieldType::String),
        ])
        .unwrap()
    }

    #[test]
    fn test_hash_ignores_comments() {
        let a = orders();
        let b = RecordSchema::new(vec![
            Field::new("id", FieldType::Bigint)
                .not_null()
                .with_comment("primary key"),
            Field::new("name", FieldType::String),
        ])
        .unwrap();
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_hash_changes_with_nullability() {
        let a = orders();
        let b = RecordSchema::new(vec![
            Field::new("id", FieldType::Bigint),
            Field::new("name", FieldType::String),
        ])
        .unwrap();
        assert_ne!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_appending_field_changes_hash() {
        let a = orders();
        let b = a.with_field(Field::new("price", FieldType::Double)).unwrap();
        assert_eq!(b.len(), 3);
        assert_ne!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let result = RecordSchema::new(vec![
            Field::new("id", FieldType::Bigint),
            Field::new("ID", FieldType::String),
        ]);
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_illegal_names_rejected() {
        for name in ["", "1abc", "with space", "dash-name", "__dh_attribute__"] {
            let result = RecordSchema::new(vec![Field::new(name, FieldType::String)]);
            assert!(result.is_err(), "accepted '{name}'");
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let schema = orders();
        let json = schema.to_json();
        assert!(json.contains("\"BIGINT\""));
        let parsed = RecordSchema::from_json(&json).unwrap();
        assert_eq!(parsed, schema);
        assert_eq!(parsed.structural_hash(), schema.structural_hash());
    }

    #[test]
    fn test_json_defaults_to_nullable() {
        let parsed =
            RecordSchema::from_json(r#"{"fields":[{"name":"f1","type":"TINYINT"}]}"#).unwrap();
        assert!(parsed.fields()[0].nullable);
        assert_eq!(parsed.fields()[0].field_type, FieldType::Tinyint);
    }
}
