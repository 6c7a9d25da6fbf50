//! Schema Wire Mapping
//!
//! Records travel as Avro datums. This module derives the Avro schema for a
//! topic and converts between [`Record`] and Avro [`Value`].
//!
//! ## Field Mapping
//!
//! | field type                     | Avro      |
//! |--------------------------------|-----------|
//! | BIGINT, TIMESTAMP              | `long`    |
//! | INTEGER, SMALLINT, TINYINT     | `int`     |
//! | FLOAT                          | `float`   |
//! | DOUBLE                         | `double`  |
//! | BOOLEAN                        | `boolean` |
//! | STRING, DECIMAL                | `string`  |
//!
//! A nullable field becomes `["null", T]` with a `null` default; a not-null
//! field is the bare type. Every wire record ends with the attribute column:
//!
//! ```text
//! { "name": "__dh_attribute__", "type": ["null", {"type": "map", "values": "string"}], "default": null }
//! ```
//!
//! BLOB topics use the fixed schema `{ data: bytes, __dh_attribute__ }`.

use crate::record::{Record, RecordData, TupleData};
use crate::schema::{FieldType, FieldValue, RecordSchema};
use crate::{Error, Result};
use apache_avro::types::Value;
use apache_avro::Schema;
use bytes::Bytes;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Reserved trailing column holding record attributes.
pub const ATTRIBUTE_FIELD: &str = "__dh_attribute__";

/// Payload column of the BLOB wire schema.
pub const BLOB_DATA_FIELD: &str = "data";

/// Version id used for every BLOB record.
pub const BLOB_VERSION_ID: i32 = -1;

const RECORD_NAME: &str = "AvroRecord";
const RECORD_NAMESPACE: &str = "dhub.wire";

fn avro_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Bigint | FieldType::Timestamp => "long",
        FieldType::Integer | FieldType::Smallint | FieldType::Tinyint => "int",
        FieldType::Float => "float",
        FieldType::Double => "double",
        FieldType::Boolean => "boolean",
        FieldType::String | FieldType::Decimal => "string",
    }
}

fn attribute_field_json() -> JsonValue {
    json!({
        "name": ATTRIBUTE_FIELD,
        "type": ["null", {"type": "map", "values": "string"}],
        "default": null
    })
}

/// Avro schema JSON for a tuple schema, or the blob schema when `None`.
pub fn wire_schema_json(schema: Option<&RecordSchema>) -> JsonValue {
    let mut fields: Vec<JsonValue> = match schema {
        None => vec![json!({"name": BLOB_DATA_FIELD, "type": "bytes"})],
        Some(schema) => schema
            .fields()
            .iter()
            .map(|f| {
                let ty = avro_type(f.field_type);
                if f.nullable {
                    json!({"name": f.name, "type": ["null", ty], "default": null})
                } else {
                    json!({"name": f.name, "type": ty})
                }
            })
            .collect(),
    };
    fields.push(attribute_field_json());

    json!({
        "type": "record",
        "name": RECORD_NAME,
        "namespace": RECORD_NAMESPACE,
        "fields": fields
    })
}

/// Parsed Avro schema for a tuple schema, or the blob schema when `None`.
pub fn build_wire_schema(schema: Option<&RecordSchema>) -> Result<Schema> {
    Ok(Schema::parse(&wire_schema_json(schema))?)
}

impl RecordSchema {
    /// Avro schema records of this layout are written with.
    pub fn wire_schema(&self) -> Result<Schema> {
        build_wire_schema(Some(self))
    }
}

/// One resolvable schema version: its id, logical schema and wire schema.
///
/// Version `-1` is the blob schema, `0` the schema of a single-schema topic,
/// and `0..N` the versions of a registry topic.
#[derive(Debug, Clone)]
pub struct SchemaItem {
    pub version_id: i32,
    pub schema: Option<Arc<RecordSchema>>,
    pub wire: Schema,
}

impl SchemaItem {
    pub fn blob() -> Result<Self> {
        Ok(Self {
            version_id: BLOB_VERSION_ID,
            schema: None,
            wire: build_wire_schema(None)?,
        })
    }

    pub fn tuple(version_id: i32, schema: Arc<RecordSchema>) -> Result<Self> {
        let wire = schema.wire_schema()?;
        Ok(Self {
            version_id,
            schema: Some(schema),
            wire,
        })
    }

    pub fn is_blob(&self) -> bool {
        self.schema.is_none()
    }
}

fn attributes_to_value(attributes: &BTreeMap<String, String>) -> Value {
    if attributes.is_empty() {
        return Value::Union(0, Box::new(Value::Null));
    }
    let map: HashMap<String, Value> = attributes
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Union(1, Box::new(Value::Map(map)))
}

fn scalar_to_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Bigint(v) | FieldValue::Timestamp(v) => Value::Long(*v),
        FieldValue::Integer(v) => Value::Int(*v),
        FieldValue::Smallint(v) => Value::Int(i32::from(*v)),
        FieldValue::Tinyint(v) => Value::Int(i32::from(*v)),
        FieldValue::Float(v) => Value::Float(*v),
        FieldValue::Double(v) => Value::Double(*v),
        FieldValue::Boolean(v) => Value::Boolean(*v),
        FieldValue::String(v) | FieldValue::Decimal(v) => Value::String(v.clone()),
    }
}

fn tuple_to_fields(tuple: &TupleData, schema: &RecordSchema) -> Result<Vec<(String, Value)>> {
    if tuple.schema().structural_hash() != schema.structural_hash() {
        return Err(Error::SchemaMismatch(
            "record schema differs from the batch schema".to_string(),
        ));
    }

    let mut fields = Vec::with_capacity(schema.len() + 1);
    for (field, value) in schema.fields().iter().zip(tuple.values()) {
        let avro = match (value, field.nullable) {
            (Some(v), _) if v.field_type() != field.field_type => {
                return Err(Error::SchemaMismatch(format!(
                    "field '{}' expects {}, got {}",
                    field.name,
                    field.field_type,
                    v.field_type()
                )));
            }
            (Some(v), true) => Value::Union(1, Box::new(scalar_to_value(v))),
            (Some(v), false) => scalar_to_value(v),
            (None, true) => Value::Union(0, Box::new(Value::Null)),
            (None, false) => {
                return Err(Error::SchemaMismatch(format!(
                    "field '{}' is not nullable",
                    field.name
                )));
            }
        };
        fields.push((field.name.clone(), avro));
    }
    Ok(fields)
}

/// Convert a record to the Avro value of `item`'s wire schema.
pub fn record_to_value(record: &Record, item: &SchemaItem) -> Result<Value> {
    let mut fields = match (&record.data, &item.schema) {
        (RecordData::Blob(data), None) => {
            vec![(BLOB_DATA_FIELD.to_string(), Value::Bytes(data.to_vec()))]
        }
        (RecordData::Tuple(tuple), Some(schema)) => tuple_to_fields(tuple, schema)?,
        (RecordData::Blob(_), Some(_)) => {
            return Err(Error::SchemaMismatch(
                "blob record written with a tuple schema".to_string(),
            ));
        }
        (RecordData::Tuple(_), None) => {
            return Err(Error::SchemaMismatch(
                "tuple record written with the blob schema".to_string(),
            ));
        }
    };
    fields.push((
        ATTRIBUTE_FIELD.to_string(),
        attributes_to_value(&record.attributes),
    ));
    Ok(Value::Record(fields))
}

fn unwrap_union(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

fn value_to_scalar(name: &str, field_type: FieldType, value: Value) -> Result<FieldValue> {
    let mismatch = |v: &Value| {
        Error::SchemaMismatch(format!("field '{name}' ({field_type}) decoded as {v:?}"))
    };

    let out = match (field_type, value) {
        (FieldType::Bigint, Value::Long(v)) => FieldValue::Bigint(v),
        (FieldType::Timestamp, Value::Long(v)) => FieldValue::Timestamp(v),
        (FieldType::Integer, Value::Int(v)) => FieldValue::Integer(v),
        (FieldType::Smallint, Value::Int(v)) => {
            FieldValue::Smallint(i16::try_from(v).map_err(|_| mismatch(&Value::Int(v)))?)
        }
        (FieldType::Tinyint, Value::Int(v)) => {
            FieldValue::Tinyint(i8::try_from(v).map_err(|_| mismatch(&Value::Int(v)))?)
        }
        (FieldType::Float, Value::Float(v)) => FieldValue::Float(v),
        (FieldType::Double, Value::Double(v)) => FieldValue::Double(v),
        (FieldType::Boolean, Value::Boolean(v)) => FieldValue::Boolean(v),
        (FieldType::String, Value::String(v)) => FieldValue::String(v),
        (FieldType::Decimal, Value::String(v)) => FieldValue::Decimal(v),
        (_, other) => return Err(mismatch(&other)),
    };
    Ok(out)
}

fn value_to_attributes(value: Value) -> Result<BTreeMap<String, String>> {
    match unwrap_union(value) {
        Value::Null => Ok(BTreeMap::new()),
        Value::Map(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                other => Err(Error::SchemaMismatch(format!(
                    "attribute '{k}' decoded as {other:?}"
                ))),
            })
            .collect(),
        other => Err(Error::SchemaMismatch(format!(
            "attribute column decoded as {other:?}"
        ))),
    }
}

/// Convert a decoded Avro value back into a record.
///
/// `schema` is the schema the value was resolved into: `None` for blob data,
/// otherwise the tuple layout (the reader schema when one was used). Fields the
/// value does not carry are left unset.
pub fn value_to_record(value: Value, schema: Option<&Arc<RecordSchema>>) -> Result<Record> {
    let fields = match value {
        Value::Record(fields) => fields,
        other => {
            return Err(Error::SchemaMismatch(format!(
                "expected an Avro record, got {other:?}"
            )));
        }
    };
    let mut by_name: HashMap<String, Value> = fields.into_iter().collect();

    let attributes = match by_name.remove(ATTRIBUTE_FIELD) {
        Some(v) => value_to_attributes(v)?,
        None => BTreeMap::new(),
    };

    let data = match schema {
        None => match by_name.remove(BLOB_DATA_FIELD).map(unwrap_union) {
            Some(Value::Bytes(b)) => RecordData::Blob(Bytes::from(b)),
            other => {
                return Err(Error::SchemaMismatch(format!(
                    "blob data decoded as {other:?}"
                )));
            }
        },
        Some(schema) => {
            let mut tuple = TupleData::new(Arc::clone(schema));
            for (index, field) in schema.fields().iter().enumerate() {
                let value = match by_name.remove(&field.name).map(unwrap_union) {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(value_to_scalar(&field.name, field.field_type, v)?),
                };
                tuple.set(index, value)?;
            }
            RecordData::Tuple(tuple)
        }
    };

    let mut record = Record::new(data);
    record.attributes = attributes;
    Ok(record)
}
