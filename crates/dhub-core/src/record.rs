//! Record Data Structure
//!
//! A [`Record`] is the unit a caller hands to a producer. Its payload is one of
//! two closed variants:
//!
//! - **Blob**: opaque bytes, written to BLOB topics
//! - **Tuple**: an ordered list of optional typed values bound to a shared
//!   [`RecordSchema`], written to TUPLE topics
//!
//! ## Routing Fields
//! - **shard_id**: explicit destination, always wins
//! - **partition_key**: hashed to pick a shard deterministically
//! - **hash_key**: explicit 128-bit hex hash, used as-is for range routing
//!
//! Attributes are free-form string pairs carried next to the payload. Records
//! decoded from a batch also carry [`ReadMeta`].
//!
//! ## Example
//! ```ignore
//! let record = Record::blob(Bytes::from_static(b"click"))
//!     .with_partition_key("user-42")
//!     .with_attribute("trace", "abc");
//! ```

use crate::schema::{FieldValue, RecordSchema};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tuple payload: one optional value per schema field.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleData {
    schema: Arc<RecordSchema>,
    values: Vec<Option<FieldValue>>,
}

impl TupleData {
    /// Create a tuple with every field unset.
    pub fn new(schema: Arc<RecordSchema>) -> Self {
        let values = vec![None; schema.len()];
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<RecordSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[Option<FieldValue>] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(Option::as_ref)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&FieldValue> {
        self.schema.index_of(name).and_then(|i| self.get(i))
    }

    /// Set a field, checking that the value matches the declared type.
    ///
    /// `None` clears the field; whether that is legal for a not-null field is
    /// checked when the record is encoded.
    pub fn set(&mut self, index: usize, value: Option<FieldValue>) -> Result<()> {
        let field = self.schema.field(index).ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "field index {} out of range for {} fields",
                index,
                self.schema.len()
            ))
        })?;

        if let Some(v) = &value {
            if v.field_type() != field.field_type {
                return Err(Error::SchemaMismatch(format!(
                    "field '{}' expects {}, got {}",
                    field.name,
                    field.field_type,
                    v.field_type()
                )));
            }
        }

        self.values[index] = value;
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: Option<FieldValue>) -> Result<()> {
        let index = self
            .schema
            .index_of(name)
            .ok_or_else(|| Error::SchemaMismatch(format!("no field named '{name}'")))?;
        self.set(index, value)
    }

    /// Builder form of [`TupleData::set_by_name`].
    pub fn with(mut self, name: &str, value: FieldValue) -> Result<Self> {
        self.set_by_name(name, Some(value))?;
        Ok(self)
    }

    fn estimated_size(&self) -> usize {
        self.values
            .iter()
            .map(|v| match v {
                None => 1,
                Some(FieldValue::String(s)) | Some(FieldValue::Decimal(s)) => s.len() + 2,
                Some(_) => 8,
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Blob(Bytes),
    Tuple(TupleData),
}

/// Position information stamped on records read back from a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadMeta {
    pub shard_id: String,
    pub sequence: i64,
    pub system_time: i64,
    pub cursor: String,
    pub next_cursor: String,
    pub serial: i64,
    /// Position of the record within its batch.
    pub batch_index: u32,
}

/// A single record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub data: RecordData,
    pub shard_id: Option<String>,
    pub partition_key: Option<String>,
    pub hash_key: Option<String>,
    pub attributes: BTreeMap<String, String>,
    /// Set only on records decoded from a batch.
    pub meta: Option<ReadMeta>,
}

impl Record {
    pub fn new(data: RecordData) -> Self {
        Self {
            data,
            shard_id: None,
            partition_key: None,
            hash_key: None,
            attributes: BTreeMap::new(),
            meta: None,
        }
    }

    pub fn blob(data: impl Into<Bytes>) -> Self {
        Self::new(RecordData::Blob(data.into()))
    }

    pub fn tuple(data: TupleData) -> Self {
        Self::new(RecordData::Tuple(data))
    }

    pub fn with_shard_id(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = Some(shard_id.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_hash_key(mut self, key: impl Into<String>) -> Self {
        self.hash_key = Some(key.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.data, RecordData::Blob(_))
    }

    /// Schema of a tuple record; `None` for blobs.
    pub fn schema(&self) -> Option<&Arc<RecordSchema>> {
        match &self.data {
            RecordData::Blob(_) => None,
            RecordData::Tuple(t) => Some(t.schema()),
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match &self.data {
            RecordData::Blob(b) => Some(b),
            RecordData::Tuple(_) => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&TupleData> {
        match &self.data {
            RecordData::Blob(_) => None,
            RecordData::Tuple(t) => Some(t),
        }
    }

    /// Rough in-memory size of the payload plus routing fields.
    pub fn estimated_size(&self) -> usize {
        let payload = match &self.data {
            RecordData::Blob(b) => b.len(),
            RecordData::Tuple(t) => t.estimated_size(),
        };
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();

        payload
            + attrs
            + self.shard_id.as_ref().map_or(0, String::len)
            + self.partition_key.as_ref().map_or(0, String::len)
            + self.hash_key.as_ref().map_or(0, String::len)
    }
}
