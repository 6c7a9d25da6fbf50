//! Core data model and wire format for the dhub producer.
//!
//! - [`record`]: blob and tuple records
//! - [`schema`]: tuple schemas and their structural hash
//! - [`topic`]: topic and shard metadata
//! - [`wire`]: schema-to-Avro mapping
//! - [`compression`]: batch payload codecs
//! - [`batch`]: the framed batch codec

pub mod batch;
pub mod compression;
pub mod error;
pub mod record;
pub mod schema;
pub mod topic;
pub mod wire;

pub use batch::{BatchEncoder, BatchHeader, BatchReader, BATCH_HEADER_SIZE};
pub use compression::{CompressType, Compressor};
pub use error::{Error, Result};
pub use record::{ReadMeta, Record, RecordData, TupleData};
pub use schema::{Field, FieldType, FieldValue, RecordSchema};
pub use topic::{ExpandMode, RecordType, Shard, ShardState, TopicExtraConfig, TopicMeta};
pub use wire::{SchemaItem, BLOB_VERSION_ID};
