//! Transport Contract
//!
//! The producers never speak HTTP themselves. Every control-plane and data-plane
//! call goes through the [`Transport`] trait, so the signing HTTP client, a test
//! double or the in-crate [`crate::MemoryTransport`] can sit behind them.
//!
//! ```text
//!   AsyncProducer / SyncProducer / SchemaRegistry
//!                       │
//!                       ▼
//!              Arc<dyn Transport>
//!        ┌──────────────┴──────────────┐
//!        ▼                             ▼
//!   HTTP client (external)       MemoryTransport
//! ```

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use dhub_core::{CompressType, RecordSchema, Shard, TopicMeta};
use std::sync::Arc;

/// Result type of every transport call.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Response of a successful batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub request_id: String,
}

/// One version of a registry topic's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub version_id: i32,
    pub schema: RecordSchema,
}

/// Credentials used to sign requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Account {
    #[serde(default)]
    pub access_id: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub security_token: Option<String>,
}

/// Connection options a producer hands to its transport at build time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    pub endpoint: String,
    pub account: Account,
    /// Compression of HTTP request bodies. Independent of the batch codec.
    pub request_compression: Option<CompressType>,
}

/// Calls the producers make against the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive connection options from the producer configuration.
    fn configure(&self, _options: &TransportOptions) {}

    async fn get_topic(&self, project: &str, topic: &str) -> TransportResult<TopicMeta>;

    /// All shards of the topic, in any state.
    async fn list_shard(&self, project: &str, topic: &str) -> TransportResult<Vec<Shard>>;

    /// Every registered version of a registry topic's schema.
    async fn list_topic_schema(
        &self,
        project: &str,
        topic: &str,
    ) -> TransportResult<Vec<SchemaEntry>>;

    async fn get_topic_schema_by_version(
        &self,
        project: &str,
        topic: &str,
        version_id: i32,
    ) -> TransportResult<SchemaEntry>;

    /// Register `schema` and return its version id. Registering an existing
    /// schema returns the existing id.
    async fn register_topic_schema(
        &self,
        project: &str,
        topic: &str,
        schema: &RecordSchema,
    ) -> TransportResult<i32>;

    /// Write one encoded batch frame to a shard.
    async fn put_records_by_shard(
        &self,
        project: &str,
        topic: &str,
        shard_id: &str,
        frame: Bytes,
        record_count: u32,
    ) -> TransportResult<PutResult>;
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;
