//! Topic and Shard Metadata
//!
//! Control-plane view of a topic as returned by `GetTopic` and `ListShard`.
//!
//! ## Shard Lifecycle
//!
//! ```text
//!   OPENING ──► ACTIVE ──► CLOSING ──► CLOSED
//!                  │
//!                  └── split / merge seals the shard and creates children
//! ```
//!
//! Only ACTIVE shards accept writes. Hash keys are 128-bit values rendered as
//! 32 uppercase hex characters, so plain string comparison orders them.

use crate::compression::CompressType;
use crate::schema::RecordSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardState {
    Opening,
    Active,
    Closing,
    Closed,
}

impl ShardState {
    /// True once the shard has left the transitional states.
    pub fn is_settled(self) -> bool {
        matches!(self, ShardState::Active | ShardState::Closed)
    }
}

/// A hash-range-bounded partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Shard {
    pub shard_id: String,
    pub state: ShardState,
    pub begin_hash_key: String,
    pub end_hash_key: String,
    #[serde(default)]
    pub parent_shard_ids: Vec<String>,
    #[serde(default)]
    pub left_shard_id: Option<String>,
    #[serde(default)]
    pub right_shard_id: Option<String>,
}

impl Shard {
    pub fn new(shard_id: impl Into<String>, begin: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            state: ShardState::Active,
            begin_hash_key: begin.into(),
            end_hash_key: end.into(),
            parent_shard_ids: Vec::new(),
            left_shard_id: None,
            right_shard_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ShardState::Active
    }

    /// Numeric form of the id, used for stable ordering.
    ///
    /// Non-numeric ids sort after every numeric one.
    pub fn numeric_id(&self) -> u64 {
        self.shard_id.parse().unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    Blob,
    Tuple,
}

/// How a topic grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpandMode {
    /// Shards own hash ranges; split/merge reshapes them.
    #[default]
    SplitMerge,
    /// Shards are only ever appended; keys route by `crc32 % count`.
    OnlyExtend,
}

/// Per-topic options the service reports alongside the topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicExtraConfig {
    pub protocol: Option<String>,
    pub compress_type: Option<CompressType>,
    pub list_shard_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicMeta {
    pub project: String,
    pub topic_name: String,
    pub shard_count: u32,
    pub lifecycle: u32,
    pub record_type: RecordType,
    /// Schema of a single-schema TUPLE topic.
    pub record_schema: Option<RecordSchema>,
    pub expand_mode: ExpandMode,
    /// Topic keeps a versioned schema registry instead of a single schema.
    pub enable_schema: bool,
    pub extra: TopicExtraConfig,
    pub comment: String,
}

impl TopicMeta {
    pub fn blob(project: impl Into<String>, topic: impl Into<String>, shard_count: u32) -> Self {
        Self {
            project: project.into(),
            topic_name: topic.into(),
            shard_count,
            lifecycle: 7,
            record_type: RecordType::Blob,
            record_schema: None,
            expand_mode: ExpandMode::SplitMerge,
            enable_schema: false,
            extra: TopicExtraConfig::default(),
            comment: String::new(),
        }
    }

    pub fn tuple(
        project: impl Into<String>,
        topic: impl Into<String>,
        shard_count: u32,
        schema: RecordSchema,
    ) -> Self {
        Self {
            record_type: RecordType::Tuple,
            record_schema: Some(schema),
            ..Self::blob(project, topic, shard_count)
        }
    }

    pub fn with_expand_mode(mut self, mode: ExpandMode) -> Self {
        self.expand_mode = mode;
        self
    }

    pub fn with_schema_registry(mut self) -> Self {
        self.enable_schema = true;
        self
    }

    pub fn is_blob(&self) -> bool {
        self.record_type == RecordType::Blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_json_uses_service_field_names() {
        let json = r#"{"ShardId":"3","State":"ACTIVE","BeginHashKey":"00000000000000000000000000000000","EndHashKey":"FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF","ParentShardIds":["1"]}"#;
        let shard: Shard = serde_json::from_str(json).unwrap();
        assert_eq!(shard.shard_id, "3");
        assert!(shard.is_active());
        assert_eq!(shard.parent_shard_ids, vec!["1".to_string()]);
        assert_eq!(shard.left_shard_id, None);
    }

    #[test]
    fn test_numeric_id_ordering() {
        let mut shards = vec![
            Shard::new("10", "", ""),
            Shard::new("2", "", ""),
            Shard::new("x", "", ""),
        ];
        shards.sort_by_key(|s| s.numeric_id());
        let ids: Vec<_> = shards.iter().map(|s| s.shard_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "10", "x"]);
    }

    #[test]
    fn test_settled_states() {
        assert!(ShardState::Active.is_settled());
        assert!(ShardState::Closed.is_settled());
        assert!(!ShardState::Opening.is_settled());
        assert!(!ShardState::Closing.is_settled());
    }
}
