//! In-Memory Transport
//!
//! [`MemoryTransport`] keeps topics, shards, schema versions and every written
//! frame in process memory. It backs the integration tests and demos, and lets
//! them reshape topology (split/merge) or script failures while producers run.
//!
//! Writes are validated the way the service does it: the shard must exist and
//! be ACTIVE (CLOSED/CLOSING answers `ShardSealed`), and the frame header must
//! parse with a matching record count.

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{
    PutResult, SchemaEntry, Transport, TransportOptions, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use dhub_core::{BatchHeader, RecordSchema, Shard, ShardState, TopicMeta};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;
use tracing::debug;

const MAX_HASH_KEY: u128 = u128::MAX;

/// Format a 128-bit hash key the way the service does.
pub fn format_hash_key(key: u128) -> String {
    format!("{key:032X}")
}

fn parse_hash_key(key: &str) -> TransportResult<u128> {
    u128::from_str_radix(key, 16).map_err(|_| {
        TransportError::new(
            TransportErrorKind::InvalidParameter,
            format!("invalid hash key '{key}'"),
        )
    })
}

/// A frame accepted by [`MemoryTransport::put_records_by_shard`].
#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub shard_id: String,
    pub frame: Bytes,
    pub header: BatchHeader,
    pub request_id: String,
}

struct TopicState {
    meta: TopicMeta,
    shards: Vec<Shard>,
    schema_versions: Vec<RecordSchema>,
    frames: Vec<StoredFrame>,
}

impl TopicState {
    fn shard_mut(&mut self, shard_id: &str) -> TransportResult<&mut Shard> {
        self.shards
            .iter_mut()
            .find(|s| s.shard_id == shard_id)
            .ok_or_else(|| not_found(format!("shard '{shard_id}'")))
    }

    fn next_shard_id(&self) -> u64 {
        self.shards
            .iter()
            .filter_map(|s| s.shard_id.parse::<u64>().ok())
            .max()
            .map_or(0, |id| id + 1)
    }
}

struct ScriptedFailure {
    shard_id: Option<String>,
    kind: TransportErrorKind,
}

fn not_found(what: String) -> TransportError {
    TransportError::new(TransportErrorKind::NotFound, format!("{what} does not exist"))
}

/// Service double holding all state in memory.
pub struct MemoryTransport {
    topics: RwLock<HashMap<(String, String), TopicState>>,
    failures: StdMutex<Vec<ScriptedFailure>>,
    options: StdMutex<Option<TransportOptions>>,
    child_state: StdMutex<ShardState>,
    put_calls: AtomicUsize,
    list_shard_calls: AtomicUsize,
    get_topic_calls: AtomicUsize,
    next_request: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            failures: StdMutex::new(Vec::new()),
            options: StdMutex::new(None),
            child_state: StdMutex::new(ShardState::Active),
            put_calls: AtomicUsize::new(0),
            list_shard_calls: AtomicUsize::new(0),
            get_topic_calls: AtomicUsize::new(0),
            next_request: AtomicUsize::new(0),
        }
    }

    /// Create a topic with `meta.shard_count` ACTIVE shards evenly covering the
    /// hash space. A registry topic's initial schema becomes version 0.
    pub async fn create_topic(&self, meta: TopicMeta) {
        let count = u128::from(meta.shard_count.max(1));
        let step = MAX_HASH_KEY / count;
        let shards = (0..count)
            .map(|i| {
                let end = if i + 1 == count {
                    MAX_HASH_KEY
                } else {
                    step * (i + 1)
                };
                Shard::new(i.to_string(), format_hash_key(step * i), format_hash_key(end))
            })
            .collect();

        let schema_versions = match (&meta.record_schema, meta.enable_schema) {
            (Some(schema), true) => vec![schema.clone()],
            _ => Vec::new(),
        };

        let key = (meta.project.clone(), meta.topic_name.clone());
        let mut meta = meta;
        meta.shard_count = count as u32;
        self.topics.write().await.insert(
            key,
            TopicState {
                meta,
                shards,
                schema_versions,
                frames: Vec::new(),
            },
        );
    }

    /// State given to shards created by later splits and merges.
    pub fn set_child_shard_state(&self, state: ShardState) {
        *self
            .child_state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn child_state(&self) -> ShardState {
        *self.child_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn set_shard_state(
        &self,
        project: &str,
        topic: &str,
        shard_id: &str,
        state: ShardState,
    ) -> TransportResult<()> {
        let mut topics = self.topics.write().await;
        let topic = Self::topic_mut(&mut topics, project, topic)?;
        topic.shard_mut(shard_id)?.state = state;
        Ok(())
    }

    /// Seal `shard_id` and replace it by two children splitting its range at
    /// `split_key` (the midpoint when `None`). Returns the child ids.
    pub async fn split_shard(
        &self,
        project: &str,
        topic: &str,
        shard_id: &str,
        split_key: Option<&str>,
    ) -> TransportResult<(String, String)> {
        let child_state = self.child_state();
        let mut topics = self.topics.write().await;
        let topic = Self::topic_mut(&mut topics, project, topic)?;

        let parent = topic.shard_mut(shard_id)?;
        if !parent.is_active() {
            return Err(TransportError::new(
                TransportErrorKind::InvalidParameter,
                format!("shard '{shard_id}' is not active"),
            ));
        }
        let begin = parse_hash_key(&parent.begin_hash_key)?;
        let end = parse_hash_key(&parent.end_hash_key)?;
        let split = match split_key {
            Some(key) => parse_hash_key(key)?,
            None => begin + (end - begin) / 2,
        };
        if split <= begin || split >= end {
            return Err(TransportError::new(
                TransportErrorKind::InvalidParameter,
                format!("split key outside shard '{shard_id}' range"),
            ));
        }
        parent.state = ShardState::Closed;

        let left_id = topic.next_shard_id().to_string();
        let right_id = (topic.next_shard_id() + 1).to_string();

        let mut left = Shard::new(left_id.clone(), format_hash_key(begin), format_hash_key(split));
        left.state = child_state;
        left.parent_shard_ids = vec![shard_id.to_string()];
        left.right_shard_id = Some(right_id.clone());

        let mut right = Shard::new(right_id.clone(), format_hash_key(split), format_hash_key(end));
        right.state = child_state;
        right.parent_shard_ids = vec![shard_id.to_string()];
        right.left_shard_id = Some(left_id.clone());

        topic.shards.push(left);
        topic.shards.push(right);
        topic.meta.shard_count = topic.shards.iter().filter(|s| s.is_active()).count() as u32;

        debug!(shard_id, left = %left_id, right = %right_id, "Split shard");
        Ok((left_id, right_id))
    }

    /// Seal two adjacent shards and replace them by one covering both ranges.
    pub async fn merge_shard(
        &self,
        project: &str,
        topic: &str,
        shard_id: &str,
        adjacent_shard_id: &str,
    ) -> TransportResult<String> {
        let child_state = self.child_state();
        let mut topics = self.topics.write().await;
        let topic = Self::topic_mut(&mut topics, project, topic)?;

        let (a_begin, a_end) = {
            let a = topic.shard_mut(shard_id)?;
            (parse_hash_key(&a.begin_hash_key)?, parse_hash_key(&a.end_hash_key)?)
        };
        let (b_begin, b_end) = {
            let b = topic.shard_mut(adjacent_shard_id)?;
            (parse_hash_key(&b.begin_hash_key)?, parse_hash_key(&b.end_hash_key)?)
        };
        if a_end != b_begin && b_end != a_begin {
            return Err(TransportError::new(
                TransportErrorKind::InvalidParameter,
                format!("shards '{shard_id}' and '{adjacent_shard_id}' are not adjacent"),
            ));
        }

        topic.shard_mut(shard_id)?.state = ShardState::Closed;
        topic.shard_mut(adjacent_shard_id)?.state = ShardState::Closed;

        let merged_id = topic.next_shard_id().to_string();
        let mut merged = Shard::new(
            merged_id.clone(),
            format_hash_key(a_begin.min(b_begin)),
            format_hash_key(a_end.max(b_end)),
        );
        merged.state = child_state;
        merged.parent_shard_ids = vec![shard_id.to_string(), adjacent_shard_id.to_string()];
        topic.shards.push(merged);
        topic.meta.shard_count = topic.shards.iter().filter(|s| s.is_active()).count() as u32;

        Ok(merged_id)
    }

    /// Replace the schema of a single-schema TUPLE topic.
    pub async fn update_topic_schema(
        &self,
        project: &str,
        topic: &str,
        schema: RecordSchema,
    ) -> TransportResult<()> {
        let mut topics = self.topics.write().await;
        let topic = Self::topic_mut(&mut topics, project, topic)?;
        topic.meta.record_schema = Some(schema);
        Ok(())
    }

    /// Make the next `times` writes fail with `kind`. `shard_id = None` matches
    /// writes to any shard.
    pub fn fail_next_puts(&self, shard_id: Option<&str>, kind: TransportErrorKind, times: usize) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..times {
            failures.push(ScriptedFailure {
                shard_id: shard_id.map(str::to_string),
                kind,
            });
        }
    }

    fn take_failure(&self, shard_id: &str) -> Option<TransportErrorKind> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let index = failures
            .iter()
            .position(|f| f.shard_id.as_deref().map_or(true, |id| id == shard_id))?;
        Some(failures.remove(index).kind)
    }

    /// Every frame accepted for the topic, in arrival order.
    pub async fn frames(&self, project: &str, topic: &str) -> Vec<StoredFrame> {
        self.topics
            .read()
            .await
            .get(&(project.to_string(), topic.to_string()))
            .map(|t| t.frames.clone())
            .unwrap_or_default()
    }

    /// Total records across accepted frames.
    pub async fn record_count(&self, project: &str, topic: &str) -> usize {
        self.frames(project, topic)
            .await
            .iter()
            .map(|f| f.header.record_count as usize)
            .sum()
    }

    /// Number of write attempts, including failed ones.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn list_shard_calls(&self) -> usize {
        self.list_shard_calls.load(Ordering::SeqCst)
    }

    pub fn get_topic_calls(&self) -> usize {
        self.get_topic_calls.load(Ordering::SeqCst)
    }

    /// Options last passed to [`Transport::configure`].
    pub fn options(&self) -> Option<TransportOptions> {
        self.options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn topic_mut<'a>(
        topics: &'a mut HashMap<(String, String), TopicState>,
        project: &str,
        topic: &str,
    ) -> TransportResult<&'a mut TopicState> {
        topics
            .get_mut(&(project.to_string(), topic.to_string()))
            .ok_or_else(|| not_found(format!("topic '{project}/{topic}'")))
    }

    async fn with_topic<T>(
        &self,
        project: &str,
        topic: &str,
        f: impl FnOnce(&TopicState) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let topics = self.topics.read().await;
        let state = topics
            .get(&(project.to_string(), topic.to_string()))
            .ok_or_else(|| not_found(format!("topic '{project}/{topic}'")))?;
        f(state)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn configure(&self, options: &TransportOptions) {
        *self.options.lock().unwrap_or_else(|e| e.into_inner()) = Some(options.clone());
    }

    async fn get_topic(&self, project: &str, topic: &str) -> TransportResult<TopicMeta> {
        self.get_topic_calls.fetch_add(1, Ordering::SeqCst);
        self.with_topic(project, topic, |t| Ok(t.meta.clone())).await
    }

    async fn list_shard(&self, project: &str, topic: &str) -> TransportResult<Vec<Shard>> {
        self.list_shard_calls.fetch_add(1, Ordering::SeqCst);
        self.with_topic(project, topic, |t| Ok(t.shards.clone())).await
    }

    async fn list_topic_schema(
        &self,
        project: &str,
        topic: &str,
    ) -> TransportResult<Vec<SchemaEntry>> {
        self.with_topic(project, topic, |t| {
            Ok(t.schema_versions
                .iter()
                .enumerate()
                .map(|(version, schema)| SchemaEntry {
                    version_id: version as i32,
                    schema: schema.clone(),
                })
                .collect())
        })
        .await
    }

    async fn get_topic_schema_by_version(
        &self,
        project: &str,
        topic: &str,
        version_id: i32,
    ) -> TransportResult<SchemaEntry> {
        self.with_topic(project, topic, |t| {
            usize::try_from(version_id)
                .ok()
                .and_then(|v| t.schema_versions.get(v))
                .map(|schema| SchemaEntry {
                    version_id,
                    schema: schema.clone(),
                })
                .ok_or_else(|| not_found(format!("schema version {version_id}")))
        })
        .await
    }

    async fn register_topic_schema(
        &self,
        project: &str,
        topic: &str,
        schema: &RecordSchema,
    ) -> TransportResult<i32> {
        let mut topics = self.topics.write().await;
        let topic = Self::topic_mut(&mut topics, project, topic)?;
        if !topic.meta.enable_schema {
            return Err(TransportError::new(
                TransportErrorKind::InvalidParameter,
                "topic does not keep a schema registry",
            ));
        }

        let hash = schema.structural_hash();
        if let Some(existing) = topic
            .schema_versions
            .iter()
            .position(|s| s.structural_hash() == hash)
        {
            return Ok(existing as i32);
        }
        topic.schema_versions.push(schema.clone());
        Ok(topic.schema_versions.len() as i32 - 1)
    }

    async fn put_records_by_shard(
        &self,
        project: &str,
        topic: &str,
        shard_id: &str,
        frame: Bytes,
        record_count: u32,
    ) -> TransportResult<PutResult> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let request_id = format!("req-{}", self.next_request.fetch_add(1, Ordering::SeqCst));

        if let Some(kind) = self.take_failure(shard_id) {
            return Err(TransportError::new(kind, "scripted failure").with_request_id(request_id));
        }

        let mut topics = self.topics.write().await;
        let state = Self::topic_mut(&mut topics, project, topic)?;

        let shard = state
            .shards
            .iter()
            .find(|s| s.shard_id == shard_id)
            .ok_or_else(|| {
                TransportError::new(
                    TransportErrorKind::InvalidParameter,
                    format!("shard '{shard_id}' does not exist"),
                )
            })?;
        match shard.state {
            ShardState::Active => {}
            ShardState::Closed | ShardState::Closing => {
                return Err(TransportError::new(
                    TransportErrorKind::ShardSealed,
                    format!("shard '{shard_id}' is sealed"),
                )
                .with_request_id(request_id));
            }
            ShardState::Opening => {
                return Err(TransportError::new(
                    TransportErrorKind::ServiceUnavailable,
                    format!("shard '{shard_id}' is still opening"),
                )
                .with_request_id(request_id));
            }
        }

        let header = BatchHeader::parse(&frame).map_err(|e| {
            TransportError::new(TransportErrorKind::MalformedRecord, e.to_string())
        })?;
        if header.record_count != record_count {
            return Err(TransportError::new(
                TransportErrorKind::MalformedRecord,
                format!(
                    "frame holds {} records, request says {}",
                    header.record_count, record_count
                ),
            ));
        }

        state.frames.push(StoredFrame {
            shard_id: shard_id.to_string(),
            frame,
            header,
            request_id: request_id.clone(),
        });
        Ok(PutResult { request_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhub_core::{BatchEncoder, CompressType, Field, FieldType, Record, SchemaItem};

    fn blob_frame(n: usize) -> Bytes {
        let records: Vec<_> = (0..n).map(|i| Record::blob(format!("r{i}"))).collect();
        BatchEncoder::new(CompressType::None)
            .encode(&records, &SchemaItem::blob().unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_topic_covers_hash_space() {
        let transport = MemoryTransport::new();
        transport.create_topic(TopicMeta::blob("p", "t", 4)).await;

        let shards = transport.list_shard("p", "t").await.unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0].begin_hash_key, "0".repeat(32));
        assert_eq!(shards[3].end_hash_key, "F".repeat(32));
        for pair in shards.windows(2) {
            assert_eq!(pair[0].end_hash_key, pair[1].begin_hash_key);
        }
    }

    #[tokio::test]
    async fn test_put_stores_frame() {
        let transport = MemoryTransport::new();
        transport.create_topic(TopicMeta::blob("p", "t", 1)).await;

        let result = transport
            .put_records_by_shard("p", "t", "0", blob_frame(3), 3)
            .await
            .unwrap();
        assert_eq!(result.request_id, "req-0");
        assert_eq!(transport.record_count("p", "t").await, 3);
        assert_eq!(transport.put_calls(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_bad_frames() {
        let transport = MemoryTransport::new();
        transport.create_topic(TopicMeta::blob("p", "t", 1)).await;

        let err = transport
            .put_records_by_shard("p", "t", "0", blob_frame(3), 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::MalformedRecord);

        let err = transport
            .put_records_by_shard("p", "t", "0", Bytes::from_static(b"junk"), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::MalformedRecord);

        let err = transport
            .put_records_by_shard("p", "t", "9", blob_frame(1), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_split_seals_parent() {
        let transport = MemoryTransport::new();
        transport.create_topic(TopicMeta::blob("p", "t", 1)).await;

        let (left, right) = transport.split_shard("p", "t", "0", None).await.unwrap();
        assert_eq!((left.as_str(), right.as_str()), ("1", "2"));

        let shards = transport.list_shard("p", "t").await.unwrap();
        assert_eq!(shards[0].state, ShardState::Closed);
        assert_eq!(shards[1].end_hash_key, shards[2].begin_hash_key);
        assert_eq!(shards[1].parent_shard_ids, vec!["0".to_string()]);

        let err = transport
            .put_records_by_shard("p", "t", "0", blob_frame(1), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::ShardSealed);

        let meta = transport.get_topic("p", "t").await.unwrap();
        assert_eq!(meta.shard_count, 2);
    }

    #[tokio::test]
    async fn test_merge_requires_adjacency() {
        let transport = MemoryTransport::new();
        transport.create_topic(TopicMeta::blob("p", "t", 3)).await;

        assert!(transport.merge_shard("p", "t", "0", "2").await.is_err());
        let merged = transport.merge_shard("p", "t", "0", "1").await.unwrap();
        assert_eq!(merged, "3");

        let shards = transport.list_shard("p", "t").await.unwrap();
        let merged = shards.iter().find(|s| s.shard_id == "3").unwrap();
        assert_eq!(merged.begin_hash_key, shards[0].begin_hash_key);
        assert_eq!(merged.end_hash_key, shards[1].end_hash_key);
    }

    #[tokio::test]
    async fn test_scripted_failures_match_shard() {
        let transport = MemoryTransport::new();
        transport.create_topic(TopicMeta::blob("p", "t", 2)).await;
        transport.fail_next_puts(Some("1"), TransportErrorKind::LimitExceeded, 1);

        assert!(transport
            .put_records_by_shard("p", "t", "0", blob_frame(1), 1)
            .await
            .is_ok());
        let err = transport
            .put_records_by_shard("p", "t", "1", blob_frame(1), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::LimitExceeded);
        assert!(transport
            .put_records_by_shard("p", "t", "1", blob_frame(1), 1)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_registry_is_additive() {
        let transport = MemoryTransport::new();
        let v0 = RecordSchema::new(vec![Field::new("a", FieldType::Bigint)]).unwrap();
        let v1 = v0.with_field(Field::new("b", FieldType::String)).unwrap();
        transport
            .create_topic(TopicMeta::tuple("p", "t", 1, v0.clone()).with_schema_registry())
            .await;

        assert_eq!(transport.register_topic_schema("p", "t", &v0).await.unwrap(), 0);
        assert_eq!(transport.register_topic_schema("p", "t", &v1).await.unwrap(), 1);
        assert_eq!(transport.list_topic_schema("p", "t").await.unwrap().len(), 2);
        assert_eq!(
            transport.get_topic_schema_by_version("p", "t", 1).await.unwrap().schema,
            v1
        );
        assert!(transport.get_topic_schema_by_version("p", "t", 5).await.is_err());
    }
}
