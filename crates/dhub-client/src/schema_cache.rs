//! Schema Cache
//!
//! Resolves the schema version id each batch is encoded under, and the wire
//! schema for each version id.
//!
//! ## Architecture
//!
//! ```text
//!  SchemaRegistry (one per producer stack, injected)
//!    │
//!    ├── (project, topic) ──► Arc<TopicSchemaCache>   created lazily,
//!    ├── (project, topic) ──► Arc<TopicSchemaCache>   evicted after 5 min idle
//!    └── ...
//!
//!  TopicSchemaCache
//!    ┌───────────────────────────────────────────────┐
//!    │ RwLock<SchemaTable>                           │
//!    │   by_version: version id ──► Arc<SchemaItem>  │
//!    │   by_hash:    structural hash ──► SchemaItem  │
//!    └───────────────────────────────────────────────┘
//! ```
//!
//! ## Topic Kinds
//!
//! - **Blob**: every record resolves to version -1.
//! - **Single schema**: the topic's schema is version 0. When a refresh sees a
//!   different structural hash, the new schema takes over version 0 and the
//!   previous entry stays resolvable under its own hash.
//! - **Registry**: the full version list is fetched and merged additively.
//!   Entries are never removed.
//!
//! Refreshes are single-flight and, unless forced, skipped while the table is
//! younger than the refresh interval.

use crate::error::{ClientError, Result};
use crate::single_flight::SingleFlight;
use crate::transport::SharedTransport;
use dhub_core::{Record, RecordSchema, RecordType, SchemaItem, TopicMeta};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Caches unused for this long are dropped when another cache is created.
pub const IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);

/// Default minimum age of a table before an unforced refresh.
pub const DEFAULT_SCHEMA_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Blob,
    Single,
    Registry,
}

impl CacheKind {
    fn of(meta: &TopicMeta) -> Self {
        match (meta.record_type, meta.enable_schema) {
            (RecordType::Blob, _) => CacheKind::Blob,
            (RecordType::Tuple, false) => CacheKind::Single,
            (RecordType::Tuple, true) => CacheKind::Registry,
        }
    }
}

#[derive(Default)]
struct SchemaTable {
    by_version: BTreeMap<i32, Arc<SchemaItem>>,
    by_hash: HashMap<u64, Arc<SchemaItem>>,
    refreshed_at: Option<Instant>,
}

impl SchemaTable {
    fn insert(&mut self, item: Arc<SchemaItem>) {
        if let Some(schema) = &item.schema {
            self.by_hash
                .insert(schema.structural_hash(), Arc::clone(&item));
        }
        self.by_version.insert(item.version_id, item);
    }

    fn current_single_hash(&self) -> Option<u64> {
        self.by_version
            .get(&0)
            .and_then(|item| item.schema.as_ref())
            .map(|schema| schema.structural_hash())
    }
}

/// Schema versions known for one topic.
pub struct TopicSchemaCache {
    project: String,
    topic: String,
    kind: CacheKind,
    transport: SharedTransport,
    refresh_interval: Duration,
    table: RwLock<SchemaTable>,
    refresh_flight: SingleFlight,
    created: Instant,
    /// Milliseconds after `created` of the latest lookup.
    last_access: AtomicU64,
}

impl TopicSchemaCache {
    /// Fetch the topic and fill the table for the first time.
    pub async fn load(
        transport: SharedTransport,
        project: &str,
        topic: &str,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let meta = transport.get_topic(project, topic).await?;
        let kind = CacheKind::of(&meta);

        let cache = Self {
            project: project.to_string(),
            topic: topic.to_string(),
            kind,
            transport,
            refresh_interval,
            table: RwLock::new(SchemaTable::default()),
            refresh_flight: SingleFlight::new(),
            created: Instant::now(),
            last_access: AtomicU64::new(0),
        };

        match kind {
            CacheKind::Blob => {
                let mut table = cache.table.write().await;
                table.insert(Arc::new(SchemaItem::blob()?));
                table.refreshed_at = Some(Instant::now());
            }
            CacheKind::Single => cache.apply_single(&meta).await?,
            CacheKind::Registry => cache.fetch_registry().await?,
        }

        debug!(
            project = %cache.project,
            topic = %cache.topic,
            kind = ?kind,
            "Schema cache loaded"
        );
        Ok(cache)
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the cache was last used.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Highest known version id (-1 for blob topics).
    pub async fn max_version_id(&self) -> Option<i32> {
        self.touch();
        self.table.read().await.by_version.keys().next_back().copied()
    }

    pub async fn schema_by_version(&self, version_id: i32) -> Option<Arc<RecordSchema>> {
        self.touch();
        self.table
            .read()
            .await
            .by_version
            .get(&version_id)
            .and_then(|item| item.schema.clone())
    }

    /// Full entry for `version_id`, for decoding a frame written under it.
    pub async fn wire_schema_by_version(&self, version_id: i32) -> Result<Arc<SchemaItem>> {
        self.touch();
        if let Some(item) = self.table.read().await.by_version.get(&version_id) {
            return Ok(Arc::clone(item));
        }
        Err(dhub_core::Error::UnknownSchemaVersion(version_id).into())
    }

    pub async fn version_id_by_hash(&self, hash: u64) -> Option<i32> {
        self.touch();
        self.table
            .read()
            .await
            .by_hash
            .get(&hash)
            .map(|item| item.version_id)
    }

    /// Entry for a schema with this structural hash, including entries a
    /// single-schema topic has since replaced.
    pub async fn schema_by_hash(&self, hash: u64) -> Option<Arc<SchemaItem>> {
        self.touch();
        self.table.read().await.by_hash.get(&hash).cloned()
    }

    /// Entry a record must be encoded under.
    ///
    /// A schema the table does not know forces one refresh before the record
    /// is rejected. Single-schema topics only accept their current schema.
    pub async fn resolve_version(&self, record: &Record) -> Result<Arc<SchemaItem>> {
        self.touch();
        if let Some(item) = self.lookup(record).await? {
            return Ok(item);
        }

        self.refresh(true).await?;
        if let Some(item) = self.lookup(record).await? {
            return Ok(item);
        }

        Err(dhub_core::Error::SchemaMismatch(format!(
            "record schema is not a current schema of topic '{}/{}'",
            self.project, self.topic
        ))
        .into())
    }

    async fn lookup(&self, record: &Record) -> Result<Option<Arc<SchemaItem>>> {
        let table = self.table.read().await;
        match (self.kind, record.schema()) {
            (CacheKind::Blob, None) => Ok(table.by_version.values().next().cloned()),
            (CacheKind::Blob, Some(_)) => Err(ClientError::InvalidRecord(format!(
                "topic '{}/{}' takes blob records",
                self.project, self.topic
            ))),
            (_, None) => Err(ClientError::InvalidRecord(format!(
                "topic '{}/{}' takes tuple records",
                self.project, self.topic
            ))),
            (CacheKind::Single, Some(schema)) => {
                let hash = schema.structural_hash();
                Ok(table
                    .by_version
                    .get(&0)
                    .filter(|item| {
                        item.schema
                            .as_ref()
                            .is_some_and(|s| s.structural_hash() == hash)
                    })
                    .cloned())
            }
            (CacheKind::Registry, Some(schema)) => {
                Ok(table.by_hash.get(&schema.structural_hash()).cloned())
            }
        }
    }

    /// Register `schema` with the service and add the returned version.
    pub async fn register_schema(&self, schema: RecordSchema) -> Result<i32> {
        self.touch();
        if self.kind != CacheKind::Registry {
            return Err(ClientError::InvalidRecord(format!(
                "topic '{}/{}' does not keep a schema registry",
                self.project, self.topic
            )));
        }

        let version_id = self
            .transport
            .register_topic_schema(&self.project, &self.topic, &schema)
            .await?;
        let item = Arc::new(SchemaItem::tuple(version_id, Arc::new(schema))?);
        self.table.write().await.insert(item);

        info!(
            project = %self.project,
            topic = %self.topic,
            version_id,
            "Schema registered"
        );
        Ok(version_id)
    }

    /// Reload the table from the service.
    ///
    /// Unforced refreshes are skipped while the table is younger than the
    /// refresh interval. A refresh already in progress is joined instead of
    /// repeated.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        self.touch();
        if !force {
            let refreshed_at = self.table.read().await.refreshed_at;
            if refreshed_at.is_some_and(|at| at.elapsed() < self.refresh_interval) {
                return Ok(());
            }
        }

        let outcome = self
            .refresh_flight
            .run(|| async {
                match self.kind {
                    CacheKind::Blob => Ok::<(), ClientError>(()),
                    CacheKind::Single => {
                        let meta = self.transport.get_topic(&self.project, &self.topic).await?;
                        self.apply_single(&meta).await
                    }
                    CacheKind::Registry => self.fetch_registry().await,
                }
            })
            .await;
        outcome.unwrap_or(Ok(()))
    }

    async fn apply_single(&self, meta: &TopicMeta) -> Result<()> {
        let schema = meta.record_schema.clone().ok_or_else(|| {
            ClientError::Internal(format!(
                "tuple topic '{}/{}' reported no schema",
                self.project, self.topic
            ))
        })?;
        let hash = schema.structural_hash();

        let mut table = self.table.write().await;
        table.refreshed_at = Some(Instant::now());
        if table.current_single_hash() == Some(hash) {
            return Ok(());
        }

        if let Some(previous) = table.current_single_hash() {
            info!(
                project = %self.project,
                topic = %self.topic,
                previous_hash = previous,
                hash,
                "Topic schema changed"
            );
        }
        // The previous entry stays in by_hash.
        let item = match table.by_hash.get(&hash) {
            Some(known) => Arc::clone(known),
            None => Arc::new(SchemaItem::tuple(0, Arc::new(schema))?),
        };
        table.insert(item);
        Ok(())
    }

    async fn fetch_registry(&self) -> Result<()> {
        let entries = self
            .transport
            .list_topic_schema(&self.project, &self.topic)
            .await?;

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            items.push(Arc::new(SchemaItem::tuple(
                entry.version_id,
                Arc::new(entry.schema),
            )?));
        }

        let mut table = self.table.write().await;
        let before = table.by_version.len();
        for item in items {
            if !table.by_version.contains_key(&item.version_id) {
                table.insert(item);
            }
        }
        table.refreshed_at = Some(Instant::now());

        if table.by_version.len() > before {
            debug!(
                project = %self.project,
                topic = %self.topic,
                added = table.by_version.len() - before,
                "Schema versions merged"
            );
        }
        Ok(())
    }
}

/// Per-topic schema caches for one producer stack.
pub struct SchemaRegistry {
    transport: SharedTransport,
    refresh_interval: Duration,
    caches: RwLock<HashMap<(String, String), Arc<TopicSchemaCache>>>,
}

impl SchemaRegistry {
    pub fn new(transport: SharedTransport, refresh_interval: Duration) -> Self {
        Self {
            transport,
            refresh_interval,
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Cache for `(project, topic)`, loading it on first use.
    pub async fn get_or_create(&self, project: &str, topic: &str) -> Result<Arc<TopicSchemaCache>> {
        let key = (project.to_string(), topic.to_string());
        if let Some(cache) = self.caches.read().await.get(&key) {
            cache.touch();
            return Ok(Arc::clone(cache));
        }

        let loaded = Arc::new(
            TopicSchemaCache::load(
                Arc::clone(&self.transport),
                project,
                topic,
                self.refresh_interval,
            )
            .await?,
        );

        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|_, cache| cache.idle_for() < IDLE_EVICTION);
        if caches.len() < before {
            debug!(evicted = before - caches.len(), "Idle schema caches evicted");
        }

        // A concurrent loader may have won; keep its cache.
        let cache = caches.entry(key).or_insert(loaded);
        Ok(Arc::clone(cache))
    }

    pub async fn len(&self) -> usize {
        self.caches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.caches.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use dhub_core::{Field, FieldType, FieldValue, TupleData};

    fn base_schema() -> RecordSchema {
        RecordSchema::new(vec![
            Field::new("id", FieldType::Bigint).not_null(),
            Field::new("name", FieldType::String),
        ])
        .unwrap()
    }

    fn tuple_record(schema: &RecordSchema) -> Record {
        let data = TupleData::new(Arc::new(schema.clone()))
            .with("id", FieldValue::Bigint(1))
            .unwrap();
        Record::tuple(data)
    }

    async fn setup(meta: TopicMeta) -> (Arc<MemoryTransport>, SchemaRegistry) {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic(meta).await;
        let registry = SchemaRegistry::new(transport.clone(), Duration::from_secs(300));
        (transport, registry)
    }

    #[tokio::test]
    async fn test_blob_topic_resolves_to_minus_one() {
        let (_, registry) = setup(TopicMeta::blob("p", "b", 1)).await;
        let cache = registry.get_or_create("p", "b").await.unwrap();

        assert_eq!(cache.kind(), CacheKind::Blob);
        let item = cache.resolve_version(&Record::blob("x")).await.unwrap();
        assert_eq!(item.version_id, -1);
        assert_eq!(cache.max_version_id().await, Some(-1));

        let err = cache
            .resolve_version(&tuple_record(&base_schema()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_single_schema_change_keeps_old_entry() {
        let schema = base_schema();
        let (transport, registry) = setup(TopicMeta::tuple("p", "t", 1, schema.clone())).await;
        let cache = registry.get_or_create("p", "t").await.unwrap();

        let old_hash = schema.structural_hash();
        assert_eq!(cache.version_id_by_hash(old_hash).await, Some(0));

        let extended = schema
            .with_field(Field::new("email", FieldType::String))
            .unwrap();
        transport
            .update_topic_schema("p", "t", extended.clone())
            .await
            .unwrap();
        cache.refresh(true).await.unwrap();

        // New encodes use the new schema.
        let item = cache.resolve_version(&tuple_record(&extended)).await.unwrap();
        assert_eq!(item.version_id, 0);
        assert_eq!(cache.schema_by_version(0).await.unwrap().len(), 3);

        // The old entry is still resolvable by hash.
        let old = cache.schema_by_hash(old_hash).await.unwrap();
        assert_eq!(old.schema.as_deref(), Some(&schema));

        // But no longer accepted for new writes.
        let err = cache.resolve_version(&tuple_record(&schema)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Core(dhub_core::Error::SchemaMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_schema_forces_refresh() {
        let schema = base_schema();
        let (transport, registry) = setup(TopicMeta::tuple("p", "t", 1, schema.clone())).await;
        let cache = registry.get_or_create("p", "t").await.unwrap();

        let extended = schema
            .with_field(Field::new("age", FieldType::Integer))
            .unwrap();
        transport
            .update_topic_schema("p", "t", extended.clone())
            .await
            .unwrap();

        // Not refreshed yet, but the miss triggers one.
        let item = cache.resolve_version(&tuple_record(&extended)).await.unwrap();
        assert_eq!(item.schema.as_deref(), Some(&extended));
    }

    #[tokio::test]
    async fn test_unforced_refresh_is_time_boxed() {
        let schema = base_schema();
        let (transport, registry) = setup(TopicMeta::tuple("p", "t", 1, schema.clone())).await;
        let cache = registry.get_or_create("p", "t").await.unwrap();
        let calls = transport.get_topic_calls();

        cache.refresh(false).await.unwrap();
        assert_eq!(transport.get_topic_calls(), calls);

        cache.refresh(true).await.unwrap();
        assert_eq!(transport.get_topic_calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_registry_merge_never_shrinks() {
        let schema = base_schema();
        let meta = TopicMeta::tuple("p", "r", 1, schema.clone()).with_schema_registry();
        let (_, registry) = setup(meta).await;
        let cache = registry.get_or_create("p", "r").await.unwrap();
        assert_eq!(cache.kind(), CacheKind::Registry);
        assert_eq!(cache.max_version_id().await, Some(0));

        let v1 = schema
            .with_field(Field::new("score", FieldType::Double))
            .unwrap();
        assert_eq!(cache.register_schema(v1.clone()).await.unwrap(), 1);
        assert_eq!(cache.register_schema(v1.clone()).await.unwrap(), 1);

        cache.refresh(true).await.unwrap();
        assert_eq!(cache.max_version_id().await, Some(1));
        assert!(cache.schema_by_version(0).await.is_some());

        // Both versions stay usable for writes.
        assert_eq!(cache.resolve_version(&tuple_record(&schema)).await.unwrap().version_id, 0);
        assert_eq!(cache.resolve_version(&tuple_record(&v1)).await.unwrap().version_id, 1);

        assert!(matches!(
            cache.wire_schema_by_version(9).await,
            Err(ClientError::Core(dhub_core::Error::UnknownSchemaVersion(9)))
        ));
    }

    #[tokio::test]
    async fn test_register_rejected_for_single_schema_topic() {
        let (_, registry) = setup(TopicMeta::tuple("p", "t", 1, base_schema())).await;
        let cache = registry.get_or_create("p", "t").await.unwrap();
        assert!(cache.register_schema(base_schema()).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_reuses_cache() {
        let (_, registry) = setup(TopicMeta::blob("p", "b", 1)).await;
        let a = registry.get_or_create("p", "b").await.unwrap();
        let b = registry.get_or_create("p", "b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);

        assert!(registry.get_or_create("p", "missing").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_caches_evicted_on_creation() {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic(TopicMeta::blob("p", "old", 1)).await;
        transport.create_topic(TopicMeta::blob("p", "new", 1)).await;
        let registry = SchemaRegistry::new(transport, Duration::from_secs(300));

        registry.get_or_create("p", "old").await.unwrap();
        tokio::time::advance(IDLE_EVICTION + Duration::from_secs(1)).await;
        registry.get_or_create("p", "new").await.unwrap();

        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_in_use_survives_eviction() {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic(TopicMeta::blob("p", "busy", 1)).await;
        transport.create_topic(TopicMeta::blob("p", "other", 1)).await;
        let registry = SchemaRegistry::new(transport, Duration::from_secs(300));

        let busy = registry.get_or_create("p", "busy").await.unwrap();
        for _ in 0..360 {
            tokio::time::advance(Duration::from_secs(1)).await;
            busy.resolve_version(&Record::blob("x")).await.unwrap();
        }
        assert!(busy.idle_for() < Duration::from_secs(2));

        registry.get_or_create("p", "other").await.unwrap();
        assert_eq!(registry.len().await, 2);

        let again = registry.get_or_create("p", "busy").await.unwrap();
        assert!(Arc::ptr_eq(&busy, &again));
    }
}
