//! Integration tests for the sync producer against the in-memory transport.

use dhub_client::{ClientError, MemoryTransport, ProducerBuilder, SchemaRegistry, SendStrategy};
use dhub_core::{
    BatchReader, Field, FieldType, FieldValue, ReadMeta, Record, RecordSchema, TopicMeta,
    TupleData,
};
use std::sync::Arc;
use std::time::Duration;

fn builder(transport: &Arc<MemoryTransport>) -> ProducerBuilder {
    ProducerBuilder::new()
        .endpoint("memory://")
        .project("p")
        .topic("t")
        .max_retry(1)
        .retry_interval(Duration::from_millis(5))
        .sync_shard_refresh_interval(Duration::ZERO)
        .transport(transport.clone())
}

#[tokio::test]
async fn test_round_robin_spreads_calls_over_shards() {
    let transport = Arc::new(MemoryTransport::new());
    transport.create_topic(TopicMeta::blob("p", "t", 3)).await;
    let producer = builder(&transport)
        .send_strategy(SendStrategy::RoundRobin)
        .build_sync()
        .await
        .unwrap();

    for i in 0..6 {
        let written = producer
            .send(vec![Record::blob(format!("{i}-a")), Record::blob(format!("{i}-b"))])
            .await
            .unwrap();
        assert_eq!(written.records.len(), 2);
    }

    let shards: Vec<String> = transport
        .frames("p", "t")
        .await
        .into_iter()
        .map(|f| f.shard_id)
        .collect();
    assert_eq!(shards, vec!["0", "1", "2", "0", "1", "2"]);
    assert_eq!(transport.record_count("p", "t").await, 12);
}

#[tokio::test]
async fn test_split_moves_writes_to_children() {
    let transport = Arc::new(MemoryTransport::new());
    transport.create_topic(TopicMeta::blob("p", "t", 1)).await;
    let producer = builder(&transport).build_sync().await.unwrap();

    producer.send(vec![Record::blob("before")]).await.unwrap();
    let (left, right) = transport.split_shard("p", "t", "0", None).await.unwrap();

    let written = producer.send(vec![Record::blob("after")]).await.unwrap();
    assert!(written.shard_id == left || written.shard_id == right);
    assert_eq!(producer.active_shard_ids().await, vec![left, right]);

    let frames = transport.frames("p", "t").await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].shard_id, "0");
}

#[tokio::test]
async fn test_registry_topic_requires_registered_schema() {
    let v0 = RecordSchema::new(vec![Field::new("id", FieldType::Bigint).not_null()]).unwrap();
    let v1 = v0.with_field(Field::new("tag", FieldType::String)).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport
        .create_topic(TopicMeta::tuple("p", "t", 1, v0.clone()).with_schema_registry())
        .await;

    let registry = Arc::new(SchemaRegistry::new(transport.clone(), Duration::from_secs(300)));
    let producer = builder(&transport)
        .schema_registry(Arc::clone(&registry))
        .build_sync()
        .await
        .unwrap();

    let v0 = Arc::new(v0);
    let v1 = Arc::new(v1);
    let row = |schema: &Arc<RecordSchema>, id: i64| {
        Record::tuple(
            TupleData::new(Arc::clone(schema))
                .with("id", FieldValue::Bigint(id))
                .unwrap(),
        )
    };

    producer.send(vec![row(&v0, 1)]).await.unwrap();

    let err = producer.send(vec![row(&v1, 2)]).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Core(dhub_core::Error::SchemaMismatch(_))
    ));

    let cache = registry.get_or_create("p", "t").await.unwrap();
    let version = cache.register_schema((*v1).clone()).await.unwrap();
    assert_eq!(version, 1);
    producer.send(vec![row(&v1, 2), row(&v1, 3)]).await.unwrap();

    let frames = transport.frames("p", "t").await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].header.schema_version, 0);
    assert_eq!(frames[1].header.schema_version, 1);

    let writer = cache.wire_schema_by_version(1).await.unwrap();
    let decoded = BatchReader::new(frames[1].frame.clone())
        .unwrap()
        .read_all(&writer, None, &ReadMeta::default())
        .unwrap();
    let ids: Vec<_> = decoded
        .iter()
        .map(|r| r.as_tuple().unwrap().get_by_name("id").cloned())
        .collect();
    assert_eq!(ids, vec![Some(FieldValue::Bigint(2)), Some(FieldValue::Bigint(3))]);
}

#[tokio::test]
async fn test_blob_record_rejected_on_tuple_topic() {
    let schema = RecordSchema::new(vec![Field::new("id", FieldType::Bigint)]).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.create_topic(TopicMeta::tuple("p", "t", 1, schema)).await;
    let producer = builder(&transport).build_sync().await.unwrap();

    let err = producer.send(vec![Record::blob("raw")]).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidRecord(_)));
    assert_eq!(transport.put_calls(), 0);
}
