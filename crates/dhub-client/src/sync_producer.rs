//! Sync Producer
//!
//! [`SyncProducer`] writes a caller-formed batch in one request and returns
//! once the service has answered. There is no buffering: each `send` encodes
//! its records into a single frame and puts it to one ACTIVE shard, picked by
//! round robin or at random.
//!
//! The ACTIVE shard list is refreshed by a background task on a fixed interval.
//! A write that hits a sealed shard forces an immediate refresh; `send` then
//! makes one more attempt on a freshly picked shard, while `send_to_shard`
//! returns the error since its target is fixed.

use crate::config::{ProducerConfig, SendStrategy};
use crate::error::{ClientError, Result};
use crate::outcome::ProduceSuccess;
use crate::retry::RetryPolicy;
use crate::schema_cache::{SchemaRegistry, TopicSchemaCache};
use crate::shard_writer::put_frame;
use crate::single_flight::SingleFlight;
use crate::topology::fetch_active_shards;
use crate::transport::SharedTransport;
use bytes::Bytes;
use dhub_core::{BatchEncoder, Record};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct ShardList {
    transport: SharedTransport,
    project: String,
    topic: String,
    ids: RwLock<Vec<String>>,
    flight: SingleFlight,
}

impl ShardList {
    async fn refresh(&self) -> Result<()> {
        let outcome = self
            .flight
            .run(|| async {
                let shards =
                    fetch_active_shards(self.transport.as_ref(), &self.project, &self.topic)
                        .await?;
                let ids: Vec<String> = shards.into_iter().map(|s| s.shard_id).collect();
                debug!(topic = %self.topic, active = ids.len(), "Shard list refreshed");
                *self.ids.write().await = ids;
                Ok::<(), ClientError>(())
            })
            .await;
        outcome.unwrap_or(Ok(()))
    }

    async fn refresh_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(topic = %self.topic, error = %e, "Failed to refresh shard list");
            }
        }
    }
}

/// Unbuffered producer returning the outcome of every write.
pub struct SyncProducer {
    config: ProducerConfig,
    schemas: Arc<TopicSchemaCache>,
    encoder: BatchEncoder,
    policy: RetryPolicy,
    shards: Arc<ShardList>,
    next_shard: AtomicUsize,
    closed: AtomicBool,
    refresh: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncProducer {
    pub(crate) async fn start(
        config: ProducerConfig,
        transport: SharedTransport,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Self> {
        let schemas = registry.get_or_create(&config.project, &config.topic).await?;
        let shards = Arc::new(ShardList {
            transport,
            project: config.project.clone(),
            topic: config.topic.clone(),
            ids: RwLock::new(Vec::new()),
            flight: SingleFlight::new(),
        });
        shards.refresh().await?;

        let period = config.sync_shard_refresh_interval();
        let refresh = if period.is_zero() {
            None
        } else {
            Some(tokio::spawn(Arc::clone(&shards).refresh_loop(period)))
        };

        let active_shards = shards.ids.read().await.len();
        info!(
            project = %config.project,
            topic = %config.topic,
            strategy = ?config.send_strategy,
            active_shards,
            "Sync producer started"
        );

        Ok(Self {
            encoder: BatchEncoder::new(config.compress_type),
            policy: config.retry_policy(),
            config,
            schemas,
            shards,
            next_shard: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            refresh: StdMutex::new(refresh),
        })
    }

    /// ACTIVE shard ids currently rotated over.
    pub async fn active_shard_ids(&self) -> Vec<String> {
        self.shards.ids.read().await.clone()
    }

    /// Reload the ACTIVE shard list now.
    pub async fn refresh_shards(&self) -> Result<()> {
        self.shards.refresh().await
    }

    async fn select_shard(&self) -> Result<String> {
        let ids = self.shards.ids.read().await;
        if ids.is_empty() {
            return Err(ClientError::NoActiveShard(self.config.topic.clone()));
        }
        let index = match self.config.send_strategy {
            SendStrategy::RoundRobin => self.next_shard.fetch_add(1, Ordering::Relaxed) % ids.len(),
            SendStrategy::Random => rand::thread_rng().gen_range(0..ids.len()),
        };
        Ok(ids[index].clone())
    }

    /// Encode `records` into one frame. They must share a schema.
    async fn encode(&self, records: &[Record]) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ProducerClosed);
        }
        let Some(first) = records.first() else {
            return Err(ClientError::InvalidRecord("no records to send".to_string()));
        };
        let key = first.schema().map(|s| s.structural_hash());
        if records
            .iter()
            .any(|r| r.schema().map(|s| s.structural_hash()) != key)
        {
            return Err(ClientError::InvalidRecord(
                "records in one send must share a schema".to_string(),
            ));
        }

        let item = self.schemas.resolve_version(first).await?;
        Ok(self.encoder.encode(records, &item)?)
    }

    async fn put(&self, shard_id: &str, frame: Bytes, record_count: u32) -> Result<String> {
        let put = put_frame(
            self.shards.transport.as_ref(),
            &self.config.project,
            &self.config.topic,
            shard_id,
            &self.policy,
            frame,
            record_count,
        )
        .await?;
        Ok(put.request_id)
    }

    /// Write `records` to the next shard picked by the send strategy.
    pub async fn send(&self, records: Vec<Record>) -> Result<ProduceSuccess> {
        let frame = self.encode(&records).await?;
        let record_count = records.len() as u32;
        let started = Instant::now();

        let mut shard_id = self.select_shard().await?;
        let request_id = match self.put(&shard_id, frame.clone(), record_count).await {
            Ok(request_id) => request_id,
            Err(e) if e.is_shard_sealed() => {
                debug!(shard_id = %shard_id, "Shard sealed, retrying on a fresh shard");
                self.shards.refresh().await?;
                shard_id = self.select_shard().await?;
                self.put(&shard_id, frame, record_count).await?
            }
            Err(e) => return Err(e),
        };

        Ok(ProduceSuccess {
            shard_id,
            records,
            latency: started.elapsed(),
            request_id,
        })
    }

    /// Write `records` to `shard_id`. A sealed shard refreshes the shard list
    /// and fails the call.
    pub async fn send_to_shard(&self, shard_id: &str, records: Vec<Record>) -> Result<ProduceSuccess> {
        let frame = self.encode(&records).await?;
        let started = Instant::now();

        match self.put(shard_id, frame, records.len() as u32).await {
            Ok(request_id) => Ok(ProduceSuccess {
                shard_id: shard_id.to_string(),
                records,
                latency: started.elapsed(),
                request_id,
            }),
            Err(e) => {
                if e.is_shard_sealed() {
                    if let Err(refresh_err) = self.shards.refresh().await {
                        warn!(error = %refresh_err, "Shard list refresh after seal failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Stop the refresh task. Later sends fail with
    /// [`ClientError::ProducerClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        info!(topic = %self.config.topic, "Sync producer closed");
    }
}

impl Drop for SyncProducer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::memory::MemoryTransport;
    use crate::producer::ProducerBuilder;
    use dhub_core::{Field, FieldType, RecordSchema, ShardState, TopicMeta, TupleData};

    async fn producer(shards: u32, strategy: SendStrategy) -> (Arc<MemoryTransport>, SyncProducer) {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic(TopicMeta::blob("p", "t", shards)).await;
        let producer = ProducerBuilder::new()
            .endpoint("memory://")
            .project("p")
            .topic("t")
            .send_strategy(strategy)
            .sync_shard_refresh_interval(Duration::ZERO)
            .transport(transport.clone())
            .build_sync()
            .await
            .unwrap();
        (transport, producer)
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let (_, producer) = producer(3, SendStrategy::RoundRobin).await;
        let mut shards = Vec::new();
        for i in 0..6 {
            let ok = producer.send(vec![Record::blob(format!("{i}"))]).await.unwrap();
            shards.push(ok.shard_id);
        }
        assert_eq!(shards, vec!["0", "1", "2", "0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_random_stays_within_active_shards() {
        let (_, producer) = producer(3, SendStrategy::Random).await;
        for _ in 0..20 {
            let ok = producer.send(vec![Record::blob("x")]).await.unwrap();
            assert!(["0", "1", "2"].contains(&ok.shard_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_sealed_shard_one_refresh_one_reattempt() {
        let (transport, producer) = producer(2, SendStrategy::RoundRobin).await;
        transport.split_shard("p", "t", "0", None).await.unwrap();
        let lists_before = transport.list_shard_calls();

        let ok = producer.send(vec![Record::blob("a"), Record::blob("b")]).await.unwrap();
        assert_ne!(ok.shard_id, "0");
        assert_eq!(ok.records.len(), 2);
        assert_eq!(transport.list_shard_calls(), lists_before + 1);
        assert_eq!(transport.put_calls(), 2);
        assert_eq!(
            producer.active_shard_ids().await,
            vec!["1".to_string(), "2".to_string(), "3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sealed_twice_fails_with_shard_sealed() {
        let (transport, producer) = producer(1, SendStrategy::RoundRobin).await;
        transport.fail_next_puts(None, TransportErrorKind::ShardSealed, 2);

        let err = producer.send(vec![Record::blob("a")]).await.unwrap_err();
        assert!(err.is_shard_sealed());
        assert_eq!(transport.put_calls(), 2);
    }

    #[tokio::test]
    async fn test_send_to_shard_sealed_refreshes_and_fails() {
        let (transport, producer) = producer(2, SendStrategy::RoundRobin).await;
        transport
            .set_shard_state("p", "t", "1", ShardState::Closed)
            .await
            .unwrap();

        let err = producer
            .send_to_shard("1", vec![Record::blob("a")])
            .await
            .unwrap_err();
        assert!(err.is_shard_sealed());
        assert_eq!(producer.active_shard_ids().await, vec!["0".to_string()]);

        let ok = producer.send_to_shard("0", vec![Record::blob("b")]).await.unwrap();
        assert_eq!(ok.shard_id, "0");
    }

    #[tokio::test]
    async fn test_mixed_schemas_rejected() {
        let (_, producer) = producer(1, SendStrategy::RoundRobin).await;
        let schema = Arc::new(RecordSchema::new(vec![Field::new("a", FieldType::Bigint)]).unwrap());
        let err = producer
            .send(vec![Record::blob("a"), Record::tuple(TupleData::new(schema))])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRecord(_)));

        let err = producer.send(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_no_active_shard() {
        let (transport, producer) = producer(1, SendStrategy::RoundRobin).await;
        transport
            .set_shard_state("p", "t", "0", ShardState::Closed)
            .await
            .unwrap();
        producer.refresh_shards().await.unwrap();

        let err = producer.send(vec![Record::blob("a")]).await.unwrap_err();
        assert!(matches!(err, ClientError::NoActiveShard(_)));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (_, producer) = producer(1, SendStrategy::RoundRobin).await;
        producer.close();
        producer.close();
        let err = producer.send(vec![Record::blob("a")]).await.unwrap_err();
        assert!(matches!(err, ClientError::ProducerClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_picks_up_new_shards() {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic(TopicMeta::blob("p", "t", 1)).await;
        let producer = ProducerBuilder::new()
            .endpoint("memory://")
            .project("p")
            .topic("t")
            .sync_shard_refresh_interval(Duration::from_secs(30))
            .transport(transport.clone())
            .build_sync()
            .await
            .unwrap();

        transport.split_shard("p", "t", "0", None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(
            producer.active_shard_ids().await,
            vec!["1".to_string(), "2".to_string()]
        );
        producer.close();
    }
}
