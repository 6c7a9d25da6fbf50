//! Async Producer
//!
//! [`AsyncProducer`] accepts records one at a time, batches them per shard and
//! writes them in the background. Results come back as per-batch outcomes on
//! the success and error queues.
//!
//! ## Architecture
//!
//! ```text
//!  send(record)
//!      │ bounded input queue (max_async_flighting_num)
//!      ▼
//!  ┌──────────┐  shard id set   ┌──────────────┐
//!  │ dispatch │ ──────────────► │ ShardWriter  │──► put_records_by_shard
//!  └──────────┘                 │ (per shard)  │        │
//!      │  ▲  no shard id        └──────────────┘        │ shard sealed
//!      │  │                            ▲                ▼
//!      │  └──────── retry queue ◄──────┼────────── SealedBatch
//!      ▼                               │
//!  ┌───────────────┐  batches   ┌────────────────┐
//!  │ global buffer │ ─────────► │ dispatch_batch │  round robin over
//!  └───────────────┘            └────────────────┘  ACTIVE shards
//! ```
//!
//! ## Routing
//!
//! Each record goes through the [`Partitioner`]. A record that names a shard
//! (explicitly or through its keys) goes to that shard's writer; the rest are
//! batched in the global buffer and each batch goes to the next ACTIVE shard.
//!
//! ## Topology
//!
//! The ACTIVE shard list is refreshed on a jittered interval and whenever a
//! batch comes back from a sealed shard. New shards get writers; writers are
//! never removed, so a batch already queued for a sealed shard still reaches
//! the service and comes back through the retry queue.
//!
//! ## Shutdown
//!
//! `close()` closes the input queue. Dispatch drains it, then stops accepting
//! sealed batches and drains the retry queue, then the global buffer flushes
//! its remainder, and finally every shard writer flushes and stops. Each record
//! accepted before `close()` ends in exactly one success or error outcome.
//!
//! ## Examples
//!
//! ```ignore
//! use dhub_client::{AsyncProducer, ProducerConfig};
//! use dhub_core::Record;
//!
//! let producer = AsyncProducer::builder()
//!     .config(ProducerConfig::new("https://dhub.example.com", "analytics", "clicks"))
//!     .transport(transport)
//!     .build_async()
//!     .await?;
//!
//! let mut errors = producer.take_errors().await.expect("error queue enabled");
//! producer.send(Record::blob("payload").with_partition_key("user-7")).await?;
//! producer.close().await?;
//!
//! while let Some(failed) = errors.recv().await {
//!     eprintln!("{} records failed: {}", failed.records.len(), failed.error);
//! }
//! ```

use crate::buffer::BufferHelper;
use crate::config::{ProducerConfig, SendStrategy};
use crate::error::{ClientError, Closed, Result};
use crate::outcome::{ErrorReceiver, OutcomeSink, SuccessReceiver};
use crate::partition::{DefaultPartitioner, Partitioner};
use crate::schema_cache::SchemaRegistry;
use crate::shard_writer::{RetryReceiver, SealedBatch, ShardWriter, WriterContext};
use crate::single_flight::SingleFlight;
use crate::sync_producer::SyncProducer;
use crate::topology::{fetch_active_shards, next_refresh_delay, refresh_interval};
use crate::transport::{Account, SharedTransport};
use dhub_core::{BatchEncoder, CompressType, Record, Shard, TopicMeta};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of an [`AsyncProducer`].
///
/// [`ProducerBuilder::create_async`] returns a producer in `Uninitialized`;
/// `init` moves it through `Initializing` to `Running`. `close` moves a
/// running producer through `Closing` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Uninitialized,
    Initializing,
    Running,
    Closing,
    Closed,
}

/// ACTIVE shards and every writer created so far.
struct Routing {
    active: Vec<Shard>,
    writers: HashMap<String, Arc<ShardWriter>>,
}

struct Inner {
    config: ProducerConfig,
    topic: TopicMeta,
    transport: SharedTransport,
    partitioner: Arc<dyn Partitioner>,
    context: Arc<WriterContext>,
    routing: RwLock<Routing>,
    refresh_flight: SingleFlight,
    outcomes: OutcomeSink,
    global: BufferHelper<Record>,
    next_shard: AtomicUsize,
}

impl Inner {
    fn spawn_writer(&self, shard_id: &str) -> Arc<ShardWriter> {
        Arc::new(ShardWriter::spawn(
            shard_id,
            Arc::clone(&self.context),
            self.config.max_async_buffer_num,
            self.config.max_async_buffer_time(),
            self.config.max_async_flighting_num,
        ))
    }

    /// Reload the ACTIVE shard list and add writers for new shards.
    #[instrument(skip(self), fields(topic = %self.config.topic))]
    async fn refresh_topology(&self) -> Result<()> {
        let outcome = self
            .refresh_flight
            .run(|| async {
                let shards = fetch_active_shards(
                    self.transport.as_ref(),
                    &self.config.project,
                    &self.config.topic,
                )
                .await?;

                let mut routing = self.routing.write().await;
                for shard in &shards {
                    if !routing.writers.contains_key(&shard.shard_id) {
                        info!(shard_id = %shard.shard_id, "New shard discovered");
                        let writer = self.spawn_writer(&shard.shard_id);
                        routing.writers.insert(shard.shard_id.clone(), writer);
                    }
                }
                debug!(active = shards.len(), writers = routing.writers.len(), "Topology refreshed");
                routing.active = shards;
                Ok::<(), ClientError>(())
            })
            .await;
        outcome.unwrap_or(Ok(()))
    }

    async fn writer(&self, shard_id: &str) -> Option<Arc<ShardWriter>> {
        self.routing.read().await.writers.get(shard_id).cloned()
    }

    async fn next_active_writer(&self) -> Option<Arc<ShardWriter>> {
        let routing = self.routing.read().await;
        if routing.active.is_empty() {
            return None;
        }
        let index = self.next_shard.fetch_add(1, Ordering::Relaxed) % routing.active.len();
        let shard_id = &routing.active[index].shard_id;
        routing.writers.get(shard_id).cloned()
    }

    /// Send one input record to its shard writer or the global buffer.
    async fn route(&self, record: Record) {
        let shard_id = {
            let routing = self.routing.read().await;
            self.partitioner.partition(&self.topic, &routing.active, &record)
        };

        if shard_id.is_empty() {
            if let Err(Closed(record)) = self.global.submit(record).await {
                self.outcomes
                    .fail(String::new(), vec![record], ClientError::ProducerClosed);
            }
            return;
        }

        let writer = match self.writer(&shard_id).await {
            Some(writer) => Some(writer),
            None => {
                if let Err(e) = self.refresh_topology().await {
                    warn!(shard_id = %shard_id, error = %e, "Refresh for unknown shard failed");
                }
                self.writer(&shard_id).await
            }
        };

        match writer {
            Some(writer) => {
                if let Err(Closed(record)) = writer.submit(record).await {
                    self.outcomes
                        .fail(shard_id, vec![record], ClientError::ProducerClosed);
                }
            }
            None => {
                let error = ClientError::InvalidShard {
                    shard_id: shard_id.clone(),
                    topic: self.config.topic.clone(),
                };
                self.outcomes.fail(shard_id, vec![record], error);
            }
        }
    }

    /// Refresh topology and put a sealed batch back on the load-balanced path.
    async fn resubmit(&self, sealed: SealedBatch) {
        debug!(
            shard_id = %sealed.shard_id,
            record_count = sealed.records.len(),
            "Resubmitting batch from sealed shard"
        );
        if let Err(e) = self.refresh_topology().await {
            warn!(error = %e, "Topology refresh after shard seal failed");
        }
        if let Err(Closed(records)) = self.global.submit_batch(sealed.records).await {
            self.outcomes
                .fail(sealed.shard_id, records, ClientError::ProducerClosed);
        }
    }

    /// Hand a global-buffer batch to the next ACTIVE shard.
    async fn forward(&self, batch: Vec<Record>) {
        let writer = match self.next_active_writer().await {
            Some(writer) => Some(writer),
            None => {
                if let Err(e) = self.refresh_topology().await {
                    warn!(error = %e, "Refresh for empty shard list failed");
                }
                self.next_active_writer().await
            }
        };

        let Some(writer) = writer else {
            warn!(record_count = batch.len(), "No active shard for batch");
            self.outcomes.fail(
                String::new(),
                batch,
                ClientError::NoActiveShard(self.config.topic.clone()),
            );
            return;
        };

        if let Err(Closed(batch)) = writer.submit_batch(batch).await {
            self.outcomes
                .fail(writer.shard_id(), batch, ClientError::ProducerClosed);
        }
    }
}

/// Collaborators held by an uninitialized producer until `init` uses them.
struct Setup {
    transport: SharedTransport,
    registry: Arc<SchemaRegistry>,
    partitioner: Arc<dyn Partitioner>,
}

/// Buffered, background-sending producer for one topic.
pub struct AsyncProducer {
    config: ProducerConfig,
    setup: Mutex<Option<Setup>>,
    inner: OnceLock<Arc<Inner>>,
    state: StdMutex<ProducerState>,
    input: RwLock<Option<mpsc::Sender<Record>>>,
    successes: Mutex<Option<SuccessReceiver>>,
    errors: Mutex<Option<ErrorReceiver>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    dispatch_batch: Mutex<Option<JoinHandle<()>>>,
    refresh: StdMutex<Option<JoinHandle<()>>>,
}

impl AsyncProducer {
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    fn new(
        config: ProducerConfig,
        transport: SharedTransport,
        registry: Arc<SchemaRegistry>,
        partitioner: Arc<dyn Partitioner>,
    ) -> Self {
        Self {
            config,
            setup: Mutex::new(Some(Setup {
                transport,
                registry,
                partitioner,
            })),
            inner: OnceLock::new(),
            state: StdMutex::new(ProducerState::Uninitialized),
            input: RwLock::new(None),
            successes: Mutex::new(None),
            errors: Mutex::new(None),
            dispatch: Mutex::new(None),
            dispatch_batch: Mutex::new(None),
            refresh: StdMutex::new(None),
        }
    }

    /// Fetch topic metadata and the ACTIVE shard list, create the shard
    /// writers and start the workers.
    ///
    /// On failure the producer returns to `Uninitialized` and `init` may be
    /// called again. Calling it on a running producer is a no-op.
    pub async fn init(&self) -> Result<()> {
        let mut setup = self.setup.lock().await;
        match self.state() {
            ProducerState::Uninitialized => {}
            ProducerState::Running => return Ok(()),
            _ => return Err(ClientError::ProducerClosed),
        }
        let Some(parts) = setup.as_ref() else {
            return Err(ClientError::Internal("producer setup already consumed".to_string()));
        };

        self.set_state(ProducerState::Initializing);
        debug!(project = %self.config.project, topic = %self.config.topic, "Initializing async producer");
        match self.start(parts).await {
            Ok(()) => {
                setup.take();
                self.set_state(ProducerState::Running);
                Ok(())
            }
            Err(e) => {
                warn!(topic = %self.config.topic, error = %e, "Async producer initialization failed");
                self.set_state(ProducerState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn start(&self, parts: &Setup) -> Result<()> {
        let config = self.config.clone();
        let transport = Arc::clone(&parts.transport);
        let topic = transport.get_topic(&config.project, &config.topic).await?;
        let schemas = parts
            .registry
            .get_or_create(&config.project, &config.topic)
            .await?;

        let (outcomes, successes, errors) =
            OutcomeSink::new(config.enable_success_ch, config.enable_error_ch);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let context = Arc::new(WriterContext {
            transport: Arc::clone(&transport),
            project: config.project.clone(),
            topic: config.topic.clone(),
            schemas,
            encoder: BatchEncoder::new(config.compress_type),
            policy: config.retry_policy(),
            outcomes: outcomes.clone(),
            retry_tx,
        });

        let (global, global_rx) = BufferHelper::new(
            config.max_async_buffer_num,
            config.max_async_buffer_time(),
            config.max_async_flighting_num,
        );
        let (input_tx, input_rx) = mpsc::channel(config.max_async_flighting_num);
        let base_interval = refresh_interval(&topic, config.shard_refresh_interval());

        let inner = Arc::new(Inner {
            config,
            topic,
            transport,
            partitioner: Arc::clone(&parts.partitioner),
            context,
            routing: RwLock::new(Routing {
                active: Vec::new(),
                writers: HashMap::new(),
            }),
            refresh_flight: SingleFlight::new(),
            outcomes,
            global,
            next_shard: AtomicUsize::new(0),
        });
        if let Err(e) = inner.refresh_topology().await {
            inner.global.close().await;
            return Err(e);
        }
        if self.inner.set(Arc::clone(&inner)).is_err() {
            return Err(ClientError::Internal("producer initialized twice".to_string()));
        }

        *self.successes.lock().await = successes;
        *self.errors.lock().await = errors;
        *self.dispatch.lock().await =
            Some(tokio::spawn(Self::dispatch(Arc::clone(&inner), input_rx, retry_rx)));
        *self.dispatch_batch.lock().await =
            Some(tokio::spawn(Self::dispatch_batch(Arc::clone(&inner), global_rx)));
        if !base_interval.is_zero() {
            *self.refresh.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(tokio::spawn(Self::refresh_loop(Arc::clone(&inner), base_interval)));
        }
        *self.input.write().await = Some(input_tx);

        let active_shards = inner.routing.read().await.active.len();
        info!(
            project = %inner.config.project,
            topic = %inner.config.topic,
            active_shards,
            refresh_ms = base_interval.as_millis() as u64,
            "Async producer started"
        );
        Ok(())
    }

    pub fn state(&self) -> ProducerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ProducerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Topic metadata, once `init` has fetched it.
    pub fn topic(&self) -> Option<&TopicMeta> {
        self.inner.get().map(|inner| &inner.topic)
    }

    /// Queue a record for sending. Waits while the input queue is full.
    pub async fn send(&self, record: Record) -> Result<()> {
        let input = self.input.read().await;
        let Some(tx) = input.as_ref() else {
            return Err(match self.state() {
                ProducerState::Uninitialized | ProducerState::Initializing => {
                    ClientError::NotInitialized
                }
                _ => ClientError::ProducerClosed,
            });
        };
        tx.send(record)
            .await
            .map_err(|_| ClientError::ProducerClosed)
    }

    /// Take the success queue. Returns `None` if it is disabled, was already
    /// taken, or the producer is not initialized yet.
    pub async fn take_successes(&self) -> Option<SuccessReceiver> {
        self.successes.lock().await.take()
    }

    /// Take the error queue. Returns `None` if it is disabled, was already
    /// taken, or the producer is not initialized yet.
    pub async fn take_errors(&self) -> Option<ErrorReceiver> {
        self.errors.lock().await.take()
    }

    /// ACTIVE shards the producer currently routes to.
    pub async fn active_shards(&self) -> Vec<Shard> {
        match self.inner.get() {
            Some(inner) => inner.routing.read().await.active.clone(),
            None => Vec::new(),
        }
    }

    /// Number of shard writers, sealed shards included.
    pub async fn writer_count(&self) -> usize {
        match self.inner.get() {
            Some(inner) => inner.routing.read().await.writers.len(),
            None => 0,
        }
    }

    /// Reload the shard list now.
    pub async fn refresh_topology(&self) -> Result<()> {
        let inner = self.inner.get().ok_or(ClientError::NotInitialized)?;
        inner.refresh_topology().await
    }

    /// Flush everything accepted so far and stop. Later sends fail with
    /// [`ClientError::ProducerClosed`]. Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            // Waits for an `init` in progress.
            let _setup = self.setup.lock().await;
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ProducerState::Running => *state = ProducerState::Closing,
                ProducerState::Uninitialized => {
                    *state = ProducerState::Closed;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
        info!(topic = %self.config.topic, "Closing async producer");

        // Waits for in-progress sends before the queue closes.
        drop(self.input.write().await.take());

        let mut result = Ok(());
        for (name, worker) in [("dispatch", &self.dispatch), ("dispatch_batch", &self.dispatch_batch)] {
            if let Some(handle) = worker.lock().await.take() {
                if let Err(e) = handle.await {
                    warn!(worker = name, error = %e, "Producer worker ended abnormally");
                    result = Err(ClientError::Internal(format!("{name} worker failed: {e}")));
                }
            }
        }

        self.abort_refresh();

        if let Some(inner) = self.inner.get() {
            let writers: Vec<Arc<ShardWriter>> =
                inner.routing.read().await.writers.values().cloned().collect();
            for writer in writers {
                writer.close().await;
            }
        }

        self.set_state(ProducerState::Closed);
        info!(topic = %self.config.topic, "Async producer closed");
        result
    }

    fn abort_refresh(&self) {
        if let Some(handle) = self
            .refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    async fn dispatch(
        inner: Arc<Inner>,
        mut input: mpsc::Receiver<Record>,
        mut retry_rx: RetryReceiver,
    ) {
        loop {
            tokio::select! {
                record = input.recv() => match record {
                    Some(record) => inner.route(record).await,
                    None => break,
                },
                Some(sealed) = retry_rx.recv() => inner.resubmit(sealed).await,
            }
        }

        // Writers that hit a sealed shard from here on report ProducerClosed.
        retry_rx.close();
        while let Some(sealed) = retry_rx.recv().await {
            inner.resubmit(sealed).await;
        }

        inner.global.close().await;
        debug!("Dispatch finished");
    }

    async fn dispatch_batch(inner: Arc<Inner>, mut batches: mpsc::Receiver<Vec<Record>>) {
        while let Some(batch) = batches.recv().await {
            inner.forward(batch).await;
        }
        debug!("Batch dispatch finished");
    }

    async fn refresh_loop(inner: Arc<Inner>, base: Duration) {
        loop {
            tokio::time::sleep(next_refresh_delay(base)).await;
            if let Err(e) = inner.refresh_topology().await {
                // Keep routing with the last known shard list.
                warn!(error = %e, "Periodic topology refresh failed");
            }
        }
    }
}

impl Drop for AsyncProducer {
    fn drop(&mut self) {
        self.abort_refresh();
    }
}

/// Builder for [`AsyncProducer`] and [`SyncProducer`].
///
/// Settings start from [`ProducerConfig::new`] defaults. A transport is
/// required; the schema registry and partitioner are optional.
///
/// # Examples
///
/// ```ignore
/// let producer = ProducerBuilder::new()
///     .endpoint("https://dhub.example.com")
///     .project("analytics")
///     .topic("clicks")
///     .max_async_buffer_num(500)
///     .max_async_buffer_time(Duration::from_millis(200))
///     .transport(transport)
///     .build_async()
///     .await?;
/// ```
pub struct ProducerBuilder {
    config: ProducerConfig,
    transport: Option<SharedTransport>,
    schema_registry: Option<Arc<SchemaRegistry>>,
    partitioner: Option<Arc<dyn Partitioner>>,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            config: ProducerConfig::new("", "", ""),
            transport: None,
            schema_registry: None,
            partitioner: None,
        }
    }

    /// Replace every setting at once.
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.config.project = project.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn account(mut self, account: Account) -> Self {
        self.config.account = account;
        self
    }

    /// Retries after the first attempt. Negative retries forever.
    pub fn max_retry(mut self, max_retry: i32) -> Self {
        self.config.max_retry = max_retry;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_async_buffer_num(mut self, num: usize) -> Self {
        self.config.max_async_buffer_num = num;
        self
    }

    pub fn max_async_flighting_num(mut self, num: usize) -> Self {
        self.config.max_async_flighting_num = num;
        self
    }

    pub fn max_async_buffer_time(mut self, time: Duration) -> Self {
        self.config.max_async_buffer_time_ms = time.as_millis() as u64;
        self
    }

    pub fn enable_success_ch(mut self, enabled: bool) -> Self {
        self.config.enable_success_ch = enabled;
        self
    }

    pub fn enable_error_ch(mut self, enabled: bool) -> Self {
        self.config.enable_error_ch = enabled;
        self
    }

    pub fn send_strategy(mut self, strategy: SendStrategy) -> Self {
        self.config.send_strategy = strategy;
        self
    }

    /// Codec for batch payloads.
    pub fn compress_type(mut self, compress_type: CompressType) -> Self {
        self.config.compress_type = compress_type;
        self
    }

    /// Codec for HTTP request bodies, applied by the transport.
    pub fn request_compression(mut self, compress_type: CompressType) -> Self {
        self.config.request_compression = Some(compress_type);
        self
    }

    pub fn shard_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.shard_refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn sync_shard_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.sync_shard_refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn schema_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.schema_refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Transport used for every service call (required).
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a schema registry between producers. Each build creates its own
    /// otherwise.
    pub fn schema_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.schema_registry = Some(registry);
        self
    }

    /// Replace the routing policy of the async producer.
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    fn prepare(self) -> Result<(ProducerConfig, SharedTransport, Arc<SchemaRegistry>, Arc<dyn Partitioner>)> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| ClientError::ConfigError("transport is required".to_string()))?;
        transport.configure(&self.config.transport_options());

        let registry = self.schema_registry.unwrap_or_else(|| {
            Arc::new(SchemaRegistry::new(
                Arc::clone(&transport),
                self.config.schema_refresh_interval(),
            ))
        });
        let partitioner = self
            .partitioner
            .unwrap_or_else(|| Arc::new(DefaultPartitioner) as Arc<dyn Partitioner>);
        Ok((self.config, transport, registry, partitioner))
    }

    /// Validate the settings and return an uninitialized producer. Nothing is
    /// fetched or spawned until [`AsyncProducer::init`].
    pub fn create_async(self) -> Result<AsyncProducer> {
        let (config, transport, registry, partitioner) = self.prepare()?;
        Ok(AsyncProducer::new(config, transport, registry, partitioner))
    }

    /// [`create_async`](Self::create_async) followed by `init`.
    pub async fn build_async(self) -> Result<AsyncProducer> {
        let producer = self.create_async()?;
        producer.init().await?;
        Ok(producer)
    }

    pub async fn build_sync(self) -> Result<SyncProducer> {
        let (config, transport, registry, _) = self.prepare()?;
        SyncProducer::start(config, transport, registry).await
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::{PutResult, SchemaEntry, Transport, TransportResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use dhub_core::RecordSchema;
    use tokio::sync::Semaphore;

    /// Holds every `get_topic` call until `open` has a permit.
    struct GatedTransport {
        inner: Arc<MemoryTransport>,
        open: Semaphore,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn get_topic(&self, project: &str, topic: &str) -> TransportResult<TopicMeta> {
            let _permit = self.open.acquire().await;
            self.inner.get_topic(project, topic).await
        }

        async fn list_shard(&self, project: &str, topic: &str) -> TransportResult<Vec<Shard>> {
            self.inner.list_shard(project, topic).await
        }

        async fn list_topic_schema(
            &self,
            project: &str,
            topic: &str,
        ) -> TransportResult<Vec<SchemaEntry>> {
            self.inner.list_topic_schema(project, topic).await
        }

        async fn get_topic_schema_by_version(
            &self,
            project: &str,
            topic: &str,
            version_id: i32,
        ) -> TransportResult<SchemaEntry> {
            self.inner
                .get_topic_schema_by_version(project, topic, version_id)
                .await
        }

        async fn register_topic_schema(
            &self,
            project: &str,
            topic: &str,
            schema: &RecordSchema,
        ) -> TransportResult<i32> {
            self.inner.register_topic_schema(project, topic, schema).await
        }

        async fn put_records_by_shard(
            &self,
            project: &str,
            topic: &str,
            shard_id: &str,
            frame: Bytes,
            record_count: u32,
        ) -> TransportResult<PutResult> {
            self.inner
                .put_records_by_shard(project, topic, shard_id, frame, record_count)
                .await
        }
    }

    fn base_config() -> ProducerConfig {
        let mut config = ProducerConfig::new("memory://", "p", "t");
        config.max_async_buffer_time_ms = 3_600_000;
        config.shard_refresh_interval_ms = 0;
        config
    }

    async fn transport_with(meta: TopicMeta) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic(meta).await;
        transport
    }

    #[tokio::test]
    async fn test_builder_requires_transport() {
        let result = ProducerBuilder::new().config(base_config()).build_async().await;
        assert!(matches!(result, Err(ClientError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_builder_validates_config() {
        let transport = transport_with(TopicMeta::blob("p", "t", 1)).await;
        let result = ProducerBuilder::new()
            .config(base_config())
            .project("")
            .transport(transport)
            .build_async()
            .await;
        assert!(matches!(result, Err(ClientError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_build_passes_request_compression_to_transport() {
        let transport = transport_with(TopicMeta::blob("p", "t", 1)).await;
        let producer = ProducerBuilder::new()
            .config(base_config())
            .request_compression(CompressType::Deflate)
            .transport(transport.clone())
            .build_async()
            .await
            .unwrap();

        let options = transport.options().unwrap();
        assert_eq!(options.request_compression, Some(CompressType::Deflate));
        assert_eq!(options.endpoint, "memory://");
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_topic_fails_build() {
        let transport = Arc::new(MemoryTransport::new());
        let result = ProducerBuilder::new()
            .config(base_config())
            .transport(transport)
            .build_async()
            .await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let transport = transport_with(TopicMeta::blob("p", "t", 2)).await;
        let producer = ProducerBuilder::new()
            .config(base_config())
            .transport(transport)
            .build_async()
            .await
            .unwrap();

        assert_eq!(producer.state(), ProducerState::Running);
        assert_eq!(producer.active_shards().await.len(), 2);
        assert_eq!(producer.writer_count().await, 2);

        producer.close().await.unwrap();
        assert_eq!(producer.state(), ProducerState::Closed);
        producer.close().await.unwrap();

        let err = producer.send(Record::blob("late")).await.unwrap_err();
        assert!(matches!(err, ClientError::ProducerClosed));
    }

    #[tokio::test]
    async fn test_init_passes_through_initializing() {
        let memory = transport_with(TopicMeta::blob("p", "t", 2)).await;
        let gated = Arc::new(GatedTransport {
            inner: memory,
            open: Semaphore::new(0),
        });
        let producer = Arc::new(
            ProducerBuilder::new()
                .config(base_config())
                .transport(gated.clone())
                .create_async()
                .unwrap(),
        );

        assert_eq!(producer.state(), ProducerState::Uninitialized);
        assert!(producer.topic().is_none());
        assert!(producer.take_errors().await.is_none());
        let err = producer.send(Record::blob("early")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));

        let init = tokio::spawn({
            let producer = Arc::clone(&producer);
            async move { producer.init().await }
        });
        while producer.state() != ProducerState::Initializing {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            producer.refresh_topology().await,
            Err(ClientError::NotInitialized)
        ));

        gated.open.add_permits(1);
        init.await.unwrap().unwrap();
        assert_eq!(producer.state(), ProducerState::Running);
        assert_eq!(producer.topic().map(|t| t.shard_count), Some(2));
        assert_eq!(producer.writer_count().await, 2);

        // A second init is a no-op.
        producer.init().await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(producer.state(), ProducerState::Closed);
    }

    #[tokio::test]
    async fn test_failed_init_can_be_retried() {
        let transport = Arc::new(MemoryTransport::new());
        let producer = ProducerBuilder::new()
            .config(base_config())
            .transport(transport.clone())
            .create_async()
            .unwrap();

        assert!(matches!(producer.init().await, Err(ClientError::Transport(_))));
        assert_eq!(producer.state(), ProducerState::Uninitialized);

        transport.create_topic(TopicMeta::blob("p", "t", 1)).await;
        producer.init().await.unwrap();
        assert_eq!(producer.state(), ProducerState::Running);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_init() {
        let transport = transport_with(TopicMeta::blob("p", "t", 1)).await;
        let producer = ProducerBuilder::new()
            .config(base_config())
            .transport(transport.clone())
            .create_async()
            .unwrap();

        producer.close().await.unwrap();
        assert_eq!(producer.state(), ProducerState::Closed);
        assert!(matches!(producer.init().await, Err(ClientError::ProducerClosed)));
        assert!(matches!(
            producer.send(Record::blob("x")).await,
            Err(ClientError::ProducerClosed)
        ));
        assert_eq!(transport.get_topic_calls(), 0);
    }

    #[tokio::test]
    async fn test_keyed_records_stay_on_one_shard() {
        let transport = transport_with(TopicMeta::blob("p", "t", 4)).await;
        let producer = ProducerBuilder::new()
            .config(base_config())
            .transport(transport.clone())
            .build_async()
            .await
            .unwrap();

        for i in 0..20 {
            producer
                .send(Record::blob(format!("v{i}")).with_partition_key("same-key"))
                .await
                .unwrap();
        }
        producer.close().await.unwrap();

        let frames = transport.frames("p", "t").await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.record_count, 20);
    }

    #[tokio::test]
    async fn test_outcome_queues_taken_once() {
        let transport = transport_with(TopicMeta::blob("p", "t", 1)).await;
        let producer = ProducerBuilder::new()
            .config(base_config())
            .enable_success_ch(false)
            .transport(transport)
            .build_async()
            .await
            .unwrap();

        assert!(producer.take_successes().await.is_none());
        assert!(producer.take_errors().await.is_some());
        assert!(producer.take_errors().await.is_none());
        producer.close().await.unwrap();
    }
}
