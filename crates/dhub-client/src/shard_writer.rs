//! Shard Writer
//!
//! One writer per shard. It owns a [`BufferHelper`] that groups records into
//! batches and a worker task that encodes and sends each batch.
//!
//! ## Batch Flow
//!
//! ```text
//!   submit(record) ──► BufferHelper ──► worker
//!                                         │ split into schema runs
//!                                         │ resolve version + encode once
//!                                         ▼
//!                               send_with_retry(put_records_by_shard)
//!                                         │
//!           ┌─────────────────────────────┼──────────────────────────┐
//!           ▼                             ▼                          ▼
//!     ProduceSuccess                shard sealed                any other failure
//!                           run pushed to the retry queue      ProduceError
//!                           (ProducerClosed if it is shut)
//! ```
//!
//! A batch mixing schemas goes out as one frame per run of consecutive records
//! sharing a schema, since a frame carries a single schema version.

use crate::buffer::BufferHelper;
use crate::error::{ClientError, Closed, TransportError};
use crate::outcome::{OutcomeSink, ProduceSuccess};
use crate::retry::{send_with_retry, RetryPolicy};
use crate::schema_cache::TopicSchemaCache;
use crate::transport::{PutResult, SharedTransport, Transport};
use bytes::Bytes;
use dhub_core::{BatchEncoder, Record};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Records handed back by a writer whose shard was sealed.
#[derive(Debug)]
pub struct SealedBatch {
    pub shard_id: String,
    pub records: Vec<Record>,
}

pub type RetrySender = mpsc::UnboundedSender<SealedBatch>;
pub type RetryReceiver = mpsc::UnboundedReceiver<SealedBatch>;

/// Everything a writer needs besides its own shard id. Shared by all writers
/// of one producer.
pub struct WriterContext {
    pub transport: SharedTransport,
    pub project: String,
    pub topic: String,
    pub schemas: Arc<TopicSchemaCache>,
    pub encoder: BatchEncoder,
    pub policy: RetryPolicy,
    pub outcomes: OutcomeSink,
    pub retry_tx: RetrySender,
}

/// Buffered writer for one shard.
pub struct ShardWriter {
    shard_id: String,
    buffer: BufferHelper<Record>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ShardWriter {
    pub fn spawn(
        shard_id: impl Into<String>,
        context: Arc<WriterContext>,
        buffer_num: usize,
        buffer_time: Duration,
        depth: usize,
    ) -> Self {
        let shard_id = shard_id.into();
        let (buffer, batches) = BufferHelper::new(buffer_num, buffer_time, depth);
        let worker = tokio::spawn(Self::run(shard_id.clone(), context, batches));

        debug!(shard_id = %shard_id, buffer_num, "Shard writer started");
        Self {
            shard_id,
            buffer,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub async fn submit(&self, record: Record) -> Result<(), Closed<Record>> {
        self.buffer.submit(record).await
    }

    /// Queue an already-formed batch without re-batching it.
    pub async fn submit_batch(&self, records: Vec<Record>) -> Result<(), Closed<Vec<Record>>> {
        self.buffer.submit_batch(records).await
    }

    /// Flush the buffer and wait for every queued batch to be written.
    pub async fn close(&self) {
        self.buffer.close().await;
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(shard_id = %self.shard_id, error = %e, "Shard writer ended abnormally");
            }
        }
        debug!(shard_id = %self.shard_id, "Shard writer closed");
    }

    async fn run(
        shard_id: String,
        context: Arc<WriterContext>,
        mut batches: mpsc::Receiver<Vec<Record>>,
    ) {
        while let Some(batch) = batches.recv().await {
            for run in split_schema_runs(batch) {
                write_run(&context, &shard_id, run).await;
            }
        }
    }
}

/// Encode and send one single-schema run, reporting its outcome.
async fn write_run(context: &WriterContext, shard_id: &str, records: Vec<Record>) {
    let Some(first) = records.first() else {
        return;
    };

    let frame = match context.schemas.resolve_version(first).await {
        Ok(item) => context
            .encoder
            .encode(&records, &item)
            .map_err(ClientError::from),
        Err(e) => Err(e),
    };
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            warn!(shard_id, record_count = records.len(), error = %e, "Batch encoding failed");
            context.outcomes.fail(shard_id, records, e);
            return;
        }
    };

    let started = Instant::now();
    let result = put_frame(
        context.transport.as_ref(),
        &context.project,
        &context.topic,
        shard_id,
        &context.policy,
        frame,
        records.len() as u32,
    )
    .await;

    match result {
        Ok(put) => {
            debug!(
                shard_id,
                record_count = records.len(),
                request_id = %put.request_id,
                "Batch written"
            );
            context.outcomes.success(ProduceSuccess {
                shard_id: shard_id.to_string(),
                records,
                latency: started.elapsed(),
                request_id: put.request_id,
            });
        }
        Err(e) if e.is_shard_sealed() => {
            debug!(shard_id, record_count = records.len(), "Shard sealed, resubmitting batch");
            let sealed = SealedBatch {
                shard_id: shard_id.to_string(),
                records,
            };
            if let Err(mpsc::error::SendError(sealed)) = context.retry_tx.send(sealed) {
                context
                    .outcomes
                    .fail(sealed.shard_id, sealed.records, ClientError::ProducerClosed);
            }
        }
        Err(e) => context.outcomes.fail(shard_id, records, e.into()),
    }
}

/// Send one encoded frame with the retry policy applied.
pub async fn put_frame(
    transport: &dyn Transport,
    project: &str,
    topic: &str,
    shard_id: &str,
    policy: &RetryPolicy,
    frame: Bytes,
    record_count: u32,
) -> Result<PutResult, TransportError> {
    send_with_retry(policy, move || {
        transport.put_records_by_shard(project, topic, shard_id, frame.clone(), record_count)
    })
    .await
}

/// Split a batch into runs of consecutive records that share a schema.
pub fn split_schema_runs(records: Vec<Record>) -> Vec<Vec<Record>> {
    let mut runs: Vec<Vec<Record>> = Vec::new();
    let mut current_key = None;

    for record in records {
        let key = record.schema().map(|s| s.structural_hash());
        if current_key == Some(key) {
            if let Some(run) = runs.last_mut() {
                run.push(record);
                continue;
            }
        }
        current_key = Some(key);
        runs.push(vec![record]);
    }
    runs
}
