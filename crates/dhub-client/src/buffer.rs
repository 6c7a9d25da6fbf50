//! Buffer Helper: Generic Micro-Batcher
//!
//! [`BufferHelper`] accumulates submitted items into batches and hands each
//! completed batch to a bounded output queue. One background task owns the
//! pending batch, so submitters never contend on it.
//!
//! ## Architecture
//!
//! ```text
//! submit(item) ──────┐
//!                    ▼
//!            ┌───────────────┐   count == buffer_num    ┌──────────────┐
//!            │ pending batch │ ───────────────────────► │ output queue │ ──► consumer
//!            └───────────────┘   buffer_time elapsed     │  (bounded)   │
//!                    ▲                                   └──────────────┘
//! submit_batch(v) ───┴── forwarded as one unit ─────────────────▲
//! ```
//!
//! ## Flush Triggers
//!
//! - **Size**: the batch reaches `buffer_num` items
//! - **Time**: `buffer_time` has passed since the first item entered an empty
//!   batch. The timer only starts on that transition and is discarded by a size
//!   flush.
//! - **Close**: the partial remainder is flushed before the output closes
//!
//! A full output queue blocks the worker, which in turn blocks submitters once
//! the input queue fills. Accepted items are never dropped.

use crate::error::Closed;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

enum Command<T> {
    Item(T),
    Batch(Vec<T>),
}

/// Items collected since the last flush.
struct PendingBatch<T> {
    items: Vec<T>,
    capacity: usize,
    deadline: Option<Instant>,
    linger: Duration,
}

impl<T> PendingBatch<T> {
    fn new(capacity: usize, linger: Duration) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            deadline: None,
            linger,
        }
    }

    fn append(&mut self, item: T) {
        if self.items.is_empty() {
            self.deadline = Some(Instant::now() + self.linger);
        }
        self.items.push(item);
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn drain(&mut self) -> Vec<T> {
        self.deadline = None;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.capacity))
    }
}

/// Size- and time-bounded batcher feeding a bounded output queue.
pub struct BufferHelper<T> {
    input: RwLock<Option<mpsc::Sender<Command<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BufferHelper<T> {
    /// Create the helper and return the receiver of completed batches.
    ///
    /// `buffer_num` of zero is treated as one. `output_depth` bounds both the
    /// input and output queues.
    pub fn new(
        buffer_num: usize,
        buffer_time: Duration,
        output_depth: usize,
    ) -> (Self, mpsc::Receiver<Vec<T>>) {
        let depth = output_depth.max(1);
        let (input_tx, input_rx) = mpsc::channel(depth);
        let (output_tx, output_rx) = mpsc::channel(depth);

        let pending = PendingBatch::new(buffer_num.max(1), buffer_time);
        let worker = tokio::spawn(Self::run(input_rx, output_tx, pending));

        (
            Self {
                input: RwLock::new(Some(input_tx)),
                worker: Mutex::new(Some(worker)),
            },
            output_rx,
        )
    }

    /// Add one item to the pending batch. Waits while the input queue is full.
    pub async fn submit(&self, item: T) -> Result<(), Closed<T>> {
        let input = self.input.read().await;
        let Some(tx) = input.as_ref() else {
            return Err(Closed(item));
        };
        if let Err(mpsc::error::SendError(Command::Item(item))) =
            tx.send(Command::Item(item)).await
        {
            return Err(Closed(item));
        }
        Ok(())
    }

    /// Forward an already-formed batch to the output as one unit. Empty
    /// batches are ignored.
    pub async fn submit_batch(&self, batch: Vec<T>) -> Result<(), Closed<Vec<T>>> {
        if batch.is_empty() {
            return Ok(());
        }
        let input = self.input.read().await;
        let Some(tx) = input.as_ref() else {
            return Err(Closed(batch));
        };
        if let Err(mpsc::error::SendError(Command::Batch(batch))) =
            tx.send(Command::Batch(batch)).await
        {
            return Err(Closed(batch));
        }
        Ok(())
    }

    /// Flush the remainder, stop the worker and close the output queue.
    ///
    /// Later submissions fail with the item handed back. Calling `close` again
    /// is a no-op.
    pub async fn close(&self) {
        // Waits for in-progress submits to finish before dropping the sender.
        drop(self.input.write().await.take());

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Buffer worker ended abnormally");
            }
        }
    }

    async fn run(
        mut input: mpsc::Receiver<Command<T>>,
        output: mpsc::Sender<Vec<T>>,
        mut pending: PendingBatch<T>,
    ) {
        loop {
            let command = match pending.deadline {
                Some(deadline) => tokio::select! {
                    command = input.recv() => command,
                    _ = sleep_until(deadline) => {
                        let batch = pending.drain();
                        debug!(batch_size = batch.len(), "Flushing batch on timeout");
                        if output.send(batch).await.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                None => input.recv().await,
            };

            let Some(command) = command else {
                break;
            };

            match command {
                Command::Item(item) => {
                    pending.append(item);
                    if pending.is_full() && output.send(pending.drain()).await.is_err() {
                        break;
                    }
                }
                Command::Batch(batch) => {
                    if output.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        }

        if !pending.items.is_empty() {
            let batch = pending.drain();
            debug!(batch_size = batch.len(), "Flushing remainder on close");
            if output.send(batch).await.is_err() {
                warn!("Buffer output closed, remainder dropped");
            }
        }
    }
}
