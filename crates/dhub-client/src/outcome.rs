//! Per-batch results of asynchronous sends.
//!
//! Every record accepted by the async producer ends up in exactly one
//! [`ProduceSuccess`] or [`ProduceError`], delivered on unbounded queues so a
//! caller that never reads them cannot stall shutdown. Either kind can be
//! switched off in the configuration; disabled outcomes are dropped.

use crate::error::ClientError;
use dhub_core::Record;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A batch written to a shard.
#[derive(Debug)]
pub struct ProduceSuccess {
    pub shard_id: String,
    pub records: Vec<Record>,
    /// Time spent in the write, retries included.
    pub latency: Duration,
    pub request_id: String,
}

/// A batch that could not be written.
#[derive(Debug)]
pub struct ProduceError {
    /// Shard the batch was last routed to, empty if it never got one.
    pub shard_id: String,
    pub records: Vec<Record>,
    pub error: ClientError,
}

pub type SuccessReceiver = mpsc::UnboundedReceiver<ProduceSuccess>;
pub type ErrorReceiver = mpsc::UnboundedReceiver<ProduceError>;

/// Sending half of the outcome queues, shared by every writer.
#[derive(Debug, Clone)]
pub struct OutcomeSink {
    successes: Option<mpsc::UnboundedSender<ProduceSuccess>>,
    errors: Option<mpsc::UnboundedSender<ProduceError>>,
}

impl OutcomeSink {
    /// Create the sink and its receivers. A disabled kind gets no queue.
    pub fn new(
        enable_success: bool,
        enable_error: bool,
    ) -> (Self, Option<SuccessReceiver>, Option<ErrorReceiver>) {
        let (success_tx, success_rx) = if enable_success {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (error_tx, error_rx) = if enable_error {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        (
            Self {
                successes: success_tx,
                errors: error_tx,
            },
            success_rx,
            error_rx,
        )
    }

    pub fn success(&self, outcome: ProduceSuccess) {
        match &self.successes {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Success receiver dropped");
                }
            }
            None => debug!(
                shard_id = %outcome.shard_id,
                record_count = outcome.records.len(),
                "Batch written"
            ),
        }
    }

    pub fn error(&self, outcome: ProduceError) {
        match &self.errors {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Error receiver dropped");
                }
            }
            None => error!(
                shard_id = %outcome.shard_id,
                record_count = outcome.records.len(),
                error = %outcome.error,
                "Batch failed"
            ),
        }
    }

    /// Report `records` as failed with `error`.
    pub fn fail(&self, shard_id: impl Into<String>, records: Vec<Record>, error: ClientError) {
        self.error(ProduceError {
            shard_id: shard_id.into(),
            records,
            error,
        });
    }
}
