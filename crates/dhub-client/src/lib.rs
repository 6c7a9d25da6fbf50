//! dhub Client - Async and Sync Producers
//!
//! This crate writes records to topics of the dhub partitioned stream service.
//! It routes records to shards, batches them, encodes each batch once with the
//! [`dhub_core`] codec, and retries or reroutes failed writes.
//!
//! All service calls go through the [`Transport`] trait. [`MemoryTransport`]
//! implements it in process memory for tests and demos.
//!
//! # Examples
//!
//! ## Async Producer
//!
//! ```ignore
//! use dhub_client::{AsyncProducer, ProducerConfig};
//! use dhub_core::Record;
//!
//! let producer = AsyncProducer::builder()
//!     .config(ProducerConfig::new(endpoint, "analytics", "clicks"))
//!     .transport(transport)
//!     .build_async()
//!     .await?;
//!
//! producer.send(Record::blob("click").with_partition_key("user123")).await?;
//! producer.close().await?;
//! ```
//!
//! ## Sync Producer
//!
//! ```ignore
//! use dhub_client::ProducerBuilder;
//!
//! let producer = ProducerBuilder::new()
//!     .endpoint(endpoint)
//!     .project("analytics")
//!     .topic("clicks")
//!     .transport(transport)
//!     .build_sync()
//!     .await?;
//!
//! let written = producer.send(vec![Record::blob("a"), Record::blob("b")]).await?;
//! println!("{} records on shard {}", written.records.len(), written.shard_id);
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod outcome;
pub mod partition;
pub mod producer;
pub mod retry;
pub mod schema_cache;
pub mod shard_writer;
pub mod single_flight;
pub mod sync_producer;
pub mod topology;
pub mod transport;

pub use buffer::BufferHelper;
pub use config::{ProducerConfig, SendStrategy};
pub use error::{ClientError, ErrorClass, Result, TransportError, TransportErrorKind};
pub use memory::MemoryTransport;
pub use outcome::{ErrorReceiver, ProduceError, ProduceSuccess, SuccessReceiver};
pub use partition::{DefaultPartitioner, Partitioner};
pub use producer::{AsyncProducer, ProducerBuilder, ProducerState};
pub use retry::{send_with_retry, RetryPolicy};
pub use schema_cache::{SchemaRegistry, TopicSchemaCache};
pub use sync_producer::SyncProducer;
pub use topology::wait_shards_ready;
pub use transport::{Account, PutResult, SchemaEntry, SharedTransport, Transport, TransportOptions};
