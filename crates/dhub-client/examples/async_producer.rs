//! Async Producer Example
//!
//! Sends keyed and unkeyed records through the buffered producer, splits a
//! shard halfway through, and prints the per-batch outcomes.
//!
//! Run with:
//! ```bash
//! RUST_LOG=dhub_client=debug cargo run --package dhub-client --example async_producer
//! ```

use dhub_client::{AsyncProducer, MemoryTransport, ProducerConfig};
use dhub_core::{Record, TopicMeta};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("\n🎯 dhub Async Producer Example");
    println!("==============================\n");

    // Step 1: In-memory service with one topic
    println!("📦 Step 1: Creating topic 'demo/clicks' with 2 shards");
    let transport = Arc::new(MemoryTransport::new());
    transport.create_topic(TopicMeta::blob("demo", "clicks", 2)).await;

    // Step 2: Producer
    println!("🚀 Step 2: Starting async producer");
    let mut config = ProducerConfig::new("memory://", "demo", "clicks");
    config.max_async_buffer_num = 100;
    config.max_async_buffer_time_ms = 200;
    config.shard_refresh_interval_ms = 1_000;

    let producer = AsyncProducer::builder()
        .config(config)
        .transport(transport.clone())
        .build_async()
        .await?;
    let mut successes = producer.take_successes().await.ok_or("success queue disabled")?;
    let mut errors = producer.take_errors().await.ok_or("error queue disabled")?;

    // Step 3: Records, with a split in the middle
    println!("📨 Step 3: Sending 1000 records");
    for i in 0..1000 {
        let record = if i % 2 == 0 {
            Record::blob(format!("click-{i}")).with_partition_key(format!("user-{}", i % 10))
        } else {
            Record::blob(format!("click-{i}"))
        };
        producer.send(record).await?;

        if i == 500 {
            let (left, right) = transport.split_shard("demo", "clicks", "0", None).await?;
            println!("   ✂️  Split shard 0 into {left} and {right}");
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    producer.close().await?;

    // Step 4: Outcomes
    println!("\n📊 Step 4: Outcomes");
    let mut written = 0;
    while let Some(success) = successes.recv().await {
        written += success.records.len();
        println!(
            "   ✅ {:>4} records on shard {:<2} ({:?})",
            success.records.len(),
            success.shard_id,
            success.latency
        );
    }
    while let Some(failed) = errors.recv().await {
        println!("   ❌ {} records failed: {}", failed.records.len(), failed.error);
    }

    println!("\n   Written: {written}");
    println!("   Stored:  {}", transport.record_count("demo", "clicks").await);
    Ok(())
}
