//! Sync Producer Example
//!
//! Writes TUPLE records one call at a time and reads the frames back.
//!
//! Run with:
//! ```bash
//! cargo run --package dhub-client --example sync_producer
//! ```

use dhub_client::{MemoryTransport, ProducerBuilder, SendStrategy};
use dhub_core::{
    BatchReader, Field, FieldType, FieldValue, ReadMeta, Record, RecordSchema, SchemaItem,
    TopicMeta, TupleData,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🎯 dhub Sync Producer Example");
    println!("=============================\n");

    let schema = RecordSchema::new(vec![
        Field::new("order_id", FieldType::Bigint).not_null(),
        Field::new("customer", FieldType::String),
        Field::new("amount", FieldType::Double),
    ])?;

    println!("📦 Step 1: Creating topic 'shop/orders' with 3 shards");
    let transport = Arc::new(MemoryTransport::new());
    transport
        .create_topic(TopicMeta::tuple("shop", "orders", 3, schema.clone()))
        .await;

    println!("🚀 Step 2: Starting sync producer");
    let producer = ProducerBuilder::new()
        .endpoint("memory://")
        .project("shop")
        .topic("orders")
        .send_strategy(SendStrategy::RoundRobin)
        .transport(transport.clone())
        .build_sync()
        .await?;

    println!("📨 Step 3: Sending 3 calls of 4 orders\n");
    let schema = Arc::new(schema);
    for call in 0..3 {
        let mut records = Vec::new();
        for n in 0..4 {
            let id = call * 4 + n;
            let row = TupleData::new(Arc::clone(&schema))
                .with("order_id", FieldValue::Bigint(id))?
                .with("customer", FieldValue::String(format!("customer-{}", id % 3)))?
                .with("amount", FieldValue::Double(id as f64 * 9.99))?;
            records.push(Record::tuple(row));
        }
        let written = producer.send(records).await?;
        println!(
            "   ✅ {} records on shard {} (request {})",
            written.records.len(),
            written.shard_id,
            written.request_id
        );
    }
    producer.close();

    println!("\n📖 Step 4: Reading frames back");
    let item = SchemaItem::tuple(0, Arc::clone(&schema))?;
    for frame in transport.frames("shop", "orders").await {
        let records = BatchReader::new(frame.frame)?.read_all(&item, None, &ReadMeta::default())?;
        for record in records {
            if let Some(row) = record.as_tuple() {
                println!("   shard {}: {:?}", frame.shard_id, row.get_by_name("order_id"));
            }
        }
    }
    Ok(())
}
