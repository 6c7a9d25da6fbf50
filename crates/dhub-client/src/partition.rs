//! Record-to-Shard Routing
//!
//! The partition function decides, per record, which shard the async producer
//! sends it to:
//!
//! 1. An explicit `shard_id` always wins.
//! 2. ONLY_EXTEND topics with a partition key: `crc32(key) % active_count`,
//!    over the active shards sorted by numeric id.
//! 3. SPLIT_MERGE topics with a hash key or partition key: the shard with the
//!    greatest BeginHashKey not above the key's 128-bit hash (uppercase hex
//!    MD5 of the partition key, or the record's explicit hash key), falling
//!    back to the first shard.
//! 4. Otherwise the empty string: the record is load-balanced across shards.
//!
//! Same key, same shard set, same answer: routing is deterministic until the
//! topology changes.

use dhub_core::{ExpandMode, Record, Shard, TopicMeta};
use md5::{Digest, Md5};

/// Routing policy used by the async producer. Replace it through
/// [`crate::ProducerBuilder::partitioner`].
pub trait Partitioner: Send + Sync {
    /// Shard id for `record`, or an empty string to load-balance it.
    fn partition(&self, topic: &TopicMeta, active_shards: &[Shard], record: &Record) -> String;
}

/// The built-in routing rules described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitioner;

impl Partitioner for DefaultPartitioner {
    fn partition(&self, topic: &TopicMeta, active_shards: &[Shard], record: &Record) -> String {
        if let Some(shard_id) = record.shard_id.as_deref().filter(|s| !s.is_empty()) {
            return shard_id.to_string();
        }
        if active_shards.is_empty() {
            return String::new();
        }

        match topic.expand_mode {
            ExpandMode::OnlyExtend => record
                .partition_key
                .as_deref()
                .map(|key| extend_mode_shard(key, active_shards))
                .unwrap_or_default(),
            ExpandMode::SplitMerge => {
                let hash_key = match (&record.hash_key, &record.partition_key) {
                    (Some(hash), _) if !hash.is_empty() => hash.to_ascii_uppercase(),
                    (_, Some(key)) => hash_key_for(key),
                    _ => return String::new(),
                };
                range_mode_shard(&hash_key, active_shards)
            }
        }
    }
}

/// Uppercase hex MD5 of `partition_key`: its position in the 128-bit hash space.
pub fn hash_key_for(partition_key: &str) -> String {
    hex::encode_upper(Md5::digest(partition_key.as_bytes()))
}

/// `crc32(key) % count` over shards ordered by numeric id.
pub fn extend_mode_shard(partition_key: &str, shards: &[Shard]) -> String {
    if shards.is_empty() {
        return String::new();
    }
    let mut ordered: Vec<&Shard> = shards.iter().collect();
    ordered.sort_by_key(|s| s.numeric_id());

    let index = crc32fast::hash(partition_key.as_bytes()) as usize % ordered.len();
    ordered[index].shard_id.clone()
}

/// Shard with the greatest BeginHashKey `<= hash_key`, else the first shard.
///
/// Hash keys are fixed-width uppercase hex, so string order is numeric order.
pub fn range_mode_shard(hash_key: &str, shards: &[Shard]) -> String {
    let mut ordered: Vec<&Shard> = shards.iter().collect();
    ordered.sort_by(|a, b| a.begin_hash_key.cmp(&b.begin_hash_key));

    ordered
        .iter()
        .rev()
        .find(|s| s.begin_hash_key.as_str() <= hash_key)
        .or_else(|| ordered.first())
        .map(|s| s.shard_id.clone())
        .unwrap_or_default()
}
