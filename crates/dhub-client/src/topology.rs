//! Shard topology helpers shared by both producers.

use crate::error::Result;
use crate::retry::jittered;
use crate::transport::Transport;
use dhub_core::{Shard, TopicMeta};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Jitter applied to the async producer's refresh period.
pub const REFRESH_JITTER: f64 = 0.2;

/// The ACTIVE shards of a topic, sorted by numeric id.
pub async fn fetch_active_shards(
    transport: &dyn Transport,
    project: &str,
    topic: &str,
) -> Result<Vec<Shard>> {
    let mut shards: Vec<Shard> = transport
        .list_shard(project, topic)
        .await?
        .into_iter()
        .filter(Shard::is_active)
        .collect();
    shards.sort_by_key(Shard::numeric_id);
    Ok(shards)
}

/// Refresh period for the async producer: the topic's own list-shard interval
/// when it reports one, else the configured default. Zero means disabled.
pub fn refresh_interval(topic: &TopicMeta, configured: Duration) -> Duration {
    topic
        .extra
        .list_shard_interval
        .filter(|interval| !interval.is_zero())
        .unwrap_or(configured)
}

/// Next wait of the refresh loop, jittered by ±20%.
pub fn next_refresh_delay(base: Duration) -> Duration {
    jittered(base, REFRESH_JITTER)
}

/// Poll until every shard of the topic is ACTIVE or CLOSED.
///
/// Returns `false` if `timeout` passes first. Listing errors are logged and
/// polled through.
pub async fn wait_shards_ready(
    transport: &dyn Transport,
    project: &str,
    topic: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        match transport.list_shard(project, topic).await {
            Ok(shards) if shards.iter().all(|s| s.state.is_settled()) => {
                debug!(project, topic, shard_count = shards.len(), "Shards ready");
                return true;
            }
            Ok(shards) => {
                let pending = shards.iter().filter(|s| !s.state.is_settled()).count();
                debug!(project, topic, pending, "Waiting for shards to settle");
            }
            Err(e) => warn!(project, topic, error = %e, "Listing shards failed"),
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(poll_interval.min(deadline - now)).await;
    }
}
