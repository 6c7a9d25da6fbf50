//! Producer Configuration
//!
//! [`ProducerConfig`] holds every setting shared by the async and sync
//! producers. It deserializes from JSON/TOML-style documents (durations as
//! `*_ms` integers) and is also assembled by [`crate::ProducerBuilder`].
//!
//! ## Defaults
//!
//! - **max_retry**: 3 retries after the first attempt (negative = unbounded)
//! - **retry_interval_ms**: 500
//! - **max_async_buffer_num**: 1000 records per batch
//! - **max_async_buffer_time_ms**: 1000
//! - **max_async_flighting_num**: 64 queued records/batches per stage
//! - **enable_success_ch / enable_error_ch**: true
//! - **send_strategy**: round robin
//! - **compress_type**: lz4 (batch payload codec)
//! - **request_compression**: none (HTTP body codec, transport only)
//! - **shard_refresh_interval_ms / sync_shard_refresh_interval_ms**: 30 000
//! - **schema_refresh_interval_ms**: 300 000
//!
//! ## Usage
//!
//! ```ignore
//! let config: ProducerConfig = serde_json::from_str(r#"{
//!     "endpoint": "https://dhub.example.com",
//!     "project": "analytics",
//!     "topic": "clicks",
//!     "max_async_buffer_num": 500
//! }"#)?;
//! config.validate()?;
//! ```

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{Account, TransportOptions};
use dhub_core::CompressType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the sync producer picks a shard for each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub account: Account,

    /// Service endpoint URL
    pub endpoint: String,

    pub project: String,

    pub topic: String,

    /// Retries after the first attempt; negative retries forever (default: 3)
    #[serde(default = "default_max_retry")]
    pub max_retry: i32,

    /// Wait between retries of transient failures (default: 500ms)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Records per batch before a size flush (default: 1000)
    #[serde(default = "default_max_async_buffer_num")]
    pub max_async_buffer_num: usize,

    /// Depth of every bounded queue between pipeline stages (default: 64)
    #[serde(default = "default_max_async_flighting_num")]
    pub max_async_flighting_num: usize,

    /// Longest a partial batch waits before a time flush (default: 1s)
    #[serde(default = "default_max_async_buffer_time_ms")]
    pub max_async_buffer_time_ms: u64,

    #[serde(default = "default_true")]
    pub enable_success_ch: bool,

    #[serde(default = "default_true")]
    pub enable_error_ch: bool,

    #[serde(default)]
    pub send_strategy: SendStrategy,

    /// Batch payload codec (default: lz4)
    #[serde(default = "default_compress_type")]
    pub compress_type: CompressType,

    /// HTTP request body codec, handed to the transport (default: none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_compression: Option<CompressType>,

    /// Async producer topology refresh period, before jitter (default: 30s).
    /// A topic-level list-shard interval takes precedence. Zero disables it.
    #[serde(default = "default_shard_refresh_interval_ms")]
    pub shard_refresh_interval_ms: u64,

    /// Sync producer topology refresh period (default: 30s). Zero disables it.
    #[serde(default = "default_shard_refresh_interval_ms")]
    pub sync_shard_refresh_interval_ms: u64,

    /// Minimum age of the schema cache before an unforced refresh (default: 5min)
    #[serde(default = "default_schema_refresh_interval_ms")]
    pub schema_refresh_interval_ms: u64,
}

fn default_max_retry() -> i32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn default_max_async_buffer_num() -> usize {
    1000
}

fn default_max_async_flighting_num() -> usize {
    64
}

fn default_max_async_buffer_time_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_compress_type() -> CompressType {
    CompressType::Lz4
}

fn default_shard_refresh_interval_ms() -> u64 {
    30_000
}

fn default_schema_refresh_interval_ms() -> u64 {
    5 * 60 * 1000
}

impl ProducerConfig {
    /// Configuration with every optional field at its default.
    pub fn new(
        endpoint: impl Into<String>,
        project: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            account: Account::default(),
            endpoint: endpoint.into(),
            project: project.into(),
            topic: topic.into(),
            max_retry: default_max_retry(),
            retry_interval_ms: default_retry_interval_ms(),
            max_async_buffer_num: default_max_async_buffer_num(),
            max_async_flighting_num: default_max_async_flighting_num(),
            max_async_buffer_time_ms: default_max_async_buffer_time_ms(),
            enable_success_ch: true,
            enable_error_ch: true,
            send_strategy: SendStrategy::default(),
            compress_type: default_compress_type(),
            request_compression: None,
            shard_refresh_interval_ms: default_shard_refresh_interval_ms(),
            sync_shard_refresh_interval_ms: default_shard_refresh_interval_ms(),
            schema_refresh_interval_ms: default_schema_refresh_interval_ms(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ClientError::ConfigError("endpoint is required".to_string()));
        }
        if self.project.trim().is_empty() {
            return Err(ClientError::ConfigError("project is required".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(ClientError::ConfigError("topic is required".to_string()));
        }
        if self.max_async_buffer_num == 0 {
            return Err(ClientError::ConfigError(
                "max_async_buffer_num must be positive".to_string(),
            ));
        }
        if self.max_async_flighting_num == 0 {
            return Err(ClientError::ConfigError(
                "max_async_flighting_num must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_async_buffer_time(&self) -> Duration {
        Duration::from_millis(self.max_async_buffer_time_ms)
    }

    pub fn shard_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.shard_refresh_interval_ms)
    }

    pub fn sync_shard_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.sync_shard_refresh_interval_ms)
    }

    pub fn schema_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.schema_refresh_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry, self.retry_interval())
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            endpoint: self.endpoint.clone(),
            account: self.account.clone(),
            request_compression: self.request_compression,
        }
    }
}
