//! Engine configuration types.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Default cap on concurrently running file callbacks in one traversal.
pub const DEFAULT_MAX_INFLIGHT_OPERATIONS: usize = 5;

/// Default buffer size for streamed cross-backend copies.
pub const DEFAULT_STREAM_COPY_CHUNK_SIZE: usize = 32 * 1024;

/// Configuration for the operation engine.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Maximum file-level operations in flight within one traversal.
    #[builder(default = "DEFAULT_MAX_INFLIGHT_OPERATIONS")]
    #[serde(default = "default_max_inflight")]
    pub max_inflight_operations: usize,

    /// Chunk size for streamed copies between backends.
    #[builder(default = "DEFAULT_STREAM_COPY_CHUNK_SIZE")]
    #[serde(default = "default_chunk_size")]
    pub stream_copy_chunk_size: usize,

    /// Flush every streamed copy before reporting completion.
    #[builder(default = "false")]
    #[serde(default)]
    pub flush_on_stream_copy: bool,

    /// Entries per page requested from backends that page listings.
    #[builder(default = "64")]
    #[serde(default = "default_page_size")]
    pub directory_page_size: usize,

    /// Capacity of progress channels handed out by the engine.
    #[builder(default = "100")]
    #[serde(default = "default_progress_channel_size")]
    pub progress_channel_size: usize,
}

fn default_max_inflight() -> usize {
    DEFAULT_MAX_INFLIGHT_OPERATIONS
}

fn default_chunk_size() -> usize {
    DEFAULT_STREAM_COPY_CHUNK_SIZE
}

fn default_page_size() -> usize {
    64
}

fn default_progress_channel_size() -> usize {
    100
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_inflight_operations == Some(0) {
            return Err("max_inflight_operations must be at least 1".to_string());
        }
        if self.stream_copy_chunk_size == Some(0) {
            return Err("stream_copy_chunk_size must be at least 1".to_string());
        }
        if self.directory_page_size == Some(0) {
            return Err("directory_page_size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inflight_operations: DEFAULT_MAX_INFLIGHT_OPERATIONS,
            stream_copy_chunk_size: DEFAULT_STREAM_COPY_CHUNK_SIZE,
            flush_on_stream_copy: false,
            directory_page_size: default_page_size(),
            progress_channel_size: default_progress_channel_size(),
        }
    }
}
