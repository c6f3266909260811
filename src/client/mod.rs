//! Client half of the chunked upload protocol.
//!
//! `splitter` plans byte ranges, `transport` drives one file through the
//! server chunk by chunk over any `ChunkSender`, `store` holds the
//! group/file state machine, and `uploader` ties them together on tokio
//! tasks.

pub mod cancel;
pub mod http;
pub mod splitter;
pub mod store;
pub mod transport;
pub mod uploader;

use std::time::Duration;

/// Default chunk size: 3 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 3 * 1024 * 1024;

/// Default number of tries per chunk, the first one included.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// Default pause between two tries of the same chunk.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(4);

/// Bounded retry for one chunk: `attempts` tries with a fixed `delay`
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub chunk_size: u64,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}
