//! The keyed metadata store the chunk receiver depends on.
//!
//! Any key-value service with an atomic set-add and a conditional delete can
//! back it. Records expire after `ttl` without a recorded chunk.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::models::upload::{ChunkUploadMetadata, DeclaredUpload};
use crate::services::UploadResult;

/// Default inactivity window before an abandoned upload is evicted.
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

#[async_trait]
pub trait UploadMetadataStore: Send + Sync {
    /// Fetch a live record. Expired records are reported as absent.
    async fn get(&self, upload_id: &str) -> UploadResult<Option<ChunkUploadMetadata>>;

    /// Fetch the live record or create one from `declared`.
    ///
    /// An expired record under the same id is replaced. Returns `None`, and
    /// creates nothing, while the id carries an assembled marker.
    async fn get_or_create(
        &self,
        upload_id: &str,
        declared: &DeclaredUpload,
    ) -> UploadResult<Option<ChunkUploadMetadata>>;

    /// Record a chunk index. Returns `true` only if it was not recorded yet;
    /// re-adding an index is a no-op.
    async fn add_chunk_index(&self, upload_id: &str, chunk_index: u32) -> UploadResult<bool>;

    /// Swap a live record for an assembled marker in one step. Returns `true`
    /// only for the caller that retired the record.
    ///
    /// The marker expires after the same `ttl` as records.
    async fn mark_assembled(&self, upload_id: &str) -> UploadResult<bool>;

    /// Whether the id carries an unexpired assembled marker.
    async fn is_assembled(&self, upload_id: &str) -> UploadResult<bool>;

    /// Remove a record and any assembled marker. Returns `true` if either
    /// existed.
    async fn delete(&self, upload_id: &str) -> UploadResult<bool>;

    /// Ids of records past their TTL, oldest first.
    async fn expired_ids(&self) -> UploadResult<Vec<String>>;

    /// Remove and return the record if it is still expired.
    async fn remove_expired(&self, upload_id: &str) -> UploadResult<Option<ChunkUploadMetadata>>;

    /// Drop expired assembled markers. Returns how many were dropped.
    async fn purge_assembled(&self) -> UploadResult<usize>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> UploadResult<()> {
        Ok(())
    }
}

pub(crate) fn ttl_from_secs(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

fn is_stale(at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    at.checked_add_signed(ttl)
        .is_some_and(|deadline| deadline < now)
}

fn is_expired(meta: &ChunkUploadMetadata, ttl: Duration, now: DateTime<Utc>) -> bool {
    is_stale(meta.updated_at, ttl, now)
}

#[derive(Debug, Default)]
struct Records {
    live: HashMap<String, ChunkUploadMetadata>,
    /// Assembled uploadIds and when they were assembled.
    assembled: HashMap<String, DateTime<Utc>>,
}

impl Records {
    fn assembled_since(&self, upload_id: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.assembled
            .get(upload_id)
            .is_some_and(|at| !is_stale(*at, ttl, now))
    }
}

/// In-process store; records live as long as the process.
#[derive(Debug)]
pub struct MemoryMetadataStore {
    records: Mutex<Records>,
    ttl: Duration,
}

impl MemoryMetadataStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            ttl: ttl_from_secs(ttl_secs),
        }
    }

    /// Number of records currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.records.lock().await.live.len()
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, upload_id: &str, by: Duration) {
        let mut records = self.records.lock().await;
        if let Some(meta) = records.live.get_mut(upload_id) {
            meta.updated_at = meta.updated_at - by;
            meta.created_at = meta.created_at - by;
        }
        if let Some(at) = records.assembled.get_mut(upload_id) {
            *at = *at - by;
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_SECS)
    }
}

#[async_trait]
impl UploadMetadataStore for MemoryMetadataStore {
    async fn get(&self, upload_id: &str) -> UploadResult<Option<ChunkUploadMetadata>> {
        let records = self.records.lock().await;
        let now = Utc::now();
        Ok(records
            .live
            .get(upload_id)
            .filter(|meta| !is_expired(meta, self.ttl, now))
            .cloned())
    }

    async fn get_or_create(
        &self,
        upload_id: &str,
        declared: &DeclaredUpload,
    ) -> UploadResult<Option<ChunkUploadMetadata>> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        if records.assembled_since(upload_id, self.ttl, now) {
            return Ok(None);
        }
        if let Some(existing) = records.live.get(upload_id) {
            if !is_expired(existing, self.ttl, now) {
                return Ok(Some(existing.clone()));
            }
        }
        let meta = ChunkUploadMetadata::new(upload_id, declared, now);
        records.live.insert(upload_id.to_string(), meta.clone());
        Ok(Some(meta))
    }

    async fn add_chunk_index(&self, upload_id: &str, chunk_index: u32) -> UploadResult<bool> {
        let mut records = self.records.lock().await;
        match records.live.get_mut(upload_id) {
            Some(meta) => {
                meta.updated_at = Utc::now();
                Ok(meta.uploaded_chunks.insert(chunk_index))
            }
            None => Ok(false),
        }
    }

    async fn mark_assembled(&self, upload_id: &str) -> UploadResult<bool> {
        let mut records = self.records.lock().await;
        if records.live.remove(upload_id).is_none() {
            return Ok(false);
        }
        records.assembled.insert(upload_id.to_string(), Utc::now());
        Ok(true)
    }

    async fn is_assembled(&self, upload_id: &str) -> UploadResult<bool> {
        let records = self.records.lock().await;
        Ok(records.assembled_since(upload_id, self.ttl, Utc::now()))
    }

    async fn delete(&self, upload_id: &str) -> UploadResult<bool> {
        let mut records = self.records.lock().await;
        let live = records.live.remove(upload_id).is_some();
        let marker = records.assembled.remove(upload_id).is_some();
        Ok(live || marker)
    }

    async fn expired_ids(&self) -> UploadResult<Vec<String>> {
        let records = self.records.lock().await;
        let now = Utc::now();
        let mut expired: Vec<&ChunkUploadMetadata> = records
            .live
            .values()
            .filter(|meta| is_expired(meta, self.ttl, now))
            .collect();
        expired.sort_by_key(|meta| meta.updated_at);
        Ok(expired.into_iter().map(|meta| meta.upload_id.clone()).collect())
    }

    async fn remove_expired(&self, upload_id: &str) -> UploadResult<Option<ChunkUploadMetadata>> {
        let mut records = self.records.lock().await;
        let still_expired = records
            .live
            .get(upload_id)
            .is_some_and(|meta| is_expired(meta, self.ttl, Utc::now()));
        if !still_expired {
            return Ok(None);
        }
        Ok(records.live.remove(upload_id))
    }

    async fn purge_assembled(&self) -> UploadResult<usize> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        let before = records.assembled.len();
        records.assembled.retain(|_, at| !is_stale(*at, self.ttl, now));
        Ok(before - records.assembled.len())
    }
}
