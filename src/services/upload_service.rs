//! UploadService: the chunk receiver.
//!
//! Validates a chunk request, spools its body, records the index in the
//! metadata store and, when the index set is complete, elects exactly one
//! request to run the assembly pipeline. Chunks that arrive for an upload
//! already assembled within the TTL are acknowledged and dropped.

use bytes::Bytes;
use futures::Stream;
use std::{io, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::chunk::{ChunkFields, ChunkUploadResponse, UploadStatusResponse};
use crate::services::{
    UploadError, UploadResult,
    assembly::AssemblyPipeline,
    chunk_spool::ChunkSpool,
    metadata_store::UploadMetadataStore,
    upload_locks::UploadLocks,
    validation::{ChunkDescriptor, UploadRules, ensure_upload_id_safe},
};

#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn UploadMetadataStore>,
    rules: Arc<UploadRules>,
    locks: UploadLocks,
    pipeline: Arc<AssemblyPipeline>,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn UploadMetadataStore>,
        rules: UploadRules,
        pipeline: AssemblyPipeline,
    ) -> Self {
        Self {
            store,
            rules: Arc::new(rules),
            locks: UploadLocks::new(),
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn store(&self) -> &Arc<dyn UploadMetadataStore> {
        &self.store
    }

    pub fn rules(&self) -> &UploadRules {
        &self.rules
    }

    pub fn pipeline(&self) -> &AssemblyPipeline {
        &self.pipeline
    }

    pub fn spool(&self) -> &ChunkSpool {
        self.pipeline.spool()
    }

    /// Check the declared fields without touching any state.
    pub fn validate(&self, fields: &ChunkFields) -> UploadResult<ChunkDescriptor> {
        self.rules.validate(fields)
    }

    /// Receive one chunk.
    ///
    /// Work for a single uploadId is serialized from the metadata lookup
    /// through assembly. Across processes sharing one store, the request that
    /// swaps the completed record for an assembled marker is the only one
    /// that assembles; the others answer `isComplete: true` without metadata,
    /// as does any later chunk for the same id while the marker lives.
    pub async fn receive_chunk<S>(
        &self,
        fields: &ChunkFields,
        body: S,
    ) -> UploadResult<ChunkUploadResponse>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let desc = self.rules.validate(fields)?;
        let upload_id = desc.upload_id.as_str();
        let _guard = self.locks.acquire(upload_id).await;

        if self.store.is_assembled(upload_id).await? {
            debug!(
                "upload {} already assembled, dropping chunk {}",
                upload_id, desc.chunk_index
            );
            return Ok(already_assembled(&desc));
        }

        let existing = self.store.get(upload_id).await?;
        match &existing {
            Some(record) => {
                if let Some(field) = record.conflicting_field(&desc.declared) {
                    return Err(UploadError::MetadataConflict {
                        upload_id: upload_id.to_string(),
                        field,
                    });
                }
            }
            // Leftovers of an expired or failed attempt under the same id.
            None => self.spool().remove_upload(upload_id).await,
        }

        let bytes = self
            .spool()
            .write_chunk(upload_id, desc.chunk_index, self.rules.max_chunk_size, body)
            .await?;

        let record = match self.store.get_or_create(upload_id, &desc.declared).await? {
            Some(record) => record,
            None => {
                // Another process assembled it while this chunk was spooling.
                self.spool().remove_upload(upload_id).await;
                return Ok(already_assembled(&desc));
            }
        };
        if let Some(field) = record.conflicting_field(&desc.declared) {
            return Err(UploadError::MetadataConflict {
                upload_id: upload_id.to_string(),
                field,
            });
        }
        if existing.is_none() {
            info!(
                "upload {} started: {} ({}, {} bytes in {} chunks)",
                upload_id,
                record.file_name,
                record.file_type,
                record.file_size,
                record.total_chunks
            );
        }

        let added = self.store.add_chunk_index(upload_id, desc.chunk_index).await?;
        debug!(
            "chunk {}/{} of {} received ({} bytes, new: {}, last flag: {})",
            desc.chunk_index + 1,
            record.total_chunks,
            upload_id,
            bytes,
            added,
            desc.is_last_chunk
        );

        let current = self
            .store
            .get(upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;

        let mut response = ChunkUploadResponse {
            is_complete: false,
            upload_id: upload_id.to_string(),
            chunk_index: desc.chunk_index,
            total_chunks: current.total_chunks,
            metadata: None,
        };
        if !current.is_complete() {
            return Ok(response);
        }

        response.is_complete = true;
        if !self.store.mark_assembled(upload_id).await? {
            debug!("upload {} is being assembled elsewhere", upload_id);
            return Ok(response);
        }

        match self.pipeline.assemble(&current).await {
            Ok(artifact) => {
                response.metadata = Some(artifact);
                Ok(response)
            }
            Err(err) => {
                self.spool().remove_upload(upload_id).await;
                // No artifact exists, so a resend may start the upload over.
                if let Err(clear) = self.store.delete(upload_id).await {
                    warn!("failed to clear assembled marker of {}: {}", upload_id, clear);
                }
                Err(err)
            }
        }
    }

    /// Current status of an in-flight upload.
    pub async fn upload_status(&self, upload_id: &str) -> UploadResult<UploadStatusResponse> {
        ensure_upload_id_safe(upload_id)?;
        self.store
            .get(upload_id)
            .await?
            .map(UploadStatusResponse::from)
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }

    /// Drop an in-flight upload: its temp chunks and its record.
    pub async fn cleanup_upload(&self, upload_id: &str) -> UploadResult<()> {
        ensure_upload_id_safe(upload_id)?;
        let _guard = self.locks.acquire(upload_id).await;

        let removed = self.store.delete(upload_id).await?;
        self.spool().remove_upload(upload_id).await;
        if !removed {
            return Err(UploadError::NotFound(upload_id.to_string()));
        }
        info!("upload {} cleaned up", upload_id);
        Ok(())
    }

    /// Evict expired records and their temp chunks, then drop expired
    /// assembled markers. Returns how many records were evicted.
    ///
    /// Each record is removed under its upload lock, and only if it is still
    /// expired once the lock is held.
    pub async fn purge_expired(&self) -> UploadResult<usize> {
        let mut evicted = 0;
        for upload_id in self.store.expired_ids().await? {
            let _guard = self.locks.acquire(&upload_id).await;
            let Some(record) = self.store.remove_expired(&upload_id).await? else {
                debug!("upload {} was refreshed before eviction", upload_id);
                continue;
            };
            self.spool().remove_upload(&upload_id).await;
            info!(
                "evicted abandoned upload {} ({}/{} chunks)",
                upload_id,
                record.uploaded_chunks.len(),
                record.total_chunks
            );
            evicted += 1;
        }

        let markers = self.store.purge_assembled().await?;
        if markers > 0 {
            debug!("dropped {} expired assembled marker(s)", markers);
        }
        Ok(evicted)
    }

    /// Run `purge_expired` every `every` until the runtime shuts down.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!("sweeper evicted {} upload(s)", n),
                    Err(err) => warn!("sweeper failed: {}", err),
                }
            }
        })
    }
}

fn already_assembled(desc: &ChunkDescriptor) -> ChunkUploadResponse {
    ChunkUploadResponse {
        is_complete: true,
        upload_id: desc.upload_id.clone(),
        chunk_index: desc.chunk_index,
        total_chunks: desc.declared.total_chunks,
        metadata: None,
    }
}
