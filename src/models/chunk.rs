//! Wire types for the chunk upload endpoints, shared by the server handlers
//! and the client transport.

use serde::{Deserialize, Serialize};

use crate::models::artifact::ArtifactMetadata;
use crate::models::upload::ChunkUploadMetadata;

/// Name of the multipart field carrying the chunk bytes.
pub const CHUNK_FIELD: &str = "chunk";

/// Declared fields of a chunk request, as received.
///
/// Everything is optional here; `services::validation` turns this into a
/// validated `ChunkDescriptor` or a validation error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkFields {
    pub chunk_index: Option<String>,
    pub total_chunks: Option<String>,
    pub upload_id: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<String>,
    pub is_last_chunk: Option<String>,
}

impl ChunkFields {
    /// Store a multipart text field by name. Unknown names are ignored.
    pub fn set(&mut self, name: &str, value: String) {
        match name {
            "chunkIndex" => self.chunk_index = Some(value),
            "totalChunks" => self.total_chunks = Some(value),
            "uploadId" => self.upload_id = Some(value),
            "fileName" => self.file_name = Some(value),
            "fileType" => self.file_type = Some(value),
            "fileSize" => self.file_size = Some(value),
            "isLastChunk" | "lastChunk" => self.is_last_chunk = Some(value),
            _ => {}
        }
    }
}

/// Response to `POST /media/chunk`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub is_complete: bool,
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
}

/// Response to `GET /media/status`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: Vec<u32>,
    pub progress: u8,
}

impl UploadStatusResponse {
    /// First chunk index the server has not recorded yet.
    pub fn next_missing_chunk(&self) -> u32 {
        let mut expected = 0;
        for index in &self.uploaded_chunks {
            if *index != expected {
                break;
            }
            expected += 1;
        }
        expected
    }
}

impl From<ChunkUploadMetadata> for UploadStatusResponse {
    fn from(meta: ChunkUploadMetadata) -> Self {
        let progress = meta.progress();
        Self {
            upload_id: meta.upload_id,
            file_name: meta.file_name,
            file_type: meta.file_type,
            file_size: meta.file_size,
            total_chunks: meta.total_chunks,
            uploaded_chunks: meta.uploaded_chunks.into_iter().collect(),
            progress,
        }
    }
}

/// Query string of the status and cleanup endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIdQuery {
    pub upload_id: Option<String>,
}
