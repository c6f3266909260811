//! Server-side record of an in-flight chunked upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;

/// The immutable description of a file, as declared by the first chunk of an upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredUpload {
    /// Original file name as sent by the client.
    pub file_name: String,

    /// Declared MIME type.
    pub file_type: String,

    /// Declared total size in bytes.
    pub file_size: u64,

    /// Number of chunks the client split the file into.
    pub total_chunks: u32,
}

/// Tracking record for one uploadId.
///
/// `file_name`, `file_type` and `total_chunks` never change for the lifetime of
/// the record; `uploaded_chunks` only grows until the record is deleted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadMetadata {
    pub upload_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,

    /// Chunk indices recorded so far, ascending.
    pub uploaded_chunks: BTreeSet<u32>,

    /// When the first chunk arrived.
    pub created_at: DateTime<Utc>,

    /// Last time a chunk was recorded; drives TTL eviction.
    pub updated_at: DateTime<Utc>,
}

impl ChunkUploadMetadata {
    /// Build a fresh record with no chunks recorded.
    pub fn new(upload_id: impl Into<String>, declared: &DeclaredUpload, now: DateTime<Utc>) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_name: declared.file_name.clone(),
            file_type: declared.file_type.clone(),
            file_size: declared.file_size,
            total_chunks: declared.total_chunks,
            uploaded_chunks: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True once every index in `0..total_chunks` has been recorded.
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() == self.total_chunks as usize
    }

    /// Rounded percentage of chunks recorded.
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        let pct = self.uploaded_chunks.len() as f64 / self.total_chunks as f64 * 100.0;
        pct.round().min(100.0) as u8
    }

    /// Name of the first immutable field that differs from `declared`, if any.
    ///
    /// The declared size is informational and is not compared.
    pub fn conflicting_field(&self, declared: &DeclaredUpload) -> Option<&'static str> {
        if self.file_name != declared.file_name {
            Some("fileName")
        } else if self.file_type != declared.file_type {
            Some("fileType")
        } else if self.total_chunks != declared.total_chunks {
            Some("totalChunks")
        } else {
            None
        }
    }
}

/// Row shape of the `chunk_uploads` table.
#[derive(Clone, FromRow, Debug)]
pub struct UploadRow {
    pub upload_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub total_chunks: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadRow {
    /// Combine a row with its recorded chunk indices.
    pub fn into_metadata(self, uploaded_chunks: BTreeSet<u32>) -> ChunkUploadMetadata {
        ChunkUploadMetadata {
            upload_id: self.upload_id,
            file_name: self.file_name,
            file_type: self.file_type,
            file_size: self.file_size.max(0) as u64,
            total_chunks: self.total_chunks.max(0) as u32,
            uploaded_chunks,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> DeclaredUpload {
        DeclaredUpload {
            file_name: "clip.mp4".into(),
            file_type: "video/mp4".into(),
            file_size: 10,
            total_chunks: 4,
        }
    }

    #[test]
    fn completion_tracks_index_cardinality() {
        let mut meta = ChunkUploadMetadata::new("u1", &declared(), Utc::now());
        assert!(!meta.is_complete());
        for i in [3, 1, 0] {
            meta.uploaded_chunks.insert(i);
        }
        assert_eq!(meta.progress(), 75);
        meta.uploaded_chunks.insert(2);
        assert!(meta.is_complete());
        assert_eq!(meta.progress(), 100);
    }

    #[test]
    fn conflict_ignores_declared_size() {
        let meta = ChunkUploadMetadata::new("u1", &declared(), Utc::now());

        let mut other = declared();
        other.file_size = 99;
        assert_eq!(meta.conflicting_field(&other), None);

        other.file_name = "other.mp4".into();
        assert_eq!(meta.conflicting_field(&other), Some("fileName"));

        let mut other = declared();
        other.file_type = "video/webm".into();
        assert_eq!(meta.conflicting_field(&other), Some("fileType"));

        let mut other = declared();
        other.total_chunks = 5;
        assert_eq!(meta.conflicting_field(&other), Some("totalChunks"));
    }
}
