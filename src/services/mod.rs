//! Server-side upload pipeline: validation, metadata tracking, chunk
//! persistence and assembly.

pub mod assembly;
pub mod chunk_spool;
pub mod media;
pub mod metadata_store;
pub mod sqlite_store;
pub mod upload_locks;
pub mod upload_service;
pub mod validation;

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Missing or malformed fields, disallowed type, oversized file or
    /// out-of-range chunk index. Nothing was mutated.
    #[error("{0}")]
    Validation(String),
    /// A later chunk disagrees with the record created by an earlier one.
    #[error("upload `{upload_id}` metadata mismatch on `{field}`")]
    MetadataConflict {
        upload_id: String,
        field: &'static str,
    },
    #[error("upload `{0}` not found")]
    NotFound(String),
    /// Reassembly or conversion failed; temp chunks and the record are gone.
    #[error("failed to assemble file: {0}")]
    Assembly(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UploadError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::Assembly(msg.into())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
