//! Boundary checks for chunk requests and name sanitizing.

use crate::models::{chunk::ChunkFields, upload::DeclaredUpload};
use crate::services::{UploadError, UploadResult};

/// Default maximum declared file size: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default maximum size of a single chunk body: 16 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

const MAX_UPLOAD_ID_LEN: usize = 128;

/// MIME types accepted by the chunk endpoint.
pub const ALLOWED_TYPES: [&str; 13] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/heic",
    "image/heif",
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "audio/mp3",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
];

/// Limits enforced before any state is touched.
#[derive(Debug, Clone)]
pub struct UploadRules {
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub allowed_types: Vec<String>,
}

impl Default for UploadRules {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            allowed_types: ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A chunk request whose declared fields passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub upload_id: String,
    pub chunk_index: u32,
    pub is_last_chunk: bool,
    pub declared: DeclaredUpload,
}

impl UploadRules {
    pub fn is_allowed_type(&self, mime: &str) -> bool {
        self.allowed_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }

    /// Validate the declared fields of a chunk request.
    pub fn validate(&self, fields: &ChunkFields) -> UploadResult<ChunkDescriptor> {
        let upload_id = required_text(&fields.upload_id, "uploadId")?;
        let file_name = required_text(&fields.file_name, "fileName")?;
        let file_type = required_text(&fields.file_type, "fileType")?;
        let chunk_index: u32 = required_number(&fields.chunk_index, "chunkIndex")?;
        let total_chunks: u32 = required_number(&fields.total_chunks, "totalChunks")?;
        let file_size: u64 = required_number(&fields.file_size, "fileSize")?;

        ensure_upload_id_safe(upload_id)?;

        if !self.is_allowed_type(file_type) {
            return Err(UploadError::validation(format!(
                "unsupported file type `{}`",
                file_type
            )));
        }
        if total_chunks == 0 {
            return Err(UploadError::validation("totalChunks must be at least 1"));
        }
        if chunk_index >= total_chunks {
            return Err(UploadError::validation(format!(
                "chunkIndex {} out of range for {} chunks",
                chunk_index, total_chunks
            )));
        }
        if file_size > self.max_file_size {
            return Err(UploadError::validation(format!(
                "file size {} exceeds the {} byte limit",
                file_size, self.max_file_size
            )));
        }

        // Informational only; completion is decided by the recorded index set.
        let is_last_chunk = fields
            .is_last_chunk
            .as_deref()
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(chunk_index + 1 == total_chunks);

        Ok(ChunkDescriptor {
            upload_id: upload_id.to_string(),
            chunk_index,
            is_last_chunk,
            declared: DeclaredUpload {
                file_name: file_name.to_string(),
                file_type: file_type.to_ascii_lowercase(),
                file_size,
                total_chunks,
            },
        })
    }
}

/// Reject upload ids that could not safely name a temp directory.
pub fn ensure_upload_id_safe(upload_id: &str) -> UploadResult<()> {
    if upload_id.is_empty() || upload_id.len() > MAX_UPLOAD_ID_LEN {
        return Err(UploadError::validation(format!(
            "uploadId must be 1-{} characters",
            MAX_UPLOAD_ID_LEN
        )));
    }
    if !upload_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(UploadError::validation(
            "uploadId may only contain letters, digits, `-` and `_`",
        ));
    }
    Ok(())
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn required_text<'a>(value: &'a Option<String>, name: &str) -> UploadResult<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(UploadError::validation(format!("missing required field `{}`", name))),
    }
}

fn required_number<T: std::str::FromStr>(value: &Option<String>, name: &str) -> UploadResult<T> {
    let raw = required_text(value, name)?;
    raw.parse::<T>()
        .map_err(|_| UploadError::validation(format!("field `{}` is not a valid number", name)))
}
