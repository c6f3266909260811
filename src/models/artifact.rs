//! Descriptor of an assembled upload, returned with the completing chunk.

use serde::{Deserialize, Serialize};

/// Final artifact plus whatever technical metadata the post-assembly
/// processors could extract.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    /// Public URL of the stored file (e.g. `/uploads/clip_<uuid>.mp4`).
    pub url: String,

    /// Name of the stored file under the uploads directory.
    pub file_name: String,

    /// Detected (or, after conversion, resulting) MIME type.
    pub mime_type: String,

    /// Size in bytes of the stored file.
    pub size: u64,

    /// MD5 of the assembled bytes, before any conversion.
    pub etag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    /// Duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,

    /// Bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,

    /// Public URL of the poster frame, for videos.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}
