//! Reassembly of a completed upload into its final artifact.
//!
//! Chunks are read strictly in ascending index order and each one is deleted
//! as soon as it has been appended. The result is renamed into `uploads_dir`
//! and handed to the first matching `MediaProcessor`.

use md5::Context;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{artifact::ArtifactMetadata, upload::ChunkUploadMetadata};
use crate::services::{
    UploadError, UploadResult,
    chunk_spool::ChunkSpool,
    media::{MediaProcessor, ProcessedArtifact, detect_media_type},
    validation::sanitize_file_name,
};

const COPY_BUF_LEN: usize = 64 * 1024;

pub struct AssemblyPipeline {
    uploads_dir: PathBuf,
    spool: ChunkSpool,
    public_prefix: String,
    processors: Vec<Box<dyn MediaProcessor>>,
}

impl AssemblyPipeline {
    pub fn new(uploads_dir: impl Into<PathBuf>, spool: ChunkSpool, public_prefix: &str) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            spool,
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
            processors: Vec::new(),
        }
    }

    /// Register a post-assembly processor; earlier registrations win.
    pub fn with_processor(mut self, processor: Box<dyn MediaProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_processors(mut self, processors: Vec<Box<dyn MediaProcessor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn spool(&self) -> &ChunkSpool {
        &self.spool
    }

    /// Public URL for a file stored under `uploads_dir`.
    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_prefix, file_name)
    }

    /// Concatenate, normalize and describe a completed upload.
    ///
    /// The caller must already own the upload exclusively (it retired the
    /// metadata record through `mark_assembled`). On failure every temp chunk
    /// and every file this run produced is removed.
    pub async fn assemble(&self, meta: &ChunkUploadMetadata) -> UploadResult<ArtifactMetadata> {
        info!(
            "assembling upload {} ({} chunks, {})",
            meta.upload_id, meta.total_chunks, meta.file_name
        );

        let final_name = final_file_name(&meta.file_name);
        let final_path = self.uploads_dir.join(&final_name);

        let (size, etag) = match self.concatenate(meta, &final_path).await {
            Ok(done) => done,
            Err(err) => {
                self.spool.remove_upload(&meta.upload_id).await;
                error!("assembly of {} failed: {}", meta.upload_id, err);
                return Err(into_assembly_error(err));
            }
        };
        self.spool.remove_upload(&meta.upload_id).await;

        let artifact = match self.process(&final_path, &meta.file_type).await {
            Ok(artifact) => artifact,
            Err(err) => {
                error!("post-processing of {} failed: {}", meta.upload_id, err);
                return Err(into_assembly_error(err));
            }
        };

        let stored_size = if artifact.path == final_path {
            size
        } else {
            fs::metadata(&artifact.path).await.map(|m| m.len()).unwrap_or(size)
        };
        let file_name = file_name_of(&artifact.path).unwrap_or(final_name);

        let described = ArtifactMetadata {
            url: self.public_url(&file_name),
            file_name,
            mime_type: artifact.mime_type,
            size: stored_size,
            etag,
            width: artifact.width,
            height: artifact.height,
            duration: artifact.duration,
            frame_rate: artifact.frame_rate,
            bitrate: artifact.bitrate,
            codec: artifact.codec,
            thumbnail: artifact
                .thumbnail
                .as_deref()
                .and_then(file_name_of)
                .map(|name| self.public_url(&name)),
        };

        info!(
            "assembled upload {} into {} ({} bytes, {})",
            meta.upload_id, described.url, described.size, described.mime_type
        );
        Ok(described)
    }

    /// Append chunks `0..total_chunks` to a temp file, then rename it to
    /// `final_path`. Returns the byte count and md5 hex of what was written.
    async fn concatenate(
        &self,
        meta: &ChunkUploadMetadata,
        final_path: &Path,
    ) -> UploadResult<(u64, String)> {
        fs::create_dir_all(&self.uploads_dir).await?;
        let tmp_path = self.uploads_dir.join(format!(".tmp-{}", Uuid::new_v4()));

        match self.write_chunks(meta, &tmp_path).await {
            Ok(done) => {
                if let Err(err) = fs::rename(&tmp_path, final_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Io(err));
                }
                Ok(done)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    async fn write_chunks(
        &self,
        meta: &ChunkUploadMetadata,
        tmp_path: &Path,
    ) -> UploadResult<(u64, String)> {
        let mut out = File::create(tmp_path).await?;
        let mut digest = Context::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_LEN];

        for index in 0..meta.total_chunks {
            let chunk_path = self.spool.chunk_path(&meta.upload_id, index);
            let mut chunk = File::open(&chunk_path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    UploadError::assembly(format!(
                        "chunk {} of upload {} is missing",
                        index, meta.upload_id
                    ))
                } else {
                    UploadError::Io(err)
                }
            })?;

            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                out.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            drop(chunk);

            if let Err(err) = fs::remove_file(&chunk_path).await {
                warn!("failed to remove consumed chunk {}: {}", chunk_path.display(), err);
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok((size, format!("{:x}", digest.compute())))
    }

    /// Detect the media type and run the first processor that accepts it.
    async fn process(&self, path: &Path, declared_type: &str) -> UploadResult<ProcessedArtifact> {
        let mime_type = match detect_media_type(path, declared_type).await {
            Ok(mime) => mime,
            Err(err) => {
                let _ = fs::remove_file(path).await;
                return Err(err);
            }
        };
        let mut artifact = ProcessedArtifact::new(path, mime_type);

        let Some(processor) = self.processors.iter().find(|p| p.accepts(&artifact.mime_type))
        else {
            return Ok(artifact);
        };

        info!("running {} on {}", processor.name(), path.display());
        if let Err(err) = processor.process(&mut artifact).await {
            remove_quietly(path).await;
            remove_quietly(&artifact.path).await;
            if let Some(thumb) = &artifact.thumbnail {
                remove_quietly(thumb).await;
            }
            return Err(err);
        }
        Ok(artifact)
    }
}

/// `my photo.HEIC` → `my_photo_<uuid>.HEIC`.
pub fn final_file_name(declared: &str) -> String {
    let sanitized = sanitize_file_name(declared);
    let path = Path::new(&sanitized);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && s.chars().any(|c| c != '.'))
        .unwrap_or_else(|| "file".to_string());
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, Uuid::new_v4(), ext.to_string_lossy()),
        None => format!("{}_{}", stem, Uuid::new_v4()),
    }
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove {}: {}", path.display(), err),
    }
}

fn into_assembly_error(err: UploadError) -> UploadError {
    match err {
        UploadError::Assembly(_) => err,
        other => UploadError::assembly(other.to_string()),
    }
}
