#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;

use chunked_media::services::{
    assembly::AssemblyPipeline, chunk_spool::ChunkSpool, metadata_store::MemoryMetadataStore,
    upload_service::UploadService, validation::UploadRules,
};

/// An upload service over a memory store with media processing off, rooted
/// in a fresh temp directory.
pub struct TestServer {
    pub dir: TempDir,
    pub service: UploadService,
}

pub fn test_server() -> TestServer {
    let dir = TempDir::new().expect("temp dir");
    let uploads = dir.path().join("uploads");
    let spool = ChunkSpool::new(uploads.join("temp"));
    let pipeline = AssemblyPipeline::new(&uploads, spool, "/uploads");
    let service = UploadService::new(
        Arc::new(MemoryMetadataStore::new(3600)),
        UploadRules::default(),
        pipeline,
    );
    TestServer { dir, service }
}

/// Deterministic, non-repeating-ish test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect()
}
