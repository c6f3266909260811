//! Temporary storage for received chunks, laid out as
//! `<root>/<uploadId>/<chunkIndex>.part`.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::{UploadError, UploadResult};

#[derive(Debug, Clone)]
pub struct ChunkSpool {
    root: PathBuf,
}

impl ChunkSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every chunk of one upload. The id must already have
    /// passed `ensure_upload_id_safe`.
    pub fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    pub fn chunk_path(&self, upload_id: &str, chunk_index: u32) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("{}.part", chunk_index))
    }

    /// Stream one chunk body to disk and return its length.
    ///
    /// Bytes go to a unique `.tmp-*` sibling that is renamed over the final
    /// location, so a repeated index replaces the earlier copy whole. A body
    /// longer than `max_len` is rejected and nothing is left behind.
    pub async fn write_chunk<S>(
        &self,
        upload_id: &str,
        chunk_index: u32,
        max_len: u64,
        stream: S,
    ) -> UploadResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let final_path = self.chunk_path(upload_id, chunk_index);
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut written: u64 = 0;
        pin_mut!(stream);
        while let Some(piece) = stream.next().await {
            let piece = match piece {
                Ok(piece) => piece,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Io(err));
                }
            };
            written += piece.len() as u64;
            if written > max_len {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::validation(format!(
                    "chunk {} exceeds the {} byte chunk limit",
                    chunk_index, max_len
                )));
            }
            if let Err(err) = file.write_all(&piece).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&final_path).await?;
                fs::rename(&tmp_path, &final_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        debug!(
            "stored chunk {} of {} ({} bytes)",
            chunk_index, upload_id, written
        );
        Ok(written)
    }

    /// Remove every chunk of an upload. Missing directories are fine.
    pub async fn remove_upload(&self, upload_id: &str) {
        let dir = self.upload_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("removed temp chunks at {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove temp chunks at {}: {}", dir.display(), err),
        }
    }

    /// Write, read back and delete a probe file under the spool root.
    pub async fn check_writable(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        let payload = b"ok";
        fs::write(&probe, payload).await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != payload {
            return Err(io::Error::new(ErrorKind::Other, "probe file content mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn body(parts: &[&'static str]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(
            parts
                .iter()
                .copied()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn writes_and_overwrites_chunk() {
        let dir = TempDir::new().unwrap();
        let spool = ChunkSpool::new(dir.path());

        let n = spool.write_chunk("u1", 0, 64, body(&["abc", "def"])).await.unwrap();
        assert_eq!(n, 6);
        let n = spool.write_chunk("u1", 0, 64, body(&["xyz"])).await.unwrap();
        assert_eq!(n, 3);

        let stored = fs::read(spool.chunk_path("u1", 0)).await.unwrap();
        assert_eq!(stored, b"xyz");

        let leftovers: Vec<_> = std::fs::read_dir(spool.upload_dir("u1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(leftovers, vec!["0.part".to_string()]);
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let spool = ChunkSpool::new(dir.path());

        let err = spool
            .write_chunk("u1", 2, 4, body(&["abc", "def"]))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert!(!fs::try_exists(spool.chunk_path("u1", 2)).await.unwrap());
        assert_eq!(std::fs::read_dir(spool.upload_dir("u1")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let spool = ChunkSpool::new(dir.path());
        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "reset")),
        ]);

        assert!(spool.write_chunk("u1", 0, 64, broken).await.is_err());
        assert_eq!(std::fs::read_dir(spool.upload_dir("u1")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn remove_and_probe() {
        let dir = TempDir::new().unwrap();
        let spool = ChunkSpool::new(dir.path().join("temp"));
        spool.check_writable().await.unwrap();
        spool.write_chunk("u1", 0, 64, body(&["a"])).await.unwrap();

        spool.remove_upload("u1").await;
        spool.remove_upload("never-existed").await;
        assert!(!fs::try_exists(spool.upload_dir("u1")).await.unwrap());
    }
}
