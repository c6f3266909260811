//! Runs uploads: one tokio task per file, reporting into an `UploadStore`.

use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::{
    ClientConfig,
    cancel::CancelHandle,
    store::{FileStatus, GroupCallback, GroupSnapshot, StoreError, UploadStore},
    transport::{
        ChunkSender, TransportError, TransportEvent, TransportEventFn, TransportOutcome,
        UploadSource, UploadTransport,
    },
};

#[derive(Debug, Error)]
pub enum UploaderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone)]
pub struct Uploader {
    store: UploadStore,
    transport: UploadTransport,
}

impl Uploader {
    pub fn new(sender: Arc<dyn ChunkSender>, config: ClientConfig) -> Self {
        Self::with_store(UploadStore::new(), UploadTransport::new(sender, config))
    }

    pub fn with_store(store: UploadStore, transport: UploadTransport) -> Self {
        Self { store, transport }
    }

    pub fn store(&self) -> &UploadStore {
        &self.store
    }

    pub fn transport(&self) -> &UploadTransport {
        &self.transport
    }

    /// Create a group of ready files. Nothing is sent yet.
    pub async fn add_files(
        &self,
        group_name: &str,
        paths: &[PathBuf],
        on_complete: Option<GroupCallback>,
    ) -> Result<String, UploaderError> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let source = UploadSource::from_path(path)
                .await
                .map_err(|source| UploaderError::Source {
                    path: path.clone(),
                    source,
                })?;
            sources.push(source);
        }

        let group_id = self.store.add_group(group_name, on_complete);
        for source in &sources {
            let total = self.transport.plan(source.file_size).total_chunks();
            self.store.add_file(&group_id, source, total)?;
        }
        Ok(group_id)
    }

    /// Start every ready file of the group. Returns the spawned tasks.
    pub fn upload_group(&self, group_id: &str) -> Result<Vec<JoinHandle<()>>, UploaderError> {
        let group = self
            .store
            .group(group_id)
            .ok_or_else(|| StoreError::UnknownGroup(group_id.to_string()))?;

        let mut tasks = Vec::new();
        for file in group.files.iter().filter(|f| f.status == FileStatus::Ready) {
            let cancel = self.store.start_file(&file.id)?;
            tasks.push(self.spawn_run(file.id.clone(), file.uploaded_chunk_index, cancel));
        }
        info!("uploading {} file(s) of group {}", tasks.len(), group.group.name);
        Ok(tasks)
    }

    /// `add_files` followed by `upload_group`. Returns the group id.
    pub async fn upload_files(
        &self,
        group_name: &str,
        paths: &[PathBuf],
        on_complete: Option<GroupCallback>,
    ) -> Result<String, UploaderError> {
        let group_id = self.add_files(group_name, paths, on_complete).await?;
        self.upload_group(&group_id)?;
        Ok(group_id)
    }

    /// Retry a failed file from its last confirmed chunk.
    pub async fn retry(&self, file_id: &str) -> Result<JoinHandle<()>, UploaderError> {
        let start = self.resume_point(file_id).await?;
        let cancel = self.store.start_file(file_id)?;
        Ok(self.spawn_run(file_id.to_string(), start, cancel))
    }

    pub fn pause(&self, file_id: &str) -> Result<bool, UploaderError> {
        Ok(self.store.pause_file(file_id)?)
    }

    /// Resume a paused file from the first chunk the server is missing.
    pub async fn resume(&self, file_id: &str) -> Result<JoinHandle<()>, UploaderError> {
        let start = self.resume_point(file_id).await?;
        let cancel = self.store.resume_file(file_id, start)?;
        Ok(self.spawn_run(file_id.to_string(), start, cancel))
    }

    pub fn cancel(&self, file_id: &str) -> Result<bool, UploaderError> {
        Ok(self.store.cancel_file(file_id)?)
    }

    pub fn cancel_group(&self, group_id: &str) -> Result<usize, UploaderError> {
        Ok(self.store.cancel_group(group_id)?)
    }

    /// Wait until the group is terminal. `None` if it does not exist or is
    /// removed meanwhile.
    pub async fn wait(&self, group_id: &str) -> Option<GroupSnapshot> {
        let mut changes = self.store.subscribe();
        loop {
            let snapshot = self.store.group(group_id)?;
            if snapshot.group.status.is_terminal() {
                return Some(snapshot);
            }
            if changes.changed().await.is_err() {
                return self.store.group(group_id);
            }
        }
    }

    /// The server's first missing chunk, 0 if it has no record, or the
    /// locally remembered pointer if it cannot be asked.
    async fn resume_point(&self, file_id: &str) -> Result<u32, UploaderError> {
        let file = self
            .store
            .file(file_id)
            .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))?;

        match self.transport.sender().upload_status(file_id).await {
            Ok(Some(status)) => Ok(status.next_missing_chunk().min(file.total_chunks)),
            Ok(None) => Ok(0),
            Err(err) => {
                warn!(
                    "status query for {} failed, resuming at local chunk {}: {}",
                    file.name, file.uploaded_chunk_index, err
                );
                Ok(file.uploaded_chunk_index)
            }
        }
    }

    fn spawn_run(&self, file_id: String, start: u32, cancel: CancelHandle) -> JoinHandle<()> {
        let store = self.store.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let Some(file) = store.file(&file_id) else {
                return;
            };
            let source = file.source();

            let events_store = store.clone();
            let events_id = file_id.clone();
            let events_cancel = cancel.clone();
            let on_event: TransportEventFn = Arc::new(move |event| {
                // A stopped run must not touch a file that has moved on.
                if events_cancel.is_aborted() {
                    return;
                }
                let result = match event {
                    TransportEvent::Progress { progress } => {
                        events_store.update_progress(&events_id, progress)
                    }
                    TransportEvent::ChunkConfirmed {
                        next_index,
                        progress,
                    } => events_store.record_confirmed_chunk(&events_id, next_index, progress),
                };
                if let Err(err) = result {
                    warn!("dropping transport event: {}", err);
                }
            });

            let outcome = transport
                .upload(&source, &file_id, start, &cancel, on_event)
                .await;
            let result = match outcome {
                TransportOutcome::Completed { metadata } => {
                    info!("{} uploaded", source.file_name);
                    store.complete_file(&file_id, metadata)
                }
                TransportOutcome::Paused { resume_at } => {
                    info!("{} paused at chunk {}", source.file_name, resume_at);
                    Ok(())
                }
                TransportOutcome::Failed {
                    error: TransportError::Cancelled,
                    ..
                } => Ok(()),
                TransportOutcome::Failed { chunk_index, error } => {
                    if cancel.is_aborted() {
                        Ok(())
                    } else {
                        warn!(
                            "{} failed at chunk {}: {}",
                            source.file_name, chunk_index, error
                        );
                        store.mark_file_failed(&file_id, error.to_string())
                    }
                }
            };
            if let Err(err) = result {
                warn!("upload of {} finished for a removed file: {}", source.file_name, err);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RetryPolicy, transport::{ChunkRequest, SentBytesFn}};
    use crate::client::store::GroupStatus;
    use crate::models::chunk::{ChunkUploadResponse, UploadStatusResponse};
    use async_trait::async_trait;
    use std::{
        collections::HashSet,
        sync::Mutex,
        time::Duration,
    };
    use tempfile::TempDir;

    /// Accepts every chunk except those of files whose name is listed in
    /// `reject`.
    #[derive(Default)]
    struct FakeServer {
        reject: HashSet<String>,
        received: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl ChunkSender for FakeServer {
        async fn send_chunk(
            &self,
            request: ChunkRequest,
            on_sent: SentBytesFn,
        ) -> Result<ChunkUploadResponse, TransportError> {
            if self.reject.contains(&request.file_name) {
                return Err(TransportError::Rejected {
                    status: 400,
                    message: "file type not allowed".into(),
                });
            }
            on_sent(request.data.len() as u64);
            self.received
                .lock()
                .unwrap()
                .push((request.upload_id.clone(), request.chunk_index));
            Ok(ChunkUploadResponse {
                is_complete: request.is_last_chunk,
                upload_id: request.upload_id,
                chunk_index: request.chunk_index,
                total_chunks: request.total_chunks,
                metadata: None,
            })
        }

        async fn upload_status(
            &self,
            _upload_id: &str,
        ) -> Result<Option<UploadStatusResponse>, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
    }

    fn uploader(server: Arc<FakeServer>) -> Uploader {
        Uploader::new(
            server,
            ClientConfig {
                chunk_size: 4,
                retry: RetryPolicy {
                    attempts: 1,
                    delay: Duration::ZERO,
                },
            },
        )
    }

    async fn write_files(dir: &TempDir, names: &[&str]) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for name in names {
            let path = dir.path().join(name);
            tokio::fs::write(&path, b"0123456789").await.unwrap();
            paths.push(path);
        }
        paths
    }

    #[tokio::test]
    async fn group_with_one_rejected_file_still_completes() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.png", "b.png", "bad.png"]).await;
        let server = Arc::new(FakeServer {
            reject: HashSet::from(["bad.png".to_string()]),
            ..Default::default()
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let callback: GroupCallback = Arc::new(move |snapshot: &GroupSnapshot| {
            sink.lock().unwrap().push(snapshot.group.status);
        });

        let uploader = uploader(server.clone());
        let group = uploader
            .upload_files("photos", &paths, Some(callback))
            .await
            .unwrap();
        let done = tokio::time::timeout(Duration::from_secs(5), uploader.wait(&group))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(done.group.status, GroupStatus::Completed);
        assert_eq!(done.group.completed_files, 2);
        assert_eq!(done.group.failed_files, 1);
        let bad = done.files.iter().find(|f| f.name == "bad.png").unwrap();
        assert_eq!(bad.status, FileStatus::Failed);
        assert!(bad.error.as_deref().unwrap().contains("file type not allowed"));
        assert_eq!(*calls.lock().unwrap(), vec![GroupStatus::Completed]);

        // Three chunks of 4 bytes for each accepted 10-byte file.
        assert_eq!(server.received.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let uploader = uploader(Arc::new(FakeServer::default()));
        let err = uploader
            .add_files("g", &[PathBuf::from("/definitely/not/here.png")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploaderError::Source { .. }));
        assert!(uploader.store().groups().is_empty());
    }

    #[tokio::test]
    async fn resume_falls_back_to_local_pointer_when_offline() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.png"]).await;
        let server = Arc::new(FakeServer::default());
        let uploader = uploader(server.clone());

        let group = uploader.add_files("g", &paths, None).await.unwrap();
        let file_id = uploader.store().group(&group).unwrap().files[0].id.clone();
        uploader.store().start_file(&file_id).unwrap();
        uploader.store().record_confirmed_chunk(&file_id, 2, 66.0).unwrap();
        uploader.pause(&file_id).unwrap();

        uploader.resume(&file_id).await.unwrap().await.unwrap();

        let file = uploader.store().file(&file_id).unwrap();
        assert_eq!(file.status, FileStatus::Completed);
        assert_eq!(*server.received.lock().unwrap(), vec![(file_id, 2)]);
    }

    #[tokio::test]
    async fn cancel_group_before_start_cancels_everything() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["a.png", "b.png"]).await;
        let uploader = uploader(Arc::new(FakeServer::default()));

        let group = uploader.add_files("g", &paths, None).await.unwrap();
        assert_eq!(uploader.cancel_group(&group).unwrap(), 2);
        assert!(uploader.upload_group(&group).unwrap().is_empty());
        let done = uploader.wait(&group).await.unwrap();
        assert_eq!(done.group.status, GroupStatus::Cancelled);
    }
}
