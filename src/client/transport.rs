//! UploadTransport: drives one file through the server, one chunk per
//! request, strictly in order.
//!
//! The wire itself sits behind [`ChunkSender`] so the same loop runs over
//! HTTP or against an in-process receiver.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, warn};

use crate::client::{
    ClientConfig,
    cancel::{AbortReason, CancelHandle},
    splitter::{ChunkPlan, read_chunk},
};
use crate::models::{
    artifact::ArtifactMetadata,
    chunk::{ChunkFields, ChunkUploadResponse, UploadStatusResponse},
};
use crate::services::media::guess_mime_type;

/// Progress shown for a file until the server confirms completion.
pub const MAX_UNCONFIRMED_PROGRESS: f64 = 99.9;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    /// The server refused the chunk for a structural reason (validation,
    /// metadata conflict). Retrying the same request cannot succeed.
    #[error("server rejected chunk ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("unreadable server response: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("upload cancelled")]
    Cancelled,
    #[error("server did not confirm completion of upload `{0}`")]
    Unconfirmed(String),
}

impl TransportError {
    /// Transient failures worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }
}

/// One chunk and the fields declared alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub is_last_chunk: bool,
    pub data: Bytes,
}

impl ChunkRequest {
    /// Text fields in the order they are sent, before the `chunk` part.
    pub fn text_fields(&self) -> [(&'static str, String); 7] {
        [
            ("chunkIndex", self.chunk_index.to_string()),
            ("totalChunks", self.total_chunks.to_string()),
            ("uploadId", self.upload_id.clone()),
            ("fileName", self.file_name.clone()),
            ("fileType", self.file_type.clone()),
            ("fileSize", self.file_size.to_string()),
            ("isLastChunk", self.is_last_chunk.to_string()),
        ]
    }

    /// The declared fields as the receiver sees them.
    pub fn to_fields(&self) -> ChunkFields {
        let mut fields = ChunkFields::default();
        for (name, value) in self.text_fields() {
            fields.set(name, value);
        }
        fields
    }
}

/// Called with the number of bytes of the current chunk sent so far.
pub type SentBytesFn = Arc<dyn Fn(u64) + Send + Sync>;

/// A carrier for chunk requests and status queries.
#[async_trait]
pub trait ChunkSender: Send + Sync {
    async fn send_chunk(
        &self,
        request: ChunkRequest,
        on_sent: SentBytesFn,
    ) -> Result<ChunkUploadResponse, TransportError>;

    /// `Ok(None)` when the server has no record of the upload.
    async fn upload_status(
        &self,
        upload_id: &str,
    ) -> Result<Option<UploadStatusResponse>, TransportError>;
}

/// A local file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSource {
    pub path: PathBuf,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
}

impl UploadSource {
    /// Describe the file at `path`, guessing its type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            path: path.to_path_buf(),
            file_type: guess_mime_type(&file_name).to_string(),
            file_name,
            file_size: meta.len(),
        })
    }
}

/// What the transport reports while it runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportEvent {
    /// Bytes of the in-flight chunk went out; `progress` is in percent.
    Progress { progress: f64 },
    /// The server recorded chunk `next_index - 1`.
    ChunkConfirmed { next_index: u32, progress: f64 },
}

pub type TransportEventFn = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// How one run of [`UploadTransport::upload`] ended.
#[derive(Debug)]
pub enum TransportOutcome {
    /// The server assembled the file. `metadata` is absent when another
    /// request won the assembly.
    Completed { metadata: Option<ArtifactMetadata> },
    /// Paused before `resume_at` was confirmed; nothing past it was.
    Paused { resume_at: u32 },
    /// Cancelled, rejected, or out of retries at `chunk_index`.
    Failed {
        chunk_index: u32,
        error: TransportError,
    },
}

#[derive(Clone)]
pub struct UploadTransport {
    sender: Arc<dyn ChunkSender>,
    config: ClientConfig,
}

impl UploadTransport {
    pub fn new(sender: Arc<dyn ChunkSender>, config: ClientConfig) -> Self {
        Self { sender, config }
    }

    pub fn sender(&self) -> &Arc<dyn ChunkSender> {
        &self.sender
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn plan(&self, file_size: u64) -> ChunkPlan {
        ChunkPlan::new(file_size, self.config.chunk_size)
    }

    /// Send chunks `start_chunk_index..total` of `source` under `upload_id`.
    pub async fn upload(
        &self,
        source: &UploadSource,
        upload_id: &str,
        start_chunk_index: u32,
        cancel: &CancelHandle,
        on_event: TransportEventFn,
    ) -> TransportOutcome {
        let plan = self.plan(source.file_size);
        let total = plan.total_chunks();

        if plan.is_empty() {
            on_event(TransportEvent::ChunkConfirmed {
                next_index: 0,
                progress: 100.0,
            });
            return TransportOutcome::Completed { metadata: None };
        }

        let start = start_chunk_index.min(total);
        if let Some(reason) = cancel.reason() {
            return aborted_outcome(reason, start);
        }

        let mut file = match File::open(&source.path).await {
            Ok(file) => file,
            Err(err) => {
                return TransportOutcome::Failed {
                    chunk_index: start,
                    error: err.into(),
                };
            }
        };

        for index in start..total {
            let data = match read_chunk(&mut file, &plan, index).await {
                Ok(data) => data,
                Err(err) => {
                    return TransportOutcome::Failed {
                        chunk_index: index,
                        error: err.into(),
                    };
                }
            };
            let request = ChunkRequest {
                upload_id: upload_id.to_string(),
                chunk_index: index,
                total_chunks: total,
                file_name: source.file_name.clone(),
                file_type: source.file_type.clone(),
                file_size: source.file_size,
                is_last_chunk: index + 1 == total,
                data,
            };

            let response = match self.send_with_retry(request, cancel, &on_event).await {
                Ok(response) => response,
                Err(outcome) => return outcome,
            };

            let next_index = index + 1;
            let progress = if response.is_complete {
                100.0
            } else {
                (f64::from(next_index) / f64::from(total) * 100.0).min(MAX_UNCONFIRMED_PROGRESS)
            };
            on_event(TransportEvent::ChunkConfirmed {
                next_index,
                progress,
            });

            if response.is_complete {
                debug!("upload {} completed at chunk {}", upload_id, index);
                return TransportOutcome::Completed {
                    metadata: response.metadata,
                };
            }
        }

        TransportOutcome::Failed {
            chunk_index: total,
            error: TransportError::Unconfirmed(upload_id.to_string()),
        }
    }

    async fn send_with_retry(
        &self,
        request: ChunkRequest,
        cancel: &CancelHandle,
        on_event: &TransportEventFn,
    ) -> Result<ChunkUploadResponse, TransportOutcome> {
        let index = request.chunk_index;
        let total = request.total_chunks;
        let chunk_size = self.config.chunk_size.max(1) as f64;
        let attempts = self.config.retry.attempts.max(1);

        let progress_sink = on_event.clone();
        let on_sent: SentBytesFn = Arc::new(move |sent: u64| {
            let within = (sent as f64 / chunk_size).min(1.0);
            let progress = (f64::from(index) + within) / f64::from(total) * 100.0;
            progress_sink(TransportEvent::Progress {
                progress: progress.min(MAX_UNCONFIRMED_PROGRESS),
            });
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                reason = cancel.aborted() => return Err(aborted_outcome(reason, index)),
                result = self.sender.send_chunk(request.clone(), on_sent.clone()) => result,
            };

            let error = match result {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= attempts {
                warn!(
                    "chunk {} of {} failed after {} attempt(s): {}",
                    index, request.upload_id, attempt, error
                );
                return Err(TransportOutcome::Failed {
                    chunk_index: index,
                    error,
                });
            }

            warn!(
                "chunk {} of {} failed (attempt {}/{}), retrying in {:?}: {}",
                index, request.upload_id, attempt, attempts, self.config.retry.delay, error
            );
            tokio::select! {
                biased;
                reason = cancel.aborted() => return Err(aborted_outcome(reason, index)),
                _ = tokio::time::sleep(self.config.retry.delay) => {}
            }
        }
    }
}

fn aborted_outcome(reason: AbortReason, index: u32) -> TransportOutcome {
    match reason {
        AbortReason::Paused => TransportOutcome::Paused { resume_at: index },
        AbortReason::Cancelled => TransportOutcome::Failed {
            chunk_index: index,
            error: TransportError::Cancelled,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };
    use tempfile::TempDir;

    type Scripted = Result<ChunkUploadResponse, TransportError>;

    /// Answers from a script; an empty script confirms every chunk, and the
    /// final chunk completes the upload.
    #[derive(Default)]
    struct ScriptedSender {
        script: Mutex<VecDeque<Scripted>>,
        sent: Mutex<Vec<ChunkRequest>>,
        hang: bool,
    }

    impl ScriptedSender {
        fn with_script(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn sent_indices(&self) -> Vec<u32> {
            self.sent.lock().unwrap().iter().map(|r| r.chunk_index).collect()
        }
    }

    #[async_trait]
    impl ChunkSender for ScriptedSender {
        async fn send_chunk(
            &self,
            request: ChunkRequest,
            on_sent: SentBytesFn,
        ) -> Result<ChunkUploadResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());
            if self.hang {
                futures::future::pending::<()>().await;
            }
            on_sent(request.data.len() as u64 / 2);
            on_sent(request.data.len() as u64);

            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                let complete = request.is_last_chunk;
                Ok(ChunkUploadResponse {
                    is_complete: complete,
                    upload_id: request.upload_id.clone(),
                    chunk_index: request.chunk_index,
                    total_chunks: request.total_chunks,
                    metadata: complete.then(|| ArtifactMetadata {
                        url: "/uploads/done".into(),
                        ..Default::default()
                    }),
                })
            })
        }

        async fn upload_status(
            &self,
            _upload_id: &str,
        ) -> Result<Option<UploadStatusResponse>, TransportError> {
            Ok(None)
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: UploadSource,
    }

    async fn source(len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();
        let source = UploadSource::from_path(&path).await.unwrap();
        Fixture { _dir: dir, source }
    }

    fn transport(sender: Arc<ScriptedSender>, delay: Duration) -> UploadTransport {
        UploadTransport::new(
            sender,
            ClientConfig {
                chunk_size: 10,
                retry: RetryPolicy { attempts: 2, delay },
            },
        )
    }

    fn recorder() -> (TransportEventFn, Arc<Mutex<Vec<TransportEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let f: TransportEventFn = Arc::new(move |e| sink.lock().unwrap().push(e));
        (f, events)
    }

    fn server_error() -> Scripted {
        Err(TransportError::Server {
            status: 503,
            message: "busy".into(),
        })
    }

    #[tokio::test]
    async fn sends_every_chunk_in_order_and_completes() {
        let fx = source(35).await;
        let sender = Arc::new(ScriptedSender::default());
        let (on_event, events) = recorder();

        let outcome = transport(sender.clone(), Duration::ZERO)
            .upload(&fx.source, "u1", 0, &CancelHandle::new(), on_event)
            .await;

        let metadata = match outcome {
            TransportOutcome::Completed { metadata } => metadata,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(metadata.unwrap().url, "/uploads/done");
        assert_eq!(sender.sent_indices(), vec![0, 1, 2, 3]);

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[3].data.len(), 5);
        assert!(sent[3].is_last_chunk);
        assert!(!sent[2].is_last_chunk);
        assert_eq!(sent[0].file_type, "video/mp4");
        assert_eq!(sent[0].file_size, 35);

        let events = events.lock().unwrap();
        let mut last = 0.0;
        for event in events.iter() {
            let p = match event {
                TransportEvent::Progress { progress } => *progress,
                TransportEvent::ChunkConfirmed { progress, .. } => *progress,
            };
            assert!(p >= last, "progress went backwards: {} < {}", p, last);
            last = p;
        }
        assert_eq!(last, 100.0);
        let before_final = events[events.len() - 2];
        assert!(matches!(before_final, TransportEvent::Progress { progress } if progress < 100.0));
    }

    #[tokio::test]
    async fn short_last_chunk_progress_is_measured_against_chunk_size() {
        let fx = source(15).await;
        let sender = Arc::new(ScriptedSender::default());
        let (on_event, events) = recorder();

        transport(sender, Duration::ZERO)
            .upload(&fx.source, "u1", 0, &CancelHandle::new(), on_event)
            .await;

        let in_flight: Vec<f64> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Progress { progress } => Some(*progress),
                _ => None,
            })
            .collect();
        // The 5-byte last chunk is half of the 10-byte chunk size.
        let expected = [25.0, 50.0, 60.0, 75.0];
        assert_eq!(in_flight.len(), expected.len());
        for (got, want) in in_flight.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{:?}", in_flight);
        }
    }

    #[tokio::test]
    async fn starts_at_resume_pointer() {
        let fx = source(35).await;
        let sender = Arc::new(ScriptedSender::default());
        let (on_event, _) = recorder();

        let outcome = transport(sender.clone(), Duration::ZERO)
            .upload(&fx.source, "u1", 2, &CancelHandle::new(), on_event)
            .await;
        assert!(matches!(outcome, TransportOutcome::Completed { .. }));
        assert_eq!(sender.sent_indices(), vec![2, 3]);
    }

    #[tokio::test]
    async fn empty_file_completes_without_requests() {
        let fx = source(0).await;
        let sender = Arc::new(ScriptedSender::default());
        let (on_event, _) = recorder();

        let outcome = transport(sender.clone(), Duration::ZERO)
            .upload(&fx.source, "u1", 0, &CancelHandle::new(), on_event)
            .await;
        assert!(matches!(outcome, TransportOutcome::Completed { metadata: None }));
        assert!(sender.sent_indices().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let fx = source(15).await;
        let sender = Arc::new(ScriptedSender::with_script(vec![server_error()]));
        let (on_event, _) = recorder();

        let outcome = transport(sender.clone(), Duration::from_millis(1))
            .upload(&fx.source, "u1", 0, &CancelHandle::new(), on_event)
            .await;
        assert!(matches!(outcome, TransportOutcome::Completed { .. }));
        assert_eq!(sender.sent_indices(), vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_at_chunk() {
        let fx = source(25).await;
        let ok = Ok(ChunkUploadResponse {
            is_complete: false,
            upload_id: "u1".into(),
            chunk_index: 0,
            total_chunks: 3,
            metadata: None,
        });
        let sender = Arc::new(ScriptedSender::with_script(vec![
            ok,
            server_error(),
            server_error(),
        ]));
        let (on_event, _) = recorder();

        let outcome = transport(sender.clone(), Duration::from_millis(1))
            .upload(&fx.source, "u1", 0, &CancelHandle::new(), on_event)
            .await;
        match outcome {
            TransportOutcome::Failed { chunk_index, error } => {
                assert_eq!(chunk_index, 1);
                assert!(matches!(error, TransportError::Server { status: 503, .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(sender.sent_indices(), vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let fx = source(15).await;
        let sender = Arc::new(ScriptedSender::with_script(vec![Err(
            TransportError::Rejected {
                status: 409,
                message: "conflict".into(),
            },
        )]));
        let (on_event, _) = recorder();

        let outcome = transport(sender.clone(), Duration::from_secs(60))
            .upload(&fx.source, "u1", 0, &CancelHandle::new(), on_event)
            .await;
        assert!(matches!(
            outcome,
            TransportOutcome::Failed {
                chunk_index: 0,
                error: TransportError::Rejected { status: 409, .. }
            }
        ));
        assert_eq!(sender.sent_indices(), vec![0]);
    }

    #[tokio::test]
    async fn pause_during_retry_wait_stops_at_current_chunk() {
        let fx = source(25).await;
        let ok = Ok(ChunkUploadResponse {
            is_complete: false,
            upload_id: "u1".into(),
            chunk_index: 0,
            total_chunks: 3,
            metadata: None,
        });
        let sender = Arc::new(ScriptedSender::with_script(vec![ok, server_error()]));
        let (on_event, events) = recorder();
        let cancel = CancelHandle::new();

        let pauser = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pauser.pause();
        });

        let outcome = transport(sender.clone(), Duration::from_secs(60))
            .upload(&fx.source, "u1", 0, &cancel, on_event)
            .await;
        assert!(matches!(outcome, TransportOutcome::Paused { resume_at: 1 }));

        let confirmed: Vec<u32> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::ChunkConfirmed { next_index, .. } => Some(*next_index),
                _ => None,
            })
            .collect();
        assert_eq!(confirmed, vec![1]);
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_request() {
        let fx = source(25).await;
        let sender = Arc::new(ScriptedSender {
            hang: true,
            ..Default::default()
        });
        let (on_event, _) = recorder();
        let cancel = CancelHandle::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = transport(sender.clone(), Duration::ZERO)
            .upload(&fx.source, "u1", 0, &cancel, on_event)
            .await;
        assert!(matches!(
            outcome,
            TransportOutcome::Failed {
                chunk_index: 0,
                error: TransportError::Cancelled
            }
        ));
    }

    #[tokio::test]
    async fn already_paused_handle_sends_nothing() {
        let fx = source(25).await;
        let sender = Arc::new(ScriptedSender::default());
        let (on_event, _) = recorder();
        let cancel = CancelHandle::new();
        cancel.pause();

        let outcome = transport(sender.clone(), Duration::ZERO)
            .upload(&fx.source, "u1", 1, &cancel, on_event)
            .await;
        assert!(matches!(outcome, TransportOutcome::Paused { resume_at: 1 }));
        assert!(sender.sent_indices().is_empty());
    }

    #[test]
    fn request_fields_round_trip_into_receiver_fields() {
        let request = ChunkRequest {
            upload_id: "u1".into(),
            chunk_index: 4,
            total_chunks: 5,
            file_name: "a.png".into(),
            file_type: "image/png".into(),
            file_size: 12,
            is_last_chunk: true,
            data: Bytes::from_static(b"x"),
        };
        let fields = request.to_fields();
        assert_eq!(fields.chunk_index.as_deref(), Some("4"));
        assert_eq!(fields.is_last_chunk.as_deref(), Some("true"));
        assert_eq!(fields.upload_id.as_deref(), Some("u1"));
    }
}
