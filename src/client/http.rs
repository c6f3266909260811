//! `ChunkSender` over HTTP, using `reqwest` multipart requests against the
//! `/media/chunk` and `/media/status` endpoints.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use reqwest::{
    Body, Client, Response, StatusCode,
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::time::Duration;

use crate::client::transport::{ChunkRequest, ChunkSender, SentBytesFn, TransportError};
use crate::models::chunk::{CHUNK_FIELD, ChunkUploadResponse, UploadStatusResponse};

/// Size of the slices the chunk body is streamed in; progress is reported
/// once per slice.
const BODY_SLICE: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shape of the server's error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpChunkSender {
    http: Client,
    endpoint: String,
}

impl HttpChunkSender {
    /// `endpoint` is the server's base URL, e.g. `http://127.0.0.1:3000`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self::with_client(http, endpoint))
    }

    pub fn with_client(http: Client, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self { http, endpoint }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}

/// The chunk bytes as a streamed body that reports how much has been handed
/// to the connection.
fn progress_body(data: Bytes, on_sent: SentBytesFn) -> Body {
    let len = data.len();
    let slices: Vec<Bytes> = (0..len)
        .step_by(BODY_SLICE)
        .map(|start| data.slice(start..len.min(start + BODY_SLICE)))
        .collect();

    let mut sent = 0u64;
    let body = stream::iter(slices.into_iter().map(move |slice| {
        sent += slice.len() as u64;
        on_sent(sent);
        Ok::<_, std::io::Error>(slice)
    }));
    Body::wrap_stream(body)
}

fn build_form(request: ChunkRequest, on_sent: SentBytesFn) -> Result<Form, TransportError> {
    let mut form = Form::new();
    for (name, value) in request.text_fields() {
        form = form.text(name, value);
    }

    let len = request.data.len() as u64;
    let part = Part::stream_with_length(progress_body(request.data, on_sent), len)
        .file_name(request.file_name)
        .mime_str("application/octet-stream")
        .map_err(|err| TransportError::Decode(err.to_string()))?;
    Ok(form.part(CHUNK_FIELD, part))
}

/// Turn a non-success response into the matching `TransportError`.
async fn status_error(response: Response) -> TransportError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or_else(|_| {
            if text.is_empty() {
                status.to_string()
            } else {
                text
            }
        });

    if status.is_client_error() {
        TransportError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        TransportError::Server {
            status: status.as_u16(),
            message,
        }
    }
}

fn network(err: reqwest::Error) -> TransportError {
    TransportError::Network(err.to_string())
}

#[async_trait]
impl ChunkSender for HttpChunkSender {
    async fn send_chunk(
        &self,
        request: ChunkRequest,
        on_sent: SentBytesFn,
    ) -> Result<ChunkUploadResponse, TransportError> {
        let form = build_form(request, on_sent)?;
        let response = self
            .http
            .post(self.url("/media/chunk"))
            .multipart(form)
            .send()
            .await
            .map_err(network)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<ChunkUploadResponse>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }

    async fn upload_status(
        &self,
        upload_id: &str,
    ) -> Result<Option<UploadStatusResponse>, TransportError> {
        let response = self
            .http
            .get(self.url("/media/status"))
            .query(&[("uploadId", upload_id)])
            .send()
            .await
            .map_err(network)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<UploadStatusResponse>()
            .await
            .map(Some)
            .map_err(|err| TransportError::Decode(err.to_string()))
    }
}
