//! HTTP handlers for the chunked upload endpoints.
//!
//! The chunk body is streamed straight from the multipart field into the
//! spool; only the small text fields are buffered.

use crate::{
    errors::AppError,
    models::chunk::{CHUNK_FIELD, ChunkFields, ChunkUploadResponse, UploadIdQuery, UploadStatusResponse},
    services::{media::guess_mime_type, upload_service::UploadService, validation::sanitize_file_name},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use std::io::{self, ErrorKind};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// `POST /media/chunk`
///
/// Text fields must precede the `chunk` field; anything after it is ignored.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let mut fields = ChunkFields::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name != CHUNK_FIELD {
            let value = field.text().await?;
            fields.set(&name, value);
            continue;
        }

        // Reject bad declarations before reading a single body byte.
        service.validate(&fields)?;

        let body = field.map_err(|err| io::Error::new(ErrorKind::Other, err));
        let response = service.receive_chunk(&fields, body).await?;
        return Ok(Json(response));
    }

    Err(AppError::bad_request(format!(
        "missing `{}` file field",
        CHUNK_FIELD
    )))
}

/// `GET /media/status?uploadId=`
pub async fn upload_status(
    State(service): State<UploadService>,
    Query(query): Query<UploadIdQuery>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let upload_id = require_upload_id(query)?;
    let status = service.upload_status(&upload_id).await?;
    Ok(Json(status))
}

/// `DELETE /media/cleanup?uploadId=`
pub async fn cleanup_upload(
    State(service): State<UploadService>,
    Query(query): Query<UploadIdQuery>,
) -> Result<StatusCode, AppError> {
    let upload_id = require_upload_id(query)?;
    service.cleanup_upload(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /uploads/{name}`
///
/// Streams an assembled artifact or poster frame back to the caller.
pub async fn get_upload(
    State(service): State<UploadService>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    if name.is_empty() || name.starts_with('.') || sanitize_file_name(&name) != name {
        return Err(AppError::not_found(format!("upload `{}` not found", name)));
    }

    let path = service.pipeline().uploads_dir().join(&name);
    let file = File::open(&path).await.map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            AppError::not_found(format!("upload `{}` not found", name))
        } else {
            AppError::internal(err.to_string())
        }
    })?;
    let meta = file
        .metadata()
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    // The temp spool lives under the uploads directory too.
    if !meta.is_file() {
        return Err(AppError::not_found(format!("upload `{}` not found", name)));
    }
    let len = meta.len();

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(guess_mime_type(&name)) {
        headers.insert(header::CONTENT_TYPE, value);
    }

    Ok(response.into_response())
}

fn require_upload_id(query: UploadIdQuery) -> Result<String, AppError> {
    match query.upload_id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(AppError::bad_request("missing `uploadId` query parameter")),
    }
}
