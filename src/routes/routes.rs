//! Defines routes for the chunked upload service.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /media/chunk`              - receive one multipart chunk
//!   - `GET    /media/status?uploadId=`   - progress of an in-flight upload
//!   - `DELETE /media/cleanup?uploadId=`  - drop an in-flight upload
//!
//! - **Artifacts**
//!   - `GET    /uploads/{name}`           - stream an assembled file or poster frame
//!
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{cleanup_upload, get_upload, upload_chunk, upload_status},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Multipart overhead allowed on top of the largest accepted chunk.
const MULTIPART_SLACK: usize = 64 * 1024;

/// Build the router for all upload routes.
///
/// The router carries shared state (`UploadService`) to all handlers. The
/// request body limit follows the service's chunk size limit.
pub fn routes(service: &UploadService) -> Router<UploadService> {
    let body_limit = usize::try_from(service.rules().max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_SLACK);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload endpoints
        .route(
            "/media/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/media/status", get(upload_status))
        .route("/media/cleanup", delete(cleanup_upload))
        // assembled artifacts
        .route("/uploads/{name}", get(get_upload))
}
