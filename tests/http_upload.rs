mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use chunked_media::routes::routes::routes;
use common::{TestServer, payload, test_server};

const BOUNDARY: &str = "chunked-media-test-boundary";

fn app(server: &TestServer) -> Router {
    routes(&server.service).with_state(server.service.clone())
}

/// Hand-built multipart body: text fields first, then the `chunk` file part.
fn multipart(fields: &[(&str, String)], chunk: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(bytes) = chunk {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn chunk_fields(
    upload_id: &str,
    index: u32,
    total: u32,
    name: &str,
    file_type: &str,
    size: usize,
) -> Vec<(&'static str, String)> {
    vec![
        ("chunkIndex", index.to_string()),
        ("totalChunks", total.to_string()),
        ("uploadId", upload_id.to_string()),
        ("fileName", name.to_string()),
        ("fileType", file_type.to_string()),
        ("fileSize", size.to_string()),
        ("isLastChunk", (index + 1 == total).to_string()),
    ]
}

async fn post_chunk(app: &Router, body: Vec<u8>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/media/chunk")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn delete(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::delete(uri).body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn out_of_order_chunks_assemble_and_download() {
    let server = test_server();
    let app = app(&server);
    let data = payload(25);
    let pieces: Vec<&[u8]> = data.chunks(10).collect();

    for index in [2u32, 0] {
        let fields = chunk_fields("clip-1", index, 3, "holiday clip.mp4", "video/mp4", data.len());
        let (status, json) = post_chunk(&app, multipart(&fields, Some(pieces[index as usize]))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["isComplete"], false);
        assert_eq!(json["chunkIndex"], index);
    }

    let (status, json) = get(&app, "/media/status?uploadId=clip-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["uploadedChunks"], serde_json::json!([0, 2]));
    assert_eq!(json["progress"], 67);

    let fields = chunk_fields("clip-1", 1, 3, "holiday clip.mp4", "video/mp4", data.len());
    let (status, json) = post_chunk(&app, multipart(&fields, Some(pieces[1]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["isComplete"], true);

    let metadata = &json["metadata"];
    assert_eq!(metadata["mimeType"], "video/mp4");
    assert_eq!(metadata["size"], 25);
    assert_eq!(metadata["etag"], format!("{:x}", md5::compute(&data)));
    let url = metadata["url"].as_str().unwrap();
    assert!(url.starts_with("/uploads/holiday_clip_"), "{url}");
    assert!(url.ends_with(".mp4"));

    let response = app
        .clone()
        .oneshot(Request::get(url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &data[..]);

    // The record is gone once assembled.
    let (status, _) = get(&app, "/media/status?uploadId=clip-1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn out_of_range_index_is_a_validation_error() {
    let server = test_server();
    let app = app(&server);

    let fields = chunk_fields("bad-index", 3, 3, "a.mp4", "video/mp4", 30);
    let (status, json) = post_chunk(&app, multipart(&fields, Some(b"abc"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], 400);
    assert!(json["error"].as_str().unwrap().contains("chunkIndex"));

    let (status, _) = get(&app, "/media/status?uploadId=bad-index").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disallowed_type_and_missing_chunk_are_rejected() {
    let server = test_server();
    let app = app(&server);

    let fields = chunk_fields("doc", 0, 1, "notes.txt", "text/plain", 3);
    let (status, _) = post_chunk(&app, multipart(&fields, Some(b"abc"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let fields = chunk_fields("no-body", 0, 1, "a.png", "image/png", 3);
    let (status, json) = post_chunk(&app, multipart(&fields, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("chunk"));
}

#[tokio::test]
async fn conflicting_file_name_is_409() {
    let server = test_server();
    let app = app(&server);

    let fields = chunk_fields("shared", 0, 2, "first.mp4", "video/mp4", 20);
    let (status, _) = post_chunk(&app, multipart(&fields, Some(b"0123456789"))).await;
    assert_eq!(status, StatusCode::OK);

    let fields = chunk_fields("shared", 1, 2, "second.mp4", "video/mp4", 20);
    let (status, json) = post_chunk(&app, multipart(&fields, Some(b"0123456789"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("fileName"));

    let (_, json) = get(&app, "/media/status?uploadId=shared").await;
    assert_eq!(json["fileName"], "first.mp4");
    assert_eq!(json["uploadedChunks"], serde_json::json!([0]));
}

#[tokio::test]
async fn cleanup_removes_in_flight_upload() {
    let server = test_server();
    let app = app(&server);

    let fields = chunk_fields("drop-me", 0, 2, "a.webm", "video/webm", 20);
    post_chunk(&app, multipart(&fields, Some(b"0123456789"))).await;
    assert!(server.service.spool().upload_dir("drop-me").exists());

    let (status, _) = delete(&app, "/media/cleanup?uploadId=drop-me").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!server.service.spool().upload_dir("drop-me").exists());

    let (status, _) = get(&app, "/media/status?uploadId=drop-me").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = delete(&app, "/media/cleanup?uploadId=drop-me").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = delete(&app, "/media/cleanup").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn download_refuses_hidden_and_spool_entries() {
    let server = test_server();
    let app = app(&server);
    // Make sure the spool directory exists.
    let fields = chunk_fields("pending", 0, 2, "a.mp4", "video/mp4", 20);
    post_chunk(&app, multipart(&fields, Some(b"0123456789"))).await;

    for uri in ["/uploads/temp", "/uploads/.hidden", "/uploads/missing.mp4"] {
        let (status, _) = get(&app, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn probes_report_ok() {
    let server = test_server();
    let app = app(&server);

    let (status, json) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");

    let (status, json) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["checks"]["metadata_store"]["ok"], true);
    assert_eq!(json["checks"]["disk"]["ok"], true);
}
