use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use http_body_util::BodyExt;
use kiln_core::health::TracingAlertSink;
use kiln_core::{ConversionCache, HealthMonitor, ServiceConfig, TaskId, TaskState};
use serde_json::Value;
use tower::ServiceExt;

use super::build;
use crate::client::X_CLIENT_ID;
use crate::config::Config;
use crate::middleware::trace::X_TRACE_ID;
use crate::routes::convert::X_KILN_CACHE;
use crate::state::AppState;

const BOUNDARY: &str = "kiln-test-boundary";

fn state_with(tweak: impl FnOnce(&mut ServiceConfig)) -> Arc<AppState> {
    let mut service = ServiceConfig::default();
    tweak(&mut service);
    let health = Arc::new(HealthMonitor::new(&service, Arc::new(TracingAlertSink)));
    AppState::new(Config::default(), service, ConversionCache::memory_only(), health)
}

fn png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 40, 10]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// Builds a multipart/form-data upload.
#[derive(Default)]
struct Form(Vec<u8>);

impl Form {
    fn text(mut self, name: &str, value: &str) -> Self {
        self.0.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
        self
    }

    fn file(mut self, filename: &str, content: &[u8]) -> Self {
        self.0.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.0.extend_from_slice(content);
        self.0.extend_from_slice(b"\r\n");
        self
    }

    fn post(mut self, uri: &str) -> Request<Body> {
        self.0.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .header(X_CLIENT_ID, "tester")
            .body(Body::from(self.0))
            .unwrap()
    }
}

fn upload(filename: &str, content: &[u8], to: &str) -> Form {
    Form::default().file(filename, content).text("to", to)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(X_CLIENT_ID, "tester")
        .body(Body::empty())
        .unwrap()
}

async fn send(state: &Arc<AppState>, req: Request<Body>) -> Response {
    build(Arc::clone(state)).oneshot(req).await.unwrap()
}

async fn json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── Health and discovery tests ────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_score_load_and_tools() {
    let state = state_with(|_| {});
    let response = send(&state, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert!(!body["version"].as_str().unwrap_or_default().is_empty());
    assert!(body["report"]["score"]["overall"].is_number());
    assert_eq!(body["load"]["capacity"], 4);
    assert!(body["tools"]["soffice"].is_boolean());
}

#[tokio::test]
async fn formats_list_allowed_targets() {
    let state = state_with(|_| {});
    let body = json(send(&state, get("/formats")).await).await;
    let image: Vec<&str> = body["image"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(image, ["png", "jpeg", "webp", "avif", "tiff", "heif"]);
    assert!(body["document"].as_array().is_some());
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let state = state_with(|_| {});
    let body = json(send(&state, get("/api-docs/openapi.json")).await).await;
    assert!(body["paths"]["/convert/{category}"].is_object());
    assert!(body["paths"]["/tasks/{id}"].is_object());
}

#[tokio::test]
async fn trace_id_is_echoed() {
    let state = state_with(|_| {});
    let trace_id = uuid::Uuid::new_v4().to_string();
    let mut req = get("/formats");
    req.headers_mut().insert(X_TRACE_ID, trace_id.parse().unwrap());
    let response = send(&state, req).await;
    assert_eq!(response.headers()[X_TRACE_ID], trace_id.as_str());

    let response = send(&state, get("/formats")).await;
    assert!(response.headers().contains_key(X_TRACE_ID));
}

// ── Synchronous conversion tests ──────────────────────────────────────────────

#[tokio::test]
async fn convert_returns_file_and_then_hits_cache() {
    let state = state_with(|_| {});
    let input = png();

    let first = send(&state, upload("photo.png", &input, "jpeg").post("/convert/image")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(first.headers()[X_KILN_CACHE], "miss");
    let disposition = first.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_owned();
    assert!(disposition.contains("filename*=UTF-8''photo.jpg"), "{disposition}");
    let first_bytes = first.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&first_bytes[..2], &[0xFF, 0xD8]);

    let second = send(&state, upload("photo.png", &input, "jpeg").post("/convert/image")).await;
    assert_eq!(second.headers()[X_KILN_CACHE], "hit");
    let second_bytes = second.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(first_bytes, second_bytes);

    // The permit was released with the response.
    assert_eq!(state.gate.running_total(), 0);
}

#[tokio::test]
async fn unsupported_target_names_allowed_set() {
    let state = state_with(|_| {});
    let response = send(&state, upload("photo.png", &png(), "bmp").post("/convert/image")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json(response).await;
    assert_eq!(body["error"], "BadRequest");
    assert_eq!(
        body["message"],
        "unsupported target format 'bmp'; allowed: png, jpeg, webp, avif, tiff, heif"
    );
    assert_eq!(state.health.metrics().rejections.get("BadRequest"), Some(&1));
}

#[tokio::test]
async fn missing_file_is_bad_request() {
    let state = state_with(|_| {});
    let response = send(&state, Form::default().text("to", "png").post("/convert/image")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["message"], "missing file");
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let state = state_with(|c| c.max_upload_bytes = 1_024);
    let input = vec![0_u8; 2_048];
    let response = send(&state, upload("big.png", &input, "jpeg").post("/convert/image")).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json(response).await["error"], "PayloadTooLarge");
}

#[tokio::test]
async fn quota_exhaustion_is_rate_limited() {
    let state = state_with(|c| c.rate_max_per_client = 1);
    let input = png();

    let first = send(&state, upload("photo.png", &input, "png").post("/convert/image")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let throttled = send(&state, upload("photo.png", &input, "png").post("/convert/image")).await;
    assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(throttled.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(json(throttled).await["error"], "RateLimited");
}

#[tokio::test]
async fn exhausted_concurrency_is_busy_not_throttled() {
    let state = state_with(|c| {
        c.global_concurrency = 1;
        c.client_concurrency = 1;
    });
    let _held = state.gate.acquire("someone-else").unwrap();

    let response = send(&state, upload("photo.png", &png(), "jpeg").post("/convert/image")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(!response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(json(response).await["error"], "Busy");
    assert_eq!(state.health.metrics().rejections.get("Busy"), Some(&1));
}

#[tokio::test]
async fn unknown_category_is_bad_request() {
    let state = state_with(|_| {});
    let response = send(&state, upload("a.png", &png(), "png").post("/convert/audio")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── Task tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn task_lifecycle_with_poll_throttling() {
    let state = state_with(|_| {});
    let form = upload("photo.png", &png(), "jpeg").text("category", "image");
    let accepted = send(&state, form.post("/tasks")).await;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let task_id = json(accepted).await["taskId"].as_str().unwrap().to_owned();

    let first = send(&state, get(&format!("/tasks/{task_id}"))).await;
    assert_eq!(first.status(), StatusCode::OK);
    let first = json(first).await;
    assert_eq!(first["taskId"], task_id.as_str());

    let throttled = send(&state, get(&format!("/tasks/{task_id}"))).await;
    assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
    let throttled = json(throttled).await;
    assert_eq!(throttled["error"], "PollTooFrequent");
    assert_eq!(throttled["retryAfterMs"], 1_000);

    // Wait on the scheduler directly; HTTP polls would be throttled.
    let id: TaskId = task_id.parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let progress = state.scheduler.get_progress(&id).await.unwrap();
        if progress.state == TaskState::Done {
            break;
        }
        assert_ne!(progress.state, TaskState::Error, "{progress:?}");
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = send(&state, get(&format!("/tasks/{task_id}/result"))).await;
    assert_eq!(result.status(), StatusCode::OK);
    assert_eq!(result.headers()[header::CONTENT_TYPE], "image/jpeg");
    let bytes = result.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
}

#[cfg(unix)]
#[tokio::test]
async fn running_task_counts_against_the_sync_path() {
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;

    use kiln_core::tools::Tool;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("soffice");
    std::fs::write(&script, "#!/bin/sh\n[ \"$1\" = \"--version\" ] && exit 0\nexec sleep 5\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let state = state_with(|c| {
        c.global_concurrency = 1;
        c.client_concurrency = 1;
        c.tool_programs = HashMap::from([
            (Tool::Soffice, script.to_string_lossy().into_owned()),
            (Tool::Pandoc, "/nonexistent/pandoc".to_owned()),
        ]);
    });
    let form = upload("legacy.doc", b"hello", "pdf").text("category", "document");
    let accepted = send(&state, form.post("/tasks")).await;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let id: TaskId = json(accepted).await["taskId"].as_str().unwrap().parse().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let progress = state.scheduler.get_progress(&id).await.unwrap();
        if progress.state == TaskState::Running && progress.percent >= 30 {
            break;
        }
        assert!(!progress.state.is_terminal(), "{progress:?}");
        assert!(Instant::now() < deadline, "task never reached the tool");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.gate.running("tester"), 1);

    let response = send(&state, upload("photo.png", &png(), "jpeg").post("/convert/image")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(response).await["error"], "Busy");
}

#[tokio::test]
async fn unknown_tasks_are_not_found() {
    let state = state_with(|_| {});
    let response = send(&state, get(&format!("/tasks/{}", TaskId::new()))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["error"], "NotFound");

    let response = send(&state, get("/tasks/not-a-task/result")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_without_category_is_bad_request() {
    let state = state_with(|_| {});
    let response = send(&state, upload("photo.png", &png(), "jpeg").post("/tasks")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
