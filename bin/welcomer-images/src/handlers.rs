//! HTTP handlers

use crate::AppState;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use welcomer_common::{
    ArtifactRecord, Error, ImageCreateRequest, ImageCreateResponse, ImageFormat,
};
use welcomer_render::{RenderError, RenderErrorKind};

/// Header carrying generation time in milliseconds
pub const GEN_ELAPSED_HEADER: &str = "x-gen-elapsed";

/// Length of the digest prefix used as the artifact id
const ID_DIGEST_BYTES: usize = 16;

/// Content-derived artifact id: SHA-256 over the owning guild and the
/// encoded bytes, truncated to 16 bytes, URL-safe base64.
///
/// Identical images from two guilds get distinct ids, so every file on disk
/// has exactly one index record.
#[must_use]
pub fn content_id(guild_id: u64, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(guild_id.to_le_bytes());
    hasher.update(bytes);
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..ID_DIGEST_BYTES])
}

/// Client-facing error for a failed generation, logged at a level that
/// matches its class.
fn generation_error(err: &RenderError, guild_id: u64, user_id: u64) -> Error {
    match err.kind() {
        RenderErrorKind::Resolution => {
            warn!(
                "Failed to resolve resources for guild {} user {}: {}",
                guild_id, user_id, err
            );
            Error::internal(format!("failed to resolve image resources: {err}"))
        }
        RenderErrorKind::Encode => {
            error!(
                "Failed to encode image for guild {} user {}: {}",
                guild_id, user_id, err
            );
            Error::internal(format!("failed to encode image: {err}"))
        }
        RenderErrorKind::Internal => {
            error!(
                "Failed to generate image for guild {} user {}: {}",
                guild_id, user_id, err
            );
            Error::internal(format!("failed to generate image: {err}"))
        }
    }
}

fn image_response(format: ImageFormat, bytes: impl Into<Body>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, format.content_type())],
        bytes.into(),
    )
        .into_response()
}

fn error_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ImageCreateResponse::failure(err.to_string()))).into_response()
}

fn with_elapsed(mut response: Response, start: Instant) -> Response {
    if let Ok(value) = HeaderValue::from_str(&start.elapsed().as_millis().to_string()) {
        response.headers_mut().insert(GEN_ELAPSED_HEADER, value);
    }
    response
}

pub async fn health_check() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"healthy"}"#,
    )
        .into_response()
}

/// Prometheus metrics endpoint handler
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus(),
    )
        .into_response()
}

/// `GET /images/{id}[.ext]`
///
/// Always answers 200: the stored artifact when it exists and has not
/// expired, the default image otherwise.
pub async fn get_image(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = id.split_once('.').map_or(id.as_str(), |(stem, _)| stem);

    let record = match state.store.get(id) {
        Ok(record) => record,
        Err(e) => {
            warn!("Artifact lookup for {} failed: {}", id, e);
            None
        }
    };

    let Some(record) = record.filter(|r| !r.is_default && !r.is_expired(Utc::now())) else {
        debug!("No artifact for {}, serving default image", id);
        return default_image(&state);
    };

    let path = state.config.store.store_path.join(&record.path);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let format = record.format().unwrap_or(ImageFormat::Png);
            image_response(format, bytes)
        }
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                warn!("Artifact {} is indexed but {} is missing", id, path.display());
            } else {
                error!("Failed to read artifact {}: {}", path.display(), e);
            }
            default_image(&state)
        }
    }
}

fn default_image(state: &AppState) -> Response {
    image_response(state.default_image.format, state.default_image.bytes.clone())
}

/// `POST /images`
pub async fn create_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    let Some(_guard) = state.inflight.try_enter() else {
        return error_response(&Error::ShuttingDown);
    };

    let api_key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !state.config.is_authorized(api_key) {
        return error_response(&Error::Unauthorized);
    }

    let request: ImageCreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&Error::invalid_request(e.to_string())),
    };
    if let Err(e) = request.options.validate() {
        return error_response(&e);
    }

    let encoded = match state.generator.generate(&request.options).await {
        Ok(encoded) => encoded,
        Err(e) => {
            let err = generation_error(&e, request.options.guild_id, request.options.user_id);
            return with_elapsed(error_response(&err), start);
        }
    };

    if !request.should_persist(encoded.bytes.len()) {
        return with_elapsed(image_response(encoded.format, encoded.bytes), start);
    }

    let format = encoded.format;
    let bytes = Bytes::from(encoded.bytes);
    let id = content_id(request.options.guild_id, &bytes);
    let relative = format!(
        "{}/{}.{}",
        request.options.guild_id,
        id,
        format.extension()
    );

    let path = state.config.store.store_path.join(&relative);
    if let Err(e) = write_artifact(path, bytes.clone()).await {
        error!("Failed to write artifact {}: {}", relative, e);
        return with_elapsed(
            error_response(&Error::internal(format!("failed to store image: {e}"))),
            start,
        );
    }

    let created_at = Utc::now();
    let ttl = chrono::Duration::from_std(state.config.cache.artifact_ttl())
        .unwrap_or_else(|_| chrono::Duration::days(7));
    let record = ArtifactRecord {
        id: id.clone(),
        guild_id: request.options.guild_id,
        size: bytes.len() as u64,
        path: relative,
        created_at,
        expires_at: created_at + ttl,
        is_default: false,
    };

    // The file is already servable; a failed index write is not the caller's problem
    if let Err(e) = state.store.put(&record) {
        error!("Failed to index artifact {}: {}", id, e);
    }
    state.metrics.record_persisted();
    info!(
        "Stored artifact {} for guild {} ({} bytes)",
        id, record.guild_id, record.size
    );

    let url = format!(
        "{}/images/{}.{}",
        state.config.http.bookmarkable_url.trim_end_matches('/'),
        id,
        format.extension()
    );
    with_elapsed(
        Json(ImageCreateResponse::stored(url, record)).into_response(),
        start,
    )
}

/// Write `bytes` to `path` through a uniquely named hidden sibling and a
/// rename.
///
/// Concurrent writers of the same artifact never share a temporary file; the
/// last rename wins and every writer succeeds.
async fn write_artifact(path: PathBuf, bytes: Bytes) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let Some(parent) = path.parent() else {
            return Err(std::io::Error::other("artifact path has no parent"));
        };
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::body::to_bytes;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use crate::janitor::Janitor;
    use welcomer_common::{Config, ImageMetrics};

    const API_KEY: &str = "test-key";

    struct Harness {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
    }

    fn harness(with_background: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let statics = dir.path().join("static");
        std::fs::create_dir_all(&statics).unwrap();
        if with_background {
            let png = welcomer_render::encode::solid_png(40, 12, [30, 60, 90, 255]).unwrap();
            std::fs::write(statics.join("default.png"), png).unwrap();
        }
        let default = welcomer_render::encode::solid_png(2, 2, [1, 2, 3, 255]).unwrap();
        std::fs::write(dir.path().join("default.png"), default).unwrap();

        let mut config = Config {
            api_keys: vec![API_KEY.to_string()],
            ..Config::default()
        };
        config.store.store_path = dir.path().join("store");
        config.store.database_path = dir.path().join("images.redb");
        config.store.backgrounds_path = dir.path().join("backgrounds");
        config.store.static_backgrounds_path = statics;
        config.store.fonts_path = dir.path().join("fonts");
        config.store.default_image_location = dir.path().join("default.png");
        config.http.bookmarkable_url = "https://images.example.com/".into();
        config.quantizer.speed = 30;

        let state = AppState::from_config(config, Arc::new(ImageMetrics::new())).unwrap();
        Harness {
            _dir: dir,
            state: Arc::new(state),
        }
    }

    fn create_body(force_cache: bool, filesize_limit: usize) -> String {
        create_body_for(42, force_cache, filesize_limit)
    }

    fn create_body_for(guild_id: u64, force_cache: bool, filesize_limit: usize) -> String {
        serde_json::json!({
            "force_cache": force_cache,
            "filesize_limit": filesize_limit,
            "options": {
                "guild_id": guild_id,
                "user_id": 7,
                "background": "missing-background",
                "allow_gif": false,
                "layout": 0
            }
        })
        .to_string()
    }

    fn post(body: String, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/images")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, key);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[test]
    fn test_content_id_is_stable_and_url_safe() {
        let a = content_id(1, b"hello");
        assert_eq!(a, content_id(1, b"hello"));
        assert_ne!(a, content_id(1, b"hello!"));
        assert_ne!(a, content_id(2, b"hello"));
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_generation_error_names_the_failing_stage() {
        let err = generation_error(&RenderError::Encode("palette".into()), 1, 2);
        assert_eq!(err.http_status_code(), 500);
        assert!(err.to_string().contains("failed to encode image"));

        let err = generation_error(&RenderError::FontNotFound("x".into()), 1, 2);
        assert!(err.to_string().contains("failed to resolve image resources"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_of_one_artifact_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for id in 0..10 {
            for _ in 0..8 {
                let path = dir.path().join(format!("3/{id}.png"));
                let bytes = Bytes::from(vec![id as u8; 64 * 1024]);
                handles.push(tokio::spawn(write_artifact(path, bytes)));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("3"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 10, "leftover temporary files: {names:?}");
        for id in 0..10u8 {
            let bytes = std::fs::read(dir.path().join(format!("3/{id}.png"))).unwrap();
            assert_eq!(bytes.len(), 64 * 1024);
            assert!(bytes.iter().all(|b| *b == id));
        }
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, br#"{"status":"healthy"}"#);

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("welcomer_images_created_total"));
    }

    #[tokio::test]
    async fn test_unknown_id_serves_default_image() {
        let h = harness(true);
        let response = router(Arc::clone(&h.state))
            .oneshot(get("/images/unknown.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(response).await, h.state.default_image.bytes.to_vec());
    }

    #[tokio::test]
    async fn test_create_requires_api_key() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let response = app.clone().oneshot(post(create_body(true, 0), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post(create_body(true, 0), Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let envelope: ImageCreateResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(!envelope.success);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let response = app
            .clone()
            .oneshot(post("{not json".into(), Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bad_colour = serde_json::json!({
            "options": { "text_colour": "#zzzzzz" }
        })
        .to_string();
        let response = app.oneshot(post(bad_colour, Some(API_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_small_image_is_returned_inline() {
        let h = harness(true);
        let response = router(Arc::clone(&h.state))
            .oneshot(post(create_body(false, usize::MAX), Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert!(response.headers().contains_key(GEN_ELAPSED_HEADER));

        let bytes = body_bytes(response).await;
        assert_eq!(&bytes[1..4], b"PNG");
        assert_eq!(h.state.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_large_image_is_persisted_and_readable() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let response = app
            .clone()
            .oneshot(post(create_body(false, 1), Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: ImageCreateResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(envelope.success);
        let record = envelope.image_data.unwrap();
        assert_eq!(record.guild_id, 42);
        assert_eq!(record.path, format!("42/{}.png", record.id));
        assert_eq!(
            envelope.bookmarkable_url.unwrap(),
            format!("https://images.example.com/images/{}.png", record.id)
        );
        assert_eq!(h.state.store.count().unwrap(), 1);
        assert_eq!(h.state.metrics.images_persisted(), 1);

        let first = app
            .clone()
            .oneshot(get(&format!("/images/{}.png", record.id)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_bytes(first).await;
        assert_eq!(first.len() as u64, record.size);
        assert_eq!(content_id(42, &first), record.id);

        let second = app.oneshot(get(&format!("/images/{}", record.id))).await.unwrap();
        assert_eq!(body_bytes(second).await, first);
    }

    #[tokio::test]
    async fn test_missing_file_serves_default_image() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let response = app
            .clone()
            .oneshot(post(create_body(true, usize::MAX), Some(API_KEY)))
            .await
            .unwrap();
        let envelope: ImageCreateResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        let record = envelope.image_data.unwrap();
        std::fs::remove_file(h.state.config.store.store_path.join(&record.path)).unwrap();

        let response = app.oneshot(get(&format!("/images/{}", record.id))).await.unwrap();
        assert_eq!(body_bytes(response).await, h.state.default_image.bytes.to_vec());
    }

    #[tokio::test]
    async fn test_generation_failure_is_server_error() {
        let h = harness(false);
        let response = router(Arc::clone(&h.state))
            .oneshot(post(create_body(true, 0), Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: ImageCreateResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!envelope.success);
        let message = envelope.message.unwrap();
        assert!(message.contains("failed to resolve image resources"));
        assert!(message.contains("background"));
    }

    fn janitor(h: &Harness) -> Janitor {
        Janitor::new(
            h.state.store.clone(),
            Arc::clone(&h.state.generator),
            Arc::clone(&h.state.metrics),
            h.state.config.store.store_path.clone(),
        )
    }

    async fn persist(app: &axum::Router, guild_id: u64) -> ArtifactRecord {
        let response = app
            .clone()
            .oneshot(post(create_body_for(guild_id, true, usize::MAX), Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: ImageCreateResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        envelope.image_data.unwrap()
    }

    #[tokio::test]
    async fn test_identical_images_from_two_guilds_are_indexed_separately() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let first = persist(&app, 1).await;
        let second = persist(&app, 2).await;
        assert_ne!(first.id, second.id);
        assert_eq!(first.size, second.size);
        assert_eq!(h.state.store.count().unwrap(), 2);

        let report = janitor(&h).run_cycle(Utc::now() + chrono::Duration::days(8));
        assert_eq!(report.artifacts_freed, 2);
        assert_eq!(report.files_freed, 2);
        assert_eq!(report.drift.orphan_files, 0);
        let store_path = &h.state.config.store.store_path;
        assert!(!store_path.join(&first.path).exists());
        assert!(!store_path.join(&second.path).exists());
    }

    #[tokio::test]
    async fn test_expired_artifact_serves_default_after_janitor_cycle() {
        let h = harness(true);
        let app = router(Arc::clone(&h.state));

        let record = persist(&app, 42).await;
        let stored = std::fs::read(h.state.config.store.store_path.join(&record.path)).unwrap();
        let response = app
            .clone()
            .oneshot(get(&format!("/images/{}.png", record.id)))
            .await
            .unwrap();
        assert_eq!(body_bytes(response).await, stored);

        let mut expired = record.clone();
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        h.state.store.put(&expired).unwrap();

        let report = janitor(&h).run_cycle(Utc::now());
        assert_eq!(report.artifacts_freed, 1);
        assert!(h.state.store.get(&record.id).unwrap().is_none());
        assert!(!h.state.config.store.store_path.join(&record.path).exists());

        let response = app
            .oneshot(get(&format!("/images/{}.png", record.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, h.state.default_image.bytes.to_vec());
    }

    #[tokio::test]
    async fn test_closing_rejects_writes() {
        let h = harness(true);
        h.state.inflight.close();
        let response = router(Arc::clone(&h.state))
            .oneshot(post(create_body(true, 0), Some(API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = router(Arc::clone(&h.state))
            .oneshot(get("/images/anything"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
