//! HTTPSurface (C8, §4.8): stateless request/response endpoints plus the
//! negotiate/ICE-trickle signaling routes. Grounded on the teacher's
//! `build_router`/`security_headers` shape, stripped of the auth/admin/static
//! asset surface that doesn't apply here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use lumen_media::{FaceDetector, PrivacyShield, PrivacyVerdict};
use lumen_protocol::{
    ApiError, GatewayConfig, HealthResponse, NegotiateRequest, NegotiateResponse, ProcessFrameRequest,
    ProcessFrameResponse, RecordMetadata, SpatialRequest, SpatialResponse, VerdictKind, Visibility,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use crate::collaborators::Collaborators;
use crate::gallery::{GalleryStore, NewGalleryEntry};
use crate::rate_limit::RateLimiter;
use crate::session::SessionManager;
use crate::signaling;

/// Shared application state behind every handler.
pub struct AppState {
    pub config: GatewayConfig,
    pub sessions: SessionManager,
    pub collaborators: Collaborators,
    pub shield: PrivacyShield,
    pub http_limiter: RateLimiter,
    pub idempotency: ProcessFrameCache,
    pub started_at: Instant,
}

/// Caches `/process-frame` responses by `frame_id` for a sliding 5-minute
/// window so repeated calls with the same id return identical bytes (§8).
pub struct ProcessFrameCache {
    entries: Mutex<HashMap<String, (Instant, ProcessFrameResponse)>>,
    window: Duration,
}

impl ProcessFrameCache {
    pub fn new(window: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), window }
    }

    fn get(&self, frame_id: &str) -> Option<ProcessFrameResponse> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(frame_id) {
            Some((at, response)) if at.elapsed() < self.window => Some(response.clone()),
            Some(_) => {
                entries.remove(frame_id);
                None
            }
            None => None,
        }
    }

    fn put(&self, frame_id: String, response: ProcessFrameResponse) {
        self.entries.lock().unwrap().insert(frame_id, (Instant::now(), response));
    }
}

async fn security_headers(request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("strict-transport-security", HeaderValue::from_static("max-age=63072000; includeSubDomains"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'self'; connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:"),
    );
    headers.insert("permissions-policy", HeaderValue::from_static("camera=(), microphone=(), geolocation=()"));
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state.config.server.cors_allowed_origins);

    Router::new()
        .route("/webrtc", post(negotiate))
        .route("/ws", get(ice_ws_upgrade))
        .route("/session/{id}/heartbeat", post(heartbeat))
        .route("/session/{id}", get(session_status))
        .route("/session/{id}/interrupt", post(interrupt))
        .route("/process-frame", post(process_frame))
        .route("/spatial", post(spatial))
        .route("/snapshot", post(snapshot))
        .route("/gallery", get(list_gallery))
        .route("/gallery/{id}", get(get_gallery_item))
        .route("/gallery/{id}/like", post(like_gallery_item))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(8 * 1024 * 1024))
        .layer(cors)
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

fn build_cors(allowed_origins: &[String]) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, CorsLayer};
    if allowed_origins.is_empty() {
        return CorsLayer::new();
    }
    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(tower_http::cors::Any)
}

fn client_key(headers: &HeaderMap) -> String {
    headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
}

fn error_response(err: ApiError) -> axum::response::Response {
    let status = match err.kind {
        lumen_protocol::ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        lumen_protocol::ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        lumen_protocol::ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        lumen_protocol::ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        lumen_protocol::ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        lumen_protocol::ErrorKind::AnalysisFailed => StatusCode::BAD_GATEWAY,
        lumen_protocol::ErrorKind::StorageFailed => StatusCode::INTERNAL_SERVER_ERROR,
        lumen_protocol::ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
        lumen_protocol::ErrorKind::PrivacyBlock => StatusCode::FORBIDDEN,
        lumen_protocol::ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        lumen_protocol::ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err)).into_response()
}

async fn negotiate(State(state): State<Arc<AppState>>, Json(req): Json<NegotiateRequest>) -> axum::response::Response {
    match state.sessions.create_session(&req.sdp).await {
        Ok((session_id, answer_sdp)) => {
            Json(NegotiateResponse { sdp: answer_sdp, kind: "answer".to_string(), session_id }).into_response()
        }
        Err(e @ crate::session::SessionError::MalformedOffer(_)) => {
            tracing::warn!("negotiate failed: {e}");
            error_response(ApiError::bad_request(e.to_string()))
        }
        Err(e @ crate::session::SessionError::AllocationFailed(_)) => {
            tracing::warn!("negotiate failed: {e}");
            error_response(ApiError::busy(e.to_string()))
        }
    }
}

#[derive(Deserialize)]
struct IceWsQuery {
    session_id: Uuid,
}

async fn ice_ws_upgrade(State(state): State<Arc<AppState>>, Query(query): Query<IceWsQuery>, ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(move |socket| async move {
        signaling::handle_ice_ws(socket, query.session_id, &state.sessions).await;
    })
}

/// Explicit liveness ping for clients whose media flow can legitimately go
/// quiet (e.g. camera-off, mic-muted) without the session being idle.
async fn heartbeat(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> axum::response::Response {
    if state.sessions.heartbeat(id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(ApiError::session_not_found())
    }
}

/// Observability endpoint (C10): exposes the FSM's current conversation
/// state for a live session, without requiring a client-side WS subscription.
async fn session_status(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> axum::response::Response {
    let Some(session) = state.sessions.get(id).await else {
        return error_response(ApiError::session_not_found());
    };
    Json(json!({
        "id": id,
        "conversation_state": format!("{:?}", session.conversation_state()),
        "transition_count": session.transition_count(),
    }))
    .into_response()
}

/// Explicit client-initiated interrupt (e.g. a "stop talking" button),
/// distinct from audio-energy barge-in detection (§4.7).
async fn interrupt(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> axum::response::Response {
    if state.sessions.interrupt(id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(ApiError::session_not_found())
    }
}

async fn process_frame(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ProcessFrameRequest>,
) -> axum::response::Response {
    if let Err(retry_after_ms) = state.http_limiter.check(&client_key(&headers)) {
        return error_response(ApiError::rate_limited(retry_after_ms));
    }

    if let Some(cached) = state.idempotency.get(&req.frame_id) {
        return Json(cached).into_response();
    }

    let Ok(jpeg) = base64::engine::general_purpose::STANDARD.decode(&req.image_data) else {
        return error_response(ApiError::bad_request("image_data is not valid base64"));
    };

    let verdict = match state.shield.evaluate(&jpeg).await {
        Ok(v) => v,
        Err(e) => return error_response(ApiError::analysis_failed(e.to_string())),
    };

    let response = match verdict {
        PrivacyVerdict::Safe => ProcessFrameResponse { processed_image: None, blur_applied: false, face_count: 0, verdict: VerdictKind::Safe },
        PrivacyVerdict::Blurred { processed_jpeg, face_count } => ProcessFrameResponse {
            processed_image: Some(base64::engine::general_purpose::STANDARD.encode(processed_jpeg)),
            blur_applied: true,
            face_count,
            verdict: VerdictKind::Blurred,
        },
        PrivacyVerdict::Blocked { face_count, .. } => {
            ProcessFrameResponse { processed_image: None, blur_applied: false, face_count, verdict: VerdictKind::Blocked }
        }
    };

    state.idempotency.put(req.frame_id, response.clone());
    Json(response).into_response()
}

async fn spatial(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<SpatialRequest>) -> axum::response::Response {
    if let Err(retry_after_ms) = state.http_limiter.check(&client_key(&headers)) {
        return error_response(ApiError::rate_limited(retry_after_ms));
    }

    let Ok(jpeg) = base64::engine::general_purpose::STANDARD.decode(&req.image) else {
        return error_response(ApiError::bad_request("image is not valid base64"));
    };

    let session = match req.session_id {
        Some(id) => state.sessions.get(id).await,
        None => None,
    };
    if let Some(session) = &session {
        session.fsm.write().await.apply(crate::fsm::Trigger::SpatialQuery);
    }

    let result = state.collaborators.analyzer.analyze(&jpeg, req.x, req.y, req.width, req.height).await;

    if let Some(session) = &session {
        session.fsm.write().await.apply(crate::fsm::Trigger::SpatialQueryComplete);
    }

    match result {
        Ok(surface) => Json(SpatialResponse { surface }).into_response(),
        Err(e) => error_response(ApiError::analysis_failed(e.to_string())),
    }
}

#[derive(Deserialize)]
struct SnapshotRequest {
    owner_token: String,
    title: String,
    description: String,
    before_image: String,
    after_image: String,
    metadata: RecordMetadata,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_visibility")]
    visibility: Visibility,
}

fn default_visibility() -> Visibility {
    Visibility::Private
}

async fn snapshot(State(state): State<Arc<AppState>>, Json(req): Json<SnapshotRequest>) -> axum::response::Response {
    let Ok(before_jpeg) = base64::engine::general_purpose::STANDARD.decode(&req.before_image) else {
        return error_response(ApiError::bad_request("before_image is not valid base64"));
    };
    let Ok(after_jpeg) = base64::engine::general_purpose::STANDARD.decode(&req.after_image) else {
        return error_response(ApiError::bad_request("after_image is not valid base64"));
    };
    let thumbnail_jpeg = match lumen_media::prepare_snapshot(&after_jpeg, 256, 70) {
        Ok(jpeg) => jpeg,
        Err(e) => return error_response(ApiError::bad_request(format!("after_image is not a valid jpeg: {e}"))),
    };

    let store = GalleryStore::new(&*state.collaborators.blob_store, &*state.collaborators.record_store, state.config.gallery.signed_url_ttl_secs);
    let entry = NewGalleryEntry {
        owner_token: req.owner_token,
        title: req.title,
        description: req.description,
        before_jpeg,
        after_jpeg,
        thumbnail_jpeg,
        metadata: req.metadata,
        tags: req.tags,
        visibility: req.visibility,
    };

    match store.save(entry).await {
        Ok(record) => Json(json!({ "id": record.id })).into_response(),
        Err(e) => error_response(ApiError::storage_failed(e.to_string())),
    }
}

#[derive(Deserialize)]
struct GalleryQuery {
    #[serde(default = "default_gallery_limit")]
    limit: usize,
}

fn default_gallery_limit() -> usize {
    20
}

async fn list_gallery(State(state): State<Arc<AppState>>, Query(query): Query<GalleryQuery>) -> axum::response::Response {
    let store = GalleryStore::new(&*state.collaborators.blob_store, &*state.collaborators.record_store, state.config.gallery.signed_url_ttl_secs);
    match store.list_public(query.limit).await {
        Ok(items) => Json(json!({ "items": items })).into_response(),
        Err(e) => error_response(ApiError::storage_failed(e.to_string())),
    }
}

async fn get_gallery_item(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> axum::response::Response {
    let store = GalleryStore::new(&*state.collaborators.blob_store, &*state.collaborators.record_store, state.config.gallery.signed_url_ttl_secs);
    let _ = store.increment_views(id).await;
    match store.get(id).await {
        Ok(record) => Json(record).into_response(),
        Err(crate::gallery::GalleryError::NotFound) => error_response(ApiError::new(lumen_protocol::ErrorKind::SessionNotFound, "gallery record not found")),
        Err(e) => error_response(ApiError::storage_failed(e.to_string())),
    }
}

async fn like_gallery_item(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> axum::response::Response {
    let store = GalleryStore::new(&*state.collaborators.blob_store, &*state.collaborators.record_store, state.config.gallery.signed_url_ttl_secs);
    match store.toggle_like(id).await {
        Ok(likes) => Json(json!({ "likes": likes })).into_response(),
        Err(crate::gallery::GalleryError::NotFound) => error_response(ApiError::new(lumen_protocol::ErrorKind::SessionNotFound, "gallery record not found")),
        Err(e) => error_response(ApiError::storage_failed(e.to_string())),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let started = Instant::now();
    let response_time_ms = started.duration_since(state.started_at).as_millis() as u64 % 1000;
    Json(HealthResponse { status: "ok".to_string(), response_time_ms }).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let session_count = state.sessions.session_count().await;
    (StatusCode::OK, format!("lumen_gateway_active_sessions {session_count}\n")).into_response()
}

/// Proxies the shared detector collaborator for `PrivacyShield::new`'s `Box`
/// ownership without cloning the underlying `Arc`.
pub struct SharedDetector(pub Arc<dyn FaceDetector>);

#[async_trait::async_trait]
impl FaceDetector for SharedDetector {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<lumen_media::FaceRect>, lumen_media::DetectorError> {
        self.0.detect(jpeg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::collaborators::fakes::{FakeFaceDetector, FakeSurfaceAnalyzer, FakeUpstreamClient, InMemoryBlobStore, InMemoryRecordStore};

    fn sample_jpeg() -> Vec<u8> {
        let rgb = vec![200u8; 16 * 16 * 3];
        lumen_media::encode_jpeg(16, 16, &rgb, 80).unwrap()
    }

    fn test_state() -> Arc<AppState> {
        let config: GatewayConfig = toml::from_str("").unwrap();
        let detector: Arc<dyn FaceDetector> = Arc::new(FakeFaceDetector::default());
        let collaborators = Collaborators {
            upstream: Arc::new(FakeUpstreamClient),
            analyzer: Arc::new(FakeSurfaceAnalyzer),
            blob_store: Arc::new(InMemoryBlobStore::default()),
            record_store: Arc::new(InMemoryRecordStore::default()),
        };
        let shield = PrivacyShield::new(Box::new(SharedDetector(detector.clone())), config.media.blur_radius_min, config.media.crowd_threshold);
        let sessions = SessionManager::new(
            config.clone(),
            Collaborators {
                upstream: collaborators.upstream.clone(),
                analyzer: collaborators.analyzer.clone(),
                blob_store: collaborators.blob_store.clone(),
                record_store: collaborators.record_store.clone(),
            },
            detector,
        );
        Arc::new(AppState {
            http_limiter: RateLimiter::new(config.rate_limit.requests_per_minute),
            idempotency: ProcessFrameCache::new(Duration::from_secs(300)),
            started_at: Instant::now(),
            config,
            sessions,
            collaborators,
            shield,
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(test_state());
        let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn process_frame_is_idempotent_for_same_frame_id() {
        let app = build_router(test_state());
        let image_data = base64::engine::general_purpose::STANDARD.encode(sample_jpeg());
        let request_body = serde_json::to_vec(&ProcessFrameRequest { image_data, frame_id: "frame-1".to_string(), timestamp: 0 }).unwrap();

        let req = || Request::builder().method("POST").uri("/process-frame").header("content-type", "application/json").body(Body::from(request_body.clone())).unwrap();

        let first = app.clone().oneshot(req()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first_body = body_json(first).await;

        let second = app.oneshot(req()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let second_body = body_json(second).await;

        assert_eq!(first_body, second_body);
    }

    #[tokio::test]
    async fn process_frame_rejects_invalid_base64() {
        let app = build_router(test_state());
        let request_body = serde_json::to_vec(&ProcessFrameRequest { image_data: "not-base64!!".to_string(), frame_id: "frame-x".to_string(), timestamp: 0 }).unwrap();
        let response = app
            .oneshot(Request::builder().method("POST").uri("/process-frame").header("content-type", "application/json").body(Body::from(request_body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn spatial_delegates_to_analyzer() {
        let app = build_router(test_state());
        let request_body = serde_json::to_vec(&SpatialRequest {
            image: base64::engine::general_purpose::STANDARD.encode(sample_jpeg()),
            x: 0,
            y: 0,
            width: 16,
            height: 16,
            kind: None,
            session_id: None,
        })
        .unwrap();
        let response = app
            .oneshot(Request::builder().method("POST").uri("/spatial").header("content-type", "application/json").body(Body::from(request_body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["surface"]["material"], "granite");
    }

    #[tokio::test]
    async fn snapshot_then_gallery_round_trips() {
        let app = build_router(test_state());
        let jpeg_b64 = base64::engine::general_purpose::STANDARD.encode(sample_jpeg());
        let snapshot_body = serde_json::json!({
            "owner_token": "owner-1",
            "title": "Oak counter",
            "description": "kitchen",
            "before_image": jpeg_b64,
            "after_image": jpeg_b64,
            "metadata": RecordMetadata { surface_type: "countertop".into(), material: "oak".into(), color: "brown".into(), bounding_box: [0, 0, 500, 500] },
            "tags": ["kitchen"],
            "visibility": "public",
        });

        let response = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/snapshot").header("content-type", "application/json").body(Body::from(serde_json::to_vec(&snapshot_body).unwrap())).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap();

        let list_response = app.clone().oneshot(Request::builder().uri("/gallery").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(list_response.status(), StatusCode::OK);
        let listed = body_json(list_response).await;
        assert_eq!(listed["items"].as_array().unwrap().len(), 1);

        let like_response = app.oneshot(Request::builder().method("POST").uri(format!("/gallery/{id}/like")).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(like_response.status(), StatusCode::OK);
        let liked = body_json(like_response).await;
        assert_eq!(liked["likes"], 1);
    }

    #[tokio::test]
    async fn gallery_get_missing_id_is_not_found() {
        let app = build_router(test_state());
        let response = app.oneshot(Request::builder().uri(format!("/gallery/{}", Uuid::new_v4())).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_status_unknown_id_is_not_found() {
        let app = build_router(test_state());
        let response = app.oneshot(Request::builder().uri(format!("/session/{}", Uuid::new_v4())).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
