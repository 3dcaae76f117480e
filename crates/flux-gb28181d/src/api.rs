// HTTP 控制接口

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use flux_config::RecordingConfig;
use flux_gb28181::{
    control::{PtzRequest, RecordQuery, SubscribeRequest},
    playback::{PlaybackControlRequest, StartPlayback},
    DeviceControl, DeviceDirectory, DeviceDirectoryRef, Gb28181Error, NotificationStore, PlaybackService,
    PreviewOrchestrator, Reconciler, SignalingEngine, StartPreview, StoragePolicyRef,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub directory: DeviceDirectoryRef,
    pub engine: Arc<SignalingEngine>,
    pub preview: Arc<PreviewOrchestrator>,
    pub playback: Arc<PlaybackService>,
    pub control: Arc<DeviceControl>,
    pub reconciler: Arc<Reconciler>,
    pub policy: StoragePolicyRef,
    pub notifications: Arc<NotificationStore>,
}

/// 业务错误转成 `{"error": ...}`，状态码取自错误本身
pub struct ApiError(Gb28181Error);

impl From<Gb28181Error> for ApiError {
    fn from(e: Gb28181Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(target: "gb28181d", error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id/channels", get(list_channels))
        .route("/api/v1/devices/:device_id/ptz", post(ptz))
        .route("/api/v1/devices/:device_id/catalog", post(query_catalog))
        .route("/api/v1/devices/:device_id/info", post(query_device_info))
        .route("/api/v1/devices/:device_id/records", post(query_records))
        .route("/api/v1/preview/start", post(start_preview))
        .route("/api/v1/preview/:session_id/stop", post(stop_preview))
        .route("/api/v1/preview/sessions", get(list_previews))
        .route("/api/v1/playback/start", post(start_playback))
        .route("/api/v1/playback/:session_id/control", post(control_playback))
        .route("/api/v1/playback/:session_id/stop", post(stop_playback))
        .route("/api/v1/playback/sessions", get(list_playbacks))
        .route("/api/v1/subscriptions", post(subscribe).get(list_subscriptions))
        .route("/api/v1/subscriptions/:id", delete(unsubscribe))
        .route("/api/v1/dialogs", get(list_dialogs))
        .route("/api/v1/events/alarms", get(list_alarms))
        .route("/api/v1/events/positions", get(list_positions))
        .route("/api/v1/events/records", get(list_record_items))
        .route("/api/v1/recording/statuses", get(recording_statuses))
        .route("/api/v1/recording/policy", get(get_policy).put(put_policy))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DeviceFilter {
    device_id: Option<String>,
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sip_ready": state.engine.is_ready(),
        "sip_addr": state.engine.local_addr().map(|a| a.to_string()),
        "pending_transactions": state.engine.pending_count(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> ApiResult<Value> {
    let devices = state.directory.list_devices().await?;
    Ok(Json(json!(devices)))
}

async fn list_channels(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult<Value> {
    if state.directory.find_device(&device_id).await?.is_none() {
        return Err(Gb28181Error::not_found(format!("device not found: {}", device_id)).into());
    }
    let channels = state.directory.list_channels(&device_id).await?;
    Ok(Json(json!(channels)))
}

async fn ptz(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<PtzRequest>,
) -> ApiResult<Value> {
    let outcome = state.control.ptz(&device_id, request).await?;
    Ok(Json(json!(outcome)))
}

async fn query_catalog(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult<Value> {
    let outcome = state.control.query_catalog(&device_id).await?;
    Ok(Json(json!(outcome)))
}

async fn query_device_info(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult<Value> {
    let outcome = state.control.query_device_info(&device_id).await?;
    Ok(Json(json!(outcome)))
}

async fn query_records(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    query: Option<Json<RecordQuery>>,
) -> ApiResult<Value> {
    let query = query.map(|Json(q)| q).unwrap_or_default();
    let outcome = state.control.query_records(&device_id, query).await?;
    Ok(Json(json!(outcome)))
}

async fn start_preview(State(state): State<AppState>, Json(request): Json<StartPreview>) -> ApiResult<Value> {
    let view = state.preview.start(request).await?;
    Ok(Json(json!(view)))
}

async fn stop_preview(State(state): State<AppState>, Path(session_id): Path<String>) -> Json<Value> {
    Json(json!(state.preview.stop(&session_id).await))
}

async fn list_previews(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.preview.list()))
}

async fn start_playback(State(state): State<AppState>, Json(request): Json<StartPlayback>) -> ApiResult<Value> {
    let session = state.playback.start(request).await?;
    Ok(Json(json!(session)))
}

async fn control_playback(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PlaybackControlRequest>,
) -> ApiResult<Value> {
    let session = state.playback.control(&session_id, request).await?;
    Ok(Json(json!(session)))
}

async fn stop_playback(State(state): State<AppState>, Path(session_id): Path<String>) -> ApiResult<Value> {
    let session = state.playback.stop(&session_id).await?;
    Ok(Json(json!(session)))
}

async fn list_playbacks(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.playback.list()))
}

async fn subscribe(State(state): State<AppState>, Json(request): Json<SubscribeRequest>) -> ApiResult<Value> {
    let subscription = state.control.subscribe(request).await?;
    Ok(Json(json!(subscription)))
}

async fn unsubscribe(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Value> {
    let subscription = state.control.unsubscribe(id).await?;
    Ok(Json(json!(subscription)))
}

async fn list_subscriptions(State(state): State<AppState>, Query(filter): Query<DeviceFilter>) -> Json<Value> {
    let device_id = filter.device_id.as_deref().filter(|d| !d.trim().is_empty());
    Json(json!(state.control.subscriptions(device_id)))
}

async fn list_dialogs(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.dialogs()))
}

async fn list_alarms(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Value> {
    Json(json!(state.notifications.alarms(query.limit)))
}

async fn list_positions(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Value> {
    Json(json!(state.notifications.positions(query.limit)))
}

async fn list_record_items(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Value> {
    Json(json!(state.notifications.records(query.limit)))
}

async fn recording_statuses(State(state): State<AppState>) -> ApiResult<Value> {
    let statuses = state.reconciler.list_statuses().await?;
    Ok(Json(json!(statuses)))
}

async fn get_policy(State(state): State<AppState>) -> Json<RecordingConfig> {
    Json(state.policy.current().as_ref().clone())
}

async fn put_policy(State(state): State<AppState>, Json(config): Json<RecordingConfig>) -> ApiResult<RecordingConfig> {
    let updated = state.policy.update(config)?;
    Ok(Json(updated.as_ref().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use flux_config::{MediaConfig, PreviewConfig, SipConfig};
    use flux_gb28181::{MediaGatewayRef, MemoryDirectory, StoragePolicy, ZlmClient};
    use hyper::body::to_bytes;
    use tower::ServiceExt;

    const DEVICE_ID: &str = "34020000001320000001";

    fn seed() -> flux_config::DeviceSeed {
        flux_config::DeviceSeed {
            device_id: DEVICE_ID.to_string(),
            name: "gate".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 5062,
            transport: "UDP".to_string(),
            manufacturer: "test".to_string(),
            preferred_codec: "H264".to_string(),
            channels: vec![flux_config::ChannelSeed {
                channel_id: "34020000001310000001".to_string(),
                name: "door".to_string(),
                codec: None,
            }],
        }
    }

    /// 信令关闭、流媒体指向不可达地址
    fn test_state() -> AppState {
        let directory = Arc::new(MemoryDirectory::from_seeds(&[seed()], 3600));
        let notifications = Arc::new(NotificationStore::default());
        let media: MediaGatewayRef = Arc::new(
            ZlmClient::new(&MediaConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                request_timeout_ms: 500,
                ..MediaConfig::default()
            })
            .unwrap(),
        );
        let engine = Arc::new(SignalingEngine::new(
            SipConfig {
                enabled: false,
                ..SipConfig::default()
            },
            directory.clone(),
            notifications.clone(),
        ));
        let policy = Arc::new(StoragePolicy::new(RecordingConfig::default()));
        let preview = Arc::new(PreviewOrchestrator::new(
            directory.clone(),
            engine.clone(),
            media.clone(),
            policy.clone(),
            PreviewConfig::default(),
        ));
        let playback = Arc::new(PlaybackService::new(directory.clone(), engine.clone(), media.clone()));
        let control = Arc::new(DeviceControl::new(directory.clone(), engine.clone()));
        let reconciler = Arc::new(Reconciler::new(
            directory.clone(),
            preview.clone(),
            media,
            policy.clone(),
        ));
        AppState {
            directory,
            engine,
            preview,
            playback,
            control,
            reconciler,
            policy,
            notifications,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body()).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_devices() {
        let app = router(test_state());

        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sip_ready"], false);

        let (status, body) = call(&app, "GET", "/api/v1/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["device_id"], DEVICE_ID);

        let (status, body) = call(&app, "GET", &format!("/api/v1/devices/{}/channels", DEVICE_ID), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "door");

        let (status, body) = call(&app, "GET", "/api/v1/devices/34020000001320009999/channels", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("device not found"));
    }

    #[tokio::test]
    async fn test_preview_errors_map_to_status() {
        let app = router(test_state());

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/preview/start",
            Some(json!({ "device_id": "34020000001320009999" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // 种子设备初始离线
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/preview/start",
            Some(json!({ "device_id": DEVICE_ID, "protocol": "WEBRTC" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("offline"));

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/preview/start",
            Some(json!({ "device_id": DEVICE_ID, "protocol": "RTMP" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "POST", "/api/v1/preview/unknown/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "unknown");

        let (status, body) = call(&app, "GET", "/api/v1/preview/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_media_gateway_unreachable_is_bad_gateway() {
        let state = test_state();
        state.directory.set_online(DEVICE_ID, true).await.unwrap();
        let app = router(state);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/preview/start",
            Some(json!({ "device_id": DEVICE_ID })),
        )
        .await;
        assert_eq!(status.as_u16(), 502, "{}", body);
    }

    #[tokio::test]
    async fn test_playback_validation() {
        let state = test_state();
        state.directory.set_online(DEVICE_ID, true).await.unwrap();
        let app = router(state);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/playback/start",
            Some(json!({ "device_id": DEVICE_ID, "start_time": "2026-10-18T08:00:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("endTime"));

        let (status, _) = call(&app, "POST", "/api/v1/playback/missing/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/api/v1/playback/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_subscriptions() {
        let app = router(test_state());

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/subscriptions",
            Some(json!({ "device_id": DEVICE_ID, "event_type": "catalog", "expires": 999999 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event_type"], "Catalog");
        assert_eq!(body["expires"], 86400);
        assert_eq!(body["status"], "ACTIVE");
        let id = body["id"].as_u64().unwrap();

        let (status, body) = call(&app, "DELETE", &format!("/api/v1/subscriptions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "INACTIVE");

        let (status, _) = call(&app, "DELETE", "/api/v1/subscriptions/4242", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/v1/subscriptions?device_id={}", DEVICE_ID),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_device_commands_skipped_when_signaling_disabled() {
        let app = router(test_state());

        let (status, body) = call(&app, "POST", &format!("/api/v1/devices/{}/catalog", DEVICE_ID), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/devices/{}/records", DEVICE_ID),
            Some(json!({ "channel_id": "34020000001310000001" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");

        // 离线设备不能控制云台
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/v1/devices/{}/ptz", DEVICE_ID),
            Some(json!({ "action": "UP" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "POST", "/api/v1/devices/34020000001320009999/info", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_and_dialogs() {
        let app = router(test_state());
        for path in ["alarms", "positions", "records"] {
            let (status, body) = call(&app, "GET", &format!("/api/v1/events/{}?limit=5", path), None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!([]));
        }
        let (status, body) = call(&app, "GET", "/api/v1/dialogs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_recording_policy_and_statuses() {
        let app = router(test_state());

        let (status, body) = call(&app, "GET", "/api/v1/recording/policy", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["record_enabled"], false);

        let (status, body) = call(
            &app,
            "PUT",
            "/api/v1/recording/policy",
            Some(json!({ "record_enabled": true, "record_path": "/data/record" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["record_enabled"], true);
        assert_eq!(body["reconcile_interval_ms"], 15000);

        let (status, _) = call(
            &app,
            "PUT",
            "/api/v1/recording/policy",
            Some(json!({ "reconcile_interval_ms": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "GET", "/api/v1/recording/statuses", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["device_online"], false);
        assert_eq!(rows[0]["target_recording"], false);
        assert_eq!(rows[0]["stream_ready"], false);
    }
}
