use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path as UrlPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    bridge::FileBridge,
    config::{loose_int_opt, PreferenceStore, Preferences},
    error::{BridgeError, ScanError},
    scanner::{ScanConfig, ScanCoordinator},
    session::ScanSession,
    types::{BridgeRequest, ScanRequest},
};

/// Everything the HTTP handlers share.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<ScanCoordinator>,
    bridge: FileBridge,
    prefs: PreferenceStore,
}

impl AppState {
    pub fn new(shared_dir: impl Into<PathBuf>, prefs: PreferenceStore, scan: ScanConfig) -> Self {
        let session = ScanSession::new();
        Self {
            coordinator: Arc::new(ScanCoordinator::new(scan, session.clone())),
            bridge: FileBridge::new(shared_dir, session),
            prefs,
        }
    }

    pub fn session(&self) -> &ScanSession {
        self.coordinator.session()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBody {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "loose_int_opt")]
    pub port_low: Option<i64>,
    #[serde(default, deserialize_with = "loose_int_opt")]
    pub port_high: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReply {
    pub open_ports: Vec<u16>,
    pub message: String,
}

/// Build the application router: JSON endpoints plus static UI assets from `ui_dir`.
pub fn router(state: AppState, ui_dir: impl AsRef<Path>) -> Router {
    let api = Router::new()
        .route("/scan", post(post_scan).delete(cancel_scan))
        .route("/status", get(get_status))
        .route("/session", get(get_session))
        .route("/config", get(get_config))
        .route("/files", get(get_files))
        .route("/download/{port}/{filename}", get(get_download))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    let static_svc = ServeDir::new(ui_dir.as_ref()).append_index_html_on_directories(true);

    api.fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState, ui_dir: impl AsRef<Path>) -> Result<()> {
    let app = router(state, ui_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn scan_error(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (status, Json(json!({ "error": message, "openPorts": [] }))).into_response()
}

fn plain_error(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (status, Json(json!({ "error": message }))).into_response()
}

async fn post_scan(State(app): State<AppState>, body: Result<Json<ScanBody>, JsonRejection>) -> Response {
    let body = match body {
        Ok(Json(b)) => b,
        Err(rej) => return scan_error(StatusCode::BAD_REQUEST, rej.body_text()),
    };
    let req = match ScanRequest::new(
        body.host.unwrap_or_default(),
        body.port_low.unwrap_or(0),
        body.port_high.unwrap_or(0),
    ) {
        Ok(req) => req,
        Err(e) => return scan_error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    info!(host = req.host(), low = req.port_low(), high = req.port_high(), "scan requested");
    app.prefs
        .record_range_logged(req.port_low(), req.port_high())
        .await;

    match app.coordinator.scan(&req).await {
        Ok(outcome) => {
            let message = if outcome.open_ports.is_empty() {
                "No open ports found"
            } else {
                "Found open ports"
            };
            let reply = ScanReply {
                open_ports: outcome.open_ports,
                message: message.to_string(),
            };
            (StatusCode::OK, Json(reply)).into_response()
        }
        Err(e @ ScanError::Cancelled) => scan_error(StatusCode::CONFLICT, e.to_string()),
        Err(e @ (ScanError::InvalidRange { .. } | ScanError::EmptyHost)) => {
            scan_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!("scan error: {e}");
            scan_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn cancel_scan(State(app): State<AppState>) -> Response {
    let cancelled = app.session().cancel_current().await;
    (StatusCode::OK, Json(json!({ "cancelled": cancelled }))).into_response()
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.session().status().await))
}

async fn get_session(State(app): State<AppState>) -> Response {
    match app.session().current().await {
        Some(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_config(State(app): State<AppState>) -> Json<Preferences> {
    Json(app.prefs.get().await)
}

async fn get_files(State(app): State<AppState>) -> Response {
    match app.bridge.list_files().await {
        Ok(files) => {
            let names: Vec<String> = files.into_iter().map(|f| f.name).collect();
            (StatusCode::OK, Json(json!({ "files": names }))).into_response()
        }
        Err(e) => {
            error!("error listing files in {}: {e}", app.bridge.root().display());
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list files")
        }
    }
}

async fn get_download(
    State(app): State<AppState>,
    UrlPath((port, filename)): UrlPath<(String, String)>,
) -> Response {
    let port = match port.parse::<u16>() {
        Ok(p) if p >= 1 => p,
        _ => return plain_error(StatusCode::BAD_REQUEST, "Invalid port number"),
    };
    let download = match app.bridge.download(&BridgeRequest::new(port, filename)).await {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    let disposition = format!("attachment; filename=\"{}\"", download.name.replace(['"', '\\'], "_"));
    let size = download.size_bytes;
    let mut res = Response::new(Body::from_stream(download.into_stream()));
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    res
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::ForbiddenPort(_) => StatusCode::BAD_REQUEST,
            BridgeError::NotFound => StatusCode::NOT_FOUND,
            BridgeError::Transfer(_) | BridgeError::Io(_) => {
                error!("error downloading file: {self}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        plain_error(status, self.to_string())
    }
}
