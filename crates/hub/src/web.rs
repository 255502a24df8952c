//! HTTP side of the hub: the provisioning upload callback plus a thin
//! read/actuation API. Runs beside the consume loop; a blocked bus
//! call never stalls these handlers.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::conn::{BusHandle, PublishError};
use crate::db::Db;
use crate::provision::{self, UploadError};
use crate::state::SharedState;

#[derive(Clone)]
pub(crate) struct AppState {
    pub db: Db,
    pub bus: BusHandle,
    pub shared: SharedState,
    pub settings: Arc<Settings>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadError::Unauthorized => StatusCode::FORBIDDEN,
            UploadError::FilenameMismatch { .. } | UploadError::BadFile(_) => {
                StatusCode::BAD_REQUEST
            }
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

fn bad_request(detail: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "detail": detail })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/mqtt/upload-file", post(upload_file))
        .route("/api/status", get(api_status))
        .route("/api/boards", get(list_boards))
        .route("/api/boards/{topic}/relay/{name}", post(toggle_relay))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

async fn list_boards(State(app): State<AppState>) -> Response {
    match app.db.list_controllers().await {
        Ok(boards) => {
            let count = boards.len();
            Json(json!({ "data": boards, "count": count })).into_response()
        }
        Err(e) => {
            error!(error = %e, "listing controllers failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "database error" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct RelayQuery {
    state: String,
}

/// Actuate a relay by publishing the plain state string on the
/// controller's command topic. Rejected outright when the bus is down.
async fn toggle_relay(
    State(app): State<AppState>,
    Path((topic, name)): Path<(String, String)>,
    Query(query): Query<RelayQuery>,
) -> Response {
    let command_topic = format!("{topic}/set/{name}");
    match app
        .bus
        .publish(&command_topic, query.state.clone().into_bytes())
        .await
    {
        Ok(()) => {
            info!(topic = %command_topic, state = %query.state, "relay command published");
            Json(json!({ "message": format!("Relay {name} set to {}", query.state) }))
                .into_response()
        }
        Err(PublishError::NotConnected) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "bus connection is not established" })),
        )
            .into_response(),
        Err(e) => {
            error!(topic = %command_topic, error = %e, "relay publish failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Provisioning callback: a controller posts `topic`, `secret_key`
/// and the requested file as multipart form data.
async fn upload_file(State(app): State<AppState>, mut multipart: Multipart) -> Response {
    let mut topic: Option<String> = None;
    let mut secret_key: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(&format!("malformed multipart body: {e}")),
        };
        let name = field.name().map(ToOwned::to_owned);
        match name.as_deref() {
            Some("topic") => match field.text().await {
                Ok(text) => topic = Some(text),
                Err(e) => return bad_request(&format!("unreadable topic field: {e}")),
            },
            Some("secret_key") => match field.text().await {
                Ok(text) => secret_key = Some(text),
                Err(e) => return bad_request(&format!("unreadable secret_key field: {e}")),
            },
            Some("file") => {
                let filename = field.file_name().map(ToOwned::to_owned);
                let Some(filename) = filename else {
                    return bad_request("file field carries no filename");
                };
                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, bytes.to_vec())),
                    Err(e) => return bad_request(&format!("unreadable file field: {e}")),
                }
            }
            other => {
                warn!(field = ?other, "ignoring unexpected multipart field");
            }
        }
    }

    let (Some(topic), Some(secret_key), Some((filename, bytes))) = (topic, secret_key, file)
    else {
        return bad_request("topic, secret_key and file fields are required");
    };

    match provision::consume_upload(&app.db, &topic, &secret_key, &filename, &bytes).await {
        Ok(message) => {
            // Only a validated upload is kept on disk; unauthenticated
            // or mismatched posts must leave no trace.
            if let Err(e) = save_upload(&app.settings.hub.data_dir, &topic, &filename, &bytes).await
            {
                error!(topic = %topic, filename = %filename, error = %e, "saving upload failed");
            }
            let mut st = app.shared.write().await;
            st.record_provision(message.clone());
            Json(json!({ "message": message })).into_response()
        }
        Err(e) => {
            warn!(topic = %topic, filename = %filename, error = %e, "upload rejected");
            e.into_response()
        }
    }
}

async fn save_upload(
    data_dir: &str,
    topic: &str,
    filename: &str,
    bytes: &[u8],
) -> anyhow::Result<()> {
    // The filename is client-supplied; anything that could leave the
    // per-topic directory is refused.
    if filename.contains(['/', '\\']) || filename == ".." || filename.is_empty() {
        anyhow::bail!("unsafe filename: {filename:?}");
    }
    let sanitized = topic.replace('/', "_");
    let dir = std::path::Path::new(data_dir).join(sanitized);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(filename), bytes).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub(crate) async fn serve(state: AppState) {
    let port = state.settings.web.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
