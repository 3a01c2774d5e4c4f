use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    authenticate, delete_notification, delete_notifications, get_sector, list_history,
    list_notifications, list_sectors, load_feature_collection, post_notification, purge_history,
    set_status, AccessPolicy, ApiContext,
};
use shared::{
    domain::{Actor, HistoryEntry, NotificationId, NotificationReport, Sector, SectorId},
    error::{ApiError, ErrorCode},
    geo::FeatureCollection,
    protocol::{
        BulkDeleteReport, BulkDeleteRequest, NotificationDraft, PurgeResponse, ServerEvent,
        SessionRequest, SessionResponse, SetStatusRequest, StatusMutation,
    },
};
use storage::{SectorStore, Storage};
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod change_bridge;
mod config;
mod journal_tail;
mod session;

use app_state::AppState;
use change_bridge::spawn_change_bridge;
use config::{load_settings, prepare_database_url};
use journal_tail::spawn_journal_tail;
use session::{mint_session_token, verify_session_token, SessionConfig};

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const JOURNAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let mut api = ApiContext::from_storage(
        storage.clone(),
        AccessPolicy {
            supervisor_domain: settings.supervisor_domain.clone(),
        },
    );
    if let Some(path) = settings.geometry_fallback_path.as_deref() {
        api = api.with_geometry_fallback(path);
    }

    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let _bridge = spawn_change_bridge(storage.subscribe(), events.clone());
    let _journal = spawn_journal_tail(storage.clone(), events.clone(), JOURNAL_POLL_INTERVAL).await?;

    let state = AppState {
        api,
        storage,
        sessions: SessionConfig {
            secret: settings.session_secret,
            ttl_seconds: settings.session_ttl_seconds,
        },
        events,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/session", post(create_session))
        .route("/sectors", get(http_list_sectors))
        .route("/sectors/geojson", get(http_sectors_geojson))
        .route("/sectors/:sector_id", get(http_get_sector))
        .route("/sectors/:sector_id/status", post(http_set_status))
        .route(
            "/history",
            get(http_list_history).delete(http_purge_history),
        )
        .route(
            "/notifications",
            get(http_list_notifications).post(http_post_notification),
        )
        .route("/notifications/delete", post(http_delete_notifications))
        .route("/notifications/:notification_id", delete(http_delete_notification))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::PartialBulkFailure => StatusCode::MULTI_STATUS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

/// Unreadable or ill-typed bodies are the caller's fault.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| reject(ApiError::invalid_argument(rejection.body_text())))
}

/// Resolves the bearer token, if any. No header means no actor; a header
/// that does not verify is rejected.
fn request_actor(state: &AppState, headers: &HeaderMap) -> Result<Option<Actor>, HttpError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| reject(ApiError::unauthorized("malformed authorization header")))?;
    verify_session_token(&state.sessions, token)
        .map(Some)
        .map_err(|err| {
            warn!(error = %err, "rejected session token");
            reject(ApiError::unauthorized("session expired or invalid"))
        })
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.storage.health_check().await.map_err(|e| {
        reject(ApiError::store_unavailable(e.to_string()))
    })?;
    Ok("ok")
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, HttpError> {
    let req = json_body(payload)?;
    let actor = authenticate(&state.api, &req.email, &req.password)
        .await
        .map_err(reject)?;
    let token = mint_session_token(&state.sessions, &actor).map_err(|e| {
        reject(ApiError::new(
            ErrorCode::Internal,
            format!("token mint failed: {e}"),
        ))
    })?;
    let supervisor = state.api.is_supervisor(&actor);
    info!(actor = %actor.email, supervisor, "session opened");
    Ok(Json(SessionResponse {
        token,
        actor,
        supervisor,
    }))
}

async fn http_list_sectors(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Sector>>, HttpError> {
    let sectors = list_sectors(&state.api).await.map_err(reject)?;
    Ok(Json(sectors))
}

async fn http_sectors_geojson(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FeatureCollection>, HttpError> {
    let collection = load_feature_collection(&state.api).await.map_err(reject)?;
    Ok(Json(collection))
}

async fn http_get_sector(
    State(state): State<Arc<AppState>>,
    Path(sector_id): Path<String>,
) -> Result<Json<Sector>, HttpError> {
    let sector = get_sector(&state.api, &SectorId(sector_id))
        .await
        .map_err(reject)?;
    Ok(Json(sector))
}

async fn http_set_status(
    State(state): State<Arc<AppState>>,
    Path(sector_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<SetStatusRequest>, JsonRejection>,
) -> Result<Json<StatusMutation>, HttpError> {
    let actor = request_actor(&state, &headers)?;
    let req = json_body(payload)?;
    let mutation = set_status(&state.api, &SectorId(sector_id), req.status, actor.as_ref())
        .await
        .map_err(reject)?;
    let _ = state.events.send(ServerEvent::HistoryAppended {
        entry: mutation.entry.clone(),
    });
    Ok(Json(mutation))
}

async fn http_list_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<HistoryEntry>>, HttpError> {
    let actor = request_actor(&state, &headers)?;
    let entries = list_history(&state.api, actor.as_ref(), q.limit)
        .await
        .map_err(reject)?;
    Ok(Json(entries))
}

async fn http_purge_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PurgeResponse>, HttpError> {
    let actor = request_actor(&state, &headers)?;
    let purged = purge_history(&state.api, actor.as_ref())
        .await
        .map_err(reject)?;
    let _ = state.events.send(ServerEvent::HistoryPurged { purged });
    Ok(Json(PurgeResponse { purged }))
}

async fn http_list_notifications(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<NotificationReport>>, HttpError> {
    let reports = list_notifications(&state.api, q.limit)
        .await
        .map_err(reject)?;
    Ok(Json(reports))
}

async fn http_post_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<NotificationDraft>, JsonRejection>,
) -> Result<Json<NotificationReport>, HttpError> {
    let actor = request_actor(&state, &headers)?;
    let draft = json_body(payload)?;
    let report = post_notification(&state.api, actor.as_ref(), draft)
        .await
        .map_err(reject)?;
    let _ = state.events.send(ServerEvent::NotificationPosted {
        report: report.clone(),
    });
    Ok(Json(report))
}

async fn http_delete_notification(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    let actor = request_actor(&state, &headers)?;
    let notification_id = NotificationId(notification_id);
    delete_notification(&state.api, actor.as_ref(), notification_id)
        .await
        .map_err(reject)?;
    let _ = state
        .events
        .send(ServerEvent::NotificationDeleted { notification_id });
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<BulkDeleteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BulkDeleteReport>), HttpError> {
    let actor = request_actor(&state, &headers)?;
    let req = json_body(payload)?;
    let report = delete_notifications(&state.api, actor.as_ref(), &req.ids)
        .await
        .map_err(reject)?;
    for notification_id in &report.deleted {
        let _ = state.events.send(ServerEvent::NotificationDeleted {
            notification_id: *notification_id,
        });
    }
    let status = if report.is_partial() {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                // The client cannot replay what it missed; tell it to reload.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket subscriber lagged");
                    ServerEvent::Resync { skipped }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
