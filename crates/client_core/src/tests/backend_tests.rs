use super::*;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{Actor, Boundary, HistoryEntryId},
    error::ErrorCode,
};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct ServerState {
    seen_auth: Arc<Mutex<Vec<Option<String>>>>,
}

fn sample_sector(id: &str, status: SectorStatus) -> Sector {
    Sector {
        id: SectorId::new(id),
        name: "Centro".into(),
        status,
        boundary: Boundary::default(),
        last_updated: None,
    }
}

async fn session(
    Json(req): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    if req.password != "reciclar" {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::unauthorized("invalid email or password")),
        ));
    }
    Ok(Json(SessionResponse {
        token: "tok-123".into(),
        actor: Actor::new(req.email),
        supervisor: false,
    }))
}

async fn sectors() -> Json<Vec<Sector>> {
    Json(vec![sample_sector("centro", SectorStatus::Pending)])
}

async fn set_status(
    State(state): State<ServerState>,
    Path(sector_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<StatusMutation>, (StatusCode, Json<ApiError>)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.seen_auth.lock().expect("lock").push(auth);
    if sector_id != "centro" {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found("sector does not exist")),
        ));
    }
    let sector = sample_sector(&sector_id, req.status);
    Ok(Json(StatusMutation {
        entry: HistoryEntry {
            id: HistoryEntryId(1),
            sector_id: sector.id.clone(),
            sector_name: sector.name.clone(),
            previous_status: SectorStatus::Pending,
            new_status: req.status,
            actor: None,
            timestamp: chrono::Utc::now(),
        },
        sector,
    }))
}

async fn bulk_delete(Json(req): Json<BulkDeleteRequest>) -> (StatusCode, Json<BulkDeleteReport>) {
    let (deleted, failed) = req.ids.split_at(1);
    (
        StatusCode::MULTI_STATUS,
        Json(BulkDeleteReport {
            deleted: deleted.to_vec(),
            failed: failed.to_vec(),
        }),
    )
}

async fn spawn_server() -> (String, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route("/session", post(session))
        .route("/sectors", get(sectors))
        .route("/sectors/:sector_id/status", post(set_status))
        .route("/notifications/delete", post(bulk_delete))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), state)
}

#[test]
fn rejects_non_http_server_urls() {
    assert!(HttpBackend::new("ftp://example.com").is_err());
    assert!(HttpBackend::new("not a url").is_err());
}

#[test]
fn websocket_url_follows_server_scheme() {
    let plain = HttpBackend::new("http://localhost:8080").expect("backend");
    assert_eq!(plain.ws_url().expect("ws").as_str(), "ws://localhost:8080/ws");

    let tls = HttpBackend::new("https://tracker.example/api").expect("backend");
    assert_eq!(
        tls.ws_url().expect("ws").as_str(),
        "wss://tracker.example/api/ws"
    );
}

#[tokio::test]
async fn sign_in_stores_token_and_sends_it_as_bearer() {
    let (url, state) = spawn_server().await;
    let mut backend = HttpBackend::new(&url).expect("backend");

    let session = backend
        .sign_in("driver@gmail.com", "reciclar")
        .await
        .expect("sign in");
    assert_eq!(session.actor.email, "driver@gmail.com");

    let sectors = backend.list_sectors().await.expect("sectors");
    assert_eq!(sectors.len(), 1);

    let mutation = backend
        .set_status(&SectorId::new("centro"), SectorStatus::Collected)
        .await
        .expect("set status");
    assert_eq!(mutation.sector.status, SectorStatus::Collected);

    let seen = state.seen_auth.lock().expect("lock").clone();
    assert_eq!(seen, vec![Some("Bearer tok-123".to_string())]);
}

#[tokio::test]
async fn rejected_sign_in_keeps_requests_anonymous() {
    let (url, state) = spawn_server().await;
    let mut backend = HttpBackend::new(&url).expect("backend");

    let err = backend
        .sign_in("driver@gmail.com", "wrong")
        .await
        .expect_err("bad password");
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    backend
        .set_status(&SectorId::new("centro"), SectorStatus::EnRoute)
        .await
        .expect("set status");
    let seen = state.seen_auth.lock().expect("lock").clone();
    assert_eq!(seen, vec![None]);
}

#[tokio::test]
async fn server_error_bodies_become_api_errors() {
    let (url, _state) = spawn_server().await;
    let backend = HttpBackend::new(&url).expect("backend");

    let err = backend
        .set_status(&SectorId::new("ghost"), SectorStatus::Pending)
        .await
        .expect_err("missing sector");
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.user_message(), "sector does not exist");

    let err = backend.list_history(10).await.expect_err("no route");
    assert!(matches!(err, SyncError::Transport(_)));
}

#[tokio::test]
async fn multi_status_bulk_delete_decodes_the_report() {
    let (url, _state) = spawn_server().await;
    let backend = HttpBackend::new(&url).expect("backend");
    let report = backend
        .delete_notifications(&[NotificationId(1), NotificationId(2)])
        .await
        .expect("report");
    assert!(report.is_partial());
    assert_eq!(report.deleted, vec![NotificationId(1)]);
    assert_eq!(report.failed, vec![NotificationId(2)]);
}
