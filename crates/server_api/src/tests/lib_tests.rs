use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Boundary, LngLat},
    error::ErrorCode,
    geo::Geometry,
    protocol::ChangeKind,
};

fn sector(id: &str, name: &str, status: SectorStatus) -> Sector {
    Sector {
        id: SectorId::new(id),
        name: name.to_string(),
        status,
        boundary: Boundary(vec![
            LngLat { lng: 0.0, lat: 0.0 },
            LngLat { lng: 1.0, lat: 0.0 },
            LngLat { lng: 1.0, lat: 1.0 },
        ]),
        last_updated: None,
    }
}

async fn seeded_storage() -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_sector(&sector("a", "Barrio A", SectorStatus::Pending))
        .await
        .expect("a");
    storage
        .upsert_sector(&sector("b", "Barrio B", SectorStatus::Collected))
        .await
        .expect("b");
    storage
}

async fn setup() -> (ApiContext, Storage) {
    let storage = seeded_storage().await;
    (
        ApiContext::from_storage(storage.clone(), AccessPolicy::default()),
        storage,
    )
}

fn driver() -> Actor {
    Actor::new("driver@gmail.com")
}

fn supervisor() -> Actor {
    Actor::new("jefa@ecoruta.com")
}

struct FailingHistory;

#[async_trait]
impl HistoryLog for FailingHistory {
    async fn append_history(&self, _entry: NewHistoryEntry) -> Result<HistoryEntry> {
        Err(anyhow!("history collection unreachable"))
    }

    async fn list_recent_history(&self, _limit: u32) -> Result<Vec<HistoryEntry>> {
        Ok(Vec::new())
    }

    async fn purge_history(&self) -> Result<u64> {
        Ok(0)
    }
}

struct RejectingBoard {
    inner: Storage,
    rejected: NotificationId,
}

#[async_trait]
impl NotificationStore for RejectingBoard {
    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationReport> {
        self.inner.insert_notification(notification).await
    }

    async fn list_recent_notifications(&self, limit: u32) -> Result<Vec<NotificationReport>> {
        self.inner.list_recent_notifications(limit).await
    }

    async fn delete_notification(&self, notification_id: NotificationId) -> Result<bool> {
        if notification_id == self.rejected {
            return Err(anyhow!("permission denied"));
        }
        self.inner.delete_notification(notification_id).await
    }
}

#[tokio::test]
async fn set_status_updates_store_and_appends_history() {
    let (ctx, storage) = setup().await;
    let mut feed = storage.subscribe();
    let actor = driver();

    let mutation = set_status(&ctx, &SectorId::new("a"), SectorStatus::EnRoute, Some(&actor))
        .await
        .expect("set status");
    assert_eq!(mutation.sector.status, SectorStatus::EnRoute);
    assert!(mutation.sector.last_updated.is_some());
    assert_eq!(mutation.entry.previous_status, SectorStatus::Pending);
    assert_eq!(mutation.entry.new_status, SectorStatus::EnRoute);
    assert_eq!(mutation.entry.sector_name, "Barrio A");
    assert_eq!(mutation.entry.actor.as_deref(), Some("driver@gmail.com"));

    let stored = storage
        .get_sector(&SectorId::new("a"))
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.status, SectorStatus::EnRoute);

    let history = storage.list_recent_history(50).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].previous_status, SectorStatus::Pending);
    assert_eq!(history[0].new_status, SectorStatus::EnRoute);

    let change = feed.recv().await.expect("change");
    assert_eq!(change.kind, ChangeKind::Modified);
    assert_eq!(change.sector.id, SectorId::new("a"));
}

#[tokio::test]
async fn set_status_on_missing_sector_is_not_found_without_history() {
    let (ctx, storage) = setup().await;
    let err = set_status(&ctx, &SectorId::new("ghost"), SectorStatus::Collected, None)
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::NotFound);
    assert!(storage
        .list_recent_history(50)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn set_status_requires_a_sector_id() {
    let (ctx, _storage) = setup().await;
    let err = set_status(&ctx, &SectorId::new("  "), SectorStatus::Collected, None)
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn repeating_the_same_status_still_records_history() {
    let (ctx, storage) = setup().await;
    let mutation = set_status(&ctx, &SectorId::new("b"), SectorStatus::Collected, None)
        .await
        .expect("set status");
    assert_eq!(mutation.entry.previous_status, SectorStatus::Collected);
    assert_eq!(mutation.entry.new_status, SectorStatus::Collected);
    assert_eq!(mutation.entry.actor, None);
    assert_eq!(
        storage.list_recent_history(50).await.expect("history").len(),
        1
    );
}

#[tokio::test]
async fn history_failure_reports_error_but_keeps_status() {
    let (mut ctx, storage) = setup().await;
    ctx.history = Arc::new(FailingHistory);

    let err = set_status(&ctx, &SectorId::new("a"), SectorStatus::Collected, Some(&driver()))
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::StoreUnavailable);
    assert_eq!(err.message, "failed to update sector status");

    let stored = storage
        .get_sector(&SectorId::new("a"))
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.status, SectorStatus::Collected);
    assert!(storage
        .list_recent_history(50)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn posting_requires_an_actor() {
    let (ctx, _storage) = setup().await;
    let draft = NotificationDraft {
        kind: "blocked_road".into(),
        message: "Street closed".into(),
        sector_id: Some(SectorId::new("a")),
    };
    let err = post_notification(&ctx, None, draft.clone())
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let report = post_notification(&ctx, Some(&driver()), draft)
        .await
        .expect("post");
    assert_eq!(report.reporter.as_deref(), Some("driver@gmail.com"));
    assert!(!report.read);

    let blank = NotificationDraft {
        kind: "delay".into(),
        message: "   ".into(),
        sector_id: None,
    };
    let err = post_notification(&ctx, Some(&driver()), blank)
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn bulk_delete_is_best_effort() {
    let storage = seeded_storage().await;
    let mut ids = Vec::new();
    for message in ["one", "two", "three"] {
        let report = storage
            .insert_notification(NewNotification {
                kind: "delay".into(),
                message: message.into(),
                sector_id: None,
                reporter: Some("driver@gmail.com".into()),
            })
            .await
            .expect("insert");
        ids.push(report.id);
    }
    let mut ctx = ApiContext::from_storage(storage.clone(), AccessPolicy::default());
    ctx.notifications = Arc::new(RejectingBoard {
        inner: storage.clone(),
        rejected: ids[1],
    });

    let report = delete_notifications(&ctx, Some(&supervisor()), &ids)
        .await
        .expect("bulk delete");
    assert_eq!(report.deleted, vec![ids[0], ids[2]]);
    assert_eq!(report.failed, vec![ids[1]]);
    assert_eq!(
        report.error().map(|e| e.code),
        Some(ErrorCode::PartialBulkFailure)
    );

    let remaining = list_notifications(&ctx, None).await.expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, ids[1]);
}

#[tokio::test]
async fn deleting_requires_a_supervisor() {
    let (ctx, storage) = setup().await;
    let report = storage
        .insert_notification(NewNotification {
            kind: "delay".into(),
            message: "late".into(),
            sector_id: None,
            reporter: None,
        })
        .await
        .expect("insert");

    let err = delete_notification(&ctx, Some(&driver()), report.id)
        .await
        .expect_err("driver");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = delete_notification(&ctx, None, report.id)
        .await
        .expect_err("anonymous");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    delete_notification(&ctx, Some(&supervisor()), report.id)
        .await
        .expect("supervisor delete");
    let err = delete_notification(&ctx, Some(&supervisor()), report.id)
        .await
        .expect_err("already gone");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn purge_history_is_supervisor_only_and_removes_everything() {
    let (ctx, _storage) = setup().await;
    for status in [SectorStatus::EnRoute, SectorStatus::Collected] {
        set_status(&ctx, &SectorId::new("a"), status, Some(&driver()))
            .await
            .expect("set status");
    }

    let err = purge_history(&ctx, Some(&driver()))
        .await
        .expect_err("driver");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = list_history(&ctx, Some(&driver()), None)
        .await
        .expect_err("driver");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let history = list_history(&ctx, Some(&supervisor()), None)
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].new_status, SectorStatus::Collected);
    assert_eq!(history[0].previous_status, SectorStatus::EnRoute);

    assert_eq!(
        purge_history(&ctx, Some(&supervisor())).await.expect("purge"),
        2
    );
    assert!(list_history(&ctx, Some(&supervisor()), None)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn feature_collection_comes_from_the_store_when_populated() {
    let (ctx, _storage) = setup().await;
    let collection = load_feature_collection(&ctx).await.expect("collection");
    assert_eq!(collection.features.len(), 2);
    assert_eq!(
        collection.features[1].properties.status,
        SectorStatus::Collected
    );
}

#[tokio::test]
async fn feature_collection_falls_back_to_static_file() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sectors.geojson");
    std::fs::write(
        &path,
        r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "properties":{"id":"norte","name":"Norte","status":"weird"},
            "geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1]]]}}]}"#,
    )
    .expect("write geojson");

    let ctx = ApiContext::from_storage(storage.clone(), AccessPolicy::default())
        .with_geometry_fallback(&path);
    let collection = load_feature_collection(&ctx).await.expect("collection");
    assert_eq!(collection.features.len(), 1);
    assert_eq!(
        collection.features[0].properties.status,
        SectorStatus::Pending
    );
    let Geometry::Polygon { coordinates } = &collection.features[0].geometry;
    assert_eq!(coordinates[0].len(), 4);

    let without_file = ApiContext::from_storage(storage, AccessPolicy::default())
        .with_geometry_fallback(dir.path().join("missing.geojson"));
    let err = load_feature_collection(&without_file)
        .await
        .expect_err("both sources fail");
    assert_eq!(err.code, ErrorCode::StoreUnavailable);
}

#[tokio::test]
async fn sign_in_requires_the_registered_password() {
    let (ctx, _storage) = setup().await;
    let actor = register_user(&ctx, " Jefa@EcoRuta.com ", "reciclar")
        .await
        .expect("register");
    assert_eq!(actor.email, "jefa@ecoruta.com");

    let signed_in = authenticate(&ctx, "jefa@ecoruta.com", "reciclar")
        .await
        .expect("sign in");
    assert!(ctx.is_supervisor(&signed_in));

    let err = authenticate(&ctx, "jefa@ecoruta.com", "wrong-password")
        .await
        .expect_err("wrong password");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let err = authenticate(&ctx, "nobody@ecoruta.com", "reciclar")
        .await
        .expect_err("unknown account");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let err = authenticate(&ctx, "not-an-email", "reciclar")
        .await
        .expect_err("bad email");
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn registration_rejects_short_passwords() {
    let (ctx, _storage) = setup().await;
    let err = register_user(&ctx, "driver@gmail.com", "abc")
        .await
        .expect_err("short password");
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}
