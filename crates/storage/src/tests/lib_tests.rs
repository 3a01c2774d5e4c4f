use super::*;
use shared::domain::LngLat;

fn sector(id: &str, name: &str, status: SectorStatus) -> Sector {
    Sector {
        id: SectorId::new(id),
        name: name.to_string(),
        status,
        boundary: Boundary(vec![
            LngLat {
                lng: -84.97,
                lat: 10.46,
            },
            LngLat {
                lng: -84.96,
                lat: 10.46,
            },
            LngLat {
                lng: -84.96,
                lat: 10.47,
            },
        ]),
        last_updated: None,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn stores_and_lists_sectors_in_id_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_sector(&sector("b", "Barrio B", SectorStatus::Collected))
        .await
        .expect("upsert b");
    storage
        .upsert_sector(&sector("a", "Barrio A", SectorStatus::Pending))
        .await
        .expect("upsert a");

    let sectors = storage.list_sectors().await.expect("list");
    assert_eq!(sectors.len(), 2);
    assert_eq!(sectors[0].id, SectorId::new("a"));
    assert_eq!(sectors[1].status, SectorStatus::Collected);
    assert_eq!(sectors[1].boundary.points().len(), 3);
}

#[tokio::test]
async fn unknown_stored_status_reads_as_pending() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    sqlx::query("INSERT INTO sectors (id, name, status, boundary) VALUES ('x', 'X', 'bogus', '[]')")
        .execute(&storage.pool)
        .await
        .expect("insert");
    sqlx::query("INSERT INTO sectors (id, name, status, boundary) VALUES ('y', 'Y', NULL, '[]')")
        .execute(&storage.pool)
        .await
        .expect("insert");

    let sectors = storage.list_sectors().await.expect("list");
    assert!(sectors.iter().all(|s| s.status == SectorStatus::Pending));
}

#[tokio::test]
async fn status_update_stamps_time_and_publishes_change() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_sector(&sector("a", "Barrio A", SectorStatus::Pending))
        .await
        .expect("upsert");
    let mut feed = storage.subscribe();

    let updated = storage
        .update_sector_status(&SectorId::new("a"), SectorStatus::EnRoute)
        .await
        .expect("update")
        .expect("sector exists");
    assert_eq!(updated.status, SectorStatus::EnRoute);
    assert!(updated.last_updated.is_some());

    let change = feed.recv().await.expect("change");
    assert_eq!(change.kind, ChangeKind::Modified);
    assert_eq!(change.sector.status, SectorStatus::EnRoute);
}

#[tokio::test]
async fn status_update_of_missing_sector_returns_none_without_event() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut feed = storage.subscribe();
    let updated = storage
        .update_sector_status(&SectorId::new("ghost"), SectorStatus::Collected)
        .await
        .expect("update");
    assert!(updated.is_none());
    assert!(feed.try_recv().is_err());
}

#[tokio::test]
async fn upsert_and_delete_emit_added_modified_removed() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut feed = storage.subscribe();
    let record = sector("a", "Barrio A", SectorStatus::Pending);

    assert_eq!(
        storage.upsert_sector(&record).await.expect("insert"),
        ChangeKind::Added
    );
    assert_eq!(
        storage.upsert_sector(&record).await.expect("replace"),
        ChangeKind::Modified
    );
    assert!(storage.delete_sector(&record.id).await.expect("delete"));
    assert!(!storage.delete_sector(&record.id).await.expect("delete again"));

    let kinds: Vec<ChangeKind> = (0..3)
        .map(|_| feed.try_recv().expect("event").kind)
        .collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Added, ChangeKind::Modified, ChangeKind::Removed]
    );
}

#[tokio::test]
async fn history_is_listed_newest_first_and_purged_at_once() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for (previous, next) in [
        (SectorStatus::Pending, SectorStatus::EnRoute),
        (SectorStatus::EnRoute, SectorStatus::Collected),
    ] {
        storage
            .append_history(NewHistoryEntry {
                sector_id: SectorId::new("a"),
                sector_name: "Barrio A".into(),
                previous_status: previous,
                new_status: next,
                actor: Some("driver@example.com".into()),
            })
            .await
            .expect("append");
    }

    let entries = storage.list_recent_history(50).await.expect("history");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].new_status, SectorStatus::Collected);
    assert!(entries[0].id > entries[1].id);

    let limited = storage.list_recent_history(1).await.expect("history");
    assert_eq!(limited.len(), 1);

    assert_eq!(storage.purge_history().await.expect("purge"), 2);
    assert!(storage
        .list_recent_history(50)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn notifications_round_through_the_board() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .insert_notification(NewNotification {
            kind: "blocked_road".into(),
            message: "Street closed".into(),
            sector_id: Some(SectorId::new("a")),
            reporter: Some("driver@example.com".into()),
        })
        .await
        .expect("insert");
    let second = storage
        .insert_notification(NewNotification {
            kind: "delay".into(),
            message: "Truck breakdown".into(),
            sector_id: None,
            reporter: None,
        })
        .await
        .expect("insert");
    assert!(!first.read);

    let listed = storage.list_recent_notifications(10).await.expect("list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].sector_id, Some(SectorId::new("a")));

    assert!(storage.delete_notification(first.id).await.expect("delete"));
    assert!(!storage.delete_notification(first.id).await.expect("delete"));
    let listed = storage.list_recent_notifications(10).await.expect("list");
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn credentials_are_created_then_replaced() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .password_hash("ana@ecoruta.com")
        .await
        .expect("lookup")
        .is_none());

    storage
        .set_password_hash("ana@ecoruta.com", "first")
        .await
        .expect("create");
    storage
        .set_password_hash("ana@ecoruta.com", "second")
        .await
        .expect("replace");
    assert_eq!(
        storage
            .password_hash("ana@ecoruta.com")
            .await
            .expect("lookup")
            .as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn own_writes_are_journaled_but_not_reported_as_foreign() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert_eq!(storage.journal_head().await.expect("head"), 0);

    storage
        .upsert_sector(&sector("a", "Barrio A", SectorStatus::Pending))
        .await
        .expect("upsert");
    storage
        .update_sector_status(&SectorId::new("a"), SectorStatus::Collected)
        .await
        .expect("update");
    assert_eq!(storage.journal_head().await.expect("head"), 2);
    assert!(storage
        .foreign_journal_since(0, 10)
        .await
        .expect("journal")
        .is_empty());

    let pruned = storage
        .prune_journal(Utc::now() + chrono::Duration::seconds(1))
        .await
        .expect("prune");
    assert_eq!(pruned, 2);
}
