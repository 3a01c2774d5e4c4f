use super::*;
use server_api::{set_status, AccessPolicy, ApiContext};
use shared::{
    domain::{Boundary, Sector, SectorId, SectorStatus},
    protocol::ChangeKind,
};

fn database_url(dir: &tempfile::TempDir) -> String {
    format!(
        "sqlite://{}",
        dir.path()
            .join("sectors.db")
            .to_string_lossy()
            .replace('\\', "/")
    )
}

fn norte() -> Sector {
    Sector {
        id: SectorId::new("norte"),
        name: "Norte".into(),
        status: SectorStatus::Pending,
        boundary: Boundary::default(),
        last_updated: None,
    }
}

#[tokio::test]
async fn operator_writes_become_server_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = Storage::new(&database_url(&dir)).await.expect("server db");
    let operator = Storage::new(&database_url(&dir)).await.expect("operator db");
    let (events, mut rx) = broadcast::channel(16);
    let mut cursor = server.journal_head().await.expect("head");

    operator.upsert_sector(&norte()).await.expect("import");
    let ctx = ApiContext::from_storage(operator.clone(), AccessPolicy::default());
    set_status(&ctx, &SectorId::new("norte"), SectorStatus::Collected, None)
        .await
        .expect("set status");

    let forwarded = forward_foreign_writes(&server, &events, &mut cursor)
        .await
        .expect("forward");
    assert_eq!(forwarded, 3);

    match rx.try_recv().expect("import event") {
        ServerEvent::SectorChanged { change } => assert_eq!(change.kind, ChangeKind::Added),
        other => panic!("unexpected event: {other:?}"),
    }
    match rx.try_recv().expect("status event") {
        ServerEvent::SectorChanged { change } => {
            assert_eq!(change.kind, ChangeKind::Modified);
            assert_eq!(change.sector.status, SectorStatus::Collected);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match rx.try_recv().expect("history event") {
        ServerEvent::HistoryAppended { entry } => {
            assert_eq!(entry.previous_status, SectorStatus::Pending);
            assert_eq!(entry.actor, None);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(
        forward_foreign_writes(&server, &events, &mut cursor)
            .await
            .expect("forward again"),
        0
    );
}

#[tokio::test]
async fn own_writes_are_left_to_the_change_bridge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = Storage::new(&database_url(&dir)).await.expect("server db");
    let (events, mut rx) = broadcast::channel(16);
    let mut cursor = server.journal_head().await.expect("head");

    server.upsert_sector(&norte()).await.expect("import");
    assert_eq!(
        forward_foreign_writes(&server, &events, &mut cursor)
            .await
            .expect("forward"),
        0
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn spawned_tail_delivers_external_deletes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = Storage::new(&database_url(&dir)).await.expect("server db");
    let operator = Storage::new(&database_url(&dir)).await.expect("operator db");
    operator.upsert_sector(&norte()).await.expect("import");

    let (events, mut rx) = broadcast::channel(16);
    let tail = spawn_journal_tail(server, events, Duration::from_millis(20))
        .await
        .expect("spawn");
    assert!(operator
        .delete_sector(&SectorId::new("norte"))
        .await
        .expect("delete"));

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("event");
    match event {
        ServerEvent::SectorChanged { change } => {
            assert_eq!(change.kind, ChangeKind::Removed);
            assert_eq!(change.sector.id, SectorId::new("norte"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    tail.abort();
}
