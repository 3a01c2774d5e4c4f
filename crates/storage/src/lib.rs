use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::broadcast;

use shared::{
    domain::{
        Boundary, HistoryEntry, HistoryEntryId, NotificationId, NotificationReport, Sector,
        SectorId, SectorStatus,
    },
    protocol::{ChangeKind, SectorChange, ServerEvent},
};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Authoritative sector records plus their change feed.
#[async_trait]
pub trait SectorStore: Send + Sync {
    async fn list_sectors(&self) -> Result<Vec<Sector>>;
    async fn get_sector(&self, sector_id: &SectorId) -> Result<Option<Sector>>;
    /// Writes `status` and stamps `last_updated`. `None` when no such sector.
    async fn update_sector_status(
        &self,
        sector_id: &SectorId,
        status: SectorStatus,
    ) -> Result<Option<Sector>>;
    fn subscribe(&self) -> broadcast::Receiver<SectorChange>;
}

#[async_trait]
pub trait HistoryLog: Send + Sync {
    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry>;
    async fn list_recent_history(&self, limit: u32) -> Result<Vec<HistoryEntry>>;
    /// Removes every entry in one transaction and returns how many were removed.
    async fn purge_history(&self) -> Result<u64>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: NewNotification)
        -> Result<NotificationReport>;
    async fn list_recent_notifications(&self, limit: u32) -> Result<Vec<NotificationReport>>;
    /// `false` when the id did not exist.
    async fn delete_notification(&self, notification_id: NotificationId) -> Result<bool>;
}

/// Password hashes keyed by normalized email.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn password_hash(&self, email: &str) -> Result<Option<String>>;
    /// Creates the account or replaces its password hash.
    async fn set_password_hash(&self, email: &str, password_hash: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub sector_id: SectorId,
    pub sector_name: String,
    pub previous_status: SectorStatus,
    pub new_status: SectorStatus,
    pub actor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: String,
    pub message: String,
    pub sector_id: Option<SectorId>,
    pub reporter: Option<String>,
}

/// One journaled write made by another process. `event` is `None` when the
/// stored payload no longer decodes.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub seq: i64,
    pub event: Option<ServerEvent>,
}

/// Every write is committed together with a row in `change_journal`, tagged
/// with the writing instance's origin. Writes made through this instance are
/// also published on the in-process change feed right away; writes made by
/// other processes are only visible through [`Storage::foreign_journal_since`].
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<SectorChange>,
    origin: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        // Every in-memory connection is its own database, so keep exactly one.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            pool,
            changes,
            origin: uuid::Uuid::new_v4().simple().to_string(),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or replaces a sector record, keeping its status and
    /// `last_updated` as given. The insert-or-update decision and the write
    /// are one statement, so concurrent importers agree on which of them
    /// added the sector.
    pub async fn upsert_sector(&self, sector: &Sector) -> Result<ChangeKind> {
        let boundary =
            serde_json::to_string(&sector.boundary).context("failed to encode sector boundary")?;
        let mut tx = self.pool.begin().await.context("failed to begin sector upsert")?;
        let revision: i64 = sqlx::query_scalar(
            "INSERT INTO sectors (id, name, status, boundary, last_updated)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                boundary = excluded.boundary,
                last_updated = excluded.last_updated,
                revision = sectors.revision + 1
             RETURNING revision",
        )
        .bind(sector.id.as_str())
        .bind(&sector.name)
        .bind(sector.status.as_str())
        .bind(boundary)
        .bind(sector.last_updated)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert sector '{}'", sector.id))?;

        // Fresh rows keep the default revision.
        let kind = if revision == 0 {
            ChangeKind::Added
        } else {
            ChangeKind::Modified
        };
        let change = SectorChange {
            kind,
            sector: sector.clone(),
        };
        self.journal(&mut tx, ServerEvent::SectorChanged {
            change: change.clone(),
        })
        .await?;
        tx.commit().await.context("failed to commit sector upsert")?;
        self.publish(change);
        Ok(kind)
    }

    pub async fn delete_sector(&self, sector_id: &SectorId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin sector delete")?;
        let row = sqlx::query(
            "DELETE FROM sectors WHERE id = ?
             RETURNING id, name, status, boundary, last_updated",
        )
        .bind(sector_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to delete sector '{sector_id}'"))?;
        let Some(row) = row else {
            return Ok(false);
        };

        let change = SectorChange {
            kind: ChangeKind::Removed,
            sector: sector_from_row(&row)?,
        };
        self.journal(&mut tx, ServerEvent::SectorChanged {
            change: change.clone(),
        })
        .await?;
        tx.commit().await.context("failed to commit sector delete")?;
        self.publish(change);
        Ok(true)
    }

    /// Highest journal sequence number written so far, or 0.
    pub async fn journal_head(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM change_journal")
            .fetch_one(&self.pool)
            .await
            .context("failed to read change journal head")
    }

    /// Journaled writes after `after` that other processes made, oldest first.
    pub async fn foreign_journal_since(&self, after: i64, limit: u32) -> Result<Vec<JournalRecord>> {
        let rows = sqlx::query(
            "SELECT seq, event FROM change_journal
             WHERE seq > ? AND origin != ?
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(after)
        .bind(&self.origin)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to read change journal")?;

        Ok(rows
            .into_iter()
            .map(|r| JournalRecord {
                seq: r.get::<i64, _>(0),
                event: serde_json::from_str(&r.get::<String, _>(1)).ok(),
            })
            .collect())
    }

    /// Drops journal rows written before `before`.
    pub async fn prune_journal(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM change_journal WHERE created_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await
            .context("failed to prune change journal")?;
        Ok(result.rows_affected())
    }

    async fn journal(&self, conn: &mut SqliteConnection, event: ServerEvent) -> Result<()> {
        let payload = serde_json::to_string(&event).context("failed to encode journal event")?;
        sqlx::query("INSERT INTO change_journal (origin, event, created_at) VALUES (?, ?, ?)")
            .bind(&self.origin)
            .bind(payload)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .context("failed to append change journal")?;
        Ok(())
    }

    fn publish(&self, change: SectorChange) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl SectorStore for Storage {
    async fn list_sectors(&self) -> Result<Vec<Sector>> {
        let rows = sqlx::query(
            "SELECT id, name, status, boundary, last_updated FROM sectors ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list sectors")?;
        rows.iter().map(sector_from_row).collect()
    }

    async fn get_sector(&self, sector_id: &SectorId) -> Result<Option<Sector>> {
        let row = sqlx::query(
            "SELECT id, name, status, boundary, last_updated FROM sectors WHERE id = ?",
        )
        .bind(sector_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load sector '{sector_id}'"))?;
        row.as_ref().map(sector_from_row).transpose()
    }

    async fn update_sector_status(
        &self,
        sector_id: &SectorId,
        status: SectorStatus,
    ) -> Result<Option<Sector>> {
        let mut tx = self.pool.begin().await.context("failed to begin status update")?;
        let row = sqlx::query(
            "UPDATE sectors SET status = ?, last_updated = ?
             WHERE id = ?
             RETURNING id, name, status, boundary, last_updated",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(sector_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to update status of sector '{sector_id}'"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let change = SectorChange {
            kind: ChangeKind::Modified,
            sector: sector_from_row(&row)?,
        };
        self.journal(&mut tx, ServerEvent::SectorChanged {
            change: change.clone(),
        })
        .await?;
        tx.commit().await.context("failed to commit status update")?;

        let sector = change.sector.clone();
        self.publish(change);
        Ok(Some(sector))
    }

    fn subscribe(&self) -> broadcast::Receiver<SectorChange> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl HistoryLog for Storage {
    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let timestamp = Utc::now();
        let mut tx = self.pool.begin().await.context("failed to begin history append")?;
        let rec = sqlx::query(
            "INSERT INTO history (sector_id, sector_name, previous_status, new_status, actor, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(entry.sector_id.as_str())
        .bind(&entry.sector_name)
        .bind(entry.previous_status.as_str())
        .bind(entry.new_status.as_str())
        .bind(entry.actor.as_deref())
        .bind(timestamp)
        .fetch_one(&mut *tx)
        .await
        .context("failed to append history entry")?;

        let entry = HistoryEntry {
            id: HistoryEntryId(rec.get::<i64, _>(0)),
            sector_id: entry.sector_id,
            sector_name: entry.sector_name,
            previous_status: entry.previous_status,
            new_status: entry.new_status,
            actor: entry.actor,
            timestamp,
        };
        self.journal(&mut tx, ServerEvent::HistoryAppended {
            entry: entry.clone(),
        })
        .await?;
        tx.commit().await.context("failed to commit history entry")?;
        Ok(entry)
    }

    async fn list_recent_history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, sector_id, sector_name, previous_status, new_status, actor, created_at
             FROM history
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list history")?;

        Ok(rows
            .into_iter()
            .map(|r| HistoryEntry {
                id: HistoryEntryId(r.get::<i64, _>(0)),
                sector_id: SectorId(r.get::<String, _>(1)),
                sector_name: r.get::<String, _>(2),
                previous_status: SectorStatus::from_token(Some(&r.get::<String, _>(3))),
                new_status: SectorStatus::from_token(Some(&r.get::<String, _>(4))),
                actor: r.get::<Option<String>, _>(5),
                timestamp: r.get::<DateTime<Utc>, _>(6),
            })
            .collect())
    }

    async fn purge_history(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM history")
            .execute(&mut *tx)
            .await
            .context("failed to purge history")?;
        let purged = result.rows_affected();
        self.journal(&mut tx, ServerEvent::HistoryPurged { purged })
            .await?;
        tx.commit().await.context("failed to commit history purge")?;
        Ok(purged)
    }
}

#[async_trait]
impl NotificationStore for Storage {
    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationReport> {
        let timestamp = Utc::now();
        let mut tx = self.pool.begin().await.context("failed to begin notification insert")?;
        let rec = sqlx::query(
            "INSERT INTO notifications (kind, message, sector_id, reporter, created_at, read)
             VALUES (?, ?, ?, ?, ?, 0)
             RETURNING id",
        )
        .bind(&notification.kind)
        .bind(&notification.message)
        .bind(notification.sector_id.as_ref().map(SectorId::as_str))
        .bind(notification.reporter.as_deref())
        .bind(timestamp)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert notification")?;

        let report = NotificationReport {
            id: NotificationId(rec.get::<i64, _>(0)),
            kind: notification.kind,
            message: notification.message,
            sector_id: notification.sector_id,
            reporter: notification.reporter,
            timestamp,
            read: false,
        };
        self.journal(&mut tx, ServerEvent::NotificationPosted {
            report: report.clone(),
        })
        .await?;
        tx.commit().await.context("failed to commit notification")?;
        Ok(report)
    }

    async fn list_recent_notifications(&self, limit: u32) -> Result<Vec<NotificationReport>> {
        let rows = sqlx::query(
            "SELECT id, kind, message, sector_id, reporter, created_at, read
             FROM notifications
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list notifications")?;

        Ok(rows
            .into_iter()
            .map(|r| NotificationReport {
                id: NotificationId(r.get::<i64, _>(0)),
                kind: r.get::<String, _>(1),
                message: r.get::<String, _>(2),
                sector_id: r.get::<Option<String>, _>(3).map(SectorId),
                reporter: r.get::<Option<String>, _>(4),
                timestamp: r.get::<DateTime<Utc>, _>(5),
                read: r.get::<bool, _>(6),
            })
            .collect())
    }

    async fn delete_notification(&self, notification_id: NotificationId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin notification delete")?;
        let result = sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(notification_id.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete notification {}", notification_id.0))?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.journal(&mut tx, ServerEvent::NotificationDeleted { notification_id })
            .await?;
        tx.commit().await.context("failed to commit notification delete")?;
        Ok(true)
    }
}

#[async_trait]
impl CredentialStore for Storage {
    async fn password_hash(&self, email: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT password_hash FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load credentials for '{email}'"))
    }

    async fn set_password_hash(&self, email: &str, password_hash: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (email, password_hash, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET password_hash = excluded.password_hash",
        )
        .bind(email)
        .bind(password_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store credentials for '{email}'"))?;
        Ok(())
    }
}

fn sector_from_row(row: &SqliteRow) -> Result<Sector> {
    let id: String = row.try_get("id")?;
    let boundary_json: String = row.try_get("boundary")?;
    let boundary: Boundary = serde_json::from_str(&boundary_json)
        .with_context(|| format!("corrupt boundary for sector '{id}'"))?;
    let status: Option<String> = row.try_get("status")?;
    Ok(Sector {
        id: SectorId(id),
        name: row.try_get("name")?,
        status: SectorStatus::from_token(status.as_deref()),
        boundary,
        last_updated: row.try_get::<Option<DateTime<Utc>>, _>("last_updated")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
