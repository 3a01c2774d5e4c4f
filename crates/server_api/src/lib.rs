use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use shared::{
    domain::{Actor, HistoryEntry, NotificationId, NotificationReport, Sector, SectorId, SectorStatus},
    error::ApiError,
    geo::FeatureCollection,
    protocol::{BulkDeleteReport, NotificationDraft, StatusMutation},
};
use storage::{
    CredentialStore, HistoryLog, NewHistoryEntry, NewNotification, NotificationStore,
    SectorStore, Storage,
};
use tracing::{error, info, warn};

pub mod credentials;

use credentials::{hash_password, normalize_email, verify_password, MIN_PASSWORD_LEN};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const DEFAULT_NOTIFICATION_LIMIT: u32 = 10;
pub const MAX_LIST_LIMIT: u32 = 100;
const UNKNOWN_SECTOR_NAME: &str = "Unknown sector";

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    /// Email suffix that marks an actor as a supervisor, e.g. `@ecoruta.com`.
    pub supervisor_domain: String,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            supervisor_domain: "@ecoruta.com".into(),
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub sectors: Arc<dyn SectorStore>,
    pub history: Arc<dyn HistoryLog>,
    pub notifications: Arc<dyn NotificationStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub access: AccessPolicy,
    pub geometry_fallback: Option<PathBuf>,
}

impl ApiContext {
    pub fn from_storage(storage: Storage, access: AccessPolicy) -> Self {
        let storage = Arc::new(storage);
        Self {
            sectors: storage.clone(),
            history: storage.clone(),
            notifications: storage.clone(),
            credentials: storage,
            access,
            geometry_fallback: None,
        }
    }

    pub fn with_geometry_fallback(mut self, path: impl Into<PathBuf>) -> Self {
        self.geometry_fallback = Some(path.into());
        self
    }

    pub fn is_supervisor(&self, actor: &Actor) -> bool {
        actor.is_supervisor(&self.access.supervisor_domain)
    }
}

/// Creates an account or resets its password.
pub async fn register_user(
    ctx: &ApiContext,
    email: &str,
    password: &str,
) -> Result<Actor, ApiError> {
    let email =
        normalize_email(email).ok_or_else(|| ApiError::invalid_argument("a valid email is required"))?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::invalid_argument(format!(
            "password must have at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    ctx.credentials
        .set_password_hash(&email, &hash_password(password))
        .await
        .map_err(unavailable)?;
    info!(actor = %email, "credentials stored");
    Ok(Actor::new(email))
}

/// Checks an email/password pair. Unknown accounts and wrong passwords get
/// the same `Unauthorized` answer.
pub async fn authenticate(
    ctx: &ApiContext,
    email: &str,
    password: &str,
) -> Result<Actor, ApiError> {
    let email =
        normalize_email(email).ok_or_else(|| ApiError::invalid_argument("a valid email is required"))?;
    let stored = ctx
        .credentials
        .password_hash(&email)
        .await
        .map_err(unavailable)?;
    match stored {
        Some(hash) if verify_password(password, &hash) => Ok(Actor::new(email)),
        _ => {
            warn!(actor = %email, "sign-in rejected");
            Err(ApiError::unauthorized("invalid email or password"))
        }
    }
}

pub async fn list_sectors(ctx: &ApiContext) -> Result<Vec<Sector>, ApiError> {
    ctx.sectors.list_sectors().await.map_err(unavailable)
}

pub async fn get_sector(ctx: &ApiContext, sector_id: &SectorId) -> Result<Sector, ApiError> {
    if sector_id.is_blank() {
        return Err(ApiError::invalid_argument("sector id is required"));
    }
    ctx.sectors
        .get_sector(sector_id)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| ApiError::not_found(format!("sector '{sector_id}' does not exist")))
}

/// Changes one sector's status and records the transition in the history log.
///
/// The two writes are not atomic. When the history append fails the status
/// change stays committed, the change feed has already announced it, and the
/// caller receives a generic failure.
pub async fn set_status(
    ctx: &ApiContext,
    sector_id: &SectorId,
    new_status: SectorStatus,
    actor: Option<&Actor>,
) -> Result<StatusMutation, ApiError> {
    if sector_id.is_blank() {
        return Err(ApiError::invalid_argument("no sector selected"));
    }

    let current = ctx
        .sectors
        .get_sector(sector_id)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| ApiError::not_found(format!("sector '{sector_id}' does not exist")))?;
    let previous_status = current.status;
    let sector_name = if current.name.trim().is_empty() {
        UNKNOWN_SECTOR_NAME.to_string()
    } else {
        current.name.clone()
    };

    let sector = ctx
        .sectors
        .update_sector_status(sector_id, new_status)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| ApiError::not_found(format!("sector '{sector_id}' does not exist")))?;

    let entry = ctx
        .history
        .append_history(NewHistoryEntry {
            sector_id: sector_id.clone(),
            sector_name,
            previous_status,
            new_status,
            actor: actor.map(|a| a.email.clone()),
        })
        .await
        .map_err(|err| {
            error!(
                sector_id = %sector_id,
                %new_status,
                error = %err,
                "status committed but history append failed"
            );
            ApiError::store_unavailable("failed to update sector status")
        })?;

    info!(
        sector_id = %sector_id,
        from = %previous_status,
        to = %new_status,
        actor = actor.map(|a| a.email.as_str()).unwrap_or("system"),
        "sector status changed"
    );
    Ok(StatusMutation { sector, entry })
}

/// Sector polygons as a feature collection. Falls back to the static GeoJSON
/// file when the store is empty or unreachable.
pub async fn load_feature_collection(ctx: &ApiContext) -> Result<FeatureCollection, ApiError> {
    match ctx.sectors.list_sectors().await {
        Ok(sectors) if !sectors.is_empty() => return Ok(FeatureCollection::from_sectors(&sectors)),
        Ok(_) => info!("sector store is empty; loading fallback geometry"),
        Err(err) => warn!(error = %err, "sector store unavailable; loading fallback geometry"),
    }

    let Some(path) = ctx.geometry_fallback.as_ref() else {
        return Err(ApiError::store_unavailable(
            "sectors unavailable and no fallback geometry configured",
        ));
    };
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        warn!(path = %path.display(), error = %err, "failed to read fallback geometry");
        ApiError::store_unavailable("failed to load sectors")
    })?;
    let collection = FeatureCollection::parse(&raw).map_err(|err| {
        warn!(path = %path.display(), error = %err, "fallback geometry is malformed");
        ApiError::store_unavailable("failed to load sectors")
    })?;
    // Normalize through the sector model so every feature carries id/name/status.
    let sectors = collection.into_sectors().map_err(|err| {
        warn!(path = %path.display(), error = %err, "fallback geometry is malformed");
        ApiError::store_unavailable("failed to load sectors")
    })?;
    Ok(FeatureCollection::from_sectors(&sectors))
}

pub async fn post_notification(
    ctx: &ApiContext,
    actor: Option<&Actor>,
    draft: NotificationDraft,
) -> Result<NotificationReport, ApiError> {
    let actor = require_actor(actor)?;
    let kind = draft.kind.trim();
    let message = draft.message.trim();
    if kind.is_empty() {
        return Err(ApiError::invalid_argument("notification kind is required"));
    }
    if message.is_empty() {
        return Err(ApiError::invalid_argument("notification message is required"));
    }

    let report = ctx
        .notifications
        .insert_notification(NewNotification {
            kind: kind.to_string(),
            message: message.to_string(),
            sector_id: draft.sector_id.filter(|id| !id.is_blank()),
            reporter: Some(actor.email.clone()),
        })
        .await
        .map_err(unavailable)?;
    info!(notification_id = report.id.0, kind = %report.kind, "notification posted");
    Ok(report)
}

pub async fn list_notifications(
    ctx: &ApiContext,
    limit: Option<u32>,
) -> Result<Vec<NotificationReport>, ApiError> {
    let limit = clamp_limit(limit, DEFAULT_NOTIFICATION_LIMIT);
    ctx.notifications
        .list_recent_notifications(limit)
        .await
        .map_err(unavailable)
}

pub async fn delete_notification(
    ctx: &ApiContext,
    actor: Option<&Actor>,
    notification_id: NotificationId,
) -> Result<(), ApiError> {
    require_supervisor(ctx, actor)?;
    let deleted = ctx
        .notifications
        .delete_notification(notification_id)
        .await
        .map_err(unavailable)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "notification {} does not exist",
            notification_id.0
        )));
    }
    Ok(())
}

/// Deletes each id on its own. Failures do not stop the remaining deletes;
/// the report tells which ids are gone and which survived.
pub async fn delete_notifications(
    ctx: &ApiContext,
    actor: Option<&Actor>,
    ids: &[NotificationId],
) -> Result<BulkDeleteReport, ApiError> {
    require_supervisor(ctx, actor)?;

    let mut report = BulkDeleteReport::default();
    let unique: BTreeSet<NotificationId> = ids.iter().copied().collect();
    for notification_id in unique {
        match ctx.notifications.delete_notification(notification_id).await {
            Ok(true) => report.deleted.push(notification_id),
            Ok(false) => report.failed.push(notification_id),
            Err(err) => {
                warn!(
                    notification_id = notification_id.0,
                    error = %err,
                    "notification delete failed"
                );
                report.failed.push(notification_id);
            }
        }
    }

    if report.is_partial() {
        warn!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "bulk notification delete partially failed"
        );
    }
    Ok(report)
}

pub async fn list_history(
    ctx: &ApiContext,
    actor: Option<&Actor>,
    limit: Option<u32>,
) -> Result<Vec<HistoryEntry>, ApiError> {
    require_supervisor(ctx, actor)?;
    let limit = clamp_limit(limit, DEFAULT_HISTORY_LIMIT);
    ctx.history
        .list_recent_history(limit)
        .await
        .map_err(unavailable)
}

pub async fn purge_history(ctx: &ApiContext, actor: Option<&Actor>) -> Result<u64, ApiError> {
    let actor = require_supervisor(ctx, actor)?;
    let purged = ctx.history.purge_history().await.map_err(unavailable)?;
    info!(purged, actor = %actor.email, "history purged");
    Ok(purged)
}

fn require_actor(actor: Option<&Actor>) -> Result<&Actor, ApiError> {
    actor.ok_or_else(|| ApiError::unauthorized("sign in required"))
}

fn require_supervisor<'a>(
    ctx: &ApiContext,
    actor: Option<&'a Actor>,
) -> Result<&'a Actor, ApiError> {
    let actor = require_actor(actor)?;
    if !ctx.is_supervisor(actor) {
        return Err(ApiError::forbidden("supervisor access required"));
    }
    Ok(actor)
}

fn clamp_limit(limit: Option<u32>, default: u32) -> u32 {
    limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
}

fn unavailable(err: anyhow::Error) -> ApiError {
    ApiError::store_unavailable(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
