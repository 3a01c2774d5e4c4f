use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Actor, HistoryEntry, NotificationId, NotificationReport, Sector, SectorId, SectorStatus,
    },
    error::{ApiError, ErrorCode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of the sector store's change feed. `sector` is the full record
/// after the write (or the last known record for `Removed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorChange {
    pub kind: ChangeKind,
    pub sector: Sector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub actor: Actor,
    pub supervisor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    #[serde(deserialize_with = "SectorStatus::deserialize_strict")]
    pub status: SectorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMutation {
    pub sector: Sector,
    pub entry: HistoryEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDraft {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<SectorId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<NotificationId>,
}

/// Outcome of a best-effort bulk delete. Items are attempted one by one, so
/// some may be gone while others survive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteReport {
    pub deleted: Vec<NotificationId>,
    pub failed: Vec<NotificationId>,
}

impl BulkDeleteReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn error(&self) -> Option<ApiError> {
        self.is_partial().then(|| {
            ApiError::new(
                ErrorCode::PartialBulkFailure,
                format!(
                    "deleted {} of {} notifications",
                    self.deleted.len(),
                    self.deleted.len() + self.failed.len()
                ),
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    SectorChanged { change: SectorChange },
    HistoryAppended { entry: HistoryEntry },
    HistoryPurged { purged: u64 },
    NotificationPosted { report: NotificationReport },
    NotificationDeleted { notification_id: NotificationId },
    /// The server dropped `skipped` events for this subscriber. Cached state
    /// must be reloaded from the store.
    Resync { skipped: u64 },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_uses_tagged_snake_case_layout() {
        let event = ServerEvent::HistoryPurged { purged: 3 };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(
            value,
            serde_json::json!({ "type": "history_purged", "payload": { "purged": 3 } })
        );
    }

    #[test]
    fn bulk_report_flags_partial_failure() {
        let report = BulkDeleteReport {
            deleted: vec![NotificationId(1), NotificationId(2)],
            failed: vec![NotificationId(3)],
        };
        let err = report.error().expect("partial");
        assert_eq!(err.code, ErrorCode::PartialBulkFailure);
        assert_eq!(err.message, "deleted 2 of 3 notifications");
        assert!(BulkDeleteReport::default().error().is_none());
    }
}
