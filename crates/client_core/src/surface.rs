use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{HistoryEntry, NotificationId, NotificationReport, Sector, SectorId, SectorStatus},
    error::ApiError,
    protocol::{BulkDeleteReport, NotificationDraft, ServerEvent, StatusMutation},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::{
    backend::{EventStream, SectorBackend},
    error::SyncError,
    sync::{reduce, render, ListLimits, RenderDelta, SurfaceState, SurfaceView, MAX_BATCH},
};

const SURFACE_EVENT_CAPACITY: usize = 64;
const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(250);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceRole {
    Driver,
    Supervisor,
    Citizen,
}

impl SurfaceRole {
    pub fn limits(self) -> ListLimits {
        match self {
            SurfaceRole::Driver => ListLimits {
                notifications: 10,
                history: 0,
            },
            SurfaceRole::Supervisor => ListLimits::default(),
            SurfaceRole::Citizen => ListLimits {
                notifications: 0,
                history: 0,
            },
        }
    }

    pub fn can_set_status(self) -> bool {
        matches!(self, SurfaceRole::Driver)
    }

    pub fn can_report(self) -> bool {
        matches!(self, SurfaceRole::Driver | SurfaceRole::Supervisor)
    }

    pub fn is_supervisor(self) -> bool {
        matches!(self, SurfaceRole::Supervisor)
    }
}

/// One-tap driver shortcuts that apply to the selected sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickAction {
    ReportProblem,
    PauseRoute,
    FinishShift,
}

impl QuickAction {
    pub fn status(self) -> SectorStatus {
        match self {
            QuickAction::ReportProblem => SectorStatus::Pending,
            QuickAction::PauseRoute => SectorStatus::EnRoute,
            QuickAction::FinishShift => SectorStatus::Collected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    Rendered {
        view: SurfaceView,
        delta: RenderDelta,
    },
    Toast {
        level: ToastLevel,
        message: String,
    },
}

/// State and live subscription of one open surface.
///
/// The event stream is opened before the initial load so nothing written in
/// between is missed. When the stream ends the session resubscribes with
/// backoff and reloads everything; a `resync` marker from the server does
/// the same without reconnecting. Dropping the session or calling
/// [`teardown`] cancels the subscription.
///
/// [`teardown`]: SurfaceSession::teardown
pub struct SurfaceSession {
    role: SurfaceRole,
    backend: Arc<dyn SectorBackend>,
    state: Arc<Mutex<SurfaceState>>,
    events: broadcast::Sender<SurfaceEvent>,
    sync_task: Option<JoinHandle<()>>,
}

impl SurfaceSession {
    pub async fn open(
        backend: Arc<dyn SectorBackend>,
        role: SurfaceRole,
    ) -> Result<Self, SyncError> {
        let stream = backend.subscribe().await?;

        let limits = role.limits();
        let mut state = SurfaceState::with_limits(limits);
        Snapshot::fetch(&*backend, limits)
            .await?
            .apply_to(&mut state);
        info!(
            ?role,
            sectors = state.sectors.len(),
            notifications = state.notifications.len(),
            "surface opened"
        );

        let state = Arc::new(Mutex::new(state));
        let (events, _) = broadcast::channel(SURFACE_EVENT_CAPACITY);
        let sync_task = tokio::spawn(run_sync(
            Arc::clone(&backend),
            stream,
            Arc::clone(&state),
            events.clone(),
        ));

        Ok(Self {
            role,
            backend,
            state,
            events,
            sync_task: Some(sync_task),
        })
    }

    pub fn role(&self) -> SurfaceRole {
        self.role
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }

    /// Same events as [`subscribe_events`](Self::subscribe_events), as a stream.
    pub fn updates(&self) -> BroadcastStream<SurfaceEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub async fn view(&self) -> SurfaceView {
        render(&*self.state.lock().await)
    }

    pub async fn marked(&self) -> Vec<NotificationId> {
        self.state.lock().await.marked.iter().copied().collect()
    }

    pub async fn select_sector(&self, sector_id: &SectorId) -> Result<(), SyncError> {
        let found = self.state.lock().await.select(sector_id).is_some();
        if !found {
            let err = SyncError::Api(ApiError::not_found(format!(
                "sector '{sector_id}' is not on the map"
            )));
            self.toast_error(&err);
            return Err(err);
        }
        self.publish_view(RenderDelta {
            detail_refreshed: true,
            ..RenderDelta::default()
        })
        .await;
        Ok(())
    }

    pub async fn clear_selection(&self) {
        self.state.lock().await.clear_selection();
        self.publish_view(RenderDelta {
            selection_cleared: true,
            ..RenderDelta::default()
        })
        .await;
    }

    /// Changes the selected sector's status. On success the committed record
    /// is applied locally right away unless the change feed already carried
    /// a later write to the same sector.
    pub async fn set_selected_status(
        &self,
        status: SectorStatus,
    ) -> Result<StatusMutation, SyncError> {
        let result = self.try_set_selected_status(status).await;
        match &result {
            Ok(mutation) => {
                let sector_id = mutation.sector.id.clone();
                let name = mutation.sector.name.clone();
                let applied = self
                    .state
                    .lock()
                    .await
                    .apply_committed(mutation.sector.clone());
                if applied {
                    let mut delta = RenderDelta {
                        detail_refreshed: true,
                        ..RenderDelta::default()
                    };
                    delta.restyled.insert(sector_id);
                    self.publish_view(delta).await;
                } else {
                    debug!(%sector_id, "newer write already applied; keeping it");
                }
                self.toast(
                    ToastLevel::Success,
                    format!("Sector {name} marked as {}", status.label().to_lowercase()),
                );
            }
            Err(err) => self.toast_error(err),
        }
        result
    }

    async fn try_set_selected_status(
        &self,
        status: SectorStatus,
    ) -> Result<StatusMutation, SyncError> {
        if !self.role.can_set_status() {
            return Err(SyncError::Api(ApiError::forbidden(
                "this surface cannot change sector status",
            )));
        }
        let selected = self.state.lock().await.selected.clone();
        let Some(sector_id) = selected else {
            return Err(SyncError::invalid_argument("select a sector first"));
        };
        self.backend.set_status(&sector_id, status).await
    }

    pub async fn quick_action(&self, action: QuickAction) -> Result<StatusMutation, SyncError> {
        self.set_selected_status(action.status()).await
    }

    /// Posts an incident report about the selected sector, or about all
    /// sectors when nothing is selected.
    pub async fn report_incident(
        &self,
        kind: &str,
        message: &str,
    ) -> Result<NotificationReport, SyncError> {
        let result = self.try_report_incident(kind, message).await;
        match &result {
            Ok(_) => self.toast(ToastLevel::Success, "Report sent"),
            Err(err) => self.toast_error(err),
        }
        result
    }

    async fn try_report_incident(
        &self,
        kind: &str,
        message: &str,
    ) -> Result<NotificationReport, SyncError> {
        if !self.role.can_report() {
            return Err(SyncError::Api(ApiError::forbidden(
                "this surface cannot post reports",
            )));
        }
        let sector_id = self.state.lock().await.selected.clone();
        self.backend
            .post_notification(NotificationDraft {
                kind: kind.to_string(),
                message: message.to_string(),
                sector_id,
            })
            .await
    }

    pub async fn toggle_mark(&self, notification_id: NotificationId) -> bool {
        let marked = self.state.lock().await.toggle_mark(notification_id);
        self.publish_view(RenderDelta {
            notifications_changed: true,
            ..RenderDelta::default()
        })
        .await;
        marked
    }

    pub async fn set_marked(&self, notification_id: NotificationId, marked: bool) -> bool {
        let marked = self.state.lock().await.set_marked(notification_id, marked);
        self.publish_view(RenderDelta {
            notifications_changed: true,
            ..RenderDelta::default()
        })
        .await;
        marked
    }

    pub async fn clear_marks(&self) {
        self.state.lock().await.clear_marks();
        self.publish_view(RenderDelta {
            notifications_changed: true,
            ..RenderDelta::default()
        })
        .await;
    }

    /// Deletes every marked notification, one by one. A partial failure
    /// leaves the survivors listed and marked and returns
    /// [`SyncError::PartialBulkFailure`].
    pub async fn delete_marked(&self) -> Result<BulkDeleteReport, SyncError> {
        let result = self.try_delete_marked().await;
        match &result {
            Ok(report) => self.toast(
                ToastLevel::Success,
                format!("Deleted {} notifications", report.deleted.len()),
            ),
            Err(err) => self.toast_error(err),
        }
        result
    }

    async fn try_delete_marked(&self) -> Result<BulkDeleteReport, SyncError> {
        self.require_supervisor()?;
        let ids = self.marked().await;
        if ids.is_empty() {
            return Err(SyncError::invalid_argument("no notifications selected"));
        }

        let report = self.backend.delete_notifications(&ids).await?;
        {
            let mut state = self.state.lock().await;
            for id in &report.deleted {
                state.marked.remove(id);
            }
        }
        if let Err(err) = self.reload_notifications().await {
            warn!(error = %err, "notification refresh after delete failed");
        }

        if report.is_partial() {
            warn!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "bulk notification delete partially failed"
            );
            return Err(SyncError::PartialBulkFailure(report));
        }
        Ok(report)
    }

    pub async fn refresh_notifications(&self) -> Result<(), SyncError> {
        let result = self.reload_notifications().await;
        if let Err(err) = &result {
            self.toast_error(err);
        }
        result
    }

    async fn reload_notifications(&self) -> Result<(), SyncError> {
        reload_notifications(&*self.backend, &self.state, &self.events).await
    }

    pub async fn refresh_history(&self) -> Result<(), SyncError> {
        let result = self.reload_history().await;
        if let Err(err) = &result {
            self.toast_error(err);
        }
        result
    }

    async fn reload_history(&self) -> Result<(), SyncError> {
        self.require_supervisor()?;
        let limit = self.state.lock().await.limits.history;
        let history = self.backend.list_history(limit as u32).await?;
        self.state.lock().await.replace_history(history);
        self.publish_view(RenderDelta {
            history_changed: true,
            ..RenderDelta::default()
        })
        .await;
        Ok(())
    }

    pub async fn purge_history(&self) -> Result<u64, SyncError> {
        let result = self.try_purge_history().await;
        match &result {
            Ok(0) => self.toast(ToastLevel::Info, "History is already empty"),
            Ok(purged) => self.toast(
                ToastLevel::Success,
                format!("Purged {purged} history entries"),
            ),
            Err(err) => self.toast_error(err),
        }
        result
    }

    async fn try_purge_history(&self) -> Result<u64, SyncError> {
        self.require_supervisor()?;
        let purged = self.backend.purge_history().await?;
        self.state.lock().await.replace_history(Vec::new());
        self.publish_view(RenderDelta {
            history_changed: true,
            ..RenderDelta::default()
        })
        .await;
        Ok(purged)
    }

    /// Cancels the subscription and forgets all cached state.
    pub async fn teardown(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
        *self.state.lock().await = SurfaceState::with_limits(self.role.limits());
        info!(role = ?self.role, "surface closed");
    }

    fn require_supervisor(&self) -> Result<(), SyncError> {
        if self.role.is_supervisor() {
            Ok(())
        } else {
            Err(SyncError::Api(ApiError::forbidden(
                "supervisor access required",
            )))
        }
    }

    async fn publish_view(&self, delta: RenderDelta) {
        publish_view(&self.state, &self.events, delta).await;
    }

    fn toast(&self, level: ToastLevel, message: impl Into<String>) {
        toast(&self.events, level, message);
    }

    fn toast_error(&self, err: &SyncError) {
        warn!(code = ?err.code(), error = %err, "surface action failed");
        self.toast(ToastLevel::Error, err.user_message());
    }
}

impl Drop for SurfaceSession {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
    }
}

/// Everything a surface loads up front, and again after a resync.
struct Snapshot {
    sectors: Vec<Sector>,
    notifications: Option<Vec<NotificationReport>>,
    history: Option<Vec<HistoryEntry>>,
}

impl Snapshot {
    async fn fetch(backend: &dyn SectorBackend, limits: ListLimits) -> Result<Self, SyncError> {
        let sectors = backend.list_sectors().await?;
        let notifications = if limits.notifications > 0 {
            Some(
                backend
                    .list_notifications(limits.notifications as u32)
                    .await?,
            )
        } else {
            None
        };
        let history = if limits.history > 0 {
            Some(backend.list_history(limits.history as u32).await?)
        } else {
            None
        };
        Ok(Self {
            sectors,
            notifications,
            history,
        })
    }

    fn apply_to(self, state: &mut SurfaceState) -> RenderDelta {
        let mut delta = RenderDelta {
            notifications_changed: self.notifications.is_some(),
            history_changed: self.history.is_some(),
            ..RenderDelta::default()
        };
        delta.restyled = self.sectors.iter().map(|s| s.id.clone()).collect();
        delta.removed = state
            .sectors
            .keys()
            .filter(|id| !delta.restyled.contains(*id))
            .cloned()
            .collect();

        let had_selection = state.selected.is_some();
        state.load_sectors(self.sectors);
        delta.selection_cleared = had_selection && state.selected.is_none();
        delta.detail_refreshed = state.selected.is_some();
        if let Some(notifications) = self.notifications {
            state.replace_notifications(notifications);
        }
        if let Some(history) = self.history {
            state.replace_history(history);
        }
        delta
    }
}

async fn run_sync(
    backend: Arc<dyn SectorBackend>,
    mut stream: EventStream,
    state: Arc<Mutex<SurfaceState>>,
    events: broadcast::Sender<SurfaceEvent>,
) {
    loop {
        let mut batches = stream.ready_chunks(MAX_BATCH);
        while let Some(batch) = batches.next().await {
            let delta = apply_batch(&state, &events, &batch).await;
            if delta.resync_required {
                warn!("server dropped events; reloading surface state");
                if let Err(err) = resync(&*backend, &state, &events).await {
                    warn!(error = %err, "resync failed");
                    toast(&events, ToastLevel::Error, err.user_message());
                }
            } else if delta.notifications_short {
                if let Err(err) = reload_notifications(&*backend, &state, &events).await {
                    warn!(error = %err, "notification refill failed");
                }
            }
        }

        warn!("event stream ended; reconnecting");
        toast(
            &events,
            ToastLevel::Error,
            "Live updates interrupted, reconnecting",
        );
        stream = reconnect(&*backend).await;
        match resync(&*backend, &state, &events).await {
            Ok(()) => toast(&events, ToastLevel::Info, "Live updates restored"),
            Err(err) => {
                warn!(error = %err, "reload after reconnect failed");
                toast(&events, ToastLevel::Error, err.user_message());
            }
        }
    }
}

async fn apply_batch(
    state: &Mutex<SurfaceState>,
    events: &broadcast::Sender<SurfaceEvent>,
    batch: &[ServerEvent],
) -> RenderDelta {
    let (view, delta) = {
        let mut guard = state.lock().await;
        let (next, delta) = reduce(std::mem::take(&mut *guard), batch);
        *guard = next;
        (render(&guard), delta)
    };

    for err in &delta.errors {
        toast(events, ToastLevel::Error, err.message.clone());
    }
    if !delta.is_empty() {
        let _ = events.send(SurfaceEvent::Rendered {
            view,
            delta: delta.clone(),
        });
    }
    delta
}

async fn reconnect(backend: &dyn SectorBackend) -> EventStream {
    let mut delay = RECONNECT_DELAY_MIN;
    loop {
        tokio::time::sleep(delay).await;
        match backend.subscribe().await {
            Ok(stream) => {
                info!("event stream reconnected");
                return stream;
            }
            Err(err) => {
                warn!(error = %err, ?delay, "event stream reconnect failed");
                delay = (delay * 2).min(RECONNECT_DELAY_MAX);
            }
        }
    }
}

async fn resync(
    backend: &dyn SectorBackend,
    state: &Mutex<SurfaceState>,
    events: &broadcast::Sender<SurfaceEvent>,
) -> Result<(), SyncError> {
    let limits = state.lock().await.limits;
    let snapshot = Snapshot::fetch(backend, limits).await?;
    let delta = snapshot.apply_to(&mut *state.lock().await);
    publish_view(state, events, delta).await;
    Ok(())
}

async fn reload_notifications(
    backend: &dyn SectorBackend,
    state: &Mutex<SurfaceState>,
    events: &broadcast::Sender<SurfaceEvent>,
) -> Result<(), SyncError> {
    let limit = state.lock().await.limits.notifications;
    if limit == 0 {
        return Ok(());
    }
    let notifications = backend.list_notifications(limit as u32).await?;
    state.lock().await.replace_notifications(notifications);
    publish_view(
        state,
        events,
        RenderDelta {
            notifications_changed: true,
            ..RenderDelta::default()
        },
    )
    .await;
    Ok(())
}

async fn publish_view(
    state: &Mutex<SurfaceState>,
    events: &broadcast::Sender<SurfaceEvent>,
    delta: RenderDelta,
) {
    let view = render(&*state.lock().await);
    let _ = events.send(SurfaceEvent::Rendered { view, delta });
}

fn toast(events: &broadcast::Sender<SurfaceEvent>, level: ToastLevel, message: impl Into<String>) {
    let _ = events.send(SurfaceEvent::Toast {
        level,
        message: message.into(),
    });
}

#[cfg(test)]
#[path = "tests/surface_tests.rs"]
mod tests;
