//! Pure state handling for a surface: a reducer that folds batches of server
//! events into [`SurfaceState`] and a projection that turns state into a
//! [`SurfaceView`]. Nothing here performs I/O.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{HistoryEntry, NotificationId, NotificationReport, Sector, SectorId, SectorStatus},
    error::ApiError,
    protocol::{ChangeKind, ServerEvent},
    style::SectorStyle,
};

/// Upper bound of events folded into one batch.
pub const MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListLimits {
    pub notifications: usize,
    pub history: usize,
}

impl Default for ListLimits {
    fn default() -> Self {
        Self {
            notifications: 10,
            history: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub en_route: usize,
    pub collected: usize,
}

impl StatusSummary {
    /// Full re-scan; the result does not depend on event order.
    pub fn from_sectors<'a>(sectors: impl IntoIterator<Item = &'a Sector>) -> Self {
        let mut summary = Self::default();
        for sector in sectors {
            match sector.status {
                SectorStatus::Pending => summary.pending += 1,
                SectorStatus::EnRoute => summary.en_route += 1,
                SectorStatus::Collected => summary.collected += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.pending + self.en_route + self.collected
    }

    pub fn count(&self, status: SectorStatus) -> usize {
        match status {
            SectorStatus::Pending => self.pending,
            SectorStatus::EnRoute => self.en_route,
            SectorStatus::Collected => self.collected,
        }
    }

    /// Share of `status` in percent. Zero when there are no sectors.
    pub fn percentage(&self, status: SectorStatus) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.count(status) as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SurfaceState {
    pub sectors: BTreeMap<SectorId, Sector>,
    pub selected: Option<SectorId>,
    pub notifications: Vec<NotificationReport>,
    pub history: Vec<HistoryEntry>,
    /// Notifications picked for bulk deletion. Always a subset of
    /// `notifications`.
    pub marked: BTreeSet<NotificationId>,
    pub summary: StatusSummary,
    pub limits: ListLimits,
}

impl SurfaceState {
    pub fn with_limits(limits: ListLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn load_sectors(&mut self, sectors: Vec<Sector>) {
        self.sectors = sectors
            .into_iter()
            .map(|sector| (sector.id.clone(), sector))
            .collect();
        if let Some(selected) = &self.selected {
            if !self.sectors.contains_key(selected) {
                self.selected = None;
            }
        }
        self.recount();
    }

    /// Applies a record returned by a local mutation unless the change feed
    /// already delivered a later write to the same sector. Returns whether
    /// the record was applied.
    pub fn apply_committed(&mut self, sector: Sector) -> bool {
        let stale = self
            .sectors
            .get(&sector.id)
            .is_some_and(|cached| cached.last_updated > sector.last_updated);
        if stale {
            return false;
        }
        self.sectors.insert(sector.id.clone(), sector);
        self.recount();
        true
    }

    pub fn selected_sector(&self) -> Option<&Sector> {
        self.selected.as_ref().and_then(|id| self.sectors.get(id))
    }

    pub fn select(&mut self, sector_id: &SectorId) -> Option<&Sector> {
        if !self.sectors.contains_key(sector_id) {
            return None;
        }
        self.selected = Some(sector_id.clone());
        self.sectors.get(sector_id)
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn replace_notifications(&mut self, mut notifications: Vec<NotificationReport>) {
        sort_notifications(&mut notifications);
        notifications.truncate(self.limits.notifications);
        self.notifications = notifications;
        self.reconcile_marks();
    }

    pub fn replace_history(&mut self, mut history: Vec<HistoryEntry>) {
        sort_history(&mut history);
        history.truncate(self.limits.history);
        self.history = history;
    }

    /// Flips the mark of a listed notification and returns the new state.
    /// Unlisted ids are never marked.
    pub fn toggle_mark(&mut self, notification_id: NotificationId) -> bool {
        if !self.is_listed(notification_id) {
            return false;
        }
        if !self.marked.remove(&notification_id) {
            self.marked.insert(notification_id);
        }
        self.marked.contains(&notification_id)
    }

    pub fn set_marked(&mut self, notification_id: NotificationId, marked: bool) -> bool {
        if marked && self.is_listed(notification_id) {
            self.marked.insert(notification_id);
            true
        } else {
            self.marked.remove(&notification_id);
            false
        }
    }

    pub fn clear_marks(&mut self) {
        self.marked.clear();
    }

    fn is_listed(&self, notification_id: NotificationId) -> bool {
        self.notifications.iter().any(|n| n.id == notification_id)
    }

    fn reconcile_marks(&mut self) {
        let listed: BTreeSet<NotificationId> = self.notifications.iter().map(|n| n.id).collect();
        self.marked.retain(|id| listed.contains(id));
    }

    fn recount(&mut self) {
        self.summary = StatusSummary::from_sectors(self.sectors.values());
    }
}

/// What changed while folding one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderDelta {
    pub restyled: BTreeSet<SectorId>,
    pub removed: BTreeSet<SectorId>,
    pub detail_refreshed: bool,
    pub selection_cleared: bool,
    pub notifications_changed: bool,
    pub history_changed: bool,
    pub errors: Vec<ApiError>,
    /// The server dropped events; cached state must be reloaded.
    pub resync_required: bool,
    /// A delete left the notification list below its limit.
    pub notifications_short: bool,
}

impl RenderDelta {
    pub fn is_empty(&self) -> bool {
        self.restyled.is_empty()
            && self.removed.is_empty()
            && !self.detail_refreshed
            && !self.selection_cleared
            && !self.notifications_changed
            && !self.history_changed
            && self.errors.is_empty()
    }
}

/// Folds a batch of server events into `state`.
///
/// Events inside a batch may be in any order; aggregate counts are rebuilt
/// from the full sector set once the batch is applied.
pub fn reduce(mut state: SurfaceState, batch: &[ServerEvent]) -> (SurfaceState, RenderDelta) {
    let mut delta = RenderDelta::default();
    for event in batch {
        apply_event(&mut state, event, &mut delta);
    }

    if delta.notifications_changed {
        sort_notifications(&mut state.notifications);
        state.notifications.truncate(state.limits.notifications);
        state.reconcile_marks();
    }
    delta.notifications_short &= state.notifications.len() < state.limits.notifications;
    if delta.history_changed {
        sort_history(&mut state.history);
        state.history.truncate(state.limits.history);
    }
    state.recount();
    (state, delta)
}

fn apply_event(state: &mut SurfaceState, event: &ServerEvent, delta: &mut RenderDelta) {
    match event {
        ServerEvent::SectorChanged { change } => {
            let sector_id = change.sector.id.clone();
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    state.sectors.insert(sector_id.clone(), change.sector.clone());
                    if state.selected.as_ref() == Some(&sector_id) {
                        delta.detail_refreshed = true;
                    }
                    delta.removed.remove(&sector_id);
                    delta.restyled.insert(sector_id);
                }
                ChangeKind::Removed => {
                    state.sectors.remove(&sector_id);
                    if state.selected.as_ref() == Some(&sector_id) {
                        state.selected = None;
                        delta.selection_cleared = true;
                    }
                    delta.restyled.remove(&sector_id);
                    delta.removed.insert(sector_id);
                }
            }
        }
        ServerEvent::HistoryAppended { entry } => {
            if state.limits.history == 0 {
                return;
            }
            if !state.history.iter().any(|e| e.id == entry.id) {
                state.history.push(entry.clone());
                delta.history_changed = true;
            }
        }
        ServerEvent::HistoryPurged { .. } => {
            if !state.history.is_empty() {
                state.history.clear();
                delta.history_changed = true;
            }
        }
        ServerEvent::NotificationPosted { report } => {
            if state.limits.notifications == 0 {
                return;
            }
            if !state.notifications.iter().any(|n| n.id == report.id) {
                state.notifications.push(report.clone());
                delta.notifications_changed = true;
            }
        }
        ServerEvent::NotificationDeleted { notification_id } => {
            let before = state.notifications.len();
            state.notifications.retain(|n| n.id != *notification_id);
            if state.notifications.len() != before {
                delta.notifications_changed = true;
                delta.notifications_short = true;
            }
        }
        ServerEvent::Resync { .. } => delta.resync_required = true,
        ServerEvent::Error(err) => delta.errors.push(err.clone()),
    }
}

fn sort_notifications(notifications: &mut [NotificationReport]) {
    notifications.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

fn sort_history(history: &mut [HistoryEntry]) {
    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorLayer {
    pub id: SectorId,
    pub name: String,
    pub status: SectorStatus,
    pub style: SectorStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailPanel {
    pub id: SectorId,
    pub name: String,
    pub status: SectorStatus,
    pub label: String,
    pub badge_class: &'static str,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRow {
    pub report: NotificationReport,
    pub marked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceView {
    pub layers: Vec<SectorLayer>,
    pub detail: Option<DetailPanel>,
    pub summary: StatusSummary,
    pub notifications: Vec<NotificationRow>,
    pub history: Vec<HistoryEntry>,
}

pub fn render(state: &SurfaceState) -> SurfaceView {
    let layers = state
        .sectors
        .values()
        .map(|sector| {
            let style = sector.status.style();
            let selected = state.selected.as_ref() == Some(&sector.id);
            SectorLayer {
                id: sector.id.clone(),
                name: sector.name.clone(),
                status: sector.status,
                style: if selected { style.highlighted() } else { style },
            }
        })
        .collect();

    let detail = state.selected_sector().map(|sector| DetailPanel {
        id: sector.id.clone(),
        name: sector.name.clone(),
        status: sector.status,
        label: sector.status.label(),
        badge_class: sector.status.badge_class(),
        last_updated: sector.last_updated,
    });

    let notifications = state
        .notifications
        .iter()
        .map(|report| NotificationRow {
            report: report.clone(),
            marked: state.marked.contains(&report.id),
        })
        .collect();

    SurfaceView {
        layers,
        detail,
        summary: state.summary,
        notifications,
        history: state.history.clone(),
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
