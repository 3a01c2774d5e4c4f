//! Status colors and polygon styles shared by every surface.

use serde::Serialize;

use crate::domain::SectorStatus;

pub const PENDING_COLOR: &str = "#dc3545";
pub const EN_ROUTE_COLOR: &str = "#ffc107";
pub const COLLECTED_COLOR: &str = "#28a745";
pub const UNKNOWN_COLOR: &str = "#6c757d";

const STROKE_COLOR: &str = "#fff";
const SELECTED_STROKE_COLOR: &str = "#000";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorStyle {
    pub fill_color: &'static str,
    pub color: &'static str,
    pub weight: u8,
    pub opacity: f32,
    pub fill_opacity: f32,
    pub class_name: String,
}

impl SectorStyle {
    pub fn highlighted(mut self) -> Self {
        self.color = SELECTED_STROKE_COLOR;
        self.weight = 3;
        self
    }
}

/// Fill color for a raw status token. Anything outside the three known
/// tokens maps to the neutral gray.
pub fn status_color(token: &str) -> &'static str {
    match SectorStatus::parse(token) {
        Some(SectorStatus::Pending) => PENDING_COLOR,
        Some(SectorStatus::EnRoute) => EN_ROUTE_COLOR,
        Some(SectorStatus::Collected) => COLLECTED_COLOR,
        None => UNKNOWN_COLOR,
    }
}

pub fn status_to_style(token: &str) -> SectorStyle {
    SectorStyle {
        fill_color: status_color(token),
        color: STROKE_COLOR,
        weight: 2,
        opacity: 1.0,
        fill_opacity: 0.7,
        class_name: format!("sector-{}", token.trim()),
    }
}

impl SectorStatus {
    pub fn style(self) -> SectorStyle {
        status_to_style(self.as_str())
    }

    pub fn badge_class(self) -> &'static str {
        match self {
            SectorStatus::Collected => "bg-success",
            SectorStatus::EnRoute => "bg-warning",
            SectorStatus::Pending => "bg-danger",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_statuses_map_to_fixed_colors() {
        assert_eq!(status_color("pending"), "#dc3545");
        assert_eq!(status_color("en_route"), "#ffc107");
        assert_eq!(status_color("collected"), "#28a745");
    }

    #[test]
    fn unrecognized_tokens_map_to_neutral_gray() {
        for token in ["", "done", "PENDING", "en route"] {
            assert_eq!(status_color(token), UNKNOWN_COLOR, "token {token:?}");
        }
    }

    #[test]
    fn style_mapping_is_pure_and_limited_to_four_colors() {
        let palette = [PENDING_COLOR, EN_ROUTE_COLOR, COLLECTED_COLOR, UNKNOWN_COLOR];
        for token in ["pending", "en_route", "collected", "x", "pending"] {
            let first = status_to_style(token);
            assert_eq!(first, status_to_style(token));
            assert!(palette.contains(&first.fill_color));
        }
    }

    #[test]
    fn highlight_only_changes_stroke() {
        let base = SectorStatus::EnRoute.style();
        let highlighted = base.clone().highlighted();
        assert_eq!(highlighted.fill_color, base.fill_color);
        assert_eq!(highlighted.color, "#000");
        assert_eq!(highlighted.weight, 3);
        assert_eq!(base.class_name, "sector-en_route");
    }
}
