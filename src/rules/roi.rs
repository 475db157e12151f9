//! ROI entity and validation (§3, §4.6), built on [`crate::geometry`].

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::{self, Point};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roi {
    pub id: String,
    pub name: String,
    pub polygon: Vec<Point>,
    pub priority: u8,
    pub enabled: bool,
    /// Wall-clock daily window, as seconds-since-midnight UTC. `None`
    /// means always active.
    pub time_window: Option<(u32, u32)>,
}

impl Roi {
    /// Validates vertex count, bounds, area, self-intersection and
    /// (optionally) convexity, in the order §4.6 enumerates them.
    pub fn validate(&self, frame_width: f64, frame_height: f64, min_area: f64, require_convex: bool) -> Result<()> {
        geometry::validate_polygon(&self.polygon, frame_width, frame_height, min_area, require_convex)
    }

    pub fn is_active_at(&self, seconds_since_midnight_utc: u32) -> bool {
        if !self.enabled {
            return false;
        }
        match self.time_window {
            None => true,
            Some((start, end)) if start <= end => seconds_since_midnight_utc >= start && seconds_since_midnight_utc < end,
            // Window wraps past midnight.
            Some((start, end)) => seconds_since_midnight_utc >= start || seconds_since_midnight_utc < end,
        }
    }
}

/// Selects, among the ROIs containing `point` and active at `now`, the
/// single highest-priority one, ties broken by lexicographic id order
/// (§4.6 step 3).
pub fn select_dispatch_roi<'a>(point: Point, rois: &'a [Roi], seconds_since_midnight_utc: u32) -> Option<&'a Roi> {
    rois.iter()
        .filter(|r| r.is_active_at(seconds_since_midnight_utc))
        .filter(|r| geometry::point_in_polygon(point, &r.polygon))
        .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.id.cmp(&a.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi(id: &str, priority: u8) -> Roi {
        Roi {
            id: id.to_string(),
            name: id.to_string(),
            polygon: vec![(100.0, 100.0), (300.0, 100.0), (300.0, 300.0), (100.0, 300.0)],
            priority,
            enabled: true,
            time_window: None,
        }
    }

    #[test]
    fn overlapping_rois_resolve_to_highest_priority() {
        let a = roi("A", 5);
        let mut b = roi("B", 3);
        b.polygon = vec![(150.0, 150.0), (350.0, 150.0), (350.0, 350.0), (150.0, 350.0)];
        let rois = vec![a, b];
        let selected = select_dispatch_roi((200.0, 200.0), &rois, 0).unwrap();
        assert_eq!(selected.id, "A");
    }

    #[test]
    fn disabled_roi_is_never_selected() {
        let mut a = roi("A", 5);
        a.enabled = false;
        let rois = vec![a];
        assert!(select_dispatch_roi((200.0, 200.0), &rois, 0).is_none());
    }
}
