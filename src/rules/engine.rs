//! Rule engine core (C6): per-camera ROI/rule state machine implementing
//! the §4.6 dispatch algorithm — representative point → single
//! highest-priority ROI → dwell/hysteresis tracking per rule variant.
//!
//! Grounded in the retrieval pack's `ZoneCounter` (per-track previous
//! position bookkeeping, entry/exit transitions), generalized from simple
//! in/out counting into the full Intrusion/Loitering/Crowd/LineCross set.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::geometry::{self, Point};
use crate::rules::roi::select_dispatch_roi;
use crate::rules::{BehaviorRule, Roi};
use crate::tracker::{Track, TrackState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorEventType {
    Intrusion,
    Loitering,
    Crowd,
    LineCross,
}

/// Immutable once emitted (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub id: String,
    pub camera_id: String,
    pub rule_id: String,
    pub roi_id: Option<String>,
    pub track_id: u32,
    pub global_track_id: Option<String>,
    pub event_type: BehaviorEventType,
    pub start_ts: DateTime<Utc>,
    pub confidence: f32,
    pub metadata: serde_json::Value,
    pub snapshot_ref: Option<String>,
}

/// Person class convention shared with the attribute analyzer and ReID
/// extractor: class_id 0 is "person".
const PERSON_CLASS_ID: u32 = 0;

struct IntrusionState {
    first_seen_ms: i64,
    fired: bool,
}

struct LoiteringState {
    first_seen_ms: i64,
    anchor: Point,
    fired: bool,
}

#[derive(Default)]
struct CrowdState {
    active_since_ms: Option<i64>,
    below_since_ms: Option<i64>,
    fired: bool,
}

/// Holds the ROIs and rules for one pipeline/camera and the per-rule
/// dwell/hysteresis state carried across frames.
pub struct RuleEngine {
    camera_id: String,
    frame_width: f64,
    frame_height: f64,
    min_area: f64,
    require_convex: bool,
    rois: Vec<Roi>,
    rules: Vec<BehaviorRule>,
    intrusion_state: HashMap<(String, u32), IntrusionState>,
    loitering_state: HashMap<(String, u32), LoiteringState>,
    crowd_state: HashMap<String, CrowdState>,
    line_cross_prev: HashMap<u32, Point>,
}

impl RuleEngine {
    pub fn new(camera_id: impl Into<String>, frame_width: f64, frame_height: f64, min_area: f64, require_convex: bool) -> Self {
        RuleEngine {
            camera_id: camera_id.into(),
            frame_width,
            frame_height,
            min_area,
            require_convex,
            rois: Vec::new(),
            rules: Vec::new(),
            intrusion_state: HashMap::new(),
            loitering_state: HashMap::new(),
            crowd_state: HashMap::new(),
            line_cross_prev: HashMap::new(),
        }
    }

    pub fn rois(&self) -> &[Roi] {
        &self.rois
    }

    pub fn rules(&self) -> &[BehaviorRule] {
        &self.rules
    }

    /// Validates and inserts (or atomically replaces) an ROI by id.
    pub fn set_roi(&mut self, roi: Roi) -> Result<()> {
        roi.validate(self.frame_width, self.frame_height, self.min_area, self.require_convex)?;
        self.rois.retain(|r| r.id != roi.id);
        self.rois.push(roi);
        Ok(())
    }

    pub fn remove_roi(&mut self, roi_id: &str) -> bool {
        let before = self.rois.len();
        self.rois.retain(|r| r.id != roi_id);
        self.rois.len() != before
    }

    /// Atomic replace-or-insert by rule id.
    pub fn set_rule(&mut self, rule: BehaviorRule) {
        self.rules.retain(|r| r.id() != rule.id());
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id() != rule_id);
        self.rules.len() != before
    }

    fn make_event(
        &self,
        rule_id: &str,
        roi_id: Option<String>,
        track_id: u32,
        global_track_id: Option<String>,
        event_type: BehaviorEventType,
        now: DateTime<Utc>,
        confidence: f32,
        metadata: serde_json::Value,
    ) -> BehaviorEvent {
        BehaviorEvent {
            id: Uuid::new_v4().to_string(),
            camera_id: self.camera_id.clone(),
            rule_id: rule_id.to_string(),
            roi_id,
            track_id,
            global_track_id,
            event_type,
            start_ts: now,
            confidence,
            metadata,
            snapshot_ref: None,
        }
    }

    /// Runs one evaluation pass over the current confirmed tracks,
    /// returning every event that fired this frame. `global_ids` maps
    /// local track id to an assigned cross-camera global id, if any.
    pub fn evaluate(&mut self, tracks: &[Track], now: DateTime<Utc>, global_ids: &HashMap<u32, String>) -> Vec<BehaviorEvent> {
        let now_ms = now.timestamp_millis();
        let seconds_since_midnight = now.num_seconds_from_midnight();
        let mut events = Vec::new();

        let mut roi_person_counts: HashMap<String, usize> = HashMap::new();
        let mut touched_intrusion: HashSet<(String, u32)> = HashSet::new();
        let mut touched_loitering: HashSet<(String, u32)> = HashSet::new();

        let confirmed: Vec<&Track> = tracks.iter().filter(|t| t.state == TrackState::Confirmed).collect();

        for track in &confirmed {
            let point = track.representative_point();
            let selected = select_dispatch_roi(point, &self.rois, seconds_since_midnight);
            let Some(roi) = selected else { continue };
            let roi_id = roi.id.clone();
            let roi_diag = bbox_diagonal(&roi.polygon);

            if track.class_id == PERSON_CLASS_ID {
                *roi_person_counts.entry(roi_id.clone()).or_insert(0) += 1;
            }

            // Clone matching rules up front to avoid borrowing self.rules
            // while also mutating self's per-rule state maps below.
            let matching: Vec<BehaviorRule> = self
                .rules
                .iter()
                .filter(|r| r.enabled() && r.roi_id() == Some(roi_id.as_str()))
                .cloned()
                .collect();

            for rule in matching {
                match rule {
                    BehaviorRule::Intrusion(r) => {
                        if !r.allowed_classes.is_empty() && !r.allowed_classes.contains(&track.class_id) {
                            continue;
                        }
                        let key = (r.id.clone(), track.local_id);
                        touched_intrusion.insert(key.clone());
                        let state = self
                            .intrusion_state
                            .entry(key)
                            .or_insert_with(|| IntrusionState { first_seen_ms: now_ms, fired: false });
                        let dwell_s = (now_ms - state.first_seen_ms) as f64 / 1000.0;
                        if !state.fired && dwell_s >= r.min_duration_s {
                            state.fired = true;
                            events.push(self.make_event(
                                &r.id,
                                Some(roi_id.clone()),
                                track.local_id,
                                global_ids.get(&track.local_id).cloned(),
                                BehaviorEventType::Intrusion,
                                now,
                                r.confidence,
                                serde_json::json!({ "dwell_seconds": dwell_s }),
                            ));
                        }
                    }
                    BehaviorRule::Loitering(r) => {
                        let key = (r.id.clone(), track.local_id);
                        touched_loitering.insert(key.clone());
                        let radius = roi_diag * 0.2;
                        let state = self.loitering_state.entry(key).or_insert_with(|| LoiteringState {
                            first_seen_ms: now_ms,
                            anchor: point,
                            fired: false,
                        });
                        let dist = ((point.0 - state.anchor.0).powi(2) + (point.1 - state.anchor.1).powi(2)).sqrt();
                        if dist > radius {
                            state.anchor = point;
                            state.first_seen_ms = now_ms;
                            state.fired = false;
                        }
                        let dwell_s = (now_ms - state.first_seen_ms) as f64 / 1000.0;
                        if !state.fired && dwell_s >= r.dwell_threshold_s {
                            state.fired = true;
                            events.push(self.make_event(
                                &r.id,
                                Some(roi_id.clone()),
                                track.local_id,
                                global_ids.get(&track.local_id).cloned(),
                                BehaviorEventType::Loitering,
                                now,
                                r.confidence,
                                serde_json::json!({ "dwell_seconds": dwell_s }),
                            ));
                        }
                    }
                    BehaviorRule::Crowd(_) | BehaviorRule::LineCross(_) => {}
                }
            }
        }

        // Re-arm: any (rule, track) pair not touched this frame means the
        // track left the dispatched ROI (or lost the priority contest),
        // so its dwell state resets.
        self.intrusion_state.retain(|k, _| touched_intrusion.contains(k));
        self.loitering_state.retain(|k, _| touched_loitering.contains(k));

        // Crowd: counted independently of per-track rule dispatch above,
        // using the same priority-resolved membership.
        let crowd_rules: Vec<crate::rules::CrowdRule> = self
            .rules
            .iter()
            .filter_map(|r| match r {
                BehaviorRule::Crowd(c) if c.enabled => Some(c.clone()),
                _ => None,
            })
            .collect();
        for rule in crowd_rules {
            let count = roi_person_counts.get(&rule.roi_id).copied().unwrap_or(0);
            if let Some(ev) = self.eval_crowd(&rule, count, now_ms, now) {
                events.push(ev);
            }
        }

        // LineCross: independent of ROI priority resolution entirely.
        let line_rules: Vec<crate::rules::LineCrossRule> = self
            .rules
            .iter()
            .filter_map(|r| match r {
                BehaviorRule::LineCross(l) if l.enabled => Some(l.clone()),
                _ => None,
            })
            .collect();
        let mut seen_tracks: HashSet<u32> = HashSet::new();
        for track in &confirmed {
            seen_tracks.insert(track.local_id);
            let point = track.representative_point();
            let prev = self.line_cross_prev.insert(track.local_id, point);
            let Some(prev) = prev else { continue };
            if prev == point {
                continue;
            }
            for rule in &line_rules {
                if !geometry::segment_intersect(prev, point, rule.segment.0, rule.segment.1) {
                    continue;
                }
                let crossing_dir = crossing_direction(rule.segment, prev, point);
                let matches = rule.direction == crate::rules::LineDirection::Either || crossing_dir == rule.direction;
                if matches {
                    events.push(self.make_event(
                        &rule.id,
                        None,
                        track.local_id,
                        global_ids.get(&track.local_id).cloned(),
                        BehaviorEventType::LineCross,
                        now,
                        rule.confidence,
                        serde_json::json!({}),
                    ));
                }
            }
        }
        self.line_cross_prev.retain(|id, _| seen_tracks.contains(id));

        events
    }

    fn eval_crowd(&mut self, rule: &crate::rules::CrowdRule, count: usize, now_ms: i64, now: DateTime<Utc>) -> Option<BehaviorEvent> {
        let state = self.crowd_state.entry(rule.id.clone()).or_default();
        if count >= rule.count_threshold {
            if state.active_since_ms.is_none() {
                state.active_since_ms = Some(now_ms);
            }
            state.below_since_ms = None;
            let dwell_s = (now_ms - state.active_since_ms.unwrap()) as f64 / 1000.0;
            if !state.fired && dwell_s >= rule.window_s {
                state.fired = true;
                return Some(self.make_event(
                    &rule.id,
                    Some(rule.roi_id.clone()),
                    0,
                    None,
                    BehaviorEventType::Crowd,
                    now,
                    rule.confidence,
                    serde_json::json!({ "count": count }),
                ));
            }
        } else {
            state.active_since_ms = None;
            let hysteresis_threshold = rule.count_threshold.saturating_sub(1);
            if count < hysteresis_threshold {
                if state.below_since_ms.is_none() {
                    state.below_since_ms = Some(now_ms);
                }
                let below_s = (now_ms - state.below_since_ms.unwrap()) as f64 / 1000.0;
                if state.fired && below_s >= 2.0 {
                    state.fired = false;
                }
            } else {
                state.below_since_ms = None;
            }
        }
        None
    }
}

fn bbox_diagonal(polygon: &[Point]) -> f64 {
    if polygon.is_empty() {
        return 0.0;
    }
    let min_x = polygon.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = polygon.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = polygon.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    ((max_x - min_x).powi(2) + (max_y - min_y).powi(2)).sqrt()
}

/// Which side of the rule's oriented segment the movement crosses to,
/// expressed in the same `LineDirection` vocabulary as configured rules.
fn crossing_direction(segment: (Point, Point), prev: Point, curr: Point) -> crate::rules::LineDirection {
    let prev_side = orientation_sign(segment, prev);
    let curr_side = orientation_sign(segment, curr);
    if prev_side > 0.0 && curr_side <= 0.0 {
        crate::rules::LineDirection::AtoB
    } else {
        crate::rules::LineDirection::BtoA
    }
}

fn orientation_sign(segment: (Point, Point), p: Point) -> f64 {
    let (a, b) = segment;
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{IntrusionRule, LineDirection};

    fn person_track(local_id: u32, x: f32, y: f32) -> Track {
        serde_json::from_value(serde_json::json!({
            "local_id": local_id,
            "class_id": 0,
            "bbox": { "x": x, "y": y, "w": 20.0, "h": 40.0 },
            "confidence": 0.9,
            "age_frames": 5,
            "time_since_update": 0,
            "state": "Confirmed",
            "hits": 5,
            "velocity": [0.0, 0.0]
        }))
        .unwrap()
    }

    fn rect_roi(id: &str, priority: u8) -> Roi {
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
    fn intrusion_fires_once_after_min_duration() {
        let mut engine = RuleEngine::new("cam1", 1920.0, 1080.0, 100.0, false);
        engine.set_roi(rect_roi("roiA", 1)).unwrap();
        engine.set_rule(BehaviorRule::Intrusion(IntrusionRule {
            id: "r1".into(),
            roi_id: "roiA".into(),
            min_duration_s: 2.0,
            allowed_classes: vec![0],
            enabled: true,
            confidence: 0.9,
        }));

        let base = chrono::Utc::now();
        let track = person_track(7, 190.0, 160.0); // bottom-center inside rect
        let empty = HashMap::new();

        let e1 = engine.evaluate(&[track.clone()], base, &empty);
        assert!(e1.is_empty());

        let e2 = engine.evaluate(&[track.clone()], base + chrono::Duration::milliseconds(1500), &empty);
        assert!(e2.is_empty());

        let e3 = engine.evaluate(&[track.clone()], base + chrono::Duration::milliseconds(2100), &empty);
        assert_eq!(e3.len(), 1);
        assert_eq!(e3[0].event_type, BehaviorEventType::Intrusion);

        // No re-fire while track stays.
        let e4 = engine.evaluate(&[track], base + chrono::Duration::milliseconds(3000), &empty);
        assert!(e4.is_empty());
    }

    #[test]
    fn priority_overlap_dispatches_only_to_higher_priority_roi() {
        let mut engine = RuleEngine::new("cam1", 1920.0, 1080.0, 100.0, false);
        let a = rect_roi("A", 5);
        let mut b = rect_roi("B", 3);
        b.polygon = vec![(150.0, 150.0), (350.0, 150.0), (350.0, 350.0), (150.0, 350.0)];
        engine.set_roi(a).unwrap();
        engine.set_roi(b).unwrap();
        engine.set_rule(BehaviorRule::Intrusion(IntrusionRule {
            id: "ruleA".into(),
            roi_id: "A".into(),
            min_duration_s: 0.0,
            allowed_classes: vec![],
            enabled: true,
            confidence: 0.9,
        }));
        engine.set_rule(BehaviorRule::Intrusion(IntrusionRule {
            id: "ruleB".into(),
            roi_id: "B".into(),
            min_duration_s: 0.0,
            allowed_classes: vec![],
            enabled: true,
            confidence: 0.9,
        }));

        let now = chrono::Utc::now();
        // representative point (200,200) lies in both A and B.
        let track = person_track(1, 190.0, 160.0);
        let empty = HashMap::new();
        let events = engine.evaluate(&[track], now, &empty);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, "ruleA");
        assert_eq!(events[0].roi_id.as_deref(), Some("A"));
    }

    #[test]
    fn line_cross_direction_gate() {
        let segment = ((0.0, 100.0), (200.0, 100.0));
        let prev = (50.0, 50.0);
        let curr = (50.0, 150.0);
        let dir = crossing_direction(segment, prev, curr);
        assert_eq!(dir, LineDirection::AtoB);

        // Reverse crossing yields the opposite direction.
        let dir_back = crossing_direction(segment, curr, prev);
        assert_eq!(dir_back, LineDirection::BtoA);
    }
}
