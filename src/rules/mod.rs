//! Behavior rule engine (C6): ROIs, rule variants, priority conflict
//! resolution and per-rule dwell/hysteresis state. Generalized from the
//! retrieval pack's `Zone`/`ZoneCounter` point-in-polygon counting into
//! the full rule set the spec requires.

mod engine;
mod roi;

pub use engine::{BehaviorEvent, BehaviorEventType, RuleEngine};
pub use roi::Roi;

use serde::{Deserialize, Serialize};

use crate::geometry::Point;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrusionRule {
    pub id: String,
    pub roi_id: String,
    pub min_duration_s: f64,
    pub allowed_classes: Vec<u32>,
    pub enabled: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoiteringRule {
    pub id: String,
    pub roi_id: String,
    pub dwell_threshold_s: f64,
    pub enabled: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrowdRule {
    pub id: String,
    pub roi_id: String,
    pub count_threshold: usize,
    pub window_s: f64,
    pub enabled: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineDirection {
    AtoB,
    BtoA,
    Either,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineCrossRule {
    pub id: String,
    pub segment: (Point, Point),
    pub direction: LineDirection,
    pub enabled: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BehaviorRule {
    Intrusion(IntrusionRule),
    Loitering(LoiteringRule),
    Crowd(CrowdRule),
    LineCross(LineCrossRule),
}

impl BehaviorRule {
    pub fn id(&self) -> &str {
        match self {
            BehaviorRule::Intrusion(r) => &r.id,
            BehaviorRule::Loitering(r) => &r.id,
            BehaviorRule::Crowd(r) => &r.id,
            BehaviorRule::LineCross(r) => &r.id,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            BehaviorRule::Intrusion(r) => r.enabled,
            BehaviorRule::Loitering(r) => r.enabled,
            BehaviorRule::Crowd(r) => r.enabled,
            BehaviorRule::LineCross(r) => r.enabled,
        }
    }

    pub fn roi_id(&self) -> Option<&str> {
        match self {
            BehaviorRule::Intrusion(r) => Some(&r.roi_id),
            BehaviorRule::Loitering(r) => Some(&r.roi_id),
            BehaviorRule::Crowd(r) => Some(&r.roi_id),
            BehaviorRule::LineCross(_) => None,
        }
    }
}
