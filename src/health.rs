// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream health monitor (C10): frame-rate EWMA, error counting and the
//! `stable` predicate that drives §4.1's reconnect state machine and the
//! manager's failed-pipeline observation.

use serde::{Deserialize, Serialize};

use crate::source::SourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Running,
    Degraded,
    Reconnecting,
    Failed,
}

impl From<SourceState> for PipelineState {
    fn from(s: SourceState) -> Self {
        match s {
            SourceState::Init => PipelineState::Init,
            SourceState::Running => PipelineState::Running,
            SourceState::Reconnecting => PipelineState::Reconnecting,
            SourceState::Failed => PipelineState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub camera_id: String,
    pub frame_rate_ewma: f64,
    pub consecutive_errors: u32,
    pub last_frame_ts_us: i64,
    pub reconnect_count: u32,
    pub state: PipelineState,
    pub dropped_frames: u64,
    pub selected_backend: Option<String>,
}

/// EWMA smoothing factor for inter-arrival-derived frame rate.
const ALPHA: f64 = 0.2;

/// Per-pipeline health accumulator. Owned by the [`crate::pipeline::VideoPipeline`]
/// and updated once per tick; read concurrently by the manager's monitoring
/// loop and the HTTP surface.
pub struct HealthMonitor {
    camera_id: String,
    configured_fps: u32,
    stable_rate_ratio: f64,
    error_threshold: u32,
    frame_rate_ewma: f64,
    last_frame_ts_us: Option<i64>,
    consecutive_errors: u32,
    reconnect_count: u32,
    state: PipelineState,
    dropped_frames: u64,
    selected_backend: Option<String>,
}

impl HealthMonitor {
    pub fn new(camera_id: impl Into<String>, configured_fps: u32, stable_rate_ratio: f64, error_threshold: u32) -> Self {
        HealthMonitor {
            camera_id: camera_id.into(),
            configured_fps,
            stable_rate_ratio,
            error_threshold,
            frame_rate_ewma: 0.0,
            last_frame_ts_us: None,
            consecutive_errors: 0,
            reconnect_count: 0,
            state: PipelineState::Init,
            dropped_frames: 0,
            selected_backend: None,
        }
    }

    pub fn on_frame(&mut self, timestamp_us: i64) {
        if let Some(last) = self.last_frame_ts_us {
            let dt_us = (timestamp_us - last).max(1) as f64;
            let instantaneous = 1_000_000.0 / dt_us;
            self.frame_rate_ewma = ALPHA * instantaneous + (1.0 - ALPHA) * self.frame_rate_ewma;
        }
        self.last_frame_ts_us = Some(timestamp_us);
        self.consecutive_errors = 0;
    }

    pub fn on_error(&mut self) {
        self.consecutive_errors += 1;
    }

    pub fn on_reconnect_attempt(&mut self) {
        self.reconnect_count += 1;
    }

    pub fn set_state(&mut self, state: PipelineState) {
        self.state = state;
    }

    pub fn set_selected_backend(&mut self, name: &str) {
        self.selected_backend = Some(name.to_string());
    }

    pub fn set_dropped_frames(&mut self, dropped: u64) {
        self.dropped_frames = dropped;
    }

    /// `stable = frame_rate_ewma >= 0.5 * configured_fps AND consecutive_errors < error_threshold` (§4.10).
    pub fn is_stable(&self) -> bool {
        self.frame_rate_ewma >= self.stable_rate_ratio * self.configured_fps as f64
            && self.consecutive_errors < self.error_threshold
    }

    pub fn snapshot(&self) -> PipelineHealth {
        let state = if self.state == PipelineState::Running && !self.is_stable() {
            PipelineState::Degraded
        } else {
            self.state
        };
        PipelineHealth {
            camera_id: self.camera_id.clone(),
            frame_rate_ewma: self.frame_rate_ewma,
            consecutive_errors: self.consecutive_errors,
            last_frame_ts_us: self.last_frame_ts_us.unwrap_or(0),
            reconnect_count: self.reconnect_count,
            state,
            dropped_frames: self.dropped_frames,
            selected_backend: self.selected_backend.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_when_frame_rate_drops_below_half_configured() {
        let mut monitor = HealthMonitor::new("cam1", 30, 0.5, 10);
        monitor.set_state(PipelineState::Running);
        let mut ts = 0i64;
        for _ in 0..20 {
            ts += 200_000; // 5 fps, well below half of 30fps
            monitor.on_frame(ts);
        }
        assert!(!monitor.is_stable());
        assert_eq!(monitor.snapshot().state, PipelineState::Degraded);
    }

    #[test]
    fn stays_running_at_full_rate() {
        let mut monitor = HealthMonitor::new("cam1", 30, 0.5, 10);
        monitor.set_state(PipelineState::Running);
        let mut ts = 0i64;
        for _ in 0..30 {
            ts += 33_333;
            monitor.on_frame(ts);
        }
        assert!(monitor.is_stable());
        assert_eq!(monitor.snapshot().state, PipelineState::Running);
    }

    #[test]
    fn error_threshold_breaks_stability() {
        let mut monitor = HealthMonitor::new("cam1", 30, 0.5, 3);
        monitor.set_state(PipelineState::Running);
        monitor.on_frame(0);
        monitor.on_frame(33_333);
        for _ in 0..3 {
            monitor.on_error();
        }
        assert!(!monitor.is_stable());
    }
}
