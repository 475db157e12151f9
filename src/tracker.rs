//! ByteTrack-style two-stage IoU tracker (C3). Grounded in the retrieval
//! pack's `ByteTracker` (greedy IoU matching over confirmed/tentative
//! tracks), generalized to the spec's high/low-confidence split,
//! deterministic lower-id-wins tie-break, and explicit `Removed` state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::detection::{BBox, Detection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub local_id: u32,
    pub class_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
    pub age_frames: u32,
    pub time_since_update: u32,
    pub state: TrackState,
    pub hits: u32,
    #[serde(skip)]
    pub reid_embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub attributes: Option<crate::attributes::PersonAttributes>,
    /// Velocity estimate (dx, dy per frame) from the simple constant-velocity
    /// predict step used in lieu of a full Kalman filter state vector.
    velocity: (f32, f32),
}

impl Track {
    /// Bbox bottom-center, the representative point used by the behavior
    /// rule engine (§4.6).
    pub fn representative_point(&self) -> (f64, f64) {
        (
            (self.bbox.x + self.bbox.w / 2.0) as f64,
            (self.bbox.y + self.bbox.h) as f64,
        )
    }

    fn predict(&mut self) {
        self.bbox.x += self.velocity.0;
        self.bbox.y += self.velocity.1;
    }
}

/// Constant-velocity predict/update gain, the weight given to the latest
/// per-frame displacement versus the track's existing velocity estimate.
const VELOCITY_GAIN: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub high_thresh: f32,
    pub low_thresh: f32,
    pub min_hits: u32,
    pub max_lost_frames: u32,
    /// Minimum IoU to accept an association in either stage.
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            high_thresh: 0.5,
            low_thresh: 0.1,
            min_hits: 3,
            max_lost_frames: 30,
            iou_threshold: 0.3,
        }
    }
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Tracker {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Attaches a ReID embedding to the track with the given local id, if
    /// still present. Called by the pipeline after C4 extraction since the
    /// tracker owns track storage but doesn't itself run ReID.
    pub fn set_reid_embedding(&mut self, local_id: u32, embedding: Vec<f32>) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.local_id == local_id) {
            t.reid_embedding = Some(embedding);
        }
    }

    /// Attaches analyzed attributes to the track with the given local id,
    /// if still present.
    pub fn set_attributes(&mut self, local_id: u32, attributes: crate::attributes::PersonAttributes) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.local_id == local_id) {
            t.attributes = Some(attributes);
        }
    }

    /// Applies a matched detection to a track: updates its bbox/confidence
    /// and re-estimates `velocity` from the observed displacement (an EWMA
    /// blend against the prior estimate), the stand-in for a Kalman
    /// filter's predict/update step (§4.3).
    fn apply_match(track: &mut Track, det: &Detection) {
        let dx = det.bbox.x - track.bbox.x;
        let dy = det.bbox.y - track.bbox.y;
        track.velocity.0 = track.velocity.0 * (1.0 - VELOCITY_GAIN) + dx * VELOCITY_GAIN;
        track.velocity.1 = track.velocity.1 * (1.0 - VELOCITY_GAIN) + dy * VELOCITY_GAIN;
        track.bbox = det.bbox;
        track.confidence = det.confidence;
        track.time_since_update = 0;
        track.hits += 1;
    }

    /// Greedy association, deterministic by iterating candidate pairs in
    /// (lower track local_id, higher IoU) priority order so ties between
    /// equal-cost candidates always resolve to the lower id.
    fn associate(tracks: &mut [Track], track_indices: &[usize], detections: &[Detection], iou_threshold: f32) -> (Vec<(usize, usize)>, Vec<usize>) {
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for &ti in track_indices {
            for (di, det) in detections.iter().enumerate() {
                let iou = tracks[ti].bbox.iou(&det.bbox);
                if iou >= iou_threshold {
                    pairs.push((ti, di, iou));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tracks[a.0].local_id.cmp(&tracks[b.0].local_id))
        });

        let mut track_used = vec![false; tracks.len()];
        let mut det_used = vec![false; detections.len()];
        let mut matched = Vec::new();
        for (ti, di, _) in pairs {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            matched.push((ti, di));
        }
        let unmatched_dets: Vec<usize> = (0..detections.len()).filter(|d| !det_used[*d]).collect();
        (matched, unmatched_dets)
    }

    /// Runs one tracking step: predict, two-stage associate, track
    /// lifecycle transitions. Returns the current set of confirmed tracks
    /// after the update.
    pub fn update(&mut self, detections: &[Detection]) -> &[Track] {
        for t in &mut self.tracks {
            t.predict();
            t.age_frames += 1;
            t.time_since_update += 1;
        }

        let high: Vec<Detection> = detections.iter().filter(|d| d.confidence >= self.config.high_thresh).cloned().collect();
        let low: Vec<Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.config.low_thresh && d.confidence < self.config.high_thresh)
            .cloned()
            .collect();

        let confirmed_indices: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TrackState::Confirmed)
            .map(|(i, _)| i)
            .collect();

        let (matched_high, unmatched_high_dets) =
            Self::associate(&mut self.tracks, &confirmed_indices, &high, self.config.iou_threshold);
        let matched_high_track_ids: std::collections::HashSet<usize> = matched_high.iter().map(|(t, _)| *t).collect();
        let remaining_confirmed: Vec<usize> = confirmed_indices
            .into_iter()
            .filter(|t| !matched_high_track_ids.contains(t))
            .collect();

        let (matched_low, _unmatched_low_dets) =
            Self::associate(&mut self.tracks, &remaining_confirmed, &low, self.config.iou_threshold);

        for (ti, di) in &matched_high {
            let det = &high[*di];
            Self::apply_match(&mut self.tracks[*ti], det);
        }
        for (ti, di) in &matched_low {
            let det = &low[*di];
            Self::apply_match(&mut self.tracks[*ti], det);
        }

        let tentative_indices: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TrackState::Tentative)
            .map(|(i, _)| i)
            .collect();
        let (matched_tentative, unmatched_high_after_tentative) =
            Self::associate(&mut self.tracks, &tentative_indices, &high_subset(&high, &unmatched_high_dets), self.config.iou_threshold);
        let high_unmatched = high_subset(&high, &unmatched_high_dets);
        for (ti, di) in &matched_tentative {
            let det = &high_unmatched[*di];
            Self::apply_match(&mut self.tracks[*ti], det);
        }

        for di in unmatched_high_after_tentative {
            let det = &high_unmatched[di];
            let track = Track {
                local_id: self.next_id,
                class_id: det.class_id,
                bbox: det.bbox,
                confidence: det.confidence,
                age_frames: 0,
                time_since_update: 0,
                state: TrackState::Tentative,
                hits: 1,
                reid_embedding: None,
                attributes: None,
                velocity: (0.0, 0.0),
            };
            self.next_id += 1;
            self.tracks.push(track);
        }

        for t in &mut self.tracks {
            if t.time_since_update == 0 && t.state == TrackState::Tentative && t.hits >= self.config.min_hits {
                t.state = TrackState::Confirmed;
            }
            if t.time_since_update == 0 && t.state == TrackState::Lost {
                t.state = TrackState::Confirmed;
            }
            if t.state != TrackState::Removed && t.time_since_update > 0 && t.state == TrackState::Confirmed {
                t.state = TrackState::Lost;
            }
            if t.time_since_update > self.config.max_lost_frames {
                t.state = TrackState::Removed;
            }
        }
        self.tracks.retain(|t| t.state != TrackState::Removed);

        &self.tracks
    }
}

fn high_subset(high: &[Detection], indices: &[usize]) -> Vec<Detection> {
    indices.iter().map(|&i| high[i].clone()).collect()
}

/// Snapshot of per-track metadata used by downstream stages without
/// exposing the tracker's internal mutable state.
pub fn track_map(tracks: &[Track]) -> HashMap<u32, &Track> {
    tracks.iter().map(|t| (t.local_id, t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn det(x: f32, y: f32, conf: f32) -> Detection {
        Detection {
            bbox: BBox { x, y, w: 50.0, h: 100.0 },
            class_id: 0,
            class_name: "person".into(),
            confidence: conf,
        }
    }

    #[test]
    fn tentative_becomes_confirmed_after_min_hits() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        let tracks = tracker.update(&[det(10.0, 10.0, 0.9)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].state, TrackState::Confirmed);
    }

    #[test]
    fn local_id_stable_across_frames() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        tracker.update(&[det(12.0, 10.0, 0.9)]);
        let tracks = tracker.update(&[det(14.0, 10.0, 0.9)]);
        assert_eq!(tracks[0].local_id, 1);
    }

    #[test]
    fn track_removed_after_max_lost_frames() {
        let mut config = TrackerConfig::default();
        config.max_lost_frames = 2;
        let mut tracker = Tracker::new(config);
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        // No detections for 3 frames > max_lost_frames(2)
        tracker.update(&[]);
        tracker.update(&[]);
        let tracks = tracker.update(&[]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn predict_moves_bbox_by_estimated_velocity() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[det(10.0, 10.0, 0.9)]);
        tracker.update(&[det(20.0, 10.0, 0.9)]);
        // Matched twice with a +10px/frame shift; velocity should now be
        // non-zero, so predict() on a frame with no detections (here,
        // simulated by checking the bbox moved before any match) advances
        // the track rather than leaving it stationary.
        let before = tracker.tracks()[0].bbox.x;
        tracker.update(&[]);
        let after = tracker.tracks()[0].bbox.x;
        assert!(after > before, "predict() should move the track using its estimated velocity");
    }

    #[test]
    fn deterministic_ids_given_same_stream() {
        let run = || {
            let mut tracker = Tracker::new(TrackerConfig::default());
            tracker.update(&[det(10.0, 10.0, 0.9), det(200.0, 200.0, 0.9)]);
            tracker.update(&[det(11.0, 10.0, 0.9), det(201.0, 200.0, 0.9)]);
            let tracks = tracker.update(&[det(12.0, 10.0, 0.9), det(202.0, 200.0, 0.9)]);
            let mut ids: Vec<u32> = tracks.iter().map(|t| t.local_id).collect();
            ids.sort();
            ids
        };
        assert_eq!(run(), run());
    }
}
