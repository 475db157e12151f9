//! Recorder (§4.7): a circular in-memory buffer of the last
//! `buffer_seconds` of annotated frames, muxed into an MP4 clip (via
//! [`crate::output::mp4_mux`]) and persisted on trigger. Reuses the
//! ring-pool storage format the global chunk writer already provides —
//! a clip is just one more record in the same sequential append-only
//! stream, keyed by camera id and the triggering event's time range,
//! rather than a fixed-duration segment.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::RecordingConfig;
use crate::output::mp4_mux::{mux_to_mp4, MuxFrame};
use crate::rules::BehaviorEvent;
use crate::storage::global_writer::WriteRequest;

/// One buffered annotated frame, BGR raw bytes plus dimensions (the
/// recorder stores the overlay-rendered image so clips show what the
/// operator saw live).
#[derive(Clone)]
struct RingFrame {
    timestamp_us: i64,
    width: u32,
    height: u32,
    data: Bytes,
}

/// Copy-on-push annotated-frame ring buffer plus the clip-extraction
/// logic triggered on a [`BehaviorEvent`] (§5: "the recorder buffer uses
/// copy-on-push for the annotated frame").
pub struct Recorder {
    camera_id: String,
    config: RecordingConfig,
    fps: u32,
    buffer: VecDeque<RingFrame>,
    max_frames: usize,
    writer_tx: tokio::sync::mpsc::Sender<WriteRequest>,
}

impl Recorder {
    pub fn new(camera_id: impl Into<String>, config: RecordingConfig, fps: u32, writer_tx: tokio::sync::mpsc::Sender<WriteRequest>) -> Self {
        let max_frames = (config.buffer_seconds as usize * fps.max(1) as usize).max(1);
        Recorder {
            camera_id: camera_id.into(),
            config,
            fps,
            buffer: VecDeque::with_capacity(max_frames),
            max_frames,
            writer_tx,
        }
    }

    pub fn push_frame(&mut self, timestamp_us: i64, width: u32, height: u32, data: Bytes) {
        if self.buffer.len() >= self.max_frames {
            self.buffer.pop_front();
        }
        self.buffer.push_back(RingFrame { timestamp_us, width, height, data });
    }

    /// Extracts `[trigger - pre_seconds, trigger + post_seconds]` from the
    /// ring buffer and hands the raw frame bytes to the global writer as
    /// one clip record. Frames after the event but still pending (the
    /// `post_seconds` window) are captured by later `push_frame` calls
    /// before this is invoked by the pipeline's post-event timer.
    /// Pure windowing step: which buffered frames fall in
    /// `[trigger - pre_seconds, trigger + post_seconds]`. Split out from
    /// [`Self::persist_clip`] so the selection logic is unit-testable
    /// without driving the GStreamer muxing pipeline.
    fn frames_in_window(&self, trigger_us: i64) -> Vec<&RingFrame> {
        let pre_us = trigger_us - self.config.pre_seconds as i64 * 1_000_000;
        let post_us = trigger_us + self.config.post_seconds as i64 * 1_000_000;
        self.buffer.iter().filter(|f| f.timestamp_us >= pre_us && f.timestamp_us <= post_us).collect()
    }

    pub async fn persist_clip(&self, event: &BehaviorEvent, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }
        let trigger_us = event.start_ts.timestamp_micros();
        let frames = self.frames_in_window(trigger_us);

        if frames.is_empty() {
            warn!(camera = %self.camera_id, event_id = %event.id, "no buffered frames in clip window");
            return;
        }

        let start_ts = frames.first().map(|f| micros_to_utc(f.timestamp_us)).unwrap_or(now);
        let end_ts = frames.last().map(|f| micros_to_utc(f.timestamp_us)).unwrap_or(now);
        let (width, height) = (frames[0].width, frames[0].height);
        let mux_frames: Vec<MuxFrame> = frames
            .iter()
            .map(|f| MuxFrame { timestamp_us: f.timestamp_us, data: f.data.clone() })
            .collect();
        let frame_count = mux_frames.len();
        let camera_id = self.camera_id.clone();
        let fps = self.fps.max(1);

        let muxed = tokio::task::spawn_blocking(move || mux_to_mp4(&camera_id, width, height, fps, &mux_frames)).await;
        let clip = match muxed {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(camera = %self.camera_id, event_id = %event.id, error = %e, "mp4 muxing failed, clip dropped");
                return;
            }
            Err(e) => {
                warn!(camera = %self.camera_id, event_id = %event.id, error = %e, "mp4 mux task panicked, clip dropped");
                return;
            }
        };

        let req = WriteRequest {
            camera_id: self.camera_id.clone(),
            start_ts,
            end_ts,
            data: clip,
        };
        if self.writer_tx.send(req).await.is_err() {
            warn!(camera = %self.camera_id, event_id = %event.id, "clip writer channel closed");
        } else {
            info!(camera = %self.camera_id, event_id = %event.id, frames = frame_count, "mp4 clip queued for persistence");
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }
}

fn micros_to_utc(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event(ts: DateTime<Utc>) -> BehaviorEvent {
        BehaviorEvent {
            id: "evt1".into(),
            camera_id: "cam1".into(),
            rule_id: "rule1".into(),
            roi_id: Some("roi1".into()),
            track_id: 1,
            global_track_id: None,
            event_type: crate::rules::BehaviorEventType::Intrusion,
            start_ts: ts,
            confidence: 0.9,
            metadata: serde_json::json!({}),
            snapshot_ref: None,
        }
    }

    #[test]
    fn clip_window_includes_only_pre_post_range() {
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let config = RecordingConfig { enabled: true, pre_seconds: 2, post_seconds: 2, buffer_seconds: 30 };
        let mut recorder = Recorder::new("cam1", config, 10, tx);

        let trigger = Utc::now();
        let trigger_us = trigger.timestamp_micros();
        for offset_s in -10i64..=10 {
            let ts = trigger_us + offset_s * 1_000_000;
            recorder.push_frame(ts, 4, 4, Bytes::from(vec![0u8; 48]));
        }

        let frames = recorder.frames_in_window(trigger_us);
        assert_eq!(frames.len(), 5); // -2s..=2s inclusive at 1 frame/sec in this fixture
    }

    #[test]
    fn clip_window_empty_when_nothing_buffered_yet() {
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let config = RecordingConfig { enabled: true, pre_seconds: 2, post_seconds: 2, buffer_seconds: 30 };
        let recorder = Recorder::new("cam1", config, 10, tx);
        assert!(recorder.frames_in_window(Utc::now().timestamp_micros()).is_empty());
    }

    #[tokio::test]
    async fn disabled_recording_persists_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let config = RecordingConfig { enabled: false, pre_seconds: 2, post_seconds: 2, buffer_seconds: 30 };
        let mut recorder = Recorder::new("cam1", config, 10, tx);
        let trigger = Utc::now();
        recorder.push_frame(trigger.timestamp_micros(), 4, 4, Bytes::from(vec![0u8; 48]));
        recorder.persist_clip(&test_event(trigger), trigger).await;
        assert!(rx.try_recv().is_err());
    }
}
