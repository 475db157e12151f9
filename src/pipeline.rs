// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Video pipeline (C8): the per-camera unit tying every other component
//! together — frame source → inference backend → tracker → ReID →
//! attributes → behavior rule engine → output fan-out. `initialize()` does
//! all the slow work (opening the inference backend, warming it up) before
//! the manager ever holds a lock on the pipeline registry; `start()` then
//! spawns the source and tick tasks. State the HTTP surface and the
//! manager's monitoring loop need to read or mutate concurrently with the
//! tick loop — health, ROIs/rules, stream config — lives behind its own
//! lock; everything else (the backend, tracker, ReID cache) is owned
//! outright by the tick task and never touched from outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex as PlMutex, RwLock as PlRwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::attributes::{AttributeAnalyzer, AttributeConfig};
use crate::backend::{BackendConfig, BackendHandle};
use crate::config::{Config, DetectionConfig, HealthConfig, SourceConfig};
use crate::detection::{BBox, Detection, PostprocessConfig};
use crate::error::Result;
use crate::frame::Frame;
use crate::health::{HealthMonitor, PipelineHealth, PipelineState};
use crate::output::alarm::{build_payload, AlarmDispatcher, DeliveryChannel, SnapshotRef};
use crate::output::recorder::Recorder;
use crate::output::streamer::{encode_jpeg, image_to_bgr_bytes, render_overlays, StreamerState};
use crate::reid::{CrossCameraMatcher, ReIdExtractor};
use crate::rules::{BehaviorEvent, BehaviorRule, Roi, RuleEngine};
use crate::source::{run_source, FrameQueue, GstConnector, SourceState};
use crate::storage::global_writer::WriteRequest;
use crate::tracker::{Track, TrackState, Tracker, TrackerConfig};

/// Deadline `stop()` waits for the worker/source tasks to exit cleanly
/// before aborting them (§5's cooperative-cancellation shutdown).
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// How often the tick loop polls the frame queue while idle; independent
/// of the source's own stall-detection timeout (§4.1), this just bounds
/// how quickly a cancellation request is noticed.
const IDLE_POLL: Duration = Duration::from_millis(500);

fn backend_config_from(detection: &DetectionConfig) -> BackendConfig {
    BackendConfig {
        kind: detection.backend,
        model_path: detection.model_path.clone(),
        input_w: detection.input_width,
        input_h: detection.input_height,
        class_names: detection.class_names.clone(),
        postprocess: PostprocessConfig {
            confidence_threshold: detection.confidence_threshold,
            nms_threshold: detection.nms_threshold,
            max_detections: detection.max_detections,
        },
        priority: vec![crate::backend::BackendKind::Gpu, crate::backend::BackendKind::Npu, crate::backend::BackendKind::Cpu],
    }
}

fn attribute_config_from(cfg: &crate::config::AttributesConfig) -> AttributeConfig {
    AttributeConfig {
        enabled: cfg.enabled,
        gender_threshold: cfg.gender_threshold,
        age_threshold: cfg.age_threshold,
        batch_size: cfg.batch_size,
        enable_caching: cfg.enable_caching,
        min_crop_width: cfg.min_crop_width,
        min_crop_height: cfg.min_crop_height,
        min_blur_variance: cfg.min_blur_variance,
    }
}

fn format_attr_label(attrs: &crate::attributes::PersonAttributes) -> String {
    match (&attrs.gender, &attrs.age_group) {
        (Some(g), Some(a)) => format!("{g}/{a}"),
        (Some(g), None) => g.clone(),
        (None, Some(a)) => a.clone(),
        (None, None) => String::new(),
    }
}

/// State the worker task owns exclusively and drives one tick at a time.
/// Split out from [`VideoPipeline`] so the public handle stays cheap to
/// hold in the manager's registry while this runs on its own task.
struct Worker {
    camera_id: String,
    reid_enabled: bool,
    cross_camera_enabled: bool,
    recording_enabled: bool,
    post_seconds: u32,

    frame_queue: Arc<FrameQueue>,
    cancel: Arc<AtomicBool>,

    backend: BackendHandle,
    tracker: Tracker,
    reid_extractor: ReIdExtractor,
    cross_camera_matcher: Arc<CrossCameraMatcher>,
    attribute_analyzer: AttributeAnalyzer,

    rule_engine: Arc<PlRwLock<RuleEngine>>,
    health: Arc<PlRwLock<HealthMonitor>>,
    stream_state: Arc<StreamerState>,
    recorder: Arc<AsyncMutex<Recorder>>,
    alarm_dispatcher: Arc<AlarmDispatcher>,
}

impl Worker {
    async fn run(mut self) {
        self.health.write().set_state(PipelineState::Running);
        info!(camera = %self.camera_id, "pipeline tick loop started");
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            match self.frame_queue.pop_timeout(IDLE_POLL).await {
                Some(frame) => self.process_frame(frame).await,
                None => {
                    self.health.write().set_dropped_frames(self.frame_queue.dropped_frames());
                }
            }
        }
        info!(camera = %self.camera_id, "pipeline tick loop stopped");
    }

    async fn process_frame(&mut self, frame: Frame) {
        {
            let mut health = self.health.write();
            health.on_frame(frame.timestamp_us);
            health.set_dropped_frames(self.frame_queue.dropped_frames());
            health.set_selected_backend(self.backend.name());
        }

        let detections = match self.backend.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(camera = %self.camera_id, error = %e, "detection failed for this frame");
                self.health.write().on_error();
                Vec::new()
            }
        };

        self.tracker.update(&detections);

        let confirmed_snapshot: Vec<(u32, u32, BBox)> = self
            .tracker
            .tracks()
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| (t.local_id, t.class_id, t.bbox))
            .collect();

        let mut global_ids: HashMap<u32, String> = HashMap::new();
        if self.reid_enabled {
            for &(local_id, class_id, bbox) in &confirmed_snapshot {
                let embedding = self.reid_extractor.extract(&frame, class_id, local_id, bbox);
                if !embedding.is_valid() {
                    continue;
                }
                self.tracker.set_reid_embedding(local_id, embedding.values.clone());
                if self.cross_camera_enabled {
                    let global_id = self.cross_camera_matcher.match_or_create(&self.camera_id, local_id, &embedding);
                    global_ids.insert(local_id, global_id);
                }
            }
        }

        let attr_results = self.attribute_analyzer.analyze(&frame, &confirmed_snapshot);
        for (local_id, attrs) in attr_results {
            self.tracker.set_attributes(local_id, attrs);
        }

        let tracks: Vec<Track> = self.tracker.tracks().to_vec();
        let now = Utc::now();
        let events = self.rule_engine.write().evaluate(&tracks, now, &global_ids);
        let active_alarm = !events.is_empty();

        self.render_and_publish(&frame, &detections, &tracks, active_alarm).await;

        for event in events {
            self.dispatch_event(event, &tracks);
        }
    }

    async fn render_and_publish(&self, frame: &Frame, detections: &[Detection], tracks: &[Track], active_alarm: bool) {
        let stream_cfg = self.stream_state.config.read().clone();
        let rois: Vec<Roi> = self.rule_engine.read().rois().to_vec();
        let labels: Vec<(u32, String)> = tracks
            .iter()
            .filter_map(|t| t.attributes.as_ref().map(|a| (t.local_id, format_attr_label(a))))
            .collect();

        let annotated = if stream_cfg.enable_overlays {
            render_overlays(frame, detections, tracks, &rois, active_alarm, &labels)
        } else {
            render_overlays(frame, &[], &[], &[], false, &[])
        };
        match encode_jpeg(&annotated, stream_cfg.quality) {
            Ok(jpeg) => self.stream_state.publisher.publish(jpeg),
            Err(e) => warn!(camera = %self.camera_id, error = %e, "jpeg encode failed, frame not published"),
        }
        let bgr = image_to_bgr_bytes(&annotated);
        *self.stream_state.last_frame.write() = Some(bgr.clone());

        if self.recording_enabled {
            let mut recorder = self.recorder.lock().await;
            recorder.push_frame(frame.timestamp_us, frame.width, frame.height, bgr);
        }
    }

    fn dispatch_event(&self, event: BehaviorEvent, tracks: &[Track]) {
        let bbox = tracks
            .iter()
            .find(|t| t.local_id == event.track_id)
            .map(|t| t.bbox)
            .unwrap_or(BBox { x: 0.0, y: 0.0, w: 0.0, h: 0.0 });
        let payload = build_payload(
            &event,
            bbox,
            SnapshotRef::Url { url: format!("/api/cameras/{}/snapshot", self.camera_id) },
            false,
        );
        let dispatcher = self.alarm_dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(payload).await });

        if self.recording_enabled {
            let recorder = self.recorder.clone();
            let post = Duration::from_secs(self.post_seconds as u64);
            let camera_id = self.camera_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(post).await;
                let recorder = recorder.lock().await;
                recorder.persist_clip(&event, Utc::now()).await;
                info!(camera = %camera_id, event_id = %event.id, "post-event clip window elapsed");
            });
        }
    }
}

/// Everything `initialize()` builds that `start()` needs but that isn't
/// part of the pipeline's long-lived public state — consumed exactly
/// once, by the first (and only) `start()` call.
struct PendingStart {
    worker: Worker,
    frame_queue: Arc<FrameQueue>,
    source: SourceConfig,
    health_config: HealthConfig,
}

/// Per-camera pipeline handle the manager holds in its registry. Not
/// `Clone`: the manager owns each pipeline outright and the HTTP surface
/// reaches its shared state (health, ROIs/rules, stream config, the MJPEG
/// publisher) through the `Arc`-wrapped fields exposed here, not through a
/// second handle to the whole pipeline.
pub struct VideoPipeline {
    pub camera_id: String,
    pub mjpeg_port: u16,

    rule_engine: Arc<PlRwLock<RuleEngine>>,
    health: Arc<PlRwLock<HealthMonitor>>,
    stream_state: Arc<StreamerState>,

    source_state: Arc<PlMutex<SourceState>>,
    source_cancel: Arc<AtomicBool>,
    worker_cancel: Arc<AtomicBool>,

    source_handle: Option<JoinHandle<()>>,
    worker_handle: Option<JoinHandle<()>>,

    pending: Option<PendingStart>,
}

impl VideoPipeline {
    /// Performs every slow operation a pipeline needs before it can run:
    /// opening the inference backend (§4.2 `Auto` selection + warmup),
    /// loading the attribute model, constructing the frame queue. None of
    /// this holds the manager's registry lock (§4.9 two-phase add).
    pub async fn initialize(
        source: SourceConfig,
        config: &Config,
        mjpeg_port: u16,
        cross_camera_matcher: Arc<CrossCameraMatcher>,
        writer_tx: mpsc::Sender<WriteRequest>,
        alarm_channels: Vec<Arc<dyn DeliveryChannel>>,
    ) -> Result<Self> {
        let camera_id = source.id.clone();

        let blank = Frame::new(
            camera_id.clone(),
            source.width,
            source.height,
            bytes::Bytes::from(vec![0u8; source.width as usize * source.height as usize * 3]),
            0,
            0,
        );
        let backend = BackendHandle::select(backend_config_from(&config.detection), &blank)?;

        let mut attribute_analyzer = AttributeAnalyzer::new(attribute_config_from(&config.attributes));
        if config.attributes.enabled {
            attribute_analyzer.load_model(&config.attributes.model_path)?;
        }

        let tracker = Tracker::new(TrackerConfig {
            high_thresh: config.tracking.high_thresh,
            low_thresh: config.tracking.low_thresh,
            min_hits: config.tracking.min_hits,
            max_lost_frames: config.tracking.max_lost_frames,
            iou_threshold: 0.3,
        });

        let reid_extractor = ReIdExtractor::new(Duration::from_secs(config.reid.match_timeout_s));

        let rule_engine = RuleEngine::new(camera_id.clone(), source.width as f64, source.height as f64, 100.0, false);

        let health_config = config.health;
        let health = HealthMonitor::new(camera_id.clone(), source.fps, health_config.stable_rate_ratio, health_config.max_consecutive_errors);

        let mut alarm_dispatcher = AlarmDispatcher::new();
        for channel in alarm_channels {
            alarm_dispatcher.add_channel(channel);
        }

        let recorder = Recorder::new(camera_id.clone(), config.recording, source.stream.fps.max(1), writer_tx);
        let stream_state = Arc::new(StreamerState::new(source.stream.clone()));
        let frame_queue = Arc::new(FrameQueue::new(64));

        let worker = Worker {
            camera_id: camera_id.clone(),
            reid_enabled: config.reid.enabled,
            cross_camera_enabled: config.reid.cross_camera_enabled,
            recording_enabled: config.recording.enabled,
            post_seconds: config.recording.post_seconds,
            frame_queue: frame_queue.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            backend,
            tracker,
            reid_extractor,
            cross_camera_matcher,
            attribute_analyzer,
            rule_engine: Arc::new(PlRwLock::new(rule_engine)),
            health: Arc::new(PlRwLock::new(health)),
            stream_state: stream_state.clone(),
            recorder: Arc::new(AsyncMutex::new(recorder)),
            alarm_dispatcher: Arc::new(alarm_dispatcher),
        };

        Ok(VideoPipeline {
            camera_id,
            mjpeg_port,
            rule_engine: worker.rule_engine.clone(),
            health: worker.health.clone(),
            stream_state,
            source_state: Arc::new(PlMutex::new(SourceState::Init)),
            source_cancel: Arc::new(AtomicBool::new(false)),
            worker_cancel: worker.cancel.clone(),
            source_handle: None,
            worker_handle: None,
            pending: Some(PendingStart { worker, frame_queue, source, health_config }),
        })
    }

    /// Spawns the source connector task and the tick loop task. Calling
    /// this twice without an intervening fresh `initialize()` panics — the
    /// manager never does this.
    pub fn start(&mut self) {
        let pending = self.pending.take().expect("start() called without a pending worker (already started?)");
        let PendingStart { worker, frame_queue, source, health_config } = pending;

        let source_state = self.source_state.clone();
        let source_cancel = self.source_cancel.clone();
        let health_monitor = self.health.clone();
        self.source_handle = Some(tokio::spawn(run_source(
            source,
            health_config,
            GstConnector::default(),
            frame_queue,
            source_state,
            source_cancel,
            health_monitor,
        )));

        self.worker_handle = Some(tokio::spawn(worker.run()));
    }

    /// Signals both tasks to stop and waits up to [`SHUTDOWN_DEADLINE`]
    /// for them to exit before aborting (§5 cooperative cancellation with
    /// a bounded grace period).
    pub async fn stop(&mut self) {
        self.source_cancel.store(true, Ordering::Relaxed);
        self.worker_cancel.store(true, Ordering::Relaxed);

        if let Some(handle) = self.source_handle.take() {
            if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
                warn!(camera = %self.camera_id, "source task did not exit within shutdown deadline, aborting");
            }
        }
        if let Some(handle) = self.worker_handle.take() {
            if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
                warn!(camera = %self.camera_id, "tick loop did not exit within shutdown deadline, aborting");
            }
        }
    }

    /// Current health snapshot, overriding the recorded lifecycle state
    /// with the frame source's own state where that's more current (the
    /// source can be `Reconnecting`/`Failed` independent of what the
    /// worker last recorded).
    pub fn health(&self) -> PipelineHealth {
        let mut snapshot = self.health.read().snapshot();
        let source_state = *self.source_state.lock();
        if matches!(source_state, SourceState::Reconnecting | SourceState::Failed) {
            snapshot.state = PipelineState::from(source_state);
        }
        snapshot
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.source_state.lock(), SourceState::Failed)
    }

    pub fn add_roi(&self, roi: Roi) -> Result<()> {
        self.rule_engine.write().set_roi(roi)
    }

    pub fn remove_roi(&self, roi_id: &str) -> bool {
        self.rule_engine.write().remove_roi(roi_id)
    }

    pub fn list_rois(&self) -> Vec<Roi> {
        self.rule_engine.read().rois().to_vec()
    }

    pub fn set_rule(&self, rule: BehaviorRule) {
        self.rule_engine.write().set_rule(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.rule_engine.write().remove_rule(rule_id)
    }

    pub fn list_rules(&self) -> Vec<BehaviorRule> {
        self.rule_engine.read().rules().to_vec()
    }

    /// Swaps the live streaming config atomically; the tick loop reads a
    /// fresh clone at the start of every frame's render step, so the
    /// change applies at the next frame boundary, never mid-frame.
    pub fn update_stream_config(&self, config: crate::config::StreamConfig) {
        *self.stream_state.config.write() = config;
    }

    pub fn mjpeg_subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<Vec<u8>>> {
        self.stream_state.publisher.subscribe()
    }

    pub fn last_frame(&self) -> Option<bytes::Bytes> {
        self.stream_state.last_frame.read().clone()
    }
}
