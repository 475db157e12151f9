// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Frame source (C1): connects to a network camera, decodes to raw BGR
//! [`Frame`]s, and exposes them through a bounded latest-wins queue.
//! Reconnect/backoff state machine per §4.1. Grounded in the GStreamer
//! appsink-callback + supervised-reconnect pattern the NVR codebase used
//! for its `CameraStream`, generalized from MPEG-TS muxing to raw decoded
//! video frames and from a single reconnect loop to the full
//! Init/Running/Reconnecting/Failed machine with fatal-vs-transient
//! failure classification.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::{HealthConfig, SourceConfig};
use crate::error::{AnalyticsError, Result};
use crate::frame::{Frame, SourceProtocol};
use crate::health::HealthMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Init,
    Running,
    Reconnecting,
    Failed,
}

/// Bounded single-producer multi-consumer frame queue with "latest wins"
/// semantics: once full, the oldest buffered frame is dropped in favor of
/// the newest one and `dropped_frames` is incremented.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
    dropped_frames: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        FrameQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: Frame) {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(frame);
        drop(q);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.inner.lock().pop_front()
    }

    /// Waits until a frame is available or `timeout` elapses.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        if let Some(f) = self.try_pop() {
            return Some(f);
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => self.try_pop(),
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Outcome of one blocking read attempt against the underlying transport.
pub enum FrameReadOutcome {
    Frame(Frame),
    /// No data within the caller-supplied read timeout; not itself an error.
    Timeout,
    EndOfStream,
}

/// Capability a concrete transport (GStreamer RTSP/ONVIF/GB28181/file
/// pipeline, or a test double) must provide. Kept separate from the
/// reconnect state machine below so the machine is unit-testable without
/// a live camera or a GStreamer runtime.
pub trait SourceConnector: Send {
    fn connect(&mut self, source: &SourceConfig) -> Result<()>;
    fn read_frame(&mut self, seq: u64) -> Result<FrameReadOutcome>;
    fn close(&mut self);
}

/// GStreamer-backed connector. Builds a decode pipeline terminating in an
/// appsink that emits raw BGR frames, following the same
/// `parse::launch` + `appsink.new_sample` callback idiom as the original
/// `CameraStream`, but decoding to `video/x-raw,format=BGR` instead of
/// remuxing to MPEG-TS.
pub struct GstConnector {
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
}

impl Default for GstConnector {
    fn default() -> Self {
        GstConnector { pipeline: None, appsink: None }
    }
}

impl GstConnector {
    fn build_launch_string(source: &SourceConfig) -> Result<String> {
        let url = Self::authenticated_url(source)?;
        let caps = format!("video/x-raw,format=BGR,width={},height={}", source.width, source.height);
        let launch = match source.protocol {
            SourceProtocol::Rtsp | SourceProtocol::Onvif | SourceProtocol::Gb28181 => format!(
                "rtspsrc location={url} latency=200 protocols=tcp name=src ! \
                 rtph264depay ! h264parse ! avdec_h264 ! videoconvert ! {caps} ! \
                 appsink name=sink emit-signals=true max-buffers=2 drop=true sync=false"
            ),
            SourceProtocol::File => format!(
                "filesrc location={url} ! decodebin ! videoconvert ! {caps} ! \
                 appsink name=sink emit-signals=true max-buffers=2 drop=true sync=false"
            ),
        };
        Ok(launch)
    }

    fn authenticated_url(source: &SourceConfig) -> Result<String> {
        let parsed = url::Url::parse(&source.url).map_err(|e| AnalyticsError::SourceAuth {
            id: source.id.clone(),
            reason: format!("malformed URL: {e}"),
        })?;
        if matches!(source.protocol, SourceProtocol::Rtsp | SourceProtocol::Onvif | SourceProtocol::Gb28181)
            && parsed.scheme() != "rtsp"
        {
            return Err(AnalyticsError::SourceAuth {
                id: source.id.clone(),
                reason: format!("expected rtsp:// URL, got scheme '{}'", parsed.scheme()),
            });
        }
        if let (Some(user), Some(pass)) = (&source.username, &source.password) {
            let mut with_auth = parsed.clone();
            with_auth
                .set_username(user)
                .map_err(|_| AnalyticsError::SourceAuth { id: source.id.clone(), reason: "cannot set username".into() })?;
            with_auth
                .set_password(Some(pass))
                .map_err(|_| AnalyticsError::SourceAuth { id: source.id.clone(), reason: "cannot set password".into() })?;
            return Ok(with_auth.to_string());
        }
        Ok(parsed.to_string())
    }
}

impl SourceConnector for GstConnector {
    fn connect(&mut self, source: &SourceConfig) -> Result<()> {
        let launch = Self::build_launch_string(source)?;
        let pipeline = gstreamer::parse::launch(&launch)
            .map_err(|e| AnalyticsError::SourceUnreachable { id: source.id.clone(), reason: e.to_string() })?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| AnalyticsError::Internal("gst launch did not yield a Pipeline".into()))?;

        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| AnalyticsError::Internal("pipeline missing appsink".into()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| AnalyticsError::Internal("sink element is not an AppSink".into()))?;

        use gstreamer::prelude::*;
        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| AnalyticsError::SourceUnreachable { id: source.id.clone(), reason: e.to_string() })?;

        self.pipeline = Some(pipeline);
        self.appsink = Some(sink);
        Ok(())
    }

    fn read_frame(&mut self, seq: u64) -> Result<FrameReadOutcome> {
        use gstreamer::prelude::*;
        use gstreamer_video::prelude::*;

        let sink = match &self.appsink {
            Some(s) => s,
            None => return Err(AnalyticsError::Internal("read_frame called before connect".into())),
        };

        let sample = match sink.try_pull_sample(gstreamer::ClockTime::from_mseconds(500)) {
            Some(s) => s,
            None => return Ok(FrameReadOutcome::Timeout),
        };

        let caps = sample
            .caps()
            .ok_or_else(|| AnalyticsError::SourceTransient { id: String::new(), reason: "sample missing caps".into() })?;
        let video_info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| AnalyticsError::SourceTransient { id: String::new(), reason: e.to_string() })?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| AnalyticsError::SourceTransient { id: String::new(), reason: "sample missing buffer".into() })?;
        let map = buffer
            .map_readable()
            .map_err(|e| AnalyticsError::SourceTransient { id: String::new(), reason: e.to_string() })?;

        let pts_us = buffer.pts().map(|p| p.useconds() as i64).unwrap_or(0);
        let data = bytes::Bytes::copy_from_slice(map.as_slice());
        let frame = Frame::new(
            "",
            video_info.width(),
            video_info.height(),
            data,
            seq,
            pts_us,
        );
        Ok(FrameReadOutcome::Frame(frame))
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            use gstreamer::prelude::*;
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
        self.appsink = None;
    }
}

/// Backoff policy for `Reconnecting`: exponential, capped, seeded from
/// `reconnect_backoff_ms`.
fn backoff_for_attempt(base_ms: u64, attempt: u32) -> Duration {
    let capped_attempt = attempt.min(5);
    let millis = base_ms.saturating_mul(1u64 << capped_attempt.saturating_sub(1).min(5));
    Duration::from_millis(millis.min(60_000))
}

/// Drives one source through its full §4.1 lifecycle until `stop` is set,
/// pushing decoded frames into `queue`. Generic over [`SourceConnector`]
/// so the state machine is exercised in tests with a scripted fake.
pub async fn run_source<C: SourceConnector>(
    source: SourceConfig,
    health: HealthConfig,
    mut connector: C,
    queue: Arc<FrameQueue>,
    state: Arc<Mutex<SourceState>>,
    stop: Arc<AtomicBool>,
    health_monitor: Arc<RwLock<HealthMonitor>>,
) {
    let mut seq: u64 = 0;
    let mut consecutive_errors: u32 = 0;
    let mut reconnect_attempts: u32 = 0;

    *state.lock() = SourceState::Init;
    loop {
        if stop.load(Ordering::Relaxed) {
            connector.close();
            return;
        }

        match connector.connect(&source) {
            Ok(()) => {
                *state.lock() = SourceState::Running;
                consecutive_errors = 0;
                reconnect_attempts = 0;
                info!(source = %source.id, "source connected");
            }
            Err(e) => {
                if matches!(e, AnalyticsError::SourceAuth { .. }) {
                    error!(source = %source.id, error = %e, "fatal source error, giving up");
                    *state.lock() = SourceState::Failed;
                    return;
                }
                reconnect_attempts += 1;
                health_monitor.write().on_reconnect_attempt();
                warn!(source = %source.id, attempt = reconnect_attempts, error = %e, "connect failed");
                if reconnect_attempts >= health.max_reconnect_attempts {
                    *state.lock() = SourceState::Failed;
                    return;
                }
                tokio::time::sleep(backoff_for_attempt(health.reconnect_backoff_ms, reconnect_attempts)).await;
                continue;
            }
        }

        let mut last_frame_at = tokio::time::Instant::now();
        loop {
            if stop.load(Ordering::Relaxed) {
                connector.close();
                return;
            }

            match connector.read_frame(seq) {
                Ok(FrameReadOutcome::Frame(mut frame)) => {
                    frame.camera_id = source.id.clone();
                    seq += 1;
                    consecutive_errors = 0;
                    last_frame_at = tokio::time::Instant::now();
                    queue.push(frame);
                }
                Ok(FrameReadOutcome::Timeout) => {
                    if last_frame_at.elapsed() > Duration::from_secs(health.frame_timeout_s) {
                        warn!(source = %source.id, "no frame within frame_timeout, reconnecting");
                        break;
                    }
                }
                Ok(FrameReadOutcome::EndOfStream) => {
                    warn!(source = %source.id, "end of stream, reconnecting");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(source = %source.id, error = %e, consecutive_errors, "transient read error");
                    if consecutive_errors >= health.max_consecutive_errors {
                        break;
                    }
                }
            }
        }

        connector.close();
        *state.lock() = SourceState::Reconnecting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedConnector {
        script: StdMutex<VecDeque<Result<FrameReadOutcome>>>,
        connect_results: StdMutex<VecDeque<Result<()>>>,
    }

    impl SourceConnector for &ScriptedConnector {
        fn connect(&mut self, _source: &SourceConfig) -> Result<()> {
            self.connect_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
        fn read_frame(&mut self, seq: u64) -> Result<FrameReadOutcome> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(FrameReadOutcome::Frame(mut f))) => {
                    f.seq = seq;
                    Ok(FrameReadOutcome::Frame(f))
                }
                Some(other) => other,
                None => Ok(FrameReadOutcome::EndOfStream),
            }
        }
        fn close(&mut self) {}
    }

    fn test_source() -> SourceConfig {
        SourceConfig {
            id: "cam1".into(),
            url: "rtsp://localhost/stream".into(),
            protocol: SourceProtocol::Rtsp,
            username: None,
            password: None,
            width: 640,
            height: 480,
            fps: 15,
            enabled: true,
            stream: Default::default(),
        }
    }

    #[test]
    fn frame_queue_drops_oldest_when_full() {
        let queue = FrameQueue::new(2);
        for i in 0..5u64 {
            queue.push(Frame::new("cam1", 1, 1, bytes::Bytes::new(), i, 0));
        }
        assert_eq!(queue.dropped_frames(), 3);
        let first = queue.try_pop().unwrap();
        assert_eq!(first.seq, 3);
        let second = queue.try_pop().unwrap();
        assert_eq!(second.seq, 4);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn fatal_auth_error_transitions_straight_to_failed() {
        let connector = ScriptedConnector {
            script: StdMutex::new(VecDeque::new()),
            connect_results: StdMutex::new(VecDeque::from([Err(AnalyticsError::SourceAuth {
                id: "cam1".into(),
                reason: "bad credentials".into(),
            })])),
        };
        let queue = Arc::new(FrameQueue::new(2));
        let state = Arc::new(Mutex::new(SourceState::Init));
        let stop = Arc::new(AtomicBool::new(false));
        let health_monitor = Arc::new(RwLock::new(HealthMonitor::new("cam1", 15, 0.5, 10)));
        run_source(test_source(), HealthConfig::default(), &connector, queue, state.clone(), stop, health_monitor).await;
        assert_eq!(*state.lock(), SourceState::Failed);
    }

    #[tokio::test]
    async fn exhausting_reconnect_attempts_fails() {
        let connector = ScriptedConnector {
            script: StdMutex::new(VecDeque::new()),
            connect_results: StdMutex::new(
                (0..10)
                    .map(|_| {
                        Err(AnalyticsError::SourceUnreachable { id: "cam1".into(), reason: "refused".into() })
                    })
                    .collect(),
            ),
        };
        let queue = Arc::new(FrameQueue::new(2));
        let state = Arc::new(Mutex::new(SourceState::Init));
        let stop = Arc::new(AtomicBool::new(false));
        let mut health = HealthConfig::default();
        health.reconnect_backoff_ms = 1;
        health.max_reconnect_attempts = 3;
        let health_monitor = Arc::new(RwLock::new(HealthMonitor::new("cam1", 15, 0.5, 10)));
        run_source(test_source(), health, &connector, queue, state.clone(), stop, health_monitor.clone()).await;
        assert_eq!(*state.lock(), SourceState::Failed);
        assert_eq!(health_monitor.read().snapshot().reconnect_count, 3);
    }
}
