// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! MP4 muxing for recorded event clips (§4.7: "persisted … muxed as MP4").
//! Builds a short-lived `appsrc ! videoconvert ! x264enc ! h264parse !
//! mp4mux ! filesink` pipeline — the same GStreamer element-graph idiom
//! [`crate::source::GstConnector`] uses for ingestion, run in reverse to
//! encode instead of decode. `mp4mux` has no fully in-memory sink, so the
//! pipeline writes to a uniquely-named temp file which is read back into
//! memory and removed once muxing finishes.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use gstreamer::prelude::*;

use crate::error::{AnalyticsError, Result};

/// One raw BGR frame queued for muxing: microsecond timestamp (used to
/// derive presentation time relative to the clip's first frame) plus the
/// pixel data.
pub struct MuxFrame {
    pub timestamp_us: i64,
    pub data: Bytes,
}

/// How long the pipeline is allowed to sit in `Playing` after EOS is
/// pushed before muxing is considered stuck and abandoned.
const MUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Encodes and muxes `frames` (already BGR, `width`x`height`) into an MP4
/// container and returns the resulting file's bytes. Blocking — callers
/// on an async runtime should run this via `spawn_blocking`.
pub fn mux_to_mp4(camera_id: &str, width: u32, height: u32, fps: u32, frames: &[MuxFrame]) -> Result<Vec<u8>> {
    if frames.is_empty() {
        return Err(AnalyticsError::Internal("mux_to_mp4 called with no frames".into()));
    }
    gstreamer::init().map_err(|e| AnalyticsError::Internal(format!("gstreamer init failed: {e}")))?;

    let out_path = temp_output_path(camera_id);
    let launch = format!(
        "appsrc name=src format=time is-live=false block=true ! \
         video/x-raw,format=BGR,width={width},height={height},framerate={fps}/1 ! \
         videoconvert ! x264enc tune=zerolatency speed-preset=ultrafast key-int-max=30 ! \
         h264parse ! mp4mux faststart=true ! filesink location={}",
        out_path.display()
    );

    let pipeline = gstreamer::parse::launch(&launch)
        .map_err(|e| AnalyticsError::Internal(format!("mp4 mux pipeline build failed: {e}")))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| AnalyticsError::Internal("mp4 mux launch did not yield a Pipeline".into()))?;

    let appsrc = pipeline
        .by_name("src")
        .ok_or_else(|| AnalyticsError::Internal("mux pipeline missing appsrc".into()))?
        .downcast::<gstreamer_app::AppSrc>()
        .map_err(|_| AnalyticsError::Internal("src element is not an AppSrc".into()))?;

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| AnalyticsError::Internal(format!("mux pipeline failed to start: {e}")))?;

    let first_ts = frames[0].timestamp_us;
    for frame in frames {
        let pts_us = (frame.timestamp_us - first_ts).max(0) as u64;
        let mut buffer = gstreamer::Buffer::with_size(frame.data.len())
            .map_err(|e| AnalyticsError::Internal(format!("buffer alloc failed: {e}")))?;
        {
            let buffer_mut = buffer.get_mut().expect("freshly allocated buffer is uniquely owned");
            buffer_mut.set_pts(gstreamer::ClockTime::from_useconds(pts_us));
            let mut map = buffer_mut
                .map_writable()
                .map_err(|e| AnalyticsError::Internal(format!("buffer map failed: {e}")))?;
            map.copy_from_slice(&frame.data);
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| AnalyticsError::Internal(format!("appsrc push failed: {e:?}")))?;
    }
    appsrc
        .end_of_stream()
        .map_err(|e| AnalyticsError::Internal(format!("appsrc eos failed: {e:?}")))?;

    let bus = pipeline.bus().ok_or_else(|| AnalyticsError::Internal("mux pipeline missing bus".into()))?;
    let result = wait_for_eos(&bus, MUX_TIMEOUT);
    let _ = pipeline.set_state(gstreamer::State::Null);
    result?;

    let bytes = std::fs::read(&out_path).map_err(AnalyticsError::Io)?;
    let _ = std::fs::remove_file(&out_path);
    Ok(bytes)
}

fn wait_for_eos(bus: &gstreamer::Bus, timeout: Duration) -> Result<()> {
    use gstreamer::MessageView;
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(AnalyticsError::Internal("mp4 mux pipeline timed out waiting for EOS".into()));
        }
        let msg = match bus.timed_pop(gstreamer::ClockTime::try_from(remaining).unwrap_or(gstreamer::ClockTime::from_mseconds(250))) {
            Some(m) => m,
            None => continue,
        };
        match msg.view() {
            MessageView::Eos(_) => return Ok(()),
            MessageView::Error(err) => {
                return Err(AnalyticsError::Internal(format!(
                    "mp4 mux pipeline error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                )));
            }
            _ => continue,
        }
    }
}

fn temp_output_path(camera_id: &str) -> PathBuf {
    let name = format!("analytics-clip-{camera_id}-{}.mp4", uuid::Uuid::new_v4());
    std::env::temp_dir().join(name)
}
