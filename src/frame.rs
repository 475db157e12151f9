//! Core data model shared across pipeline stages: the immutable [`Frame`]
//! buffer and the [`VideoSource`] configuration entity (§3).

use serde::{Deserialize, Serialize};

/// One decoded image, owned end to end until consumed by an output stage.
/// `data` is H×W×3, 8-bit BGR by convention (matches OpenCV/gstreamer
/// `videoconvert` default rather than RGB).
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    pub data: bytes::Bytes,
    /// Monotonic, strictly increasing per camera.
    pub seq: u64,
    pub timestamp_us: i64,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, width: u32, height: u32, data: bytes::Bytes, seq: u64, timestamp_us: i64) -> Self {
        Frame {
            camera_id: camera_id.into(),
            width,
            height,
            data,
            seq,
            timestamp_us,
        }
    }

    pub fn byte_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    Rtsp,
    Onvif,
    Gb28181,
    File,
}

/// Configuration entity for one camera, created by the manager and
/// immutable for the lifetime of the pipeline instance it backs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSource {
    pub id: String,
    pub url: String,
    pub protocol: SourceProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    pub mjpeg_port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    15
}
fn default_enabled() -> bool {
    true
}
