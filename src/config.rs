// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Top-level TOML configuration (§6 "Configuration recognized options").
//! Every subsystem gets its own `*Config` struct with `#[serde(default =
//! "fn")]` fields, following the teacher's `chunk_size_mb`/`max_pools`
//! defaulting pattern. `Config::from_file` loads, then `validate()` rejects
//! out-of-range values before any pipeline is constructed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{AnalyticsError, Result};
use crate::frame::SourceProtocol;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub reid: ReidConfig,
    #[serde(default)]
    pub attributes: AttributesConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Directory pipelines persist recorded clips and snapshots under.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Maximum concurrent pipelines the manager accepts (§4.9).
    #[serde(default = "default_max_pipelines")]
    pub max_pipelines: usize,
    /// MJPEG port allocation range, inclusive.
    #[serde(default = "default_port_range")]
    pub mjpeg_port_range: (u16, u16),
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Sizing for the shared clip-persistence pool (§4.7, reusing the
/// ring-of-pool-files backing store for event clips rather than
/// fixed-duration segments).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default = "default_max_pools")]
    pub max_pools: usize,
    #[serde(default = "default_writer_queue")]
    pub writer_queue_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            chunk_size_mb: default_chunk_size_mb(),
            max_pools: default_max_pools(),
            writer_queue_size: default_writer_queue(),
        }
    }
}

fn default_chunk_size_mb() -> u64 { 256 }
fn default_max_pools() -> usize { 16 }
fn default_writer_queue() -> usize { 256 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_protocol")]
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
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_detection_interval_frames")]
    pub detection_interval_frames: u32,
    #[serde(default)]
    pub enabled_classes: Vec<u32>,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default)]
    pub class_names: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            max_detections: default_max_detections(),
            detection_interval_frames: default_detection_interval_frames(),
            enabled_classes: Vec::new(),
            backend: BackendKind::default(),
            model_path: default_model_path(),
            input_width: default_input_size(),
            input_height: default_input_size(),
            class_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TrackingConfig {
    #[serde(default = "default_high_thresh")]
    pub high_thresh: f32,
    #[serde(default = "default_low_thresh")]
    pub low_thresh: f32,
    #[serde(default = "default_min_hits")]
    pub min_hits: u32,
    #[serde(default = "default_max_lost_frames")]
    pub max_lost_frames: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            high_thresh: default_high_thresh(),
            low_thresh: default_low_thresh(),
            min_hits: default_min_hits(),
            max_lost_frames: default_max_lost_frames(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ReidConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
    #[serde(default = "default_match_timeout_s")]
    pub match_timeout_s: u64,
    #[serde(default = "default_true")]
    pub cross_camera_enabled: bool,
}

impl Default for ReidConfig {
    fn default() -> Self {
        ReidConfig {
            enabled: true,
            similarity_threshold: default_similarity_threshold(),
            max_matches: default_max_matches(),
            match_timeout_s: default_match_timeout_s(),
            cross_camera_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gender_threshold")]
    pub gender_threshold: f32,
    #[serde(default = "default_age_threshold")]
    pub age_threshold: f32,
    #[serde(default = "default_attr_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    #[serde(default = "default_attr_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_attr_min_crop_width")]
    pub min_crop_width: u32,
    #[serde(default = "default_attr_min_crop_height")]
    pub min_crop_height: u32,
    #[serde(default = "default_attr_min_blur_variance")]
    pub min_blur_variance: f64,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        AttributesConfig {
            enabled: false,
            gender_threshold: default_gender_threshold(),
            age_threshold: default_age_threshold(),
            batch_size: default_attr_batch_size(),
            enable_caching: true,
            model_path: default_attr_model_path(),
            min_crop_width: default_attr_min_crop_width(),
            min_crop_height: default_attr_min_crop_height(),
            min_blur_variance: default_attr_min_blur_variance(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Mjpeg,
    Rtmp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_protocol")]
    pub protocol: StreamProtocol,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub rtmp_url: Option<String>,
    #[serde(default = "default_true")]
    pub enable_overlays: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            protocol: default_stream_protocol(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            quality: default_quality(),
            bitrate_kbps: None,
            rtmp_url: None,
            enable_overlays: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pre_seconds")]
    pub pre_seconds: u32,
    #[serde(default = "default_post_seconds")]
    pub post_seconds: u32,
    /// Size of the in-memory annotated-frame ring buffer, in seconds.
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        RecordingConfig {
            enabled: false,
            pre_seconds: default_pre_seconds(),
            post_seconds: default_post_seconds(),
            buffer_seconds: default_buffer_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_frame_timeout_s")]
    pub frame_timeout_s: u64,
    #[serde(default = "default_stable_rate_ratio")]
    pub stable_rate_ratio: f64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            max_consecutive_errors: default_max_consecutive_errors(),
            frame_timeout_s: default_frame_timeout_s(),
            stable_rate_ratio: default_stable_rate_ratio(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig { enabled: true, port: default_api_port() }
    }
}

fn default_true() -> bool { true }
fn default_enabled() -> bool { true }
fn default_protocol() -> SourceProtocol { SourceProtocol::Rtsp }
fn default_width() -> u32 { 1920 }
fn default_height() -> u32 { 1080 }
fn default_fps() -> u32 { 15 }
fn default_quality() -> u8 { 80 }
fn default_stream_protocol() -> StreamProtocol { StreamProtocol::Mjpeg }
fn default_storage_path() -> PathBuf { PathBuf::from("./recordings") }
fn default_max_pipelines() -> usize { 32 }
fn default_port_range() -> (u16, u16) { (18000, 18999) }
fn default_model_path() -> PathBuf { PathBuf::from("models/detector.onnx") }
fn default_input_size() -> u32 { 640 }
fn default_confidence_threshold() -> f32 { 0.5 }
fn default_nms_threshold() -> f32 { 0.45 }
fn default_max_detections() -> usize { 300 }
fn default_detection_interval_frames() -> u32 { 1 }
fn default_high_thresh() -> f32 { 0.5 }
fn default_low_thresh() -> f32 { 0.1 }
fn default_min_hits() -> u32 { 3 }
fn default_max_lost_frames() -> u32 { 30 }
fn default_similarity_threshold() -> f32 { 0.7 }
fn default_max_matches() -> usize { 10 }
fn default_match_timeout_s() -> u64 { 30 }
fn default_gender_threshold() -> f32 { 0.7 }
fn default_age_threshold() -> f32 { 0.6 }
fn default_attr_batch_size() -> usize { 4 }
fn default_attr_model_path() -> PathBuf { PathBuf::from("models/attributes.onnx") }
fn default_attr_min_crop_width() -> u32 { 32 }
fn default_attr_min_crop_height() -> u32 { 64 }
fn default_attr_min_blur_variance() -> f64 { 50.0 }
fn default_pre_seconds() -> u32 { 30 }
fn default_post_seconds() -> u32 { 30 }
fn default_buffer_seconds() -> u32 { 30 }
fn default_max_consecutive_errors() -> u32 { 10 }
fn default_frame_timeout_s() -> u64 { 30 }
fn default_stable_rate_ratio() -> f64 { 0.5 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_reconnect_backoff_ms() -> u64 { 5000 }
fn default_api_port() -> u16 { 8080 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AnalyticsError::ConfigInvalid(format!("cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| AnalyticsError::ConfigInvalid(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AnalyticsError::ConfigInvalid(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| AnalyticsError::ConfigInvalid(format!("cannot write config file: {e}")))?;
        Ok(())
    }

    /// Rejects out-of-range values per §6's "Configuration recognized
    /// options" ranges before any pipeline is constructed.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.id) {
                return Err(AnalyticsError::ConfigInvalid(format!("duplicate source id '{}'", source.id)));
            }
            if source.fps == 0 || source.fps > 60 {
                return Err(AnalyticsError::ConfigInvalid(format!(
                    "source '{}': fps must be in 1..=60",
                    source.id
                )));
            }
            validate_stream_config(&source.id, &source.stream)?;
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(AnalyticsError::ConfigInvalid("confidence_threshold must be in [0,1]".into()));
        }
        if !(0.0..=1.0).contains(&self.detection.nms_threshold) {
            return Err(AnalyticsError::ConfigInvalid("nms_threshold must be in [0,1]".into()));
        }
        if !(0.5..=0.95).contains(&self.reid.similarity_threshold) {
            return Err(AnalyticsError::ConfigInvalid("reid.similarity_threshold must be in [0.5,0.95]".into()));
        }
        if !(1..=20).contains(&self.reid.max_matches) {
            return Err(AnalyticsError::ConfigInvalid("reid.max_matches must be in 1..=20".into()));
        }
        if !(5..=300).contains(&self.reid.match_timeout_s) {
            return Err(AnalyticsError::ConfigInvalid("reid.match_timeout_s must be in 5..=300".into()));
        }
        if !(10..=300).contains(&self.recording.pre_seconds) {
            return Err(AnalyticsError::ConfigInvalid("recording.pre_seconds must be in 10..=300".into()));
        }
        if self.max_pipelines == 0 {
            return Err(AnalyticsError::ConfigInvalid("max_pipelines must be > 0".into()));
        }
        if self.mjpeg_port_range.0 >= self.mjpeg_port_range.1 {
            return Err(AnalyticsError::ConfigInvalid("mjpeg_port_range must be non-empty and increasing".into()));
        }
        Ok(())
    }
}

fn validate_stream_config(source_id: &str, stream: &StreamConfig) -> Result<()> {
    if stream.fps == 0 || stream.fps > 60 {
        return Err(AnalyticsError::ConfigInvalid(format!("source '{source_id}': stream fps must be in 1..=60")));
    }
    if stream.quality == 0 || stream.quality > 100 {
        return Err(AnalyticsError::ConfigInvalid(format!("source '{source_id}': stream quality must be in 1..=100")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_source() -> SourceConfig {
        SourceConfig {
            id: "cam1".into(),
            url: "rtsp://localhost/stream".into(),
            protocol: SourceProtocol::Rtsp,
            username: None,
            password: None,
            width: 1920,
            height: 1080,
            fps: 15,
            enabled: true,
            stream: StreamConfig::default(),
        }
    }

    #[test]
    fn rejects_duplicate_source_ids() {
        let cfg = Config {
            sources: vec![base_source(), base_source()],
            detection: DetectionConfig::default(),
            tracking: TrackingConfig::default(),
            reid: ReidConfig::default(),
            attributes: AttributesConfig::default(),
            recording: RecordingConfig::default(),
            health: HealthConfig::default(),
            api: ApiConfig::default(),
            storage_path: default_storage_path(),
            max_pipelines: 32,
            mjpeg_port_range: (18000, 18999),
            storage: StorageConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_similarity_threshold() {
        let mut cfg = Config {
            sources: vec![base_source()],
            detection: DetectionConfig::default(),
            tracking: TrackingConfig::default(),
            reid: ReidConfig::default(),
            attributes: AttributesConfig::default(),
            recording: RecordingConfig::default(),
            health: HealthConfig::default(),
            api: ApiConfig::default(),
            storage_path: default_storage_path(),
            max_pipelines: 32,
            mjpeg_port_range: (18000, 18999),
            storage: StorageConfig::default(),
        };
        cfg.reid.similarity_threshold = 0.99;
        assert!(cfg.validate().is_err());
    }
}
