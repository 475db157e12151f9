//! Attribute analyzer (C5): person-only size/quality gated age+gender
//! batch inference, with a per-track LRU cache that skips re-inference
//! when nothing can change. Model-call plumbing follows the same `ort`
//! session pattern as [`crate::backend`]; this module owns only the
//! gating, batching and caching policy around it.

use std::collections::HashMap;
use std::path::Path;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};

use crate::detection::BBox;
use crate::error::{AnalyticsError, Result};
use crate::frame::Frame;

#[derive(Debug, Clone, Copy)]
pub struct AttributeConfig {
    pub enabled: bool,
    pub gender_threshold: f32,
    pub age_threshold: f32,
    pub batch_size: usize,
    pub enable_caching: bool,
    pub min_crop_width: u32,
    pub min_crop_height: u32,
    pub min_blur_variance: f64,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        AttributeConfig {
            enabled: false,
            gender_threshold: 0.7,
            age_threshold: 0.6,
            batch_size: 4,
            enable_caching: true,
            min_crop_width: 32,
            min_crop_height: 64,
            min_blur_variance: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonAttributes {
    pub gender: Option<String>,
    pub gender_confidence: f32,
    pub age_group: Option<String>,
    pub age_confidence: f32,
}

impl PersonAttributes {
    fn high_confidence(&self, config: &AttributeConfig) -> bool {
        self.gender_confidence >= config.gender_threshold && self.age_confidence >= config.age_threshold
    }
}

struct CacheEntry {
    bbox: BBox,
    attributes: PersonAttributes,
}

/// Grayscale Laplacian-variance blur estimate, used as the quality gate
/// before spending a model call on a crop.
fn blur_variance(frame: &Frame, bbox: BBox) -> f64 {
    let x0 = bbox.x.max(0.0) as u32;
    let y0 = bbox.y.max(0.0) as u32;
    let x1 = ((bbox.x + bbox.w) as u32).min(frame.width);
    let y1 = ((bbox.y + bbox.h) as u32).min(frame.height);
    if x1 <= x0 + 2 || y1 <= y0 + 2 {
        return 0.0;
    }

    let gray = |x: u32, y: u32| -> f64 {
        let idx = ((y * frame.width + x) * 3) as usize;
        if idx + 2 >= frame.data.len() {
            return 0.0;
        }
        let b = frame.data[idx] as f64;
        let g = frame.data[idx + 1] as f64;
        let r = frame.data[idx + 2] as f64;
        0.114 * b + 0.587 * g + 0.299 * r
    };

    let mut values = Vec::new();
    for y in (y0 + 1)..(y1 - 1) {
        for x in (x0 + 1)..(x1 - 1) {
            let lap = gray(x, y) * 4.0 - gray(x - 1, y) - gray(x + 1, y) - gray(x, y - 1) - gray(x, y + 1);
            values.push(lap);
        }
    }
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

pub struct AttributeAnalyzer {
    config: AttributeConfig,
    model: Option<Session>,
    cache: HashMap<u32, CacheEntry>,
}

impl AttributeAnalyzer {
    pub fn new(config: AttributeConfig) -> Self {
        AttributeAnalyzer {
            config,
            model: None,
            cache: HashMap::new(),
        }
    }

    pub fn load_model(&mut self, model_path: &Path) -> Result<()> {
        if !model_path.exists() {
            return Err(AnalyticsError::BackendInitFailed(format!(
                "attribute model not found: {}",
                model_path.display()
            )));
        }
        let session = Session::builder()
            .map_err(|e| AnalyticsError::BackendInitFailed(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| AnalyticsError::BackendInitFailed(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| AnalyticsError::BackendInitFailed(e.to_string()))?;
        self.model = Some(session);
        Ok(())
    }

    /// Filters `tracks` to qualifying person crops, batches them up to
    /// `batch_size`, runs inference, and returns `(local_id, attributes)`
    /// pairs for every track that produced a confident result. Tracks
    /// whose cached attributes are still valid (bbox IoU > 0.9 with the
    /// cached bbox, and cached confidence already high) are skipped.
    pub fn analyze(&mut self, frame: &Frame, tracks: &[(u32, u32, BBox)]) -> Vec<(u32, PersonAttributes)> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut to_infer = Vec::new();
        let mut results = Vec::new();

        for &(local_id, class_id, bbox) in tracks {
            if class_id != 0 {
                continue;
            }
            if bbox.w < self.config.min_crop_width as f32 || bbox.h < self.config.min_crop_height as f32 {
                continue;
            }

            if self.config.enable_caching {
                if let Some(entry) = self.cache.get(&local_id) {
                    if entry.bbox.iou(&bbox) > 0.9 && entry.attributes.high_confidence(&self.config) {
                        results.push((local_id, entry.attributes.clone()));
                        continue;
                    }
                }
            }

            if blur_variance(frame, bbox) < self.config.min_blur_variance {
                continue;
            }

            to_infer.push((local_id, bbox));
        }

        for batch in to_infer.chunks(self.config.batch_size) {
            for &(local_id, bbox) in batch {
                if let Some(attrs) = self.infer_one(frame, bbox) {
                    if self.config.enable_caching {
                        self.cache.insert(local_id, CacheEntry { bbox, attributes: attrs.clone() });
                    }
                    results.push((local_id, attrs));
                }
            }
        }

        results
    }

    fn infer_one(&mut self, frame: &Frame, bbox: BBox) -> Option<PersonAttributes> {
        let model = self.model.as_mut()?;

        let tensor = crop_to_tensor(frame, bbox, 128, 256);
        let tensor_dyn = tensor.into_dyn();
        let input = ort::inputs![TensorRef::from_array_view(&tensor_dyn).ok()?];
        let outputs = model.run(input).ok()?;
        let (_shape, data) = outputs[0].try_extract_tensor::<f32>().ok()?;

        if data.len() < 4 {
            return None;
        }
        let gender_conf = crate::detection::sigmoid(data[0]);
        let gender = if gender_conf >= 0.5 { "male" } else { "female" };
        let age_conf = crate::detection::sigmoid(data[2]);
        let age_group = if data[2] >= 0.0 { "adult" } else { "minor" };

        Some(PersonAttributes {
            gender: Some(gender.to_string()),
            gender_confidence: gender_conf.max(1.0 - gender_conf),
            age_group: Some(age_group.to_string()),
            age_confidence: age_conf.max(1.0 - age_conf),
        })
    }
}

fn crop_to_tensor(frame: &Frame, bbox: BBox, target_w: u32, target_h: u32) -> ndarray::Array4<f32> {
    let x0 = bbox.x.max(0.0) as u32;
    let y0 = bbox.y.max(0.0) as u32;
    let w = (bbox.w as u32).min(frame.width.saturating_sub(x0)).max(1);
    let h = (bbox.h as u32).min(frame.height.saturating_sub(y0)).max(1);

    let img = image::RgbImage::from_fn(w, h, |x, y| {
        let idx = (((y0 + y) * frame.width + (x0 + x)) * 3) as usize;
        if idx + 2 >= frame.data.len() {
            return image::Rgb([114, 114, 114]);
        }
        let b = frame.data[idx];
        let g = frame.data[idx + 1];
        let r = frame.data[idx + 2];
        image::Rgb([r, g, b])
    });
    let resized = image::imageops::resize(&img, target_w, target_h, image::imageops::FilterType::Lanczos3);

    let mut array = ndarray::Array4::<f32>::zeros((1, 3, target_h as usize, target_w as usize));
    for y in 0..target_h {
        for x in 0..target_w {
            let px = resized.get_pixel(x, y);
            for c in 0..3 {
                array[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
            }
        }
    }
    array
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_analyzer_returns_nothing() {
        let mut analyzer = AttributeAnalyzer::new(AttributeConfig { enabled: false, ..Default::default() });
        let frame = Frame::new("cam1", 64, 128, bytes::Bytes::from(vec![0u8; 64 * 128 * 3]), 0, 0);
        let tracks = vec![(1u32, 0u32, BBox { x: 0.0, y: 0.0, w: 40.0, h: 100.0 })];
        assert!(analyzer.analyze(&frame, &tracks).is_empty());
    }

    #[test]
    fn non_person_class_is_skipped() {
        let mut analyzer = AttributeAnalyzer::new(AttributeConfig { enabled: true, ..Default::default() });
        let frame = Frame::new("cam1", 64, 128, bytes::Bytes::from(vec![0u8; 64 * 128 * 3]), 0, 0);
        let tracks = vec![(1u32, 2u32, BBox { x: 0.0, y: 0.0, w: 40.0, h: 100.0 })];
        assert!(analyzer.analyze(&frame, &tracks).is_empty());
    }

    #[test]
    fn small_crop_is_skipped() {
        let mut analyzer = AttributeAnalyzer::new(AttributeConfig { enabled: true, ..Default::default() });
        let frame = Frame::new("cam1", 64, 128, bytes::Bytes::from(vec![0u8; 64 * 128 * 3]), 0, 0);
        let tracks = vec![(1u32, 0u32, BBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 })];
        assert!(analyzer.analyze(&frame, &tracks).is_empty());
    }
}
