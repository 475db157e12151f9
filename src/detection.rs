//! Detection data model (C2 output) plus the pre/post-processing contract
//! that must be reproduced bit-exact: letterbox resize, BGR→RGB float
//! normalization, sigmoid activation, confidence filtering and per-class
//! NMS.

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Padding value used by letterbox resize, per §4.2.
pub const LETTERBOX_PAD: u8 = 114;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn area(&self) -> f32 {
        (self.w.max(0.0)) * (self.h.max(0.0))
    }

    /// Intersection-over-union against another box, both in frame pixels.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ax2 = self.x + self.w;
        let ay2 = self.y + self.h;
        let bx2 = other.x + other.w;
        let by2 = other.y + other.h;

        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = ax2.min(bx2);
        let iy2 = ay2.min(by2);

        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let intersection = iw * ih;
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
}

/// Parameters describing how a frame is letterboxed into the model's
/// fixed-size input tensor. Returned alongside the tensor so detections can
/// be mapped back to original frame coordinates.
#[derive(Debug, Clone, Copy)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub input_w: u32,
    pub input_h: u32,
    pub src_w: u32,
    pub src_h: u32,
}

impl LetterboxTransform {
    /// Maps a box in model-input-space back to original frame pixels.
    pub fn unletterbox(&self, b: BBox) -> BBox {
        BBox {
            x: (b.x - self.pad_x) / self.scale,
            y: (b.y - self.pad_y) / self.scale,
            w: b.w / self.scale,
            h: b.h / self.scale,
        }
    }
}

/// Aspect-preserving resize with constant gray padding to `(target_w,
/// target_h)`, followed by BGR→RGB and [0,1] normalization into an NCHW
/// `Array4<f32>` of shape `[1, 3, target_h, target_w]`.
pub fn letterbox_preprocess(
    frame: &Frame,
    target_w: u32,
    target_h: u32,
) -> (Array4<f32>, LetterboxTransform) {
    let src_w = frame.width;
    let src_h = frame.height;
    let scale = (target_w as f32 / src_w as f32).min(target_h as f32 / src_h as f32);
    let resized_w = (src_w as f32 * scale).round() as u32;
    let resized_h = (src_h as f32 * scale).round() as u32;
    let pad_x = ((target_w - resized_w) / 2) as f32;
    let pad_y = ((target_h - resized_h) / 2) as f32;

    let img = image::RgbImage::from_fn(src_w, src_h, |x, y| {
        let idx = ((y * src_w + x) * 3) as usize;
        let b = frame.data[idx];
        let g = frame.data[idx + 1];
        let r = frame.data[idx + 2];
        image::Rgb([r, g, b])
    });
    let resized = image::imageops::resize(
        &img,
        resized_w.max(1),
        resized_h.max(1),
        image::imageops::FilterType::Lanczos3,
    );

    let mut canvas = image::RgbImage::from_pixel(target_w, target_h, image::Rgb([LETTERBOX_PAD; 3]));
    image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let mut array = Array4::<f32>::zeros((1, 3, target_h as usize, target_w as usize));
    for y in 0..target_h {
        for x in 0..target_w {
            let px = canvas.get_pixel(x, y);
            for c in 0..3 {
                array[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
            }
        }
    }

    (
        array,
        LetterboxTransform {
            scale,
            pad_x,
            pad_y,
            input_w: target_w,
            input_h: target_h,
            src_w,
            src_h,
        },
    )
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// IEEE-754 binary16 → binary32 conversion. The forbidden shortcut is
/// `value as f32 / 65536.0`, which silently corrupts every value outside a
/// narrow range — see the design notes on the historical defect this
/// replaces.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = (bits >> 15) & 0x1;
    let exponent = (bits >> 10) & 0x1f;
    let mantissa = bits & 0x3ff;

    let sign_f = if sign == 1 { -1.0f32 } else { 1.0f32 };

    if exponent == 0 {
        if mantissa == 0 {
            return sign_f * 0.0;
        }
        // Subnormal: value = sign * 2^-14 * (mantissa / 1024)
        return sign_f * (mantissa as f32) * 2f32.powi(-24);
    }
    if exponent == 0x1f {
        if mantissa == 0 {
            return sign_f * f32::INFINITY;
        }
        return f32::NAN;
    }

    let exp_unbiased = exponent as i32 - 15;
    let mantissa_f = 1.0 + (mantissa as f32) / 1024.0;
    sign_f * mantissa_f * 2f32.powi(exp_unbiased)
}

#[derive(Debug, Clone, Copy)]
pub struct PostprocessConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        PostprocessConfig {
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            max_detections: 300,
        }
    }
}

/// Raw per-candidate output before NMS: objectness and per-class scores
/// are assumed already sigmoid-activated by the caller via [`sigmoid`].
#[derive(Debug, Clone)]
pub struct RawCandidate {
    pub bbox: BBox,
    pub objectness: f32,
    pub class_id: u32,
    pub class_score: f32,
}

/// Filters by `objectness * class_score` threshold, then runs per-class
/// greedy NMS keeping highest-score boxes first. `class_names` maps
/// class_id to a display name; `allowlist`, if given, restricts which
/// class ids are kept prior to NMS.
pub fn postprocess(
    candidates: &[RawCandidate],
    config: &PostprocessConfig,
    class_names: &dyn Fn(u32) -> String,
    allowlist: Option<&[u32]>,
) -> Vec<Detection> {
    let mut filtered: Vec<&RawCandidate> = candidates
        .iter()
        .filter(|c| c.objectness * c.class_score >= config.confidence_threshold)
        .filter(|c| allowlist.map(|a| a.contains(&c.class_id)).unwrap_or(true))
        .collect();

    // Group by class, sort each group by descending score, then greedy NMS.
    let mut by_class: std::collections::BTreeMap<u32, Vec<&RawCandidate>> = Default::default();
    for c in filtered.drain(..) {
        by_class.entry(c.class_id).or_default().push(c);
    }

    let mut out = Vec::new();
    for (class_id, mut group) in by_class {
        group.sort_by(|a, b| {
            (b.objectness * b.class_score)
                .partial_cmp(&(a.objectness * a.class_score))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut kept: Vec<&RawCandidate> = Vec::new();
        'outer: for cand in group {
            for k in &kept {
                if cand.bbox.iou(&k.bbox) > config.nms_threshold {
                    continue 'outer;
                }
            }
            kept.push(cand);
        }
        for c in kept {
            out.push(Detection {
                bbox: c.bbox,
                class_id,
                class_name: class_names(class_id),
                confidence: c.objectness * c.class_score,
            });
        }
    }

    out.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(config.max_detections);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_decode_known_values() {
        assert_eq!(f16_to_f32(0x3C00), 1.0); // 1.0
        assert_eq!(f16_to_f32(0xC000), -2.0); // -2.0
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert!((f16_to_f32(0x3555) - 0.33325195).abs() < 1e-5); // ~1/3
    }

    #[test]
    fn f16_decode_is_not_the_forbidden_shortcut() {
        // The forbidden shortcut (bits as f32 / 65536.0) gives a wildly
        // different value for 1.0 (0x3C00 = 15360): 15360/65536 = 0.2344.
        let shortcut = 0x3C00u16 as f32 / 65536.0;
        assert_ne!(f16_to_f32(0x3C00), shortcut);
    }

    #[test]
    fn nms_keeps_highest_box_above_threshold() {
        let candidates = vec![
            RawCandidate {
                bbox: BBox { x: 0.0, y: 0.0, w: 100.0, h: 100.0 },
                objectness: 1.0,
                class_id: 0,
                class_score: 0.9,
            },
            RawCandidate {
                bbox: BBox { x: 10.0, y: 10.0, w: 100.0, h: 100.0 },
                objectness: 1.0,
                class_id: 0,
                class_score: 0.85,
            },
        ];
        let config = PostprocessConfig {
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            max_detections: 300,
        };
        let names = |_: u32| "person".to_string();
        let out = postprocess(&candidates, &config, &names, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn nms_keeps_both_below_overlap_when_threshold_high() {
        let candidates = vec![
            RawCandidate {
                bbox: BBox { x: 0.0, y: 0.0, w: 100.0, h: 100.0 },
                objectness: 1.0,
                class_id: 0,
                class_score: 0.9,
            },
            RawCandidate {
                bbox: BBox { x: 10.0, y: 10.0, w: 100.0, h: 100.0 },
                objectness: 1.0,
                class_id: 0,
                class_score: 0.85,
            },
        ];
        let config = PostprocessConfig {
            confidence_threshold: 0.5,
            nms_threshold: 0.9,
            max_detections: 300,
        };
        let names = |_: u32| "person".to_string();
        let out = postprocess(&candidates, &config, &names, None);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn postprocess_no_two_same_class_boxes_exceed_iou_after_nms() {
        let mut candidates = Vec::new();
        for i in 0..5 {
            candidates.push(RawCandidate {
                bbox: BBox { x: i as f32 * 5.0, y: 0.0, w: 50.0, h: 50.0 },
                objectness: 1.0,
                class_id: 1,
                class_score: 0.6 + i as f32 * 0.01,
            });
        }
        let config = PostprocessConfig::default();
        let names = |_: u32| "car".to_string();
        let out = postprocess(&candidates, &config, &names, None);
        for i in 0..out.len() {
            for j in (i + 1)..out.len() {
                if out[i].class_id == out[j].class_id {
                    assert!(out[i].bbox.iou(&out[j].bbox) <= config.nms_threshold);
                }
            }
        }
    }

    #[test]
    fn bbox_iou_identical_is_one() {
        let b = BBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }
}
