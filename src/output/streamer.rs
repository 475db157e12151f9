//! Streamer (§4.7): renders overlays onto the frame exactly once — a
//! single bounding-box rectangle per detection plus a label, never the
//! "main rectangle plus corner markers" double-draw the original repo's
//! overlay code was flagged for (§9) — and serves the result as MJPEG
//! multipart/x-mixed-replace. Drawing uses `imageproc`/`ab_glyph`, the
//! same crates the retrieval pack's overlay code draws with.

use std::sync::Arc;

use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::StreamConfig;
use crate::detection::Detection;
use crate::frame::Frame;
use crate::rules::Roi;
use crate::tracker::Track;

/// Deterministic per-class color so the same class always renders the
/// same hue across frames.
fn class_color(class_id: u32) -> image::Rgb<u8> {
    const PALETTE: [[u8; 3]; 8] = [
        [230, 25, 75],
        [60, 180, 75],
        [255, 225, 25],
        [0, 130, 200],
        [245, 130, 48],
        [145, 30, 180],
        [70, 240, 240],
        [240, 50, 230],
    ];
    let c = PALETTE[class_id as usize % PALETTE.len()];
    image::Rgb(c)
}

fn roi_color(priority: u8) -> image::Rgb<u8> {
    let scaled = (priority.min(5) as u16 * 255 / 5) as u8;
    image::Rgb([scaled, 255 - scaled, 128])
}

fn bgr_frame_to_image(frame: &Frame) -> image::RgbImage {
    image::RgbImage::from_fn(frame.width, frame.height, |x, y| {
        let idx = ((y * frame.width + x) * 3) as usize;
        if idx + 2 >= frame.data.len() {
            return image::Rgb([0, 0, 0]);
        }
        image::Rgb([frame.data[idx + 2], frame.data[idx + 1], frame.data[idx]])
    })
}

pub fn image_to_bgr_bytes(img: &image::RgbImage) -> bytes::Bytes {
    let mut out = Vec::with_capacity(img.width() as usize * img.height() as usize * 3);
    for px in img.pixels() {
        out.push(px[2]);
        out.push(px[1]);
        out.push(px[0]);
    }
    bytes::Bytes::from(out)
}

/// Alpha blended into each ROI's priority-indexed color for the polygon
/// fill, so overlapping ROIs and the tracks/boxes drawn on top stay
/// legible (§4.7: "semi-transparent fill, priority-indexed color").
const ROI_FILL_ALPHA: f32 = 0.25;

/// Renders bounding boxes (color by class), track id labels, ROI polygons
/// (semi-transparent fill plus an outline, priority-indexed color), a
/// flashing alarm indicator, and a timestamp with background — each
/// drawn exactly once.
pub fn render_overlays(
    frame: &Frame,
    detections: &[Detection],
    tracks: &[Track],
    rois: &[Roi],
    active_alarm: bool,
    recognition_labels: &[(u32, String)],
) -> image::RgbImage {
    let mut img = bgr_frame_to_image(frame);

    for roi in rois {
        let color = roi_color(roi.priority);
        fill_polygon_alpha(&mut img, &roi.polygon, color, ROI_FILL_ALPHA);
        for window in roi.polygon.windows(2) {
            draw_line(&mut img, window[0], window[1], color);
        }
        if let (Some(first), Some(last)) = (roi.polygon.first(), roi.polygon.last()) {
            draw_line(&mut img, *last, *first, color);
        }
    }

    for detection in detections {
        let rect = bbox_to_rect(detection.bbox.x, detection.bbox.y, detection.bbox.w, detection.bbox.h, img.width(), img.height());
        if let Some(rect) = rect {
            draw_hollow_rect_mut(&mut img, rect, class_color(detection.class_id));
        }
    }

    for track in tracks {
        let rect = bbox_to_rect(track.bbox.x, track.bbox.y, track.bbox.w, track.bbox.h, img.width(), img.height());
        if let Some(rect) = rect {
            let label = recognition_labels
                .iter()
                .find(|(id, _)| *id == track.local_id)
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| format!("#{}", track.local_id));
            draw_label(&mut img, rect.left().max(0) as u32, rect.top().max(0).saturating_sub(14) as u32, &label);
        }
    }

    if active_alarm {
        draw_filled_rect_mut(&mut img, Rect::at(0, 0).of_size(20.min(img.width()), 20.min(img.height())), image::Rgb([255, 0, 0]));
    }

    draw_timestamp(&mut img, frame.timestamp_us);

    img
}

fn bbox_to_rect(x: f32, y: f32, w: f32, h: f32, frame_w: u32, frame_h: u32) -> Option<Rect> {
    let x = x.max(0.0) as i32;
    let y = y.max(0.0) as i32;
    let w = (w.max(1.0) as i32).min(frame_w as i32 - x).max(1);
    let h = (h.max(1.0) as i32).min(frame_h as i32 - y).max(1);
    if x >= frame_w as i32 || y >= frame_h as i32 {
        return None;
    }
    Some(Rect::at(x, y).of_size(w as u32, h as u32))
}

fn draw_line(img: &mut image::RgbImage, a: (f64, f64), b: (f64, f64), color: image::Rgb<u8>) {
    imageproc::drawing::draw_line_segment_mut(img, (a.0 as f32, a.1 as f32), (b.0 as f32, b.1 as f32), color);
}

/// Alpha-blends `color` into every pixel whose center lies inside
/// `polygon`, scanning only its bounding box. `imageproc` has no
/// alpha-aware fill for an RGB (non-RGBA) image, so this walks the
/// bounding box and reuses the rule engine's own
/// [`crate::geometry::point_in_polygon`] test per pixel.
fn fill_polygon_alpha(img: &mut image::RgbImage, polygon: &[(f64, f64)], color: image::Rgb<u8>, alpha: f32) {
    if polygon.len() < 3 {
        return;
    }
    let (w, h) = (img.width(), img.height());
    let min_x = polygon.iter().map(|p| p.0).fold(f64::INFINITY, f64::min).floor().max(0.0) as u32;
    let max_x = polygon.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max).ceil().min(w.saturating_sub(1) as f64) as u32;
    let min_y = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min).floor().max(0.0) as u32;
    let max_y = polygon.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max).ceil().min(h.saturating_sub(1) as f64) as u32;
    if min_x > max_x || min_y > max_y {
        return;
    }
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            if crate::geometry::point_in_polygon((x as f64 + 0.5, y as f64 + 0.5), polygon) {
                let px = img.get_pixel_mut(x, y);
                for c in 0..3 {
                    px[c] = (px[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha).round() as u8;
                }
            }
        }
    }
}

/// Lazily loads a system DejaVu Sans font for label/timestamp text.
/// Falls back to drawing only the label backdrop when no font is found,
/// rather than bundling a binary font asset into the crate.
fn label_font() -> Option<&'static ab_glyph::FontArc> {
    static FONT: std::sync::OnceLock<Option<ab_glyph::FontArc>> = std::sync::OnceLock::new();
    FONT.get_or_init(|| {
        const CANDIDATES: [&str; 3] = [
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/TTF/DejaVuSans.ttf",
            "/usr/share/fonts/dejavu/DejaVuSans.ttf",
        ];
        CANDIDATES
            .iter()
            .find_map(|path| std::fs::read(path).ok())
            .and_then(|bytes| ab_glyph::FontArc::try_from_vec(bytes).ok())
    })
    .as_ref()
}

fn draw_label(img: &mut image::RgbImage, x: u32, y: u32, text: &str) {
    let backdrop = bbox_to_rect(x as f32, y as f32, (text.len() as f32 * 8.0).max(24.0), 14.0, img.width(), img.height());
    if let Some(backdrop) = backdrop {
        draw_filled_rect_mut(img, backdrop, image::Rgb([0, 0, 0]));
    }
    if let Some(font) = label_font() {
        let scale = ab_glyph::PxScale::from(14.0);
        draw_text_mut(img, image::Rgb([255, 255, 255]), x as i32, y as i32, scale, font, text);
    }
}

/// Draws the overlay's timestamp-with-background in the bottom-left corner.
pub fn draw_timestamp(img: &mut image::RgbImage, timestamp_us: i64) {
    let text = chrono::DateTime::<chrono::Utc>::from_timestamp_micros(timestamp_us)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_default();
    let y = img.height().saturating_sub(18);
    draw_label(img, 4, y, &text);
}

/// Encodes `img` as a JPEG at `quality`. Returns the encoder's error
/// instead of swallowing it — a failed encode must not publish an empty
/// body to the MJPEG broadcast channel or the snapshot endpoint.
pub fn encode_jpeg(img: &image::RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(img)?;
    Ok(buf)
}

/// Per-camera MJPEG publisher: the output stage pushes encoded JPEGs in;
/// any number of HTTP handlers subscribe and receive each frame as
/// `multipart/x-mixed-replace` parts. Slow subscribers fall behind and
/// are dropped by the broadcast channel rather than blocking the
/// pipeline (§5's "slow clients are disconnected, never block").
#[derive(Clone)]
pub struct MjpegPublisher {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
}

impl MjpegPublisher {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer);
        MjpegPublisher { tx }
    }

    pub fn publish(&self, jpeg: Vec<u8>) {
        let _ = self.tx.send(Arc::new(jpeg));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.tx.subscribe()
    }
}

/// Live streaming config: protocol, resolution, fps, quality, bitrate.
/// Swapped atomically by `VideoPipeline::update_stream_config`; applied
/// at the next frame boundary, never mid-frame.
pub struct StreamerState {
    pub config: RwLock<StreamConfig>,
    pub publisher: MjpegPublisher,
    pub last_frame: RwLock<Option<bytes::Bytes>>,
}

impl StreamerState {
    pub fn new(config: StreamConfig) -> Self {
        StreamerState {
            config: RwLock::new(config),
            publisher: MjpegPublisher::new(8),
            last_frame: RwLock::new(None),
        }
    }
}
