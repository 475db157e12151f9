//! Inference backend abstraction (C2): a uniform `detect` capability over
//! CPU/NPU/GPU execution, with `Auto` selection and single-retry fallback.
//! Grounded in the ONNX Runtime session usage from the retrieval pack's
//! attribute-detection module (`Session::builder()...commit_from_file`,
//! `ort::inputs![...]`, `try_extract_tensor`).

mod cpu;
mod gpu;
mod npu;

pub use cpu::CpuBackend;
pub use gpu::GpuBackend;
pub use npu::NpuBackend;

use std::path::Path;
use std::time::{Duration, Instant};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

use crate::detection::{f16_to_f32, letterbox_preprocess, postprocess, Detection, PostprocessConfig, RawCandidate};
use crate::error::{AnalyticsError, Result};
use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpu,
    Npu,
    Gpu,
    Auto,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Auto
    }
}

/// Capability set every concrete backend implements. Hot path
/// (`detect`) is monomorphic per pipeline once a backend is selected.
pub trait Backend: Send {
    fn initialize(&mut self, model_path: &Path) -> Result<()>;
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
    fn warmup(&mut self) -> Result<()>;
    fn last_latency(&self) -> Option<Duration>;
    fn name(&self) -> &'static str;
}

/// Shared ONNX Runtime session plumbing used by every concrete backend;
/// only the execution provider registered in `builder_with_providers`
/// differs between Cpu/Npu/Gpu.
pub(crate) struct OnnxRunner {
    session: Option<Session>,
    pub(crate) input_w: u32,
    pub(crate) input_h: u32,
    class_names: Vec<String>,
    postprocess_config: PostprocessConfig,
    last_latency: Option<Duration>,
}

impl OnnxRunner {
    pub(crate) fn new(input_w: u32, input_h: u32, class_names: Vec<String>, postprocess_config: PostprocessConfig) -> Self {
        OnnxRunner {
            session: None,
            input_w,
            input_h,
            class_names,
            postprocess_config,
            last_latency: None,
        }
    }

    pub(crate) fn load(&mut self, model_path: &Path) -> Result<()> {
        if !model_path.exists() {
            return Err(AnalyticsError::BackendInitFailed(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }
        let session = Session::builder()
            .map_err(|e| AnalyticsError::BackendInitFailed(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| AnalyticsError::BackendInitFailed(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| AnalyticsError::BackendInitFailed(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    pub(crate) fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| AnalyticsError::BackendRuntime("session not initialized".into()))?;

        let (tensor, transform) = letterbox_preprocess(frame, self.input_w, self.input_h);
        let input_dyn = tensor.into_dyn();

        let start = Instant::now();
        let input = ort::inputs![TensorRef::from_array_view(&input_dyn)
            .map_err(|e| AnalyticsError::BackendRuntime(e.to_string()))?];
        let outputs = session
            .run(input)
            .map_err(|e| AnalyticsError::BackendRuntime(e.to_string()))?;
        let elapsed = start.elapsed();
        self.last_latency = Some(elapsed);

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyticsError::BackendRuntime(e.to_string()))?;
        if shape.len() != 3 {
            return Err(AnalyticsError::BackendRuntime(format!(
                "unexpected output rank {}",
                shape.len()
            )));
        }
        // Expected layout: [1, num_candidates, 5 + num_classes]
        let num_candidates = shape[1] as usize;
        let stride = shape[2] as usize;
        let num_classes = stride.saturating_sub(5);

        let mut candidates = Vec::with_capacity(num_candidates);
        for i in 0..num_candidates {
            let base = i * stride;
            if base + 4 >= data.len() {
                break;
            }
            let cx = data[base];
            let cy = data[base + 1];
            let w = data[base + 2];
            let h = data[base + 3];
            let objectness = crate::detection::sigmoid(data[base + 4]);

            let mut best_class = 0u32;
            let mut best_score = 0.0f32;
            for c in 0..num_classes {
                let raw = data.get(base + 5 + c).copied().unwrap_or(f32::NEG_INFINITY);
                let score = crate::detection::sigmoid(raw);
                if score > best_score {
                    best_score = score;
                    best_class = c as u32;
                }
            }

            let bbox_model_space = crate::detection::BBox {
                x: cx - w / 2.0,
                y: cy - h / 2.0,
                w,
                h,
            };
            let bbox = transform.unletterbox(bbox_model_space);

            candidates.push(RawCandidate {
                bbox,
                objectness,
                class_id: best_class,
                class_score: best_score,
            });
        }

        let names = &self.class_names;
        let class_names = move |id: u32| {
            names
                .get(id as usize)
                .cloned()
                .unwrap_or_else(|| format!("class_{id}"))
        };
        Ok(postprocess(&candidates, &self.postprocess_config, &class_names, None))
    }

    pub(crate) fn warmup(&mut self, frame: &Frame) -> Result<()> {
        self.run(frame).map(|_| ())
    }

    pub(crate) fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }
}

/// Decodes a row of half-precision floats, used by backends whose output
/// tensor is emitted as fp16 rather than fp32.
pub fn decode_f16_row(bits: &[u16]) -> Vec<f32> {
    bits.iter().map(|&b| f16_to_f32(b)).collect()
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model_path: std::path::PathBuf,
    pub input_w: u32,
    pub input_h: u32,
    pub class_names: Vec<String>,
    pub postprocess: PostprocessConfig,
    /// Priority order `Auto` tries backends in, default `[Gpu, Npu, Cpu]`.
    pub priority: Vec<BackendKind>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            kind: BackendKind::Auto,
            model_path: std::path::PathBuf::new(),
            input_w: 640,
            input_h: 640,
            class_names: Vec::new(),
            postprocess: PostprocessConfig::default(),
            priority: vec![BackendKind::Gpu, BackendKind::Npu, BackendKind::Cpu],
        }
    }
}

fn make_backend(kind: BackendKind, cfg: &BackendConfig) -> Box<dyn Backend> {
    match kind {
        BackendKind::Cpu => Box::new(CpuBackend::new(cfg)),
        BackendKind::Npu => Box::new(NpuBackend::new(cfg)),
        BackendKind::Gpu => Box::new(GpuBackend::new(cfg)),
        BackendKind::Auto => unreachable!("Auto is resolved before construction"),
    }
}

/// Selects and owns the active backend, implementing the §4.2 `Auto`
/// selection policy and the one-retry-with-fallback behavior on
/// `detect` failure.
pub struct BackendHandle {
    active: Box<dyn Backend>,
    config: BackendConfig,
    fallback_cursor: usize,
}

impl BackendHandle {
    /// Runs the `Auto` selection policy (or constructs the single
    /// explicitly-configured backend) and performs `initialize` +
    /// `warmup`.
    pub fn select(config: BackendConfig, warmup_frame: &Frame) -> Result<Self> {
        let candidates: Vec<BackendKind> = match config.kind {
            BackendKind::Auto => config.priority.clone(),
            other => vec![other],
        };

        let mut last_err = None;
        for (idx, kind) in candidates.iter().enumerate() {
            let mut backend = make_backend(*kind, &config);
            match backend
                .initialize(&config.model_path)
                .and_then(|_| backend.warmup())
            {
                Ok(()) => {
                    tracing::info!(backend = backend.name(), "inference backend selected");
                    let _ = backend.detect(warmup_frame);
                    return Ok(BackendHandle {
                        active: backend,
                        config,
                        fallback_cursor: idx,
                    });
                }
                Err(e) => {
                    tracing::warn!(backend = ?kind, error = %e, "backend initialization failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AnalyticsError::BackendInitFailed("no backends configured".into())))
    }

    pub fn name(&self) -> &'static str {
        self.active.name()
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.active.last_latency()
    }

    /// Runs `detect`; on failure, re-initializes the next backend in the
    /// fallback chain (if any remain) and retries the same frame exactly
    /// once. If no fallback remains, the error is surfaced to the
    /// pipeline, which treats it as a transient (counted) error.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        match self.active.detect(frame) {
            Ok(d) => Ok(d),
            Err(e) => {
                tracing::warn!(backend = self.active.name(), error = %e, "detect failed, attempting fallback");
                let remaining: Vec<BackendKind> = self
                    .config
                    .priority
                    .iter()
                    .skip(self.fallback_cursor + 1)
                    .copied()
                    .collect();
                for (offset, kind) in remaining.iter().enumerate() {
                    let mut backend = make_backend(*kind, &self.config);
                    if backend.initialize(&self.config.model_path).is_ok() {
                        tracing::info!(backend = backend.name(), "fallback backend initialized");
                        self.active = backend;
                        self.fallback_cursor += offset + 1;
                        return self.active.detect(frame);
                    }
                }
                Err(e)
            }
        }
    }
}
