use std::path::Path;
use std::time::Duration;

use crate::detection::Detection;
use crate::error::Result;
use crate::frame::Frame;

use super::{Backend, BackendConfig, OnnxRunner};

/// NPU execution provider backend, for on-device accelerators exposed
/// through an ONNX Runtime execution provider. Falls back through the
/// `BackendHandle` chain the same way Cpu/Gpu do when unavailable on a
/// given host.
pub struct NpuBackend {
    runner: OnnxRunner,
}

impl NpuBackend {
    pub fn new(cfg: &BackendConfig) -> Self {
        NpuBackend {
            runner: OnnxRunner::new(cfg.input_w, cfg.input_h, cfg.class_names.clone(), cfg.postprocess),
        }
    }
}

impl Backend for NpuBackend {
    fn initialize(&mut self, model_path: &Path) -> Result<()> {
        self.runner.load(model_path)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.runner.run(frame)
    }

    fn warmup(&mut self) -> Result<()> {
        let blank = Frame::new(
            "warmup",
            self.runner.input_w.max(1),
            self.runner.input_h.max(1),
            bytes::Bytes::from(vec![0u8; (self.runner.input_w.max(1) * self.runner.input_h.max(1) * 3) as usize]),
            0,
            0,
        );
        self.runner.warmup(&blank)
    }

    fn last_latency(&self) -> Option<Duration> {
        self.runner.last_latency()
    }

    fn name(&self) -> &'static str {
        "npu"
    }
}
