// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Pipeline manager (C9): owns the registry of running [`VideoPipeline`]s,
//! the shared clip-storage pool/writer task, and the cross-camera ReID
//! matcher every pipeline shares. Adding a pipeline is two-phase — the slow
//! work (`VideoPipeline::initialize`, which opens the inference backend and
//! warms it up) runs with no lock held, and only the cheap insert + `start()`
//! runs under the registry lock — so one camera's slow startup never stalls
//! API calls against the others. A background task polls pipeline health
//! once a second and removes (never restarts) any pipeline whose frame
//! source reports `Failed`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as PlMutex, RwLock as PlRwLock};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, SourceConfig, StreamConfig};
use crate::error::{AnalyticsError, Result};
use crate::health::PipelineHealth;
use crate::output::alarm::{DeliveryChannel, LoggingChannel};
use crate::pipeline::VideoPipeline;
use crate::reid::{CrossCameraMatcher, MatcherConfig};
use crate::rules::{BehaviorRule, Roi};
use crate::storage::chunk_pool::ChunkPool;
use crate::storage::global_writer::{self, SharedIndex, WriteRequest};

/// How often the background monitor polls pipeline health (§4.9).
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

struct PipelineEntry {
    pipeline: Arc<AsyncMutex<VideoPipeline>>,
    port: u16,
}

/// Top-level manager. Cheap to clone via `Arc<PipelineManager>` — the API
/// layer and the background monitor both hold a reference to the same
/// instance.
pub struct PipelineManager {
    config: Config,
    pipelines: PlRwLock<HashMap<String, PipelineEntry>>,
    used_ports: PlMutex<HashSet<u16>>,
    cross_camera_matcher: Arc<CrossCameraMatcher>,
    alarm_channels: Vec<Arc<dyn DeliveryChannel>>,
    writer_tx: mpsc::Sender<WriteRequest>,
    /// Shared index for status / listing (recorded clip lookups).
    pub index: SharedIndex,
    writer_handle: PlMutex<Option<JoinHandle<()>>>,
    monitor_stop: Arc<AtomicBool>,
}

impl PipelineManager {
    /// Opens the shared clip pool, spawns its writer task, and starts every
    /// `enabled` source from `config.sources`. A source that fails to start
    /// is logged and skipped rather than aborting the whole manager.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let pool_bytes = config.storage.chunk_size_mb * 1024 * 1024;
        let pool = ChunkPool::open(&config.storage_path, pool_bytes, config.storage.max_pools)?;
        let (writer_tx, index, writer_handle) = global_writer::spawn_writer(pool, config.storage.writer_queue_size);
        info!(
            pools = config.storage.max_pools,
            pool_size_mb = config.storage.chunk_size_mb,
            path = ?config.storage_path,
            "clip storage pool opened"
        );

        let cross_camera_matcher = Arc::new(CrossCameraMatcher::new(MatcherConfig {
            similarity_threshold: config.reid.similarity_threshold,
            ewma_alpha: 0.1,
            match_timeout: Duration::from_secs(config.reid.match_timeout_s),
        }));

        let alarm_channels: Vec<Arc<dyn DeliveryChannel>> = vec![Arc::new(LoggingChannel::new("log", 0))];

        let manager = Arc::new(PipelineManager {
            config: config.clone(),
            pipelines: PlRwLock::new(HashMap::new()),
            used_ports: PlMutex::new(HashSet::new()),
            cross_camera_matcher,
            alarm_channels,
            writer_tx,
            index,
            writer_handle: PlMutex::new(Some(writer_handle)),
            monitor_stop: Arc::new(AtomicBool::new(false)),
        });

        for source in config.sources.iter().filter(|s| s.enabled).cloned() {
            let id = source.id.clone();
            if let Err(e) = manager.add_pipeline(source).await {
                warn!(camera = %id, error = %e, "failed to start configured pipeline at startup");
            }
        }

        let monitor = manager.clone();
        tokio::spawn(async move { monitor.monitor_loop().await });

        Ok(manager)
    }

    /// Polls every pipeline's frame-source state once a second; a pipeline
    /// whose source has given up reconnecting (§4.1 backoff exhausted) is
    /// removed, never auto-restarted (§4.9).
    async fn monitor_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            interval.tick().await;
            if self.monitor_stop.load(Ordering::Relaxed) {
                break;
            }
            let failed: Vec<String> = {
                let pipelines = self.pipelines.read();
                pipelines
                    .iter()
                    .filter(|(_, entry)| entry.pipeline.try_lock().map(|p| p.is_failed()).unwrap_or(false))
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in failed {
                warn!(camera = %id, "pipeline source failed, removing (no auto-restart)");
                if let Err(e) = self.remove_pipeline(&id).await {
                    warn!(camera = %id, error = %e, "failed to remove failed pipeline");
                }
            }
        }
    }

    fn reserve_port(&self) -> Result<u16> {
        let mut used = self.used_ports.lock();
        let (lo, hi) = self.config.mjpeg_port_range;
        for port in lo..=hi {
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(AnalyticsError::ResourceExhausted(format!("no free mjpeg ports left in range {lo}..={hi}")))
    }

    fn release_port(&self, port: u16) {
        self.used_ports.lock().remove(&port);
    }

    fn get_entry(&self, camera_id: &str) -> Result<Arc<AsyncMutex<VideoPipeline>>> {
        self.pipelines
            .read()
            .get(camera_id)
            .map(|e| e.pipeline.clone())
            .ok_or_else(|| AnalyticsError::PipelineNotFound { id: camera_id.to_string() })
    }

    /// Reserves a registry slot and an MJPEG port, does the slow
    /// `initialize()` work with no lock held, then commits the running
    /// pipeline into the registry. Any failure along the way releases the
    /// port back to the pool.
    pub async fn add_pipeline(&self, source: SourceConfig) -> Result<()> {
        {
            let pipelines = self.pipelines.read();
            if pipelines.contains_key(&source.id) {
                return Err(AnalyticsError::ConfigInvalid(format!("pipeline '{}' already exists", source.id)));
            }
            if pipelines.len() >= self.config.max_pipelines {
                return Err(AnalyticsError::ResourceExhausted(format!(
                    "max_pipelines ({}) reached",
                    self.config.max_pipelines
                )));
            }
        }

        let port = self.reserve_port()?;
        let camera_id = source.id.clone();

        let mut pipeline = match VideoPipeline::initialize(
            source,
            &self.config,
            port,
            self.cross_camera_matcher.clone(),
            self.writer_tx.clone(),
            self.alarm_channels.clone(),
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                self.release_port(port);
                return Err(e);
            }
        };
        pipeline.start();

        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&camera_id) {
            drop(pipelines);
            pipeline.stop().await;
            self.release_port(port);
            return Err(AnalyticsError::ConfigInvalid(format!("pipeline '{camera_id}' already exists")));
        }
        pipelines.insert(camera_id.clone(), PipelineEntry { pipeline: Arc::new(AsyncMutex::new(pipeline)), port });
        drop(pipelines);
        info!(camera = %camera_id, mjpeg_port = port, "pipeline added");
        Ok(())
    }

    /// Stops and removes a pipeline, releasing its MJPEG port.
    pub async fn remove_pipeline(&self, camera_id: &str) -> Result<()> {
        let entry = {
            let mut pipelines = self.pipelines.write();
            pipelines
                .remove(camera_id)
                .ok_or_else(|| AnalyticsError::PipelineNotFound { id: camera_id.to_string() })?
        };
        entry.pipeline.lock().await.stop().await;
        self.release_port(entry.port);
        info!(camera = %camera_id, "pipeline removed");
        Ok(())
    }

    pub fn list_pipelines(&self) -> Vec<String> {
        self.pipelines.read().keys().cloned().collect()
    }

    pub async fn health(&self, camera_id: &str) -> Result<PipelineHealth> {
        Ok(self.get_entry(camera_id)?.lock().await.health())
    }

    pub async fn add_roi(&self, camera_id: &str, roi: Roi) -> Result<()> {
        self.get_entry(camera_id)?.lock().await.add_roi(roi)
    }

    pub async fn remove_roi(&self, camera_id: &str, roi_id: &str) -> Result<bool> {
        Ok(self.get_entry(camera_id)?.lock().await.remove_roi(roi_id))
    }

    pub async fn list_rois(&self, camera_id: &str) -> Result<Vec<Roi>> {
        Ok(self.get_entry(camera_id)?.lock().await.list_rois())
    }

    pub async fn set_rule(&self, camera_id: &str, rule: BehaviorRule) -> Result<()> {
        self.get_entry(camera_id)?.lock().await.set_rule(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, camera_id: &str, rule_id: &str) -> Result<bool> {
        Ok(self.get_entry(camera_id)?.lock().await.remove_rule(rule_id))
    }

    pub async fn list_rules(&self, camera_id: &str) -> Result<Vec<BehaviorRule>> {
        Ok(self.get_entry(camera_id)?.lock().await.list_rules())
    }

    pub async fn update_stream_config(&self, camera_id: &str, config: StreamConfig) -> Result<()> {
        self.get_entry(camera_id)?.lock().await.update_stream_config(config);
        Ok(())
    }

    pub async fn mjpeg_subscribe(&self, camera_id: &str) -> Result<broadcast::Receiver<Arc<Vec<u8>>>> {
        Ok(self.get_entry(camera_id)?.lock().await.mjpeg_subscribe())
    }

    pub async fn last_frame(&self, camera_id: &str) -> Result<Option<bytes::Bytes>> {
        Ok(self.get_entry(camera_id)?.lock().await.last_frame())
    }

    pub async fn mjpeg_port(&self, camera_id: &str) -> Result<u16> {
        self.pipelines
            .read()
            .get(camera_id)
            .map(|e| e.port)
            .ok_or_else(|| AnalyticsError::PipelineNotFound { id: camera_id.to_string() })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops every pipeline and the writer task. Called once, on process
    /// shutdown.
    pub async fn shutdown(&self) {
        self.monitor_stop.store(true, Ordering::Relaxed);
        let ids: Vec<String> = self.pipelines.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.remove_pipeline(&id).await {
                warn!(camera = %id, error = %e, "error stopping pipeline during shutdown");
            }
        }
        if let Some(handle) = self.writer_handle.lock().take() {
            handle.abort();
        }
        info!("pipeline manager shut down");
    }
}
