//! ReID extractor and cross-camera matcher (C4). The extractor is gated on
//! crop size and produces a sentinel "invalid" embedding for anything
//! smaller; the matcher holds a process-wide table of `GlobalTrack`s under
//! a reader-writer lock, following the concurrency discipline the spec
//! allows as an alternative to a dedicated message-queue task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::detection::BBox;
use crate::frame::Frame;

pub const MIN_CROP_WIDTH: u32 = 32;
pub const MIN_CROP_HEIGHT: u32 = 64;
pub const EMBEDDING_DIM: usize = 128;

#[derive(Debug, Clone)]
pub struct ReIdEmbedding {
    pub values: Vec<f32>,
    pub l2_normalized: bool,
    pub local_id: u32,
    pub camera_id: String,
    pub timestamp_us: i64,
}

impl ReIdEmbedding {
    pub fn is_valid(&self) -> bool {
        self.values.iter().any(|v| *v != 0.0)
    }

    fn sentinel(local_id: u32, camera_id: impl Into<String>, timestamp_us: i64) -> Self {
        ReIdEmbedding {
            values: vec![0.0; EMBEDDING_DIM],
            l2_normalized: false,
            local_id,
            camera_id: camera_id.into(),
            timestamp_us,
        }
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

struct CacheEntry {
    embedding: ReIdEmbedding,
    inserted_at: Instant,
}

/// Extracts L2-normalized embeddings for person crops, caching by
/// `(camera, local_id, bbox-hash)` with a short TTL so stationary tracks
/// skip recomputation.
pub struct ReIdExtractor {
    cache: HashMap<(String, u32, u64), CacheEntry>,
    cache_ttl: Duration,
}

impl ReIdExtractor {
    pub fn new(cache_ttl: Duration) -> Self {
        ReIdExtractor {
            cache: HashMap::new(),
            cache_ttl,
        }
    }

    fn bbox_hash(bbox: &BBox) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        bbox.x.to_bits().hash(&mut h);
        bbox.y.to_bits().hash(&mut h);
        bbox.w.to_bits().hash(&mut h);
        bbox.h.to_bits().hash(&mut h);
        h.finish()
    }

    /// Returns a sentinel invalid embedding (all-zero) for crops smaller
    /// than [`MIN_CROP_WIDTH`]x[`MIN_CROP_HEIGHT`]; callers should drop
    /// those rather than hand them to the matcher.
    pub fn extract(&mut self, frame: &Frame, class_id: u32, local_id: u32, bbox: BBox) -> ReIdEmbedding {
        if class_id != 0 || bbox.w < MIN_CROP_WIDTH as f32 || bbox.h < MIN_CROP_HEIGHT as f32 {
            return ReIdEmbedding::sentinel(local_id, frame.camera_id.clone(), frame.timestamp_us);
        }

        let key = (frame.camera_id.clone(), local_id, Self::bbox_hash(&bbox));
        if let Some(entry) = self.cache.get(&key) {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                return entry.embedding.clone();
            }
        }

        let mut values = deterministic_embedding(&frame.camera_id, local_id, bbox);
        l2_normalize(&mut values);
        let embedding = ReIdEmbedding {
            values,
            l2_normalized: true,
            local_id,
            camera_id: frame.camera_id.clone(),
            timestamp_us: frame.timestamp_us,
        };
        self.cache.insert(
            key,
            CacheEntry {
                embedding: embedding.clone(),
                inserted_at: Instant::now(),
            },
        );
        embedding
    }
}

/// Placeholder appearance descriptor derived purely from bbox geometry and
/// identity; a production backend swaps this for a learned embedding model
/// without changing the matcher's interface.
fn deterministic_embedding(camera_id: &str, local_id: u32, bbox: BBox) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    let seed = camera_id.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64)) ^ local_id as u64;
    for (i, slot) in v.iter_mut().enumerate() {
        let mixed = seed.wrapping_mul(2654435761).wrapping_add(i as u64);
        *slot = ((mixed % 1000) as f32 / 1000.0) + bbox.area() * 1e-6;
    }
    v
}

#[derive(Debug, Clone)]
pub struct GlobalTrack {
    pub global_id: String,
    pub member_local_tracks: Vec<(String, u32)>,
    pub canonical_embedding: Vec<f32>,
    pub last_seen_ts: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    pub similarity_threshold: f32,
    pub ewma_alpha: f32,
    pub match_timeout: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            similarity_threshold: 0.7,
            ewma_alpha: 0.1,
            match_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide table of [`GlobalTrack`]s. Reads (similarity scans) and
/// writes (assignment, eviction) go through the same `RwLock`; writers are
/// serialized, readers proceed concurrently.
pub struct CrossCameraMatcher {
    config: MatcherConfig,
    tracks: RwLock<HashMap<String, GlobalTrack>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl CrossCameraMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        CrossCameraMatcher {
            config,
            tracks: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Matches or creates a global track for `embedding`, returning the
    /// assigned global id. Invalid (sentinel) embeddings are rejected by
    /// the caller before this is invoked.
    pub fn match_or_create(&self, camera_id: &str, local_id: u32, embedding: &ReIdEmbedding) -> String {
        self.evict_expired();

        let best = {
            let tracks = self.tracks.read();
            tracks
                .values()
                .map(|gt| (gt.global_id.clone(), cosine_similarity(&gt.canonical_embedding, &embedding.values)))
                .filter(|(_, sim)| *sim >= self.config.similarity_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        };

        let mut tracks = self.tracks.write();
        if let Some((global_id, _sim)) = best {
            if let Some(gt) = tracks.get_mut(&global_id) {
                for (i, v) in gt.canonical_embedding.iter_mut().enumerate() {
                    *v = (1.0 - self.config.ewma_alpha) * *v + self.config.ewma_alpha * embedding.values[i];
                }
                if !gt.member_local_tracks.contains(&(camera_id.to_string(), local_id)) {
                    gt.member_local_tracks.push((camera_id.to_string(), local_id));
                }
                gt.last_seen_ts = Instant::now();
                return global_id;
            }
        }

        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let global_id = format!("g{id}");
        tracks.insert(
            global_id.clone(),
            GlobalTrack {
                global_id: global_id.clone(),
                member_local_tracks: vec![(camera_id.to_string(), local_id)],
                canonical_embedding: embedding.values.clone(),
                last_seen_ts: Instant::now(),
            },
        );
        global_id
    }

    fn evict_expired(&self) {
        let timeout = self.config.match_timeout;
        let mut tracks = self.tracks.write();
        tracks.retain(|_, gt| gt.last_seen_ts.elapsed() < timeout);
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_is_one() {
        let v = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cross_camera_match_shares_global_id_above_threshold() {
        let matcher = CrossCameraMatcher::new(MatcherConfig {
            similarity_threshold: 0.7,
            ewma_alpha: 0.1,
            match_timeout: Duration::from_secs(30),
        });
        let mut e1 = vec![1.0, 0.0, 0.0];
        l2_normalize(&mut e1);
        let embedding1 = ReIdEmbedding {
            values: e1.clone(),
            l2_normalized: true,
            local_id: 7,
            camera_id: "cam1".into(),
            timestamp_us: 0,
        };
        let gid1 = matcher.match_or_create("cam1", 7, &embedding1);

        let mut e2 = vec![0.82, 0.18, 0.0];
        l2_normalize(&mut e2);
        let embedding2 = ReIdEmbedding {
            values: e2,
            l2_normalized: true,
            local_id: 9,
            camera_id: "cam2".into(),
            timestamp_us: 2_000_000,
        };
        let gid2 = matcher.match_or_create("cam2", 9, &embedding2);
        assert_eq!(gid1, gid2);
    }

    #[test]
    fn below_threshold_creates_new_global_track() {
        let matcher = CrossCameraMatcher::new(MatcherConfig::default());
        let e1 = vec![1.0, 0.0, 0.0];
        let e2 = vec![0.0, 1.0, 0.0];
        let gid1 = matcher.match_or_create(
            "cam1",
            1,
            &ReIdEmbedding { values: e1, l2_normalized: true, local_id: 1, camera_id: "cam1".into(), timestamp_us: 0 },
        );
        let gid2 = matcher.match_or_create(
            "cam2",
            2,
            &ReIdEmbedding { values: e2, l2_normalized: true, local_id: 2, camera_id: "cam2".into(), timestamp_us: 0 },
        );
        assert_ne!(gid1, gid2);
    }
}
