//! Two-tier snapshot cache: in-process L1 in front of an external KV L2.
//!
//! Hot-path target (L1 or L2 hit) is p99 ≤ 50 ms; the cold path has no SLO.

use crate::kv::KvStore;
use crate::schemas::StorySnapshot;
use crate::state::StoryStateManager;
use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Mutation-side hook: the state manager calls this after every write.
#[async_trait]
pub trait SnapshotInvalidator: Send + Sync {
    async fn invalidate(&self, player_id: Uuid);
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub l1_size: usize,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

struct CacheMetrics {
    hits: IntCounter,
    misses: IntCounter,
    get_latency: Histogram,
}

impl CacheMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let hits = IntCounter::new("story_snapshot_cache_hits_total", "Snapshot cache hits")?;
        let misses = IntCounter::new("story_snapshot_cache_misses_total", "Snapshot cache misses")?;
        let get_latency = Histogram::with_opts(
            HistogramOpts::new(
                "story_snapshot_get_seconds",
                "End-to-end snapshot get latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(get_latency.clone()))?;
        Ok(Self {
            hits,
            misses,
            get_latency,
        })
    }
}

pub struct SnapshotCache {
    manager: Arc<StoryStateManager>,
    l2: Arc<dyn KvStore>,
    ttl: Duration,
    key_prefix: String,
    l1: Mutex<LruCache<Uuid, (StorySnapshot, Instant)>>,
    metrics: CacheMetrics,
    /// Bounded reservoir of recent get latencies (seconds) for percentiles.
    latencies: Mutex<Vec<f64>>,
}

impl SnapshotCache {
    pub fn new(
        manager: Arc<StoryStateManager>,
        l2: Arc<dyn KvStore>,
        ttl: Duration,
        l1_max: usize,
        key_prefix: &str,
        registry: &Registry,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(l1_max.max(1)).expect("max(1) is non-zero");
        Ok(Self {
            manager,
            l2,
            ttl,
            key_prefix: key_prefix.to_string(),
            l1: Mutex::new(LruCache::new(capacity)),
            metrics: CacheMetrics::new(registry)?,
            latencies: Mutex::new(Vec::new()),
        })
    }

    fn l2_key(&self, player_id: Uuid) -> String {
        format!("{}{}", self.key_prefix, player_id)
    }

    /// Get a snapshot, consulting L1 then L2 then the state manager.
    ///
    /// `force_refresh` bypasses both tiers and repopulates them from the
    /// state manager. State-manager errors propagate without touching the
    /// caches; L2 errors are absorbed so the DB path still serves.
    pub async fn get(&self, player_id: Uuid, force_refresh: bool) -> Result<StorySnapshot> {
        let start = Instant::now();

        if !force_refresh {
            if let Some(snapshot) = self.l1_lookup(player_id) {
                self.record_hit(start);
                return Ok(snapshot);
            }

            match self.l2_lookup(player_id).await {
                Ok(Some(snapshot)) => {
                    self.l1_insert(player_id, snapshot.clone());
                    self.record_hit(start);
                    return Ok(snapshot);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Snapshot L2 read failed, falling through: {}", e),
            }
        }

        self.metrics.misses.inc();
        let snapshot = self.manager.get_snapshot(player_id).await?;

        if let Err(e) = self.l2_store(player_id, &snapshot).await {
            tracing::warn!("Snapshot L2 write failed: {}", e);
        }
        self.l1_insert(player_id, snapshot.clone());

        self.record_latency(start);
        Ok(snapshot)
    }

    /// Drop the player's snapshot from both tiers.
    pub async fn invalidate_player(&self, player_id: Uuid) {
        self.l1.lock().unwrap().pop(&player_id);
        if let Err(e) = self.l2.del(&self.l2_key(player_id)).await {
            tracing::warn!("Snapshot L2 delete failed for {}: {}", player_id, e);
        }
        tracing::debug!("Invalidated snapshot cache for {}", player_id);
    }

    /// Pre-warm both tiers for a set of players.
    pub async fn warm(&self, player_ids: Vec<Uuid>) -> usize {
        tracing::info!("Warming snapshot cache for {} players", player_ids.len());
        let fetches = player_ids.into_iter().map(|player_id| async move {
            self.get(player_id, true).await.is_ok()
        });
        let results = futures_util::future::join_all(fetches).await;
        let warmed = results.into_iter().filter(|ok| *ok).count();
        tracing::info!("Cache warmed: {} snapshots loaded", warmed);
        warmed
    }

    pub fn stats(&self) -> CacheStats {
        let hit_count = self.metrics.hits.get();
        let miss_count = self.metrics.misses.get();
        let total = hit_count + miss_count;
        let hit_rate = if total > 0 {
            hit_count as f64 / total as f64
        } else {
            0.0
        };

        let mut sorted = self.latencies.lock().unwrap().clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
            sorted[idx] * 1000.0
        };

        CacheStats {
            hit_count,
            miss_count,
            hit_rate,
            l1_size: self.l1.lock().unwrap().len(),
            latency_p50_ms: percentile(0.50),
            latency_p95_ms: percentile(0.95),
            latency_p99_ms: percentile(0.99),
        }
    }

    // ========================================================================
    // Tiers
    // ========================================================================

    fn l1_lookup(&self, player_id: Uuid) -> Option<StorySnapshot> {
        let mut l1 = self.l1.lock().unwrap();
        // peek, not get: reads must not reorder entries, so the LRU victim
        // stays the oldest insertion — the entry with the earliest expires_at
        // under a uniform TTL.
        match l1.peek(&player_id) {
            Some((snapshot, expires)) if *expires > Instant::now() => Some(snapshot.clone()),
            Some(_) => {
                l1.pop(&player_id);
                None
            }
            None => None,
        }
    }

    fn l1_insert(&self, player_id: Uuid, snapshot: StorySnapshot) {
        self.l1
            .lock()
            .unwrap()
            .push(player_id, (snapshot, Instant::now() + self.ttl));
    }

    async fn l2_lookup(&self, player_id: Uuid) -> Result<Option<StorySnapshot>> {
        match self.l2.get(&self.l2_key(player_id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            None => Ok(None),
        }
    }

    async fn l2_store(&self, player_id: Uuid, snapshot: &StorySnapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.l2.set_ex(&self.l2_key(player_id), bytes, self.ttl).await
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    fn record_hit(&self, start: Instant) {
        self.metrics.hits.inc();
        self.record_latency(start);
    }

    fn record_latency(&self, start: Instant) {
        let seconds = start.elapsed().as_secs_f64();
        self.metrics.get_latency.observe(seconds);
        let mut latencies = self.latencies.lock().unwrap();
        latencies.push(seconds);
        // Keep only recent measurements.
        if latencies.len() > 10_000 {
            let split_at = latencies.len() - 5_000;
            let tail = latencies.split_off(split_at);
            *latencies = tail;
        }
    }
}

#[async_trait]
impl SnapshotInvalidator for SnapshotCache {
    async fn invalidate(&self, player_id: Uuid) {
        self.invalidate_player(player_id).await;
    }
}
