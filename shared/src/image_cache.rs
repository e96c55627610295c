//! Two-tier image cache.
//!
//! The memory tier lives here: an LRU keyed by URI with a byte budget. The
//! disk tier belongs to the platform image pipeline; this module only decides
//! when to warm it (prefetch) and when to empty it (the daily sweep).

use bytes::Bytes;
use image::ImageFormat;
use lru::LruCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::capabilities::{
    ImagePipeline, ImagePipelineError, KeyNamespace, KeyValueStore, KvKey, TypedKvStore,
};
use crate::config::ImageCacheConfig;
use crate::error::CoreError;
use crate::UnixTimeMs;

const LAST_SWEEP_KEY: &str = "image_cache.last_cleanup";
const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "file"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageCacheError {
    #[error("invalid image uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("payload for {uri} is not a supported image")]
    NotAnImage { uri: String },

    #[error(transparent)]
    Pipeline(#[from] ImagePipelineError),
}

/// One image held in the memory tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub uri: String,
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub last_access: UnixTimeMs,
    pub size_bytes: usize,
}

#[derive(Debug, Default)]
pub struct ImageCacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub load_failures: AtomicU64,
    pub rejected_payloads: AtomicU64,
    /// Served but too large to keep in memory.
    pub oversized: AtomicU64,
    pub memory_evictions: AtomicU64,
    pub prefetch_batches: AtomicU64,
    pub prefetch_batch_failures: AtomicU64,
    pub disk_sweeps: AtomicU64,
}

impl ImageCacheMetrics {
    pub fn snapshot(&self) -> ImageCacheMetricsSnapshot {
        ImageCacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            rejected_payloads: self.rejected_payloads.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            memory_evictions: self.memory_evictions.load(Ordering::Relaxed),
            prefetch_batches: self.prefetch_batches.load(Ordering::Relaxed),
            prefetch_batch_failures: self.prefetch_batch_failures.load(Ordering::Relaxed),
            disk_sweeps: self.disk_sweeps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageCacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub load_failures: u64,
    pub rejected_payloads: u64,
    pub oversized: u64,
    pub memory_evictions: u64,
    pub prefetch_batches: u64,
    pub prefetch_batch_failures: u64,
    pub disk_sweeps: u64,
}

struct MemoryTier {
    entries: LruCache<String, CacheEntry>,
    used_bytes: usize,
}

impl MemoryTier {
    /// Inserts and evicts least-recently-accessed entries until `budget` holds.
    /// Returns the number evicted.
    fn insert(&mut self, entry: CacheEntry, budget: usize) -> u64 {
        self.used_bytes += entry.size_bytes;
        if let Some(old) = self.entries.put(entry.uri.clone(), entry) {
            self.used_bytes -= old.size_bytes;
        }

        let mut evicted = 0;
        while self.used_bytes > budget {
            let Some((uri, old)) = self.entries.pop_lru() else {
                break;
            };
            self.used_bytes -= old.size_bytes;
            evicted += 1;
            debug!(%uri, size = old.size_bytes, "evicted from memory tier");
        }
        evicted
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.used_bytes = 0;
        count
    }
}

pub struct ImageCache {
    pipeline: Arc<dyn ImagePipeline>,
    store: Arc<dyn KeyValueStore>,
    config: ImageCacheConfig,
    memory: Mutex<MemoryTier>,
    last_sweep: TypedKvStore<UnixTimeMs>,
    metrics: Arc<ImageCacheMetrics>,
}

impl ImageCache {
    pub fn new(
        pipeline: Arc<dyn ImagePipeline>,
        store: Arc<dyn KeyValueStore>,
        config: ImageCacheConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let key = KvKey::new(KeyNamespace::Settings, LAST_SWEEP_KEY)?;
        Ok(Self {
            pipeline,
            store,
            config,
            memory: Mutex::new(MemoryTier {
                entries: LruCache::unbounded(),
                used_bytes: 0,
            }),
            last_sweep: TypedKvStore::new(key),
            metrics: Arc::new(ImageCacheMetrics::default()),
        })
    }

    pub fn metrics(&self) -> ImageCacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Bytes currently held by the memory tier.
    pub async fn memory_usage(&self) -> usize {
        self.memory.lock().await.used_bytes
    }

    pub async fn memory_entries(&self) -> usize {
        self.memory.lock().await.entries.len()
    }

    /// Checks the memory tier without touching recency.
    pub async fn contains_in_memory(&self, uri: &str) -> bool {
        self.memory.lock().await.entries.contains(uri)
    }

    /// The memory-tier entry for `uri`, without touching recency.
    pub async fn peek(&self, uri: &str) -> Option<CacheEntry> {
        self.memory.lock().await.entries.peek(uri).cloned()
    }

    /// Reads through the memory tier to the platform pipeline.
    #[instrument(skip(self))]
    pub async fn get(&self, uri: &str) -> Result<Bytes, ImageCacheError> {
        validate_uri(uri)?;

        {
            let mut memory = self.memory.lock().await;
            if let Some(entry) = memory.entries.get_mut(uri) {
                entry.last_access = UnixTimeMs::now();
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                debug!("memory hit");
                return Ok(entry.bytes.clone());
            }
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        debug!("memory miss");

        let bytes = self.pipeline.load(uri).await.map_err(|e| {
            self.metrics.load_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "image load failed");
            e
        })?;

        let Ok(format) = image::guess_format(&bytes) else {
            self.metrics.rejected_payloads.fetch_add(1, Ordering::Relaxed);
            warn!(size = bytes.len(), "payload is not a recognised image");
            return Err(ImageCacheError::NotAnImage {
                uri: uri.to_string(),
            });
        };

        let size_bytes = bytes.len();
        if size_bytes > self.config.max_entry_bytes {
            self.metrics.oversized.fetch_add(1, Ordering::Relaxed);
            debug!(size_bytes, "image too large for memory tier, serving uncached");
            return Ok(bytes);
        }

        let entry = CacheEntry {
            uri: uri.to_string(),
            bytes: bytes.clone(),
            format,
            last_access: UnixTimeMs::now(),
            size_bytes,
        };
        let evicted = self
            .memory
            .lock()
            .await
            .insert(entry, self.config.memory_budget_bytes);
        if evicted > 0 {
            self.metrics.memory_evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        Ok(bytes)
    }

    /// Warms the disk tier in the background, in batches.
    ///
    /// Invalid URIs are skipped. Batch failures are logged and counted, never
    /// returned. Returns `None` when there is nothing to fetch.
    pub fn prefetch(&self, uris: Vec<String>) -> Option<JoinHandle<()>> {
        let mut valid: Vec<String> = Vec::with_capacity(uris.len());
        for uri in uris {
            if let Err(e) = validate_uri(&uri) {
                warn!(error = %e, "skipping prefetch of invalid uri");
            } else if !valid.contains(&uri) {
                valid.push(uri);
            }
        }
        if valid.is_empty() {
            return None;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let metrics = Arc::clone(&self.metrics);
        let batch_size = self.config.prefetch_batch_size;
        info!(count = valid.len(), batch_size, "prefetching images");

        Some(tokio::spawn(async move {
            for (index, batch) in valid.chunks(batch_size).enumerate() {
                metrics.prefetch_batches.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = pipeline.prefetch(batch).await {
                    metrics.prefetch_batch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(batch = index, size = batch.len(), error = %e, "prefetch batch failed");
                }
            }
        }))
    }

    /// Empties the memory tier. Runs on every app-background transition.
    #[instrument(skip(self))]
    pub async fn clear_memory(&self) {
        let cleared = self.memory.lock().await.clear();
        if let Err(e) = self.pipeline.evict_memory().await {
            warn!(error = %e, "platform memory eviction failed");
        }
        info!(cleared, "memory tier cleared");
    }

    /// Empties the disk tier now and records the time, which also resets
    /// the daily sweep window.
    #[instrument(skip(self))]
    pub async fn clear_disk(&self) -> Result<(), ImageCacheError> {
        self.sweep(UnixTimeMs::now()).await
    }

    /// Runs the disk sweep if the last one is at least one interval old, or
    /// recorded in the future. Returns whether a sweep ran.
    #[instrument(skip(self))]
    pub async fn maybe_sweep_disk(&self, now: UnixTimeMs) -> bool {
        let last = match self.last_sweep.load(self.store.as_ref()).await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "could not read last sweep time, sweeping");
                None
            }
        };

        match last {
            Some(last) if now < last => {
                warn!(
                    last = last.as_millis(),
                    now = now.as_millis(),
                    "clock is behind the last disk sweep, sweeping"
                );
            }
            Some(last) => {
                let elapsed = now.saturating_sub(last);
                if elapsed < self.config.disk_sweep_interval_ms {
                    debug!(elapsed, "disk sweep not due");
                    return false;
                }
            }
            None => {}
        }

        match self.sweep(now).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "disk sweep failed");
                false
            }
        }
    }

    async fn sweep(&self, now: UnixTimeMs) -> Result<(), ImageCacheError> {
        self.pipeline.evict_disk().await?;
        self.metrics.disk_sweeps.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.last_sweep.save(self.store.as_ref(), &now).await {
            warn!(error = %e, "could not record disk sweep time");
        }
        info!(at = now.as_millis(), "disk tier swept");
        Ok(())
    }
}

fn validate_uri(uri: &str) -> Result<(), ImageCacheError> {
    let invalid = |reason: String| ImageCacheError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };
    let parsed = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn png(size: usize) -> Bytes {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.resize(size.max(8), 0);
        Bytes::from(data)
    }

    #[derive(Default)]
    struct FakePipeline {
        images: std::sync::Mutex<HashMap<String, Bytes>>,
        loads: AtomicUsize,
        disk_evictions: AtomicUsize,
        prefetched: std::sync::Mutex<Vec<Vec<String>>>,
        fail_prefetch: AtomicBool,
        fail_evict: AtomicBool,
    }

    impl FakePipeline {
        fn with(images: &[(&str, Bytes)]) -> Arc<Self> {
            let pipeline = Self::default();
            {
                let mut map = pipeline.images.lock().unwrap();
                for (uri, bytes) in images {
                    map.insert((*uri).to_string(), bytes.clone());
                }
            }
            Arc::new(pipeline)
        }
    }

    #[async_trait]
    impl ImagePipeline for FakePipeline {
        async fn load(&self, uri: &str) -> Result<Bytes, ImagePipelineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.images
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .ok_or_else(|| ImagePipelineError::NotFound {
                    uri: uri.to_string(),
                })
        }

        async fn prefetch(&self, uris: &[String]) -> Result<(), ImagePipelineError> {
            self.prefetched.lock().unwrap().push(uris.to_vec());
            if self.fail_prefetch.load(Ordering::SeqCst) {
                return Err(ImagePipelineError::Network("offline".into()));
            }
            Ok(())
        }

        async fn evict_disk(&self) -> Result<(), ImagePipelineError> {
            if self.fail_evict.load(Ordering::SeqCst) {
                return Err(ImagePipelineError::Io("read-only".into()));
            }
            self.disk_evictions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn cache(pipeline: Arc<FakePipeline>, config: ImageCacheConfig) -> ImageCache {
        ImageCache::new(pipeline, Arc::new(MemoryKvStore::new()), config).unwrap()
    }

    fn small_budget() -> ImageCacheConfig {
        ImageCacheConfig {
            memory_budget_bytes: 100,
            max_entry_bytes: 60,
            ..ImageCacheConfig::default()
        }
    }

    #[tokio::test]
    async fn second_get_is_served_from_memory() {
        let pipeline = FakePipeline::with(&[("https://img.test/a.png", png(32))]);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());

        let first = cache.get("https://img.test/a.png").await.unwrap();
        let second = cache.get("https://img.test/a.png").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(pipeline.loads.load(Ordering::SeqCst), 1);
        let metrics = cache.metrics();
        assert_eq!((metrics.hits, metrics.misses), (1, 1));
        assert_eq!(cache.memory_usage().await, 32);
        assert_eq!(
            cache.peek("https://img.test/a.png").await.unwrap().format,
            ImageFormat::Png
        );
    }

    #[tokio::test]
    async fn invalid_uris_never_reach_the_pipeline() {
        let pipeline = FakePipeline::with(&[]);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());

        for uri in ["not a uri", "ftp://img.test/a.png", ""] {
            assert!(matches!(
                cache.get(uri).await,
                Err(ImageCacheError::InvalidUri { .. })
            ));
        }
        assert_eq!(pipeline.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_image_payloads_are_rejected() {
        let pipeline =
            FakePipeline::with(&[("https://img.test/page", Bytes::from_static(b"<html></html>"))]);
        let cache = cache(pipeline, ImageCacheConfig::default());

        assert!(matches!(
            cache.get("https://img.test/page").await,
            Err(ImageCacheError::NotAnImage { .. })
        ));
        assert!(!cache.contains_in_memory("https://img.test/page").await);
        assert_eq!(cache.metrics().rejected_payloads, 1);
    }

    #[tokio::test]
    async fn missing_image_surfaces_pipeline_error() {
        let cache = cache(FakePipeline::with(&[]), ImageCacheConfig::default());
        assert!(matches!(
            cache.get("https://img.test/none.png").await,
            Err(ImageCacheError::Pipeline(ImagePipelineError::NotFound { .. }))
        ));
        assert_eq!(cache.metrics().load_failures, 1);
    }

    #[tokio::test]
    async fn memory_tier_evicts_least_recently_used() {
        let pipeline = FakePipeline::with(&[
            ("https://img.test/a.png", png(40)),
            ("https://img.test/b.png", png(40)),
            ("https://img.test/c.png", png(40)),
        ]);
        let cache = cache(pipeline, small_budget());

        cache.get("https://img.test/a.png").await.unwrap();
        cache.get("https://img.test/b.png").await.unwrap();
        cache.get("https://img.test/a.png").await.unwrap();
        cache.get("https://img.test/c.png").await.unwrap();

        assert!(cache.contains_in_memory("https://img.test/a.png").await);
        assert!(!cache.contains_in_memory("https://img.test/b.png").await);
        assert!(cache.contains_in_memory("https://img.test/c.png").await);
        assert_eq!(cache.memory_usage().await, 80);
        assert_eq!(cache.metrics().memory_evictions, 1);
    }

    #[tokio::test]
    async fn oversized_images_are_served_but_not_retained() {
        let pipeline = FakePipeline::with(&[("https://img.test/big.png", png(80))]);
        let cache = cache(pipeline, small_budget());

        let bytes = cache.get("https://img.test/big.png").await.unwrap();
        assert_eq!(bytes.len(), 80);
        assert_eq!(cache.memory_entries().await, 0);
        assert_eq!(cache.metrics().oversized, 1);
    }

    #[tokio::test]
    async fn clear_memory_empties_the_tier() {
        let pipeline = FakePipeline::with(&[("https://img.test/a.png", png(10))]);
        let cache = cache(pipeline, ImageCacheConfig::default());
        cache.get("https://img.test/a.png").await.unwrap();

        cache.clear_memory().await;
        assert_eq!(cache.memory_usage().await, 0);
        assert!(!cache.contains_in_memory("https://img.test/a.png").await);
    }

    #[tokio::test]
    async fn prefetch_of_nothing_is_noop() {
        let pipeline = FakePipeline::with(&[]);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());

        assert!(cache.prefetch(vec![]).is_none());
        assert!(cache.prefetch(vec!["bogus".into()]).is_none());
        assert!(pipeline.prefetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prefetch_runs_in_batches() {
        let pipeline = FakePipeline::with(&[]);
        let config = ImageCacheConfig {
            prefetch_batch_size: 2,
            ..ImageCacheConfig::default()
        };
        let cache = cache(pipeline.clone(), config);

        let uris: Vec<String> = (0..5).map(|i| format!("https://img.test/{i}.png")).collect();
        cache.prefetch(uris).unwrap().await.unwrap();

        let batches = pipeline.prefetched.lock().unwrap().clone();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(cache.metrics().prefetch_batches, 3);
    }

    #[tokio::test]
    async fn prefetch_failures_are_contained() {
        let pipeline = FakePipeline::with(&[]);
        pipeline.fail_prefetch.store(true, Ordering::SeqCst);
        let config = ImageCacheConfig {
            prefetch_batch_size: 1,
            ..ImageCacheConfig::default()
        };
        let cache = cache(pipeline.clone(), config);

        let uris = vec![
            "https://img.test/a.png".to_string(),
            "https://img.test/b.png".to_string(),
        ];
        cache.prefetch(uris).unwrap().await.unwrap();

        assert_eq!(pipeline.prefetched.lock().unwrap().len(), 2);
        assert_eq!(cache.metrics().prefetch_batch_failures, 2);
    }

    #[tokio::test]
    async fn disk_sweep_runs_at_most_daily() {
        let pipeline = FakePipeline::with(&[]);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());
        let start = UnixTimeMs(10 * DAY_MS);

        assert!(cache.maybe_sweep_disk(start).await);
        assert!(!cache.maybe_sweep_disk(UnixTimeMs(start.0 + DAY_MS - 1)).await);
        assert!(cache.maybe_sweep_disk(UnixTimeMs(start.0 + DAY_MS)).await);
        assert_eq!(pipeline.disk_evictions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clock_moving_backwards_sweeps_and_rerecords() {
        let pipeline = FakePipeline::with(&[]);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());
        let start = UnixTimeMs(10 * DAY_MS);

        assert!(cache.maybe_sweep_disk(start).await);
        let earlier = UnixTimeMs(start.0 - 1000);
        assert!(cache.maybe_sweep_disk(earlier).await);
        assert!(!cache.maybe_sweep_disk(UnixTimeMs(earlier.0 + 1)).await);
        assert_eq!(pipeline.disk_evictions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweep_time_survives_restart() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let pipeline = FakePipeline::with(&[]);
        let now = UnixTimeMs(10 * DAY_MS);

        let first = ImageCache::new(pipeline.clone(), Arc::clone(&store), ImageCacheConfig::default())
            .unwrap();
        assert!(first.maybe_sweep_disk(now).await);

        let second =
            ImageCache::new(pipeline, store, ImageCacheConfig::default()).unwrap();
        assert!(!second.maybe_sweep_disk(UnixTimeMs(now.0 + 1000)).await);
    }

    #[tokio::test]
    async fn manual_clear_resets_the_window() {
        let pipeline = FakePipeline::with(&[]);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());

        cache.clear_disk().await.unwrap();
        assert!(!cache.maybe_sweep_disk(UnixTimeMs::now()).await);
        assert_eq!(pipeline.disk_evictions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_sweep_is_retried_next_time() {
        let pipeline = FakePipeline::with(&[]);
        pipeline.fail_evict.store(true, Ordering::SeqCst);
        let cache = cache(pipeline.clone(), ImageCacheConfig::default());
        let now = UnixTimeMs(10 * DAY_MS);

        assert!(!cache.maybe_sweep_disk(now).await);
        assert!(cache.clear_disk().await.is_err());

        pipeline.fail_evict.store(false, Ordering::SeqCst);
        assert!(cache.maybe_sweep_disk(UnixTimeMs(now.0 + 1)).await);
    }
}
