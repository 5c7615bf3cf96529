//! Preload cache - URL -> warm audio resource
//!
//! The cache is the SINGLE OWNER of warm resources. Warm instances only fetch
//! bytes; anything that plays gets a fork (`Playable`), so seeking or volume
//! changes never leak back into the cache.
//!
//! - Check-and-register of an in-flight load happens under one lock, before
//!   any await, so concurrent `preload` calls share one fetch.
//! - `preload` settles on can-play-through or after the configured timeout,
//!   whichever comes first. A timeout is not an error; loading continues.
//! - Failed loads are dropped from the cache so the next request retries.
//! - Entries are evicted least-recently-used first once the count cap is
//!   exceeded. Entries still loading are kept until they have stalled for
//!   several preload timeouts.
//! - Read-ahead paths only warm entries; nothing is forked unless a caller
//!   wants to play.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::resource::{
    AudioBackend, AudioResource, LoadState, Playable, ResourceEvent, ResourceEventReceiver,
    ShadowResource,
};
use crate::error::{MediaErrorKind, PlaybackError, Result};
use crate::settings::PreloadSettings;

/// Reject URLs that can never be fetched
pub(crate) fn check_url(url: &str) -> Result<()> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(PlaybackError::InvalidUrl(url.to_string()));
    }
    match reqwest::Url::parse(trimmed) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https" | "file") => Ok(()),
        _ => Err(PlaybackError::InvalidUrl(url.to_string())),
    }
}

/// A load this many preload timeouts old counts as stalled
const STALL_FACTOR: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Loading,
    Ready,
    Failed(MediaErrorKind),
}

struct CacheEntry {
    id: u64,
    resource: Arc<dyn AudioResource>,
    status: watch::Receiver<EntryStatus>,
    watcher: JoinHandle<()>,
    started: Instant,
}

impl CacheEntry {
    fn is_loading(&self) -> bool {
        *self.status.borrow() == EntryStatus::Loading
    }

    fn is_evictable(&self, stall_after: std::time::Duration) -> bool {
        !self.is_loading() || self.started.elapsed() >= stall_after
    }

    fn discard(self) {
        self.watcher.abort();
        self.resource.release();
    }
}

struct CacheInner {
    backend: Arc<dyn AudioBackend>,
    settings: PreloadSettings,
    entries: Mutex<IndexMap<String, CacheEntry>>,
    next_id: AtomicU64,
}

/// Shared preload cache, cheap to clone
#[derive(Clone)]
pub struct PreloadCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for PreloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreloadCache")
            .field("entries", &self.len())
            .field("capacity", &self.inner.settings.cache_capacity)
            .finish()
    }
}

impl PreloadCache {
    pub fn new(backend: Arc<dyn AudioBackend>, settings: PreloadSettings) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                settings,
                entries: Mutex::new(IndexMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &PreloadSettings {
        &self.inner.settings
    }

    /// Load `url` once and return a playable instance of it.
    ///
    /// Concurrent and repeated calls share the same fetch. Resolves when the
    /// resource can play through, or after the preload timeout with a
    /// partially loaded instance.
    pub async fn preload(&self, url: &str) -> Result<Playable> {
        let resource = self.settle(url).await?;
        Ok(Playable::new(resource.fork()))
    }

    /// Like `preload`, but only warms the cache
    async fn warm(&self, url: &str) -> Result<()> {
        self.settle(url).await.map(|_| ())
    }

    async fn settle(&self, url: &str) -> Result<Arc<dyn AudioResource>> {
        check_url(url)?;
        let (resource, mut status) = self.inner.acquire(url);

        let settled = tokio::time::timeout(self.inner.settings.timeout(), async {
            status
                .wait_for(|s| *s != EntryStatus::Loading)
                .await
                .map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(EntryStatus::Failed(kind))) => Err(PlaybackError::Media(kind)),
            Ok(Ok(_)) => Ok(resource),
            // Entry was cleared or evicted while we waited
            Ok(Err(_)) => Err(PlaybackError::Media(MediaErrorKind::Aborted)),
            Err(_) => {
                debug!("Preload of {} still loading after timeout, continuing in background", url);
                Ok(resource)
            }
        }
    }

    /// Synchronous lookup.
    ///
    /// On a hit returns a fresh playable instance. On a miss starts a
    /// background preload and returns `None`.
    pub fn get(&self, url: &str) -> Option<Playable> {
        if let Some(resource) = self.inner.touch(url) {
            return Some(Playable::new(resource.fork()));
        }

        if check_url(url).is_err() {
            return None;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let cache = self.clone();
                let url = url.to_string();
                runtime.spawn(async move {
                    if let Err(e) = cache.warm(&url).await {
                        warn!("Background preload of {} failed: {}", url, e);
                    }
                });
            }
            Err(_) => warn!("No runtime for background preload of {}", url),
        }
        None
    }

    /// Muted analysis-only instance of a cached URL
    pub fn shadow(&self, url: &str) -> Option<ShadowResource> {
        self.inner
            .touch(url)
            .map(|resource| ShadowResource::new(resource.fork()))
    }

    /// Preload `urls` in fixed-size batches, each batch settling before the next starts
    pub fn preload_batch(&self, urls: Vec<String>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move { cache.run_batches(&urls).await })
    }

    /// Preload `current_key` first, then the entries that follow it in `ordered`.
    ///
    /// Returns `None` when `current_key` is not in the map.
    pub fn preload_proximity(
        &self,
        current_key: &str,
        ordered: &IndexMap<String, String>,
    ) -> Option<JoinHandle<()>> {
        let Some(index) = ordered.get_index_of(current_key) else {
            warn!("Proximity preload: {} not found in {} entries", current_key, ordered.len());
            return None;
        };

        let window = self.inner.settings.proximity_window;
        let mut urls = ordered.values().skip(index).take(window + 1).cloned();
        let current = urls.next()?;
        let ahead: Vec<String> = urls.collect();

        debug!(
            "Proximity preload around {}: current + {} ahead",
            current_key,
            ahead.len()
        );

        let cache = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = cache.warm(&current).await {
                warn!("Proximity preload of current {} failed: {}", current, e);
            }
            cache.run_batches(&ahead).await;
        }))
    }

    /// Release every cached resource and empty the cache
    pub fn clear(&self) {
        let drained: Vec<_> = self.inner.entries.lock().drain(..).collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.discard();
        }
        info!("Preload cache cleared ({} entries)", count);
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner.entries.lock().contains_key(url)
    }

    /// Load state of the warm instance for `url`
    pub fn load_state(&self, url: &str) -> Option<LoadState> {
        self.inner
            .entries
            .lock()
            .get(url)
            .map(|e| e.resource.load_state())
    }

    async fn run_batches(&self, urls: &[String]) {
        let batch_size = self.inner.settings.batch_size.max(1);
        for batch in urls.chunks(batch_size) {
            let results = join_all(batch.iter().map(|url| self.warm(url))).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                debug!("Preload batch settled with {}/{} failures", failed, batch.len());
            }
        }
    }
}

impl CacheInner {
    /// Return the entry for `url`, registering and starting a new load on a miss
    fn acquire(
        self: &Arc<Self>,
        url: &str,
    ) -> (Arc<dyn AudioResource>, watch::Receiver<EntryStatus>) {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.shift_remove(url) {
            let found = (entry.resource.clone(), entry.status.clone());
            entries.insert(url.to_string(), entry);
            debug!("Preload cache hit: {}", url);
            return found;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resource = self.backend.create(url);
        let events = resource.subscribe();
        let (status_tx, status_rx) = watch::channel(EntryStatus::Loading);
        let watcher = tokio::spawn(watch_entry(
            Arc::downgrade(self),
            url.to_string(),
            id,
            events,
            status_tx,
        ));
        resource.load();
        debug!("Preload started: {}", url);

        entries.insert(
            url.to_string(),
            CacheEntry {
                id,
                resource: resource.clone(),
                status: status_rx.clone(),
                watcher,
                started: Instant::now(),
            },
        );
        self.evict_over_capacity(&mut entries);

        (resource, status_rx)
    }

    /// Mark `url` as most recently used and return its warm resource
    fn touch(&self, url: &str) -> Option<Arc<dyn AudioResource>> {
        let mut entries = self.entries.lock();
        let entry = entries.shift_remove(url)?;
        let resource = entry.resource.clone();
        entries.insert(url.to_string(), entry);
        Some(resource)
    }

    fn evict_over_capacity(&self, entries: &mut IndexMap<String, CacheEntry>) {
        let capacity = self.settings.cache_capacity.max(1);
        let stall_after = self.settings.timeout() * STALL_FACTOR;
        while entries.len() > capacity {
            let Some(index) = entries.values().position(|e| e.is_evictable(stall_after)) else {
                break;
            };
            if let Some((url, entry)) = entries.shift_remove_index(index) {
                if entry.is_loading() {
                    warn!("Preload cache evicted stalled load {}", url);
                } else {
                    debug!("Preload cache evicted {}", url);
                }
                entry.discard();
            }
        }
    }

    /// Drop a failed entry unless it has already been replaced
    fn forget(&self, url: &str, id: u64) {
        let mut entries = self.entries.lock();
        if entries.get(url).map(|e| e.id) == Some(id) {
            if let Some(entry) = entries.shift_remove(url) {
                entry.resource.release();
            }
        }
    }
}

async fn watch_entry(
    cache: Weak<CacheInner>,
    url: String,
    id: u64,
    mut events: ResourceEventReceiver,
    status: watch::Sender<EntryStatus>,
) {
    loop {
        match events.recv().await {
            Ok(ResourceEvent::CanPlayThrough) => {
                debug!("Preload ready: {}", url);
                status.send_replace(EntryStatus::Ready);
            }
            Ok(ResourceEvent::Error(kind)) => {
                warn!("Preload of {} failed: {}", url, kind);
                status.send_replace(EntryStatus::Failed(kind));
                if let Some(cache) = cache.upgrade() {
                    cache.forget(&url, id);
                }
                return;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!("Preload watcher for {} skipped {} events", url, skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}
