//! Per-buffer render cache and request orchestration
//!
//! [`RenderCache`] remembers every envelope ever requested per buffer, keyed
//! by width, and resolves a new request in this order:
//!
//! 1. exact width already cached (possibly still computing): share it;
//! 2. any cached width inside the request's tolerance bounds: share it;
//! 3. smallest cached width above the target: reduce from it instead of
//!    re-scanning raw samples;
//! 4. fresh decimation from the raw channels.
//!
//! For cases 3 and 4 an unresolved entry is registered under the cache lock
//! before the first suspension point, so a concurrent request for the same
//! (buffer, width) lands on case 1 and the engine runs at most once per key.
//!
//! Entries are never removed individually and there is no eviction;
//! [`RenderCache::invalidate`] drops a buffer's whole map when the caller
//! discards that buffer. A request that fails reports the error to its own
//! caller and leaves the entry pending; anyone else waiting on that entry
//! never settles, and recovery means asking for a different width or
//! invalidating the buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::compute::{ComputePath, SyncCompute, WorkerCompute};
use crate::error::RenderResult;
use crate::pool::WorkerPool;
use crate::types::{BufferId, RenderData, RenderRequest, Sample};

/// Settlement slot shared between a computing request and its waiters.
type Slot = Option<Arc<RenderData>>;

struct CacheEntry {
    rx: watch::Receiver<Slot>,
    resolved: bool,
    /// Distinguishes this entry from a successor created after an
    /// invalidate, so a stale settlement cannot flip the wrong flag
    generation: u64,
}

enum Plan {
    /// Share a cached entry (cases 1-2)
    Wait(watch::Receiver<Slot>),
    /// Reduce from a larger cached envelope (case 3)
    Reduce {
        ancestor_width: usize,
        ancestor: watch::Receiver<Slot>,
        publish: watch::Sender<Slot>,
        generation: u64,
    },
    /// Decimate from raw channels (case 4)
    Fresh {
        publish: watch::Sender<Slot>,
        generation: u64,
    },
}

/// Cache of decimated envelopes with synchronous and worker-backed request
/// paths.
///
/// One instance is meant to be owned by whichever component manages audio
/// sessions and shared by reference with every waveform consumer.
pub struct RenderCache {
    buffers: Mutex<HashMap<BufferId, HashMap<usize, CacheEntry>>>,
    generations: AtomicU64,
    sync_path: SyncCompute,
    worker_path: WorkerCompute,
}

impl RenderCache {
    /// Create a cache backed by one worker per available hardware thread.
    pub fn new() -> Self {
        Self::with_pool(Arc::new(WorkerPool::with_hardware_concurrency()))
    }

    /// Create a cache backed by an existing worker pool.
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        RenderCache {
            buffers: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            sync_path: SyncCompute,
            worker_path: WorkerCompute::new(pool),
        }
    }

    /// Request an envelope, offloading any computation to the worker pool.
    pub async fn render(
        &self,
        buffer: BufferId,
        channels: &[Vec<Sample>],
        request: RenderRequest,
    ) -> RenderResult<Arc<RenderData>> {
        self.request(&self.worker_path, buffer, channels, request)
            .await
    }

    /// Request an envelope, computing inline on the calling task on a miss.
    pub async fn render_sync(
        &self,
        buffer: BufferId,
        channels: &[Vec<Sample>],
        request: RenderRequest,
    ) -> RenderResult<Arc<RenderData>> {
        self.request(&self.sync_path, buffer, channels, request).await
    }

    /// Drop every cached width for a buffer.
    ///
    /// In-flight computations are not cancelled; a result that lands after
    /// invalidation still reaches its waiters but is not cached.
    pub fn invalidate(&self, buffer: BufferId) {
        if self.buffers.lock().unwrap().remove(&buffer).is_some() {
            log::debug!("invalidated render cache for {:?}", buffer);
        }
    }

    pub(crate) async fn request<P: ComputePath>(
        &self,
        path: &P,
        buffer: BufferId,
        channels: &[Vec<Sample>],
        request: RenderRequest,
    ) -> RenderResult<Arc<RenderData>> {
        match self.plan(buffer, &request, path.requires_resolved_ancestor()) {
            Plan::Wait(rx) => Ok(wait_for_settlement(rx).await),
            Plan::Reduce {
                ancestor_width,
                ancestor,
                publish,
                generation,
            } => {
                log::debug!(
                    "reducing {:?} width {} from cached width {}",
                    buffer,
                    request.render_width,
                    ancestor_width
                );
                let input = wait_for_settlement(ancestor).await;
                let data = path.from_render_data(&input, request.render_width).await?;
                Ok(self.settle(buffer, request.render_width, generation, publish, data))
            }
            Plan::Fresh {
                publish,
                generation,
            } => {
                log::debug!(
                    "decimating {:?} width {} from raw channels",
                    buffer,
                    request.render_width
                );
                let data = path.from_channels(channels, request.render_width).await?;
                Ok(self.settle(buffer, request.render_width, generation, publish, data))
            }
        }
    }

    /// Decide how to serve a request and pre-register the entry for a miss.
    ///
    /// Runs entirely under the cache lock; no suspension happens before the
    /// new entry is visible to concurrent requests.
    fn plan(&self, buffer: BufferId, request: &RenderRequest, require_resolved: bool) -> Plan {
        let mut buffers = self.buffers.lock().unwrap();
        let entries = buffers.entry(buffer).or_default();

        // Exact match
        if let Some(entry) = entries.get(&request.render_width) {
            log::debug!("cache hit for {:?} width {}", buffer, request.render_width);
            return Plan::Wait(entry.rx.clone());
        }

        // Close-enough match inside the tolerance bounds
        let close_enough = entries
            .iter()
            .find(|(width, _)| **width >= request.min_width && **width <= request.max_width);
        if let Some((width, entry)) = close_enough {
            log::debug!(
                "cache hit for {:?} width {} within [{}, {}]",
                buffer,
                width,
                request.min_width,
                request.max_width
            );
            return Plan::Wait(entry.rx.clone());
        }

        // Smallest cached width above the target; worker-backed paths skip
        // entries still computing (see compute module docs)
        let mut ancestor: Option<(usize, watch::Receiver<Slot>)> = None;
        for (&width, entry) in entries.iter() {
            if width <= request.render_width {
                continue;
            }
            if require_resolved && !entry.resolved {
                continue;
            }
            if ancestor.as_ref().is_none_or(|(best, _)| width < *best) {
                ancestor = Some((width, entry.rx.clone()));
            }
        }

        let (publish, rx) = watch::channel(None);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            request.render_width,
            CacheEntry {
                rx,
                resolved: false,
                generation,
            },
        );

        match ancestor {
            Some((ancestor_width, ancestor)) => Plan::Reduce {
                ancestor_width,
                ancestor,
                publish,
                generation,
            },
            None => Plan::Fresh {
                publish,
                generation,
            },
        }
    }

    /// Publish a computed envelope to all waiters and mark the entry
    /// resolved if it is still the same generation.
    fn settle(
        &self,
        buffer: BufferId,
        render_width: usize,
        generation: u64,
        publish: watch::Sender<Slot>,
        data: RenderData,
    ) -> Arc<RenderData> {
        let data = Arc::new(data);
        publish.send_replace(Some(data.clone()));

        let mut buffers = self.buffers.lock().unwrap();
        if let Some(entry) = buffers
            .get_mut(&buffer)
            .and_then(|entries| entries.get_mut(&render_width))
        {
            if entry.generation == generation {
                entry.resolved = true;
            }
        }

        data
    }
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the producing request publishes its result.
///
/// If the producer fails or the buffer is invalidated before settlement the
/// channel closes without a value; the entry is permanently pending, so this
/// future never completes. Failures reach only the requester that drove the
/// computation.
async fn wait_for_settlement(mut rx: watch::Receiver<Slot>) -> Arc<RenderData> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(data) = current {
            return data;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts engine invocations; delegates to the inline path.
    #[derive(Default)]
    struct CountingPath {
        channels_calls: AtomicUsize,
        reduce_calls: AtomicUsize,
        require_resolved: bool,
    }

    impl ComputePath for CountingPath {
        fn requires_resolved_ancestor(&self) -> bool {
            self.require_resolved
        }

        fn from_channels<'a>(
            &'a self,
            channels: &'a [Vec<Sample>],
            render_width: usize,
        ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
            async move {
                self.channels_calls.fetch_add(1, Ordering::SeqCst);
                SyncCompute.from_channels(channels, render_width).await
            }
        }

        fn from_render_data<'a>(
            &'a self,
            input: &'a RenderData,
            render_width: usize,
        ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
            async move {
                self.reduce_calls.fetch_add(1, Ordering::SeqCst);
                SyncCompute.from_render_data(input, render_width).await
            }
        }
    }

    /// Always fails; used to produce permanently-pending entries.
    struct FailingPath;

    impl ComputePath for FailingPath {
        fn requires_resolved_ancestor(&self) -> bool {
            false
        }

        fn from_channels<'a>(
            &'a self,
            _channels: &'a [Vec<Sample>],
            _render_width: usize,
        ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
            async move { Err(RenderError::Transport("injected failure".to_string())) }
        }

        fn from_render_data<'a>(
            &'a self,
            _input: &'a RenderData,
            _render_width: usize,
        ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
            async move { Err(RenderError::Transport("injected failure".to_string())) }
        }
    }

    fn test_cache() -> RenderCache {
        let _ = env_logger::builder().is_test(true).try_init();
        RenderCache::with_pool(Arc::new(WorkerPool::new(2)))
    }

    fn stereo_ramp(len: usize) -> Vec<Vec<Sample>> {
        let ch: Vec<Sample> = (0..len).map(|i| (i as Sample).sin()).collect();
        vec![ch.clone(), ch]
    }

    #[tokio::test]
    async fn second_request_reuses_the_cached_envelope() {
        let cache = test_cache();
        let path = CountingPath::default();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(1);

        let first = cache
            .request(&path, buffer, &channels, RenderRequest::exact(10))
            .await
            .unwrap();
        // 1000 samples at width 10: step 100, 10 pairs, 20 floats per channel
        assert_eq!(first.channels.len(), 2);
        assert_eq!(first.channels[0].len(), 20);
        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);

        let second = cache
            .request(&path, buffer, &channels, RenderRequest::exact(10))
            .await
            .unwrap();
        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_requests_compute_once() {
        let cache = Arc::new(test_cache());
        let path = Arc::new(CountingPath::default());
        let channels = Arc::new(stereo_ramp(1000));
        let buffer = BufferId::new(7);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let path = path.clone();
            let channels = channels.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .request(&*path, buffer, &channels, RenderRequest::exact(100))
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);
        for result in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], result));
        }
    }

    #[tokio::test]
    async fn tolerance_bounds_accept_a_nearby_cached_width() {
        let cache = test_cache();
        let path = CountingPath::default();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(2);

        let cached = cache
            .request(&path, buffer, &channels, RenderRequest::exact(120))
            .await
            .unwrap();

        let near = cache
            .request(
                &path,
                buffer,
                &channels,
                RenderRequest::with_tolerance(100, 90, 130),
            )
            .await
            .unwrap();

        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);
        assert_eq!(path.reduce_calls.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&cached, &near));
    }

    #[tokio::test]
    async fn smaller_width_reduces_from_larger_cached_envelope() {
        let cache = test_cache();
        let path = CountingPath::default();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(3);

        cache
            .request(&path, buffer, &channels, RenderRequest::exact(500))
            .await
            .unwrap();

        let reduced = cache
            .request(&path, buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();

        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);
        assert_eq!(path.reduce_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reduced.channels[0].len(), 200);
    }

    #[tokio::test]
    async fn pending_ancestors_are_skipped_when_resolution_is_required() {
        let cache = test_cache();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(4);

        // Leave a permanently-pending entry at width 500
        let err = cache
            .request(&FailingPath, buffer, &channels, RenderRequest::exact(500))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Transport(_)));

        // A worker-style path must not chain onto it; it recomputes fresh
        let path = CountingPath {
            require_resolved: true,
            ..CountingPath::default()
        };
        let data = cache
            .request(&path, buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();

        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);
        assert_eq!(path.reduce_calls.load(Ordering::SeqCst), 0);
        assert_eq!(data.channels[0].len(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_entry_stays_pending_for_later_waiters() {
        let cache = test_cache();
        let channels = stereo_ramp(100);
        let buffer = BufferId::new(5);

        let err = cache
            .request(&FailingPath, buffer, &channels, RenderRequest::exact(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Transport(_)));

        // The entry is never retried and never settles; a second request for
        // the same width waits indefinitely
        let path = CountingPath::default();
        let waiter = cache.request(&path, buffer, &channels, RenderRequest::exact(50));
        let outcome = tokio::time::timeout(Duration::from_millis(50), waiter).await;
        assert!(outcome.is_err());
        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 0);

        // A width with no cached ancestor computes normally
        let data = cache
            .request(&path, buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();
        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);
        assert!(!data.channels[0].is_empty());
    }

    #[tokio::test]
    async fn invalidate_drops_the_whole_buffer_map() {
        let cache = test_cache();
        let path = CountingPath::default();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(6);

        cache
            .request(&path, buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();
        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 1);

        cache.invalidate(buffer);

        cache
            .request(&path, buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();
        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn worker_backed_render_end_to_end() {
        let cache = test_cache();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(8);

        let data = cache
            .render(buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();
        // step 10, 100 pairs, 200 floats per channel
        assert_eq!(data.channels.len(), 2);
        assert_eq!(data.channels[0].len(), 200);
        assert_eq!(data.values_per_sample, 2);

        // Reduce path through the pool: width 50 derives from cached 100
        let reduced = cache
            .render(buffer, &channels, RenderRequest::exact(50))
            .await
            .unwrap();
        assert_eq!(reduced.channels[0].len(), 100);
    }

    #[tokio::test]
    async fn sync_render_end_to_end() {
        let cache = test_cache();
        let channels = stereo_ramp(1000);
        let buffer = BufferId::new(9);

        let data = cache
            .render_sync(buffer, &channels, RenderRequest::exact(100))
            .await
            .unwrap();
        assert_eq!(data.channels[0].len(), 200);
    }

    #[tokio::test]
    async fn buffers_are_cached_independently() {
        let cache = test_cache();
        let path = CountingPath::default();
        let channels = stereo_ramp(1000);

        cache
            .request(&path, BufferId::new(10), &channels, RenderRequest::exact(100))
            .await
            .unwrap();
        cache
            .request(&path, BufferId::new(11), &channels, RenderRequest::exact(100))
            .await
            .unwrap();

        assert_eq!(path.channels_calls.load(Ordering::SeqCst), 2);
    }
}
