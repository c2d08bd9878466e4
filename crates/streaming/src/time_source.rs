//! Time-indexed wind snapshots resident on the GPU.
//!
//! A `TimeSource` keeps the three snapshots around the current time
//! reprojected into an `Interpolator`'s ring. Each slot goes
//! `Busy → Valid | Failed`; a slot reassigned while its work is still in
//! flight fences that work off with a new generation, so late results are
//! dropped instead of overwriting the newer key.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use foundation::bounds::{GeoBounds, MercBounds};
use foundation::time::{TimeKey, bracket, now_hours, ring_index};
use formats::{UvImage, WindMeta};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use futures::task::{LocalSpawn, LocalSpawnExt};
use glam::DMat4;
use gpu::{Gl, GpuError, ImageView, Interpolator, Reprojector, same_context};
use runtime::{EventBus, ListenerId, Metrics, names};
use tracing::{debug, info, warn};

use crate::cache::{ImageCache, MemoryBudget, SharedFetch};
use crate::config::TimeSourceConfig;
use crate::error::SnapshotError;
use crate::loader::{LoadError, SnapshotLoader};
use crate::request::Request;
use crate::residency::{BufferState, Readiness, Ring, SlotStatus};

/// How a render request was satisfied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RenderResponse {
    /// A bracket slot is missing or failed.
    Failed,
    /// Both bracket slots were already valid.
    Sync,
    /// Valid after waiting on in-flight work.
    Async,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TimeEvent {
    /// Metadata arrived and the GPU components exist.
    Loaded,
    /// The interpolator now shows `time`.
    Ready { time: f64 },
}

/// Grid geometry shared by every consumer of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceGeometry {
    /// Metadata bounds, widened when the grid wraps the globe.
    pub bounds: GeoBounds,
    pub data_size: [u32; 2],
    pub texture_size: [u32; 2],
    pub span_globe: bool,
    pub merc_bounds: MercBounds,
    pub tex_to_merc: DMat4,
    pub merc_to_tex: DMat4,
    pub uv_max: f64,
    pub speed_max: f64,
}

/// Holds event delivery off until dropped. Guards nest.
pub struct SuppressGuard<'a> {
    depth: &'a Cell<u32>,
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

struct State {
    gl: Option<Gl>,
    meta: Option<WindMeta>,
    geometry: Option<SourceGeometry>,
    reprojector: Option<Reprojector>,
    interpolator: Option<Interpolator>,
    cache: ImageCache,
    ring: Ring,
    time: Option<f64>,
    snapped: Option<TimeKey>,
}

struct Inner {
    config: TimeSourceConfig,
    loader: Rc<dyn SnapshotLoader>,
    spawner: Rc<dyn LocalSpawn>,
    state: RefCell<State>,
    events: EventBus<TimeEvent>,
    suppressed: Cell<u32>,
    metrics: RefCell<Metrics>,
}

/// Cheap to clone; clones share one ring.
#[derive(Clone)]
pub struct TimeSource {
    inner: Rc<Inner>,
}

impl TimeSource {
    pub fn new(
        config: TimeSourceConfig,
        loader: Rc<dyn SnapshotLoader>,
        spawner: Rc<dyn LocalSpawn>,
    ) -> Self {
        let budget = MemoryBudget::new(config.cache_budget_bytes);
        Self {
            inner: Rc::new(Inner {
                config,
                loader,
                spawner,
                state: RefCell::new(State {
                    gl: None,
                    meta: None,
                    geometry: None,
                    reprojector: None,
                    interpolator: None,
                    cache: ImageCache::new(budget),
                    ring: Ring::new(),
                    time: None,
                    snapped: None,
                }),
                events: EventBus::new(),
                suppressed: Cell::new(0),
                metrics: RefCell::new(Metrics::new()),
            }),
        }
    }

    pub fn config(&self) -> &TimeSourceConfig {
        &self.inner.config
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.state.borrow().meta.is_some()
    }

    pub fn meta(&self) -> Option<WindMeta> {
        self.inner.state.borrow().meta.clone()
    }

    pub fn geometry(&self) -> Option<SourceGeometry> {
        self.inner.state.borrow().geometry.clone()
    }

    /// Last time passed to `set_time`.
    pub fn time(&self) -> Option<f64> {
        self.inner.state.borrow().time
    }

    pub fn gl(&self) -> Option<Gl> {
        self.inner.state.borrow().gl.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.metrics.borrow().clone()
    }

    pub fn subscribe(&self, listener: impl FnMut(&TimeEvent) + 'static) -> ListenerId {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn suppress_events(&self) -> SuppressGuard<'_> {
        let depth = &self.inner.suppressed;
        depth.set(depth.get() + 1);
        SuppressGuard { depth }
    }

    pub fn events_suppressed(&self) -> bool {
        self.inner.suppressed.get() > 0
    }

    /// Snapshot of the ring slot currently holding `key`.
    pub fn buffer_state(&self, key: TimeKey) -> Option<BufferState> {
        self.inner.state.borrow().ring.holding(key).cloned()
    }

    pub fn cache_used_bytes(&self) -> usize {
        self.inner.state.borrow().cache.used_bytes()
    }

    /// Runs `f` against the interpolator. `f` must not call back into this
    /// source.
    pub fn with_interpolator<R>(&self, f: impl FnOnce(&mut Interpolator) -> R) -> Option<R> {
        self.inner.state.borrow_mut().interpolator.as_mut().map(f)
    }

    /// Fetches metadata for the run covering `at` (hours since epoch,
    /// defaulting to six hours ago) and builds the GPU components.
    ///
    /// Loading twice returns the stored metadata without a request.
    pub async fn load(&self, at: Option<f64>) -> Result<WindMeta, SnapshotError> {
        if let Some(meta) = self.meta() {
            return Ok(meta);
        }
        let key = at.unwrap_or_else(|| now_hours() - 6.0).floor() as TimeKey;
        let bytes = self.inner.loader.fetch(Request::Meta(key)).await?;
        let meta = WindMeta::from_json_slice(&bytes)?;
        self.install(meta.clone())?;
        info!(
            date = %meta.date,
            width = meta.width,
            height = meta.height,
            uv_max = meta.uv_max,
            "time source loaded"
        );
        self.emit(TimeEvent::Loaded);

        if let Some(time) = self.time() {
            self.update_time(time);
        }
        Ok(meta)
    }

    /// Builds the GPU components for `meta`. Nothing is kept unless they
    /// attach to the current context, so a failed load can be retried.
    fn install(&self, meta: WindMeta) -> Result<(), GpuError> {
        let mut guard = self.inner.state.borrow_mut();
        let state = &mut *guard;
        if state.meta.is_some() {
            return Ok(());
        }
        let mut bounds = meta.bounds;
        let mut reprojector = Reprojector::new(meta.data_size(), &mut bounds);
        let mut interpolator = Interpolator::new(reprojector.output_size(), reprojector.span_globe());

        if let Some(gl) = state.gl.as_ref() {
            let applied = reprojector
                .set_context(Some(gl))
                .and_then(|()| interpolator.set_context(Some(gl)));
            if let Err(e) = applied {
                warn!(error = %e, "time source: GPU setup failed");
                if let Err(e) = reprojector.set_context(None) {
                    warn!(error = %e, "time source: releasing reprojector failed");
                }
                if let Err(e) = interpolator.set_context(None) {
                    warn!(error = %e, "time source: releasing interpolator failed");
                }
                return Err(e);
            }
        }

        state.geometry = Some(SourceGeometry {
            bounds,
            data_size: meta.data_size(),
            texture_size: reprojector.output_size(),
            span_globe: reprojector.span_globe(),
            merc_bounds: reprojector.merc_bounds(),
            tex_to_merc: *reprojector.tex_to_merc(),
            merc_to_tex: *reprojector.merc_to_tex(),
            uv_max: meta.uv_max,
            speed_max: meta.speed_max(),
        });
        state.meta = Some(meta);
        state.reprojector = Some(reprojector);
        state.interpolator = Some(interpolator);
        Ok(())
    }

    /// Moves the GPU components to `gl`.
    ///
    /// Everything resident lived in the old context, so the ring is emptied
    /// and, with a new context, refilled around the current time.
    pub fn set_context(&self, gl: Option<&Gl>) -> Result<(), GpuError> {
        let time = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            if same_context(state.gl.as_ref(), gl) {
                return Ok(());
            }
            state.gl = gl.cloned();
            if let Some(r) = state.reprojector.as_mut() {
                r.set_context(gl)?;
            }
            if let Some(i) = state.interpolator.as_mut() {
                i.set_context(gl)?;
            }
            state.ring.clear();
            state.snapped = None;
            state.time
        };
        debug!(attached = gl.is_some(), "time source context changed");

        if let (Some(_), Some(time)) = (gl, time) {
            self.update_time(time);
        }
        Ok(())
    }

    /// Moves to `time`, re-centring the ring if it drifted past the snap
    /// threshold. The returned future settles once the bracket is rendered
    /// into the interpolator, or fails.
    ///
    /// Requests are issued before this returns; the future only waits.
    pub fn set_time(&self, time: f64) -> LocalBoxFuture<'static, RenderResponse> {
        self.update_time(time);
        let this = self.clone();
        async move { this.can_render().await }.boxed_local()
    }

    fn update_time(&self, time: f64) {
        let snap = {
            let mut state = self.inner.state.borrow_mut();
            state.time = Some(time);
            if state.meta.is_none() {
                None
            } else {
                let threshold = self.inner.config.snap_threshold;
                let far = state
                    .snapped
                    .is_none_or(|k| (time - k as f64).abs() > threshold);
                if far {
                    let key = time.round() as TimeKey;
                    state.snapped = Some(key);
                    Some(key)
                } else {
                    None
                }
            }
        };

        if let Some(key) = snap {
            debug!(time, key, "snapping ring");
            self.inner.metrics.borrow_mut().inc(names::TIME_SNAPS);
            for k in [key - 1, key, key + 1] {
                self.reproject(k);
            }
        }
    }

    fn readiness(&self) -> Readiness {
        let state = self.inner.state.borrow();
        match state.time {
            Some(time) if state.interpolator.is_some() => state.ring.readiness(time),
            _ => Readiness::Failed,
        }
    }

    async fn can_render(&self) -> RenderResponse {
        let mut response = RenderResponse::Sync;
        loop {
            match self.readiness() {
                Readiness::Failed => return RenderResponse::Failed,
                Readiness::Busy(signal) => {
                    signal.await;
                    response = RenderResponse::Async;
                }
                Readiness::Ready { tex_0, tex_1, mix } => {
                    self.show(tex_0, tex_1, mix);
                    return response;
                }
            }
        }
    }

    /// Non-blocking readiness check; on success the interpolator is pointed
    /// at the current bracket.
    pub fn poll_ready(&self) -> bool {
        match self.readiness() {
            Readiness::Ready { tex_0, tex_1, mix } => {
                self.show(tex_0, tex_1, mix);
                true
            }
            _ => false,
        }
    }

    fn show(&self, tex_0: usize, tex_1: usize, mix: f64) {
        let time = {
            let mut state = self.inner.state.borrow_mut();
            if let Some(i) = state.interpolator.as_mut() {
                i.set_state(tex_0, tex_1, mix as f32);
            }
            state.time
        };
        if let Some(time) = time {
            self.emit(TimeEvent::Ready { time });
        }
    }

    fn emit(&self, event: TimeEvent) {
        if !self.events_suppressed() {
            self.inner.events.emit(&event);
        }
    }

    /// The encoded bytes for `key`, shared with any fetch already running.
    pub fn image(&self, key: TimeKey) -> SharedFetch {
        let mut state = self.inner.state.borrow_mut();
        self.image_locked(&mut state, key)
    }

    fn image_locked(&self, state: &mut State, key: TimeKey) -> SharedFetch {
        let mut metrics = self.inner.metrics.borrow_mut();
        if let Some(fetch) = state.cache.get(key) {
            metrics.inc(names::FETCH_CACHE_HITS);
            return fetch;
        }
        metrics.inc(names::FETCH_REQUESTS);
        let fetch = self
            .inner
            .loader
            .fetch(Request::Snapshot(key))
            .shared();
        state.cache.insert(key, fetch.clone());
        fetch
    }

    /// Claims the ring slot for `key` and starts filling it. A slot already
    /// holding `key`, in any state, is left alone.
    fn reproject(&self, key: TimeKey) {
        let mut state = self.inner.state.borrow_mut();
        if state.ring.holding(key).is_some() {
            return;
        }
        let fetch = self.image_locked(&mut state, key);
        let generation = state.ring.peek_generation();
        let weak: Weak<Inner> = Rc::downgrade(&self.inner);
        let task = async move {
            let result = fetch.await;
            if let Some(inner) = weak.upgrade() {
                TimeSource { inner }.commit(key, generation, result);
            }
        }
        .boxed_local()
        .shared();
        let claimed = state.ring.claim(key, task.clone());
        debug_assert_eq!(claimed, generation);
        drop(state);

        if let Err(e) = self.inner.spawner.spawn_local(task) {
            warn!(key, error = %e, "could not schedule reprojection");
            self.inner.state.borrow_mut().ring.settle(
                key,
                generation,
                SlotStatus::Failed(SnapshotError::Spawn(e.to_string())),
            );
        }
    }

    fn commit(&self, key: TimeKey, generation: u64, result: Result<Bytes, LoadError>) {
        let mut guard = self.inner.state.borrow_mut();
        let state = &mut *guard;
        let mut metrics = self.inner.metrics.borrow_mut();

        // Cache bookkeeping happens even for stale results: the bytes are
        // still good for the next time this key comes around.
        let result = match result {
            Ok(bytes) => {
                let protected = state.ring.keys();
                match state.cache.mark_resident(key, bytes.len(), &protected) {
                    Ok(evicted) if !evicted.is_empty() => {
                        debug!(key, ?evicted, "evicted cached snapshots");
                        metrics.inc_by(names::CACHE_EVICTIONS, evicted.len() as u64);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(key, error = %e, "snapshot not cached"),
                }
                Ok(bytes)
            }
            Err(e) => {
                state.cache.remove(key);
                metrics.inc(names::FETCH_FAILED);
                Err(SnapshotError::from(e))
            }
        };

        if !state.ring.is_current(key, generation) {
            debug!(key, generation, "dropping stale reprojection");
            metrics.inc(names::REPROJECT_STALE);
            return;
        }

        let outcome = result.and_then(|bytes| {
            let image = UvImage::decode_png(&bytes)?;
            let (Some(reprojector), Some(interpolator)) =
                (state.reprojector.as_ref(), state.interpolator.as_mut())
            else {
                return Err(SnapshotError::NotLoaded);
            };
            let target = interpolator
                .get_buffer(ring_index(key))
                .ok_or(GpuError::NoContext)?;
            reprojector.reproject(
                ImageView {
                    width: image.width(),
                    height: image.height(),
                    rgba: image.rgba(),
                },
                target,
            )?;
            // The reprojection rebinds texture units behind the interpolator.
            interpolator.release_textures();
            Ok(())
        });

        let status = match outcome {
            Ok(()) => {
                metrics.inc(names::REPROJECT_COMMITTED);
                SlotStatus::Valid
            }
            Err(e) => {
                warn!(key, error = %e, "snapshot unavailable");
                metrics.inc(names::REPROJECT_FAILED);
                SlotStatus::Failed(e)
            }
        };
        state.ring.settle(key, generation, status);
    }

    /// Requests failed slots around the current time again. Failed fetches
    /// are never cached, so this goes back to the loader.
    pub fn retry_failed(&self) -> usize {
        let failed = {
            let mut state = self.inner.state.borrow_mut();
            let mut keys = state.ring.keys();
            if let Some(time) = state.time {
                let (k0, k1) = bracket(time);
                keys.extend([k0, k1]);
            }
            keys.sort_unstable();
            keys.dedup();
            let failed = state.ring.failed(&keys);
            for k in &failed {
                state.ring.release(*k);
                state.cache.remove(*k);
            }
            failed
        };
        if !failed.is_empty() {
            info!(keys = ?failed, "retrying failed snapshots");
        }
        for k in &failed {
            self.reproject(*k);
        }
        failed.len()
    }
}
