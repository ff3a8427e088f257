use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Loading/computing begin-end timestamps for one operator, in
/// milliseconds since the profiler's epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerTimeProfile {
    pub layer_index: usize,
    pub loading_begin: f64,
    pub loading_end: f64,
    pub loading_duration: f64,
    pub computing_begin: f64,
    pub computing_end: f64,
    pub computing_duration: f64,
}

impl LayerTimeProfile {
    pub fn new(layer_index: usize, loading_begin: f64, loading_end: f64, computing_begin: f64, computing_end: f64) -> Self {
        LayerTimeProfile {
            layer_index,
            loading_begin,
            loading_end,
            loading_duration: loading_end - loading_begin,
            computing_begin,
            computing_end,
            computing_duration: computing_end - computing_begin,
        }
    }
}

/// Four timing hooks per operator, keyed by operator index. Implemented
/// by an unlocked, single-threaded variant (the shape-only dry run) and
/// a locked variant (the parallel executor, where both worker threads
/// write to the same map).
pub trait TimeProfiler: Send + Sync {
    fn insert(&self, profile: LayerTimeProfile);
    fn layer_loading_begin(&self, layer_index: usize);
    fn layer_loading_end(&self, layer_index: usize);
    fn layer_computing_begin(&self, layer_index: usize);
    fn layer_computing_end(&self, layer_index: usize);
    fn clear(&self);
    fn profiles(&self) -> Vec<LayerTimeProfile>;
}

#[derive(Debug, Default, Clone, Copy)]
struct PartialTimes {
    loading_begin: Option<f64>,
    loading_end: Option<f64>,
    computing_begin: Option<f64>,
    computing_end: Option<f64>,
}

fn finalize(layer_index: usize, p: PartialTimes) -> LayerTimeProfile {
    LayerTimeProfile::new(
        layer_index,
        p.loading_begin.unwrap_or(0.0),
        p.loading_end.unwrap_or(0.0),
        p.computing_begin.unwrap_or(0.0),
        p.computing_end.unwrap_or(0.0),
    )
}

/// Single-threaded variant used during the shape-only dry run. Despite the
/// name it is backed by the same `parking_lot::Mutex` as
/// `LockedTimeProfiler` rather than a `RefCell`, so it genuinely satisfies
/// `TimeProfiler`'s `Sync` bound instead of asserting it unsafely; the
/// "unlocked" in the name refers to the dry run never contending the lock
/// (one thread, never held across an await or a second borrow), not to the
/// field's own thread-safety.
pub struct UnlockedTimeProfiler {
    epoch: Instant,
    partial: Mutex<BTreeMap<usize, PartialTimes>>,
}

impl Default for UnlockedTimeProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl UnlockedTimeProfiler {
    pub fn new() -> Self {
        UnlockedTimeProfiler { epoch: Instant::now(), partial: Mutex::new(BTreeMap::new()) }
    }

    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}

impl TimeProfiler for UnlockedTimeProfiler {
    fn insert(&self, profile: LayerTimeProfile) {
        self.partial.lock().insert(
            profile.layer_index,
            PartialTimes {
                loading_begin: Some(profile.loading_begin),
                loading_end: Some(profile.loading_end),
                computing_begin: Some(profile.computing_begin),
                computing_end: Some(profile.computing_end),
            },
        );
    }

    fn layer_loading_begin(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().loading_begin = Some(t);
    }

    fn layer_loading_end(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().loading_end = Some(t);
    }

    fn layer_computing_begin(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().computing_begin = Some(t);
    }

    fn layer_computing_end(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().computing_end = Some(t);
    }

    fn clear(&self) {
        self.partial.lock().clear();
    }

    fn profiles(&self) -> Vec<LayerTimeProfile> {
        self.partial.lock().iter().map(|(&idx, &p)| finalize(idx, p)).collect()
    }
}

/// Mutex-guarded variant for use from the loader and computer worker
/// threads concurrently.
pub struct LockedTimeProfiler {
    epoch: Instant,
    partial: Mutex<BTreeMap<usize, PartialTimes>>,
}

impl Default for LockedTimeProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedTimeProfiler {
    pub fn new() -> Self {
        LockedTimeProfiler { epoch: Instant::now(), partial: Mutex::new(BTreeMap::new()) }
    }

    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}

impl TimeProfiler for LockedTimeProfiler {
    fn insert(&self, profile: LayerTimeProfile) {
        self.partial.lock().insert(
            profile.layer_index,
            PartialTimes {
                loading_begin: Some(profile.loading_begin),
                loading_end: Some(profile.loading_end),
                computing_begin: Some(profile.computing_begin),
                computing_end: Some(profile.computing_end),
            },
        );
    }

    #[tracing::instrument(skip(self), name = "loading_begin")]
    fn layer_loading_begin(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().loading_begin = Some(t);
    }

    #[tracing::instrument(skip(self), name = "loading_end")]
    fn layer_loading_end(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().loading_end = Some(t);
    }

    #[tracing::instrument(skip(self), name = "computing_begin")]
    fn layer_computing_begin(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().computing_begin = Some(t);
    }

    #[tracing::instrument(skip(self), name = "computing_end")]
    fn layer_computing_end(&self, layer_index: usize) {
        let t = self.now_ms();
        self.partial.lock().entry(layer_index).or_default().computing_end = Some(t);
    }

    fn clear(&self) {
        self.partial.lock().clear();
    }

    fn profiles(&self) -> Vec<LayerTimeProfile> {
        self.partial.lock().iter().map(|(&idx, &p)| finalize(idx, p)).collect()
    }
}
