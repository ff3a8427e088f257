use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::MemoryClass;

/// One malloc or free observed during the shape-only dry run. `ptr` is
/// only a correlation key between a malloc and its matching free; it is
/// not a real address.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfilerEvent {
    pub layer_index: usize,
    pub memory_type: MemoryClass,
    pub is_malloc: bool,
    pub ptr: u64,
    pub size: usize,
    pub time_ms: f64,
}

impl MemoryProfilerEvent {
    /// Bit-packed key `(x<<18) | (memory_type<<16) | malloc_count`: 14
    /// bits for `x`, 2 for class, 16 for count. `x` is filled in by the
    /// scheduler once placement decides the earliest live operator; the
    /// dry run itself packs `layer_index` in its place as a placeholder.
    pub fn memory_index(x: usize, memory_type: MemoryClass, malloc_count: usize) -> u32 {
        ((x as u32 & 0x3FFF) << 18) | ((memory_type.as_index() as u32 & 0x3) << 16) | (malloc_count as u32 & 0xFFFF)
    }
}

/// One completed weight/blob/workspace allocation, derived by pairing a
/// malloc event with its matching free. This is the scheduler's unit of
/// work: a lifetime `[start_layer_index, end_layer_index]` plus a size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub memory_type: MemoryClass,
    pub malloc_count: usize,
    pub size: usize,
    pub start_layer_index: usize,
    pub end_layer_index: usize,
    /// Filled in by the scheduler: earliest operator at which the
    /// region becomes live. `x <= start_layer_index` always.
    pub x: Option<usize>,
    /// Filled in by the scheduler: offset within the unified buffer.
    pub y: Option<usize>,
}

impl MemoryProfile {
    pub fn key(&self) -> u32 {
        MemoryProfilerEvent::memory_index(self.x.unwrap_or(self.start_layer_index), self.memory_type, self.malloc_count)
    }
}

fn align_up(v: usize, align: usize) -> usize {
    if align == 0 {
        return v;
    }
    v.div_ceil(align) * align
}

#[derive(Debug, Default)]
struct ProfilerState {
    events: Vec<MemoryProfilerEvent>,
    counters: [usize; 3],
    active_layer: [usize; 3],
}

/// Central event log shared by the three class façades (weight, blob,
/// workspace). Each façade only carries a class tag and a back-reference
/// here; all mutable state lives behind this one mutex.
#[derive(Debug)]
pub struct MemoryProfiler {
    state: Mutex<ProfilerState>,
    next_ptr: AtomicU64,
    epoch: std::time::Instant,
    align: usize,
}

impl Default for MemoryProfiler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryProfiler {
    /// `align` is the platform alignment every recorded malloc `size` is
    /// rounded up to, matching the memory-profile entry's documented
    /// `size_aligned_to_ALIGN` field.
    pub fn new(align: usize) -> Self {
        MemoryProfiler {
            state: Mutex::new(ProfilerState::default()),
            next_ptr: AtomicU64::new(1),
            epoch: std::time::Instant::now(),
            align: align.max(1),
        }
    }

    /// Rehydrates a profiler from events read back off disk (the
    /// scheduler CLI's use case), so `profiles()` pairs them exactly as
    /// it would a live dry run. The events already carry aligned sizes,
    /// so `align` here only matters if the caller mallocs into it again.
    pub fn from_events(events: Vec<MemoryProfilerEvent>) -> Self {
        let profiler = Self::new(1);
        profiler.state.lock().events = events;
        profiler
    }

    /// Records a malloc for `class` at `layer_index`, actually
    /// allocating `size` bytes of process memory (dry run only — the
    /// real executor routes through the planned allocator instead). The
    /// recorded size is rounded up to `align` before being logged, since
    /// every downstream consumer (scheduler, allocator) reasons in
    /// aligned units. Returns the correlation key to pass to a later
    /// `free`.
    pub fn malloc(&self, layer_index: usize, class: MemoryClass, size: usize) -> u64 {
        let ptr = self.next_ptr.fetch_add(1, Ordering::SeqCst);
        let size = align_up(size, self.align);
        let mut state = self.state.lock();
        let count = state.counters[class.as_index()];
        state.counters[class.as_index()] += 1;
        state.active_layer[class.as_index()] = layer_index;
        let time_ms = self.epoch.elapsed().as_secs_f64() * 1000.0;
        state.events.push(MemoryProfilerEvent {
            layer_index,
            memory_type: class,
            is_malloc: true,
            ptr,
            size,
            time_ms,
        });
        let _ = count;
        ptr
    }

    pub fn free(&self, layer_index: usize, class: MemoryClass, ptr: u64) {
        let mut state = self.state.lock();
        let time_ms = self.epoch.elapsed().as_secs_f64() * 1000.0;
        state.events.push(MemoryProfilerEvent {
            layer_index,
            memory_type: class,
            is_malloc: false,
            ptr,
            size: 0,
            time_ms,
        });
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = ProfilerState::default();
    }

    /// Pairs malloc/free events by `ptr` into the lifetime summaries the
    /// scheduler consumes, in per-class malloc order.
    pub fn profiles(&self) -> Vec<MemoryProfile> {
        let state = self.state.lock();
        let mut counters = [0usize; 3];
        let mut open: std::collections::HashMap<u64, MemoryProfile> = std::collections::HashMap::new();
        let mut done = Vec::new();
        for ev in &state.events {
            if ev.is_malloc {
                let class_idx = ev.memory_type.as_index();
                let count = counters[class_idx];
                counters[class_idx] += 1;
                open.insert(
                    ev.ptr,
                    MemoryProfile {
                        memory_type: ev.memory_type,
                        malloc_count: count,
                        size: ev.size,
                        start_layer_index: ev.layer_index,
                        end_layer_index: ev.layer_index,
                        x: None,
                        y: None,
                    },
                );
            } else if let Some(mut p) = open.remove(&ev.ptr) {
                p.end_layer_index = ev.layer_index;
                done.push(p);
            }
        }
        // Anything never freed lives until the end of the graph.
        done.extend(open.into_values());
        done.sort_by_key(|p| (p.memory_type.as_index(), p.malloc_count));
        done
    }

    pub fn events(&self) -> Vec<MemoryProfilerEvent> {
        self.state.lock().events.clone()
    }
}

/// Thin per-class façade. Matches the original design's "interfaces
/// that behave like different allocators" — each one is a lightweight
/// value type carrying only a class tag and the currently active layer.
pub struct MemoryProfilerInterface<'a> {
    profiler: &'a MemoryProfiler,
    class: MemoryClass,
}

impl<'a> MemoryProfilerInterface<'a> {
    pub fn new(profiler: &'a MemoryProfiler, class: MemoryClass) -> Self {
        MemoryProfilerInterface { profiler, class }
    }

    pub fn fast_malloc(&self, layer_index: usize, size: usize) -> u64 {
        self.profiler.malloc(layer_index, self.class, size)
    }

    pub fn fast_free(&self, layer_index: usize, ptr: u64) {
        self.profiler.free(layer_index, self.class, ptr)
    }
}
