//! Planned allocator: one unified buffer, three per-class façades, each
//! replaying a fixed sequence of offsets precomputed by the scheduler.
//! Grounded on `src/plannedallocator.{h,cpp}` from the original
//! implementation.

use parking_lot::Mutex;

use crate::errors::{FlexError, FlexResult};
use crate::types::{LoadMode, MemoryClass};

#[derive(Debug, Default, Clone)]
struct AllocatorState {
    offsets: [Vec<usize>; 3],
    counters: [usize; 3],
    persistent: Vec<(usize, usize)>,
    load_mode: LoadMode,
}

/// Owns the single unified buffer's offset bookkeeping. Does not hold the
/// buffer's actual bytes — callers (the executor, or a test harness) own
/// the backing allocation and index into it with the offsets this type
/// hands out.
#[derive(Debug, Default)]
pub struct PlannedAllocator {
    buffer_size: usize,
    state: Mutex<AllocatorState>,
}

impl PlannedAllocator {
    pub fn new(buffer_size: usize) -> Self {
        PlannedAllocator { buffer_size, state: Mutex::new(AllocatorState::default()) }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Loads the replay sequence for one class, replacing whatever was
    /// there. Called once per session, from the malloc-plan reader.
    pub fn load_malloc_plan(&self, class: MemoryClass, offsets: Vec<usize>) {
        let mut state = self.state.lock();
        state.offsets[class.as_index()] = offsets;
        state.counters[class.as_index()] = 0;
    }

    pub fn set_malloc_plan(&self, weight: Vec<usize>, blob: Vec<usize>, workspace: Vec<usize>) {
        self.load_malloc_plan(MemoryClass::Weight, weight);
        self.load_malloc_plan(MemoryClass::Blob, blob);
        self.load_malloc_plan(MemoryClass::Workspace, workspace);
    }

    /// Offsets reserved for the whole session by persistent-weight
    /// selection (Step 2 of the scheduler); `is_persistent` consults this.
    pub fn set_persistent_regions(&self, regions: Vec<(usize, usize)>) {
        self.state.lock().persistent = regions;
    }

    pub fn set_load_mode(&self, mode: LoadMode) {
        self.state.lock().load_mode = mode;
    }

    pub fn load_mode(&self) -> LoadMode {
        self.state.lock().load_mode
    }

    /// Returns the next preassigned offset for `class`, advancing its
    /// counter. `PlanReplayMismatch` if the kernel code calls this more
    /// times than the plan provisioned — evidence of allocator-call
    /// non-determinism between the profiling dry run and real execution.
    pub fn fast_malloc(&self, class: MemoryClass) -> FlexResult<usize> {
        let mut state = self.state.lock();
        let idx = class.as_index();
        let counter = state.counters[idx];
        match state.offsets[idx].get(counter).copied() {
            Some(offset) => {
                state.counters[idx] += 1;
                Ok(offset)
            }
            None => Err(FlexError::PlanReplayMismatch { class, expected: state.offsets[idx].len(), actual: counter + 1 }),
        }
    }

    /// No-op: the plan is the sole source of truth for offsets, so
    /// freeing never returns memory to a free list.
    pub fn fast_free(&self, _class: MemoryClass, _offset: usize) {}

    /// `offset` lies in a region reserved by persistent-weight selection.
    /// The model-loading glue consults this under the current `load_mode`
    /// to decide whether to materialise a weight on this pass or skip it
    /// for the other pass: on the `Persistent` pass it loads only offsets
    /// where this is true; on the `Transient` pass, only where it's false.
    pub fn is_persistent(&self, offset: usize) -> bool {
        self.state.lock().persistent.iter().any(|&(start, len)| offset >= start && offset < start + len)
    }

    /// Resets per-class counters between inference iterations without
    /// discarding the loaded plan.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.counters = [0, 0, 0];
    }

    /// Drops the loaded plan and persistent regions entirely.
    pub fn release_buffer(&self) {
        let mut state = self.state.lock();
        *state = AllocatorState::default();
    }
}

/// Thin per-class façade, matching `MemoryProfilerInterface`'s shape: a
/// back-reference plus a class tag, no mutable state of its own.
pub struct PlannedAllocatorInterface<'a> {
    allocator: &'a PlannedAllocator,
    class: MemoryClass,
}

impl<'a> PlannedAllocatorInterface<'a> {
    pub fn new(allocator: &'a PlannedAllocator, class: MemoryClass) -> Self {
        PlannedAllocatorInterface { allocator, class }
    }

    pub fn fast_malloc(&self) -> FlexResult<usize> {
        self.allocator.fast_malloc(self.class)
    }

    pub fn fast_free(&self, offset: usize) {
        self.allocator.fast_free(self.class, offset)
    }

    pub fn is_persistent(&self, offset: usize) -> bool {
        self.allocator.is_persistent(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_offsets_in_fifo_order() {
        let alloc = PlannedAllocator::new(4096);
        alloc.set_malloc_plan(vec![0, 512], vec![1024, 2048], vec![]);
        assert_eq!(alloc.fast_malloc(MemoryClass::Weight).unwrap(), 0);
        assert_eq!(alloc.fast_malloc(MemoryClass::Weight).unwrap(), 512);
        assert_eq!(alloc.fast_malloc(MemoryClass::Blob).unwrap(), 1024);
    }

    #[test]
    fn overrun_is_plan_replay_mismatch() {
        let alloc = PlannedAllocator::new(4096);
        alloc.set_malloc_plan(vec![0, 512], vec![1024, 2048], vec![]);
        alloc.fast_malloc(MemoryClass::Weight).unwrap();
        alloc.fast_malloc(MemoryClass::Weight).unwrap();
        let err = alloc.fast_malloc(MemoryClass::Weight).unwrap_err();
        assert!(matches!(err, FlexError::PlanReplayMismatch { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn clear_resets_counters_not_plan() {
        let alloc = PlannedAllocator::new(4096);
        alloc.set_malloc_plan(vec![0, 512], vec![], vec![]);
        alloc.fast_malloc(MemoryClass::Weight).unwrap();
        alloc.clear();
        assert_eq!(alloc.fast_malloc(MemoryClass::Weight).unwrap(), 0);
    }
}
