//! The opaque kernel-execution seam. Numeric kernels themselves
//! (convolution, softmax, Winograd transforms, ...) are deliberately out
//! of scope; the executor only ever drives an operator through this
//! trait's lifecycle, grounded on `src/net.cpp`'s per-layer
//! `load_model`/`create_pipeline`/`forward`/`destroy_pipeline`/
//! `release_model` sequence.

use crate::allocator::PlannedAllocator;
use crate::errors::FlexResult;

/// One operator's runtime behaviour, addressed by its topological index.
/// A real implementation reads weight bytes through `load_model`, drives
/// `PlannedAllocator::fast_malloc` a deterministic number of times per
/// `forward` call (the allocator-replay invariant in spec section 5), and
/// frees nothing mid-session.
pub trait KernelRunner: Send + Sync {
    /// Reads this operator's weight data from the model file into its
    /// preassigned weight-class offset(s).
    fn load_model(&self, layer_index: usize, allocator: &PlannedAllocator) -> FlexResult<()>;

    /// Prepares any kernel-internal state (packed weight layouts,
    /// Winograd transform tiles, ...) once loading has completed.
    fn create_pipeline(&self, layer_index: usize) -> FlexResult<()>;

    /// Runs the operator: reads its input blobs, writes its output blob,
    /// requesting blob/workspace allocations from the allocator as needed.
    fn forward(&self, layer_index: usize, allocator: &PlannedAllocator) -> FlexResult<()>;

    /// Releases kernel-internal pipeline state (the inverse of
    /// `create_pipeline`).
    fn destroy_pipeline(&self, layer_index: usize) -> FlexResult<()>;

    /// Releases the operator's weight data (for transient, reload-per-use
    /// weights; a no-op for persistent ones).
    fn release_model(&self, layer_index: usize) -> FlexResult<()>;
}

/// A no-op placeholder used only by termination contexts, whose worker
/// loops check `should_terminate` before ever touching the kernel.
pub(crate) struct NullKernelRunner;

impl KernelRunner for NullKernelRunner {
    fn load_model(&self, _layer_index: usize, _allocator: &PlannedAllocator) -> FlexResult<()> {
        Ok(())
    }
    fn create_pipeline(&self, _layer_index: usize) -> FlexResult<()> {
        Ok(())
    }
    fn forward(&self, _layer_index: usize, _allocator: &PlannedAllocator) -> FlexResult<()> {
        Ok(())
    }
    fn destroy_pipeline(&self, _layer_index: usize) -> FlexResult<()> {
        Ok(())
    }
    fn release_model(&self, _layer_index: usize) -> FlexResult<()> {
        Ok(())
    }
}

/// A kernel runner driven purely by precomputed durations, for testing
/// the executor without real numeric kernels (spec section 8, scenario
/// S5): `forward` sleeps `computing_duration[i]`, `load_model` sleeps
/// `loading_duration[i]`.
pub struct MockKernelRunner {
    pub loading_duration_ms: Vec<f64>,
    pub computing_duration_ms: Vec<f64>,
}

impl MockKernelRunner {
    pub fn new(loading_duration_ms: Vec<f64>, computing_duration_ms: Vec<f64>) -> Self {
        MockKernelRunner { loading_duration_ms, computing_duration_ms }
    }

    fn sleep_ms(ms: f64) {
        if ms > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(ms / 1000.0));
        }
    }
}

impl KernelRunner for MockKernelRunner {
    fn load_model(&self, layer_index: usize, _allocator: &PlannedAllocator) -> FlexResult<()> {
        Self::sleep_ms(self.loading_duration_ms.get(layer_index).copied().unwrap_or(0.0));
        Ok(())
    }

    fn create_pipeline(&self, _layer_index: usize) -> FlexResult<()> {
        Ok(())
    }

    fn forward(&self, layer_index: usize, _allocator: &PlannedAllocator) -> FlexResult<()> {
        Self::sleep_ms(self.computing_duration_ms.get(layer_index).copied().unwrap_or(0.0));
        Ok(())
    }

    fn destroy_pipeline(&self, _layer_index: usize) -> FlexResult<()> {
        Ok(())
    }

    fn release_model(&self, _layer_index: usize) -> FlexResult<()> {
        Ok(())
    }
}
