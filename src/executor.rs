//! Two long-lived worker threads (loader, computer) consuming a
//! layer-dependency vector, grounded on `src/net.cpp`'s
//! `ConcurrentContextQueue`/`ForwardParallelContext`/
//! `loading_thread_worker`/`computing_thread_worker`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::allocator::PlannedAllocator;
use crate::errors::FlexError;
use crate::kernel::{KernelRunner, NullKernelRunner};
use crate::profiler::TimeProfiler;

/// Blocking MPSC-ish queue of session contexts: each worker thread parks
/// on `pop()` between sessions, woken by the main thread pushing a fresh
/// context (or a termination sentinel).
struct ConcurrentContextQueue {
    queue: Mutex<VecDeque<Arc<Context>>>,
    cond: Condvar,
}

impl ConcurrentContextQueue {
    fn new() -> Self {
        ConcurrentContextQueue { queue: Mutex::new(VecDeque::new()), cond: Condvar::new() }
    }

    fn push(&self, ctx: Arc<Context>) {
        let mut q = self.queue.lock();
        q.push_back(ctx);
        self.cond.notify_one();
    }

    fn pop(&self) -> Arc<Context> {
        let mut q = self.queue.lock();
        while q.is_empty() {
            self.cond.wait(&mut q);
        }
        q.pop_front().expect("queue non-empty after wait")
    }
}

#[derive(Default)]
struct TaskState {
    loading_completed: bool,
    computing_completed: bool,
    failure: Option<FlexError>,
}

/// One inference session's shared state: the two task queues, the
/// dependency vector, and the completion signal the main thread waits on.
/// Aggregates everything `loading_thread_worker`/`computing_thread_worker`
/// need, mirroring `ForwardParallelContext`.
struct Context {
    kernel: Arc<dyn KernelRunner>,
    allocator: Arc<PlannedAllocator>,
    time_profiler: Option<Arc<dyn TimeProfiler>>,
    layer_count: usize,
    input_layer_count: usize,
    dependencies: Vec<usize>,
    loading: Mutex<VecDeque<usize>>,
    loading_cond: Condvar,
    computing: Mutex<VecDeque<usize>>,
    computing_cond: Condvar,
    task: Mutex<TaskState>,
    task_cond: Condvar,
    should_terminate: bool,
}

impl Context {
    fn new(kernel: Arc<dyn KernelRunner>, allocator: Arc<PlannedAllocator>, time_profiler: Option<Arc<dyn TimeProfiler>>, dependencies: Vec<usize>, layer_count: usize, input_layer_count: usize) -> Self {
        Context {
            kernel,
            allocator,
            time_profiler,
            layer_count,
            input_layer_count,
            dependencies,
            loading: Mutex::new(VecDeque::new()),
            loading_cond: Condvar::new(),
            computing: Mutex::new(VecDeque::new()),
            computing_cond: Condvar::new(),
            task: Mutex::new(TaskState::default()),
            task_cond: Condvar::new(),
            should_terminate: false,
        }
    }

    fn terminate() -> Self {
        Context {
            kernel: Arc::new(NullKernelRunner),
            allocator: Arc::new(PlannedAllocator::new(0)),
            time_profiler: None,
            layer_count: 0,
            input_layer_count: 0,
            dependencies: Vec::new(),
            loading: Mutex::new(VecDeque::new()),
            loading_cond: Condvar::new(),
            computing: Mutex::new(VecDeque::new()),
            computing_cond: Condvar::new(),
            task: Mutex::new(TaskState::default()),
            task_cond: Condvar::new(),
            should_terminate: true,
        }
    }

    fn record_failure(&self, err: FlexError) {
        let mut t = self.task.lock();
        if t.failure.is_none() {
            t.failure = Some(err);
        }
    }
}

fn loading_thread_worker(queue: Arc<ConcurrentContextQueue>) {
    loop {
        let ctx = queue.pop();
        if ctx.should_terminate {
            break;
        }

        let mut task_count = ctx.input_layer_count;
        let mut local: VecDeque<usize> = VecDeque::new();
        let mut failed = false;

        while task_count < ctx.layer_count {
            {
                let mut q = ctx.loading.lock();
                while q.is_empty() {
                    ctx.loading_cond.wait(&mut q);
                }
                local.extend(q.drain(..));
            }
            while let Some(layer_index) = local.pop_front() {
                if let Some(tp) = &ctx.time_profiler {
                    tp.layer_loading_begin(layer_index);
                }
                let result = ctx.kernel.load_model(layer_index, &ctx.allocator).and_then(|_| ctx.kernel.create_pipeline(layer_index));
                task_count += 1;
                if let Some(tp) = &ctx.time_profiler {
                    tp.layer_loading_end(layer_index);
                }
                if let Err(e) = result {
                    ctx.record_failure(e);
                    failed = true;
                    break;
                }

                let mut q = ctx.computing.lock();
                q.push_back(layer_index);
                ctx.computing_cond.notify_one();
            }
            if failed {
                break;
            }
        }

        let mut t = ctx.task.lock();
        t.loading_completed = true;
        ctx.task_cond.notify_one();
    }
}

fn computing_thread_worker(queue: Arc<ConcurrentContextQueue>) {
    loop {
        let ctx = queue.pop();
        if ctx.should_terminate {
            break;
        }

        let mut task_count = ctx.input_layer_count;
        let mut local: VecDeque<usize> = VecDeque::new();
        let mut failed = false;

        while task_count < ctx.layer_count {
            {
                let mut q = ctx.computing.lock();
                while q.is_empty() {
                    ctx.computing_cond.wait(&mut q);
                }
                local.extend(q.drain(..));
            }
            while let Some(layer_index) = local.pop_front() {
                if let Some(tp) = &ctx.time_profiler {
                    tp.layer_computing_begin(layer_index);
                }
                let result = ctx.kernel.forward(layer_index, &ctx.allocator).and_then(|_| ctx.kernel.destroy_pipeline(layer_index)).and_then(|_| ctx.kernel.release_model(layer_index));
                task_count += 1;
                if let Some(tp) = &ctx.time_profiler {
                    tp.layer_computing_end(layer_index);
                }
                if let Err(e) = result {
                    ctx.record_failure(e);
                    failed = true;
                    break;
                }

                // Push new loading tasks [dep[i-1], dep[i]).
                if layer_index > 0 {
                    let start = ctx.dependencies[layer_index - 1];
                    let end = ctx.dependencies[layer_index].min(ctx.layer_count);
                    if start < end {
                        let mut q = ctx.loading.lock();
                        for i in start..end {
                            q.push_back(i);
                        }
                        ctx.loading_cond.notify_one();
                    }
                }
            }
            if failed {
                break;
            }
        }

        let mut t = ctx.task.lock();
        t.computing_completed = true;
        ctx.task_cond.notify_one();
    }
}

/// Owns the two long-lived worker threads and the queues that drive
/// them. One `ParallelExecutor` can run many sessions sequentially;
/// dropping it terminates both workers.
pub struct ParallelExecutor {
    loading_queue: Arc<ConcurrentContextQueue>,
    computing_queue: Arc<ConcurrentContextQueue>,
    loader: Option<JoinHandle<()>>,
    computer: Option<JoinHandle<()>>,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelExecutor {
    pub fn new() -> Self {
        let loading_queue = Arc::new(ConcurrentContextQueue::new());
        let computing_queue = Arc::new(ConcurrentContextQueue::new());

        let lq = loading_queue.clone();
        let loader = std::thread::spawn(move || loading_thread_worker(lq));
        let cq = computing_queue.clone();
        let computer = std::thread::spawn(move || computing_thread_worker(cq));

        ParallelExecutor { loading_queue, computing_queue, loader: Some(loader), computer: Some(computer) }
    }

    /// Runs one inference session to completion: seeds the loader with
    /// the first non-skipped operator, waits for both workers' completion
    /// flags, and surfaces any kernel failure observed along the way.
    #[tracing::instrument(skip_all, fields(layer_count, skip_layer_count))]
    pub fn run_session(
        &self,
        kernel: Arc<dyn KernelRunner>,
        allocator: Arc<PlannedAllocator>,
        time_profiler: Option<Arc<dyn TimeProfiler>>,
        dependencies: Vec<usize>,
        layer_count: usize,
        skip_layer_count: usize,
    ) -> Result<(), FlexError> {
        let ctx = Arc::new(Context::new(kernel, allocator, time_profiler, dependencies, layer_count, skip_layer_count));

        self.loading_queue.push(ctx.clone());
        self.computing_queue.push(ctx.clone());

        {
            let mut q = ctx.loading.lock();
            q.push_back(skip_layer_count);
            ctx.loading_cond.notify_one();
        }

        let mut t = ctx.task.lock();
        while !(t.loading_completed && t.computing_completed) {
            ctx.task_cond.wait(&mut t);
        }
        match t.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ParallelExecutor {
    fn drop(&mut self) {
        let term = Arc::new(Context::terminate());
        self.loading_queue.push(term.clone());
        self.computing_queue.push(term);
        if let Some(h) = self.loader.take() {
            let _ = h.join();
        }
        if let Some(h) = self.computer.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockKernelRunner;
    use crate::types::MemoryClass;

    #[test]
    fn runs_a_session_and_observes_latency_within_tolerance() {
        // S5: plan from an S4-style graph, mock kernels sleeping the
        // profiled durations; end-to-end latency should track the
        // scheduler's predicted latency.
        let loading = vec![0.0, 5.0, 5.0, 5.0, 0.0];
        let computing = vec![0.0, 5.0, 5.0, 5.0, 0.0];
        let dependencies = vec![2, 2, 3, 4, 5];
        let layer_count = 5;
        let skip = 1;

        let allocator = Arc::new(PlannedAllocator::new(4096));
        allocator.set_malloc_plan(vec![0, 16, 32], vec![64], vec![]);
        let _ = MemoryClass::Weight;

        let kernel = Arc::new(MockKernelRunner::new(loading, computing));
        let executor = ParallelExecutor::new();

        let start = std::time::Instant::now();
        let result = executor.run_session(kernel, allocator, None, dependencies, layer_count, skip);
        let elapsed = start.elapsed();

        assert!(result.is_ok());
        // Three 5ms compute stages in sequence: at least 15ms, generously bounded above.
        assert!(elapsed.as_millis() >= 10);
        assert!(elapsed.as_millis() < 500);
    }

    #[test]
    fn surfaces_kernel_failure_without_hanging() {
        struct FailingKernel;
        impl KernelRunner for FailingKernel {
            fn load_model(&self, _l: usize, _a: &PlannedAllocator) -> Result<(), FlexError> {
                Ok(())
            }
            fn create_pipeline(&self, _l: usize) -> Result<(), FlexError> {
                Ok(())
            }
            fn forward(&self, layer_index: usize, _a: &PlannedAllocator) -> Result<(), FlexError> {
                if layer_index == 2 {
                    Err(FlexError::GraphInvariantViolation("boom".into()))
                } else {
                    Ok(())
                }
            }
            fn destroy_pipeline(&self, _l: usize) -> Result<(), FlexError> {
                Ok(())
            }
            fn release_model(&self, _l: usize) -> Result<(), FlexError> {
                Ok(())
            }
        }

        let allocator = Arc::new(PlannedAllocator::new(4096));
        let executor = ParallelExecutor::new();
        let dependencies = vec![2, 2, 3, 4, 5];
        let result = executor.run_session(Arc::new(FailingKernel), allocator, None, dependencies, 5, 1);
        assert!(result.is_err());
    }
}
