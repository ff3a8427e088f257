//! `flexnn-bench <model_prefix> [key=value…]` — replays an inference
//! session `loop_count` times behind a named config, grounded on
//! `examples/benchflexnn.cpp`'s `benchmark`/`main` and its warmup/loop/
//! min/max/avg report.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use flexnn::allocator::PlannedAllocator;
use flexnn::config::RunOptions;
use flexnn::dryrun::dry_run;
use flexnn::executor::ParallelExecutor;
use flexnn::graph::Graph;
use flexnn::io::{read_layer_dependencies, read_malloc_plan, write_time_profile};
use flexnn::kernel::MockKernelRunner;
use flexnn::profiler::LockedTimeProfiler;
use flexnn::scheduler::{ScheduleResult, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "flexnn-bench", about = "Replay a planned inference session under a named bench config")]
struct Args {
    /// Graph is read from `<model_prefix>.param`.
    model_prefix: String,
    /// `key=value` overrides, including `config=<name>` (see spec.md §6),
    /// `malloc_plan_path=...`, `layer_dependency_path=...`, `loop_count=...`.
    options: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let opts = RunOptions::from_kv_pairs(&args.options)?;
    tracing::info!(bench = ?opts.bench, loop_count = opts.loop_count, warmup_loop_count = opts.warmup_loop_count, "bench config");

    let param_path = PathBuf::from(format!("{}.param", args.model_prefix));
    let text = fs::read_to_string(&param_path)?;
    let mut graph: Graph = serde_json::from_str(&text)?;
    graph.check_invariants()?;
    graph.topo_sort()?;
    graph.infer_shapes()?;
    let layer_count = graph.layers.len();

    // Always dry-run first: it supplies the mock kernel's per-layer
    // loading/computing durations, and doubles as the fallback scheduling
    // input when no malloc-plan/layer-dependency files are given.
    let dry = dry_run(&graph, opts.align)?;
    let mut loading_ms = vec![0.0; layer_count];
    let mut computing_ms = vec![0.0; layer_count];
    for p in &dry.time_profiles {
        if p.layer_index < layer_count {
            loading_ms[p.layer_index] = p.loading_duration;
            computing_ms[p.layer_index] = p.computing_duration;
        }
    }
    let kernel = Arc::new(MockKernelRunner::new(loading_ms, computing_ms));

    // A malloc plan and layer-dependency vector are required to drive the
    // planned allocator and executor; load them from disk if given,
    // otherwise derive them from the dry run, matching the original's
    // "schedule on the fly when no plan file is given" fallback.
    let (plan, dependencies) = match (&opts.malloc_plan_path, &opts.layer_dependency_path) {
        (Some(plan_path), Some(dep_path)) => {
            let plan = read_malloc_plan(&PathBuf::from(plan_path))?;
            let dependencies = read_layer_dependencies(&PathBuf::from(dep_path))?;
            (plan, dependencies)
        }
        _ => {
            let memory_profiles = flexnn::profiler::memory::MemoryProfiler::from_events(dry.memory_events.clone()).profiles();
            let scheduler = Scheduler::new(opts.scheduler, opts.align, opts.skip_layer_count);
            let ScheduleResult { plan, dependencies, predicted_latency_ms, .. } = scheduler.schedule(&memory_profiles, &dry.time_profiles, layer_count, opts.memory_budget)?;
            tracing::info!(predicted_latency_ms, "scheduled from a fresh dry run (no malloc_plan_path/layer_dependency_path given)");
            (plan, dependencies)
        }
    };

    let allocator = Arc::new(PlannedAllocator::new(opts.memory_budget));
    allocator.set_malloc_plan(plan.weight, plan.blob, plan.workspace);
    let persistent_regions: Vec<(usize, usize)> = plan.persistent.chunks(2).filter(|c| c.len() == 2).map(|c| (c[0], c[1])).collect();
    allocator.set_persistent_regions(persistent_regions);

    let time_profiler: Option<Arc<dyn flexnn::profiler::TimeProfiler>> =
        if opts.time_profile_path.is_empty() { None } else { Some(Arc::new(LockedTimeProfiler::new())) };

    let executor = ParallelExecutor::new();
    let total_iterations = opts.warmup_loop_count + opts.loop_count;
    let mut timed = Vec::with_capacity(opts.loop_count);

    for i in 0..total_iterations {
        allocator.clear();
        if let Some(tp) = &time_profiler {
            tp.clear();
        }
        let start = std::time::Instant::now();
        executor.run_session(kernel.clone(), allocator.clone(), time_profiler.clone(), dependencies.clone(), layer_count, opts.skip_layer_count)?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if i >= opts.warmup_loop_count {
            timed.push(elapsed_ms);
            tracing::info!(loop_index = i - opts.warmup_loop_count, elapsed_ms, "bench loop");
        }
    }

    let min = timed.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = timed.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = timed.iter().sum::<f64>() / timed.len() as f64;
    tracing::info!(min_ms = min, max_ms = max, avg_ms = avg, "bench complete");
    println!("{:>20}  min = {:7.2} ms  max = {:7.2} ms  avg = {:7.2} ms", args.model_prefix, min, max, avg);

    if !opts.time_profile_path.is_empty() {
        if let Some(tp) = &time_profiler {
            write_time_profile(&PathBuf::from(&opts.time_profile_path), &tp.profiles())?;
        }
    }

    Ok(())
}
