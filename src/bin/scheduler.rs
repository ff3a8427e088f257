//! `flexnn-scheduler <mem_profile> <time_profile> <malloc_plan_out>
//! <dep_out> <budget> [<skip> <layout_out>]` — runs the scheduler (spec
//! component G), grounded on `examples/flexnnschedule.h`'s CLI driver.

use std::path::PathBuf;

use clap::Parser;
use flexnn::config::SchedulerParams;
use flexnn::io::{read_memory_profile_events, read_time_profile, write_layer_dependencies, write_malloc_plan, write_memory_layout};
use flexnn::profiler::memory::MemoryProfiler;
use flexnn::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "flexnn-scheduler", about = "Pack operator lifetimes into a malloc plan and layer-dependency vector")]
struct Args {
    mem_profile: PathBuf,
    time_profile: PathBuf,
    malloc_plan_out: PathBuf,
    dep_out: PathBuf,
    budget: usize,
    /// Operators before this index are assumed preloaded; defaults to 1.
    skip: Option<usize>,
    /// Optional debug memory-layout dump.
    layout_out: Option<PathBuf>,
    /// Platform alignment in bytes.
    #[arg(long, default_value_t = 16)]
    align: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let events = read_memory_profile_events(&args.mem_profile)?;
    let memory_profiles = MemoryProfiler::from_events(events).profiles();

    let time_profiles = read_time_profile(&args.time_profile)?;
    let layer_count = time_profiles.len();
    let skip_layer_count = args.skip.unwrap_or(1);

    let scheduler = Scheduler::new(SchedulerParams::default(), args.align, skip_layer_count);
    let result = scheduler.schedule(&memory_profiles, &time_profiles, layer_count, args.budget)?;

    tracing::info!(predicted_latency_ms = result.predicted_latency_ms, "scheduling complete");

    write_malloc_plan(&args.malloc_plan_out, &result.plan)?;
    write_layer_dependencies(&args.dep_out, &result.dependencies)?;
    if let Some(layout_path) = &args.layout_out {
        write_memory_layout(layout_path, &result.placements)?;
    }

    Ok(())
}
