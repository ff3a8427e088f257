//! `flexnn-profiler <model_prefix> [key=value…]` — runs the shape-only
//! dry run (spec components D+E) and writes the two profile CSVs,
//! grounded on `examples/flexnnprofile.cpp`'s CLI surface.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use flexnn::config::RunOptions;
use flexnn::dryrun::dry_run;
use flexnn::graph::Graph;
use flexnn::io::{write_memory_profile_events, write_time_profile};

#[derive(Parser, Debug)]
#[command(name = "flexnn-profiler", about = "Run the shape-only dry run and emit memory/time profile CSVs")]
struct Args {
    /// Graph is read from `<model_prefix>.param`.
    model_prefix: String,
    /// `key=value` overrides, e.g. `memory_profile_path=out/mem.csv`.
    options: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let opts = RunOptions::from_kv_pairs(&args.options)?;

    let param_path = PathBuf::from(format!("{}.param", args.model_prefix));
    let text = fs::read_to_string(&param_path)?;
    let mut graph: Graph = serde_json::from_str(&text)?;
    graph.check_invariants()?;
    graph.topo_sort()?;
    graph.infer_shapes()?;

    let result = dry_run(&graph, opts.align)?;
    tracing::info!(events = result.memory_events.len(), layers = result.time_profiles.len(), "dry run complete");

    write_memory_profile_events(&PathBuf::from(&opts.memory_profile_path), &result.memory_events)?;
    write_time_profile(&PathBuf::from(&opts.time_profile_path), &result.time_profiles)?;

    Ok(())
}
