//! The option bundle (`RunOptions`) driving both CLI entry points and
//! direct library use, plus the scheduler's tunable constants
//! (`SchedulerParams`).

use serde::{Deserialize, Serialize};

use crate::errors::{FlexError, FlexResult};

/// The 2x/0.7x persistent-weight constants from spec.md section 9's open
/// question, exposed as fields instead of literals so tests can exercise
/// both sides of the I/O-bound gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerParams {
    /// Persistent-weight selection only runs when `total_compute <
    /// io_bound_compute_factor * total_load`.
    pub io_bound_compute_factor: f64,
    /// ...and `persistent_margin_factor * (total_weight - weight_at_peak)
    /// < max_margin`.
    pub persistent_margin_factor: f64,
    /// Default lookback window for speculative weight preloading.
    pub max_preload_count: usize,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        SchedulerParams { io_bound_compute_factor: 2.0, persistent_margin_factor: 0.7, max_preload_count: 50 }
    }
}

/// Bench feature flags toggled by the named configs in spec.md section 6
/// (`ncnn_default`, `flexnn_parallel`, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchFlags {
    pub use_ondemand_loading: bool,
    pub use_parallel_preloading: bool,
    pub use_pretransform: bool,
    pub use_memory_profiler: bool,
    pub use_winograd_convolution: bool,
    pub use_sgemm_convolution: bool,
}

/// The full option bundle threaded through the CLI surfaces and the
/// library's top-level entry points. Loadable either from `key=value` CLI
/// pairs (as spec.md section 6 describes for `profiler`/`bench`) or from a
/// small TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub num_threads: usize,
    pub input_shape: Vec<usize>,
    pub memory_profile_path: String,
    pub time_profile_path: String,
    pub vocab_path: Option<String>,
    pub memory_budget: usize,
    pub skip_layer_count: usize,
    pub max_preload_count: usize,
    /// Platform alignment: 16 or 64 bytes.
    pub align: usize,
    pub scheduler: SchedulerParams,
    pub bench: BenchFlags,
    /// `flexnn-bench` only: a malloc-plan file to load into the planned
    /// allocator before replaying sessions. No plan means every class
    /// replays against an empty offset list (every `fast_malloc` errors),
    /// matching the teacher's "only wire the planned allocator in when a
    /// plan path is given" branch.
    pub malloc_plan_path: Option<String>,
    /// `flexnn-bench` only: a layer-dependency file driving the executor's
    /// preload scheduling.
    pub layer_dependency_path: Option<String>,
    /// `flexnn-bench` only: warm-up iterations run and discarded before
    /// timing begins.
    pub warmup_loop_count: usize,
    /// `flexnn-bench` only: timed iterations averaged into the report.
    pub loop_count: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            num_threads: 1,
            input_shape: vec![1, 3, 224, 224],
            memory_profile_path: "memory_profile.csv".into(),
            time_profile_path: "time_profile.csv".into(),
            vocab_path: None,
            memory_budget: 64 * 1024 * 1024,
            skip_layer_count: 1,
            max_preload_count: 50,
            align: 16,
            scheduler: SchedulerParams::default(),
            bench: BenchFlags::default(),
            malloc_plan_path: None,
            layer_dependency_path: None,
            warmup_loop_count: 4,
            loop_count: 8,
        }
    }
}

impl RunOptions {
    /// Parses `key=value` CLI pairs over a default bundle. Unknown keys
    /// are rejected rather than silently ignored, matching the strict
    /// `sscanf`-style parsing in the original's option reader.
    pub fn from_kv_pairs(pairs: &[String]) -> FlexResult<Self> {
        let mut opts = RunOptions::default();
        for pair in pairs {
            let (key, value) = pair.split_once('=').ok_or_else(|| FlexError::CsvFormat(format!("malformed option '{pair}', expected key=value")))?;
            opts.apply_kv(key, value)?;
        }
        Ok(opts)
    }

    fn apply_kv(&mut self, key: &str, value: &str) -> FlexResult<()> {
        let parse_usize = |v: &str| -> FlexResult<usize> {
            v.parse().map_err(|source| FlexError::ParseFailure { field: key.to_string(), context: v.to_string(), source })
        };
        match key {
            "num_threads" => self.num_threads = parse_usize(value)?,
            "memory_budget" => self.memory_budget = parse_usize(value)?,
            "skip_layer_count" => self.skip_layer_count = parse_usize(value)?,
            "max_preload_count" => self.max_preload_count = parse_usize(value)?,
            "align" => self.align = parse_usize(value)?,
            "memory_profile_path" => self.memory_profile_path = value.to_string(),
            "time_profile_path" => self.time_profile_path = value.to_string(),
            "vocab_path" => self.vocab_path = Some(value.to_string()),
            "malloc_plan_path" => self.malloc_plan_path = Some(value.to_string()),
            "layer_dependency_path" => self.layer_dependency_path = Some(value.to_string()),
            "warmup_loop_count" => self.warmup_loop_count = parse_usize(value)?,
            "loop_count" => self.loop_count = parse_usize(value)?,
            "config" => {
                self.bench = named_bench_config(value).ok_or_else(|| FlexError::CsvFormat(format!("unknown bench config '{value}'")))?;
            }
            "input_shape" => {
                self.input_shape = value
                    .split(',')
                    .map(|d| d.parse::<usize>().map_err(|source| FlexError::ParseFailure { field: "input_shape".into(), context: d.to_string(), source }))
                    .collect::<FlexResult<_>>()?;
            }
            "use_ondemand_loading" => self.bench.use_ondemand_loading = value == "1" || value == "true",
            "use_parallel_preloading" => self.bench.use_parallel_preloading = value == "1" || value == "true",
            "use_pretransform" => self.bench.use_pretransform = value == "1" || value == "true",
            "use_memory_profiler" => self.bench.use_memory_profiler = value == "1" || value == "true",
            "use_winograd_convolution" => self.bench.use_winograd_convolution = value == "1" || value == "true",
            "use_sgemm_convolution" => self.bench.use_sgemm_convolution = value == "1" || value == "true",
            other => return Err(FlexError::CsvFormat(format!("unrecognised option key '{other}'"))),
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> FlexResult<Self> {
        toml::from_str(s).map_err(|e| FlexError::CsvFormat(format!("invalid config TOML: {e}")))
    }
}

/// The named bench configs from spec.md section 6, each a fixed
/// combination of `BenchFlags`.
pub fn named_bench_config(name: &str) -> Option<BenchFlags> {
    let f = |ondemand: bool, parallel: bool, pretransform: bool, profiler: bool, winograd: bool, sgemm: bool| BenchFlags {
        use_ondemand_loading: ondemand,
        use_parallel_preloading: parallel,
        use_pretransform: pretransform,
        use_memory_profiler: profiler,
        use_winograd_convolution: winograd,
        use_sgemm_convolution: sgemm,
    };
    match name {
        "ncnn_default" => Some(f(false, false, false, false, true, false)),
        "ncnn_ondemand" => Some(f(true, false, false, false, true, false)),
        "ncnn_parallel" => Some(f(true, true, false, false, true, false)),
        "ncnn_direct_conv" => Some(f(false, false, false, false, false, false)),
        "flexnn_profile" => Some(f(true, true, true, true, true, false)),
        "flexnn_ondemand" => Some(f(true, false, true, false, true, false)),
        "flexnn_parallel" => Some(f(true, true, true, false, true, false)),
        "ncnn_ondemand_gemm" => Some(f(true, false, false, false, false, true)),
        "ncnn_default_gemm" => Some(f(false, false, false, false, false, true)),
        "ncnn_ondemand_direct" => Some(f(true, false, false, false, false, false)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_pairs_override_defaults() {
        let opts = RunOptions::from_kv_pairs(&["num_threads=4".into(), "align=64".into(), "input_shape=1,3,32,32".into()]).unwrap();
        assert_eq!(opts.num_threads, 4);
        assert_eq!(opts.align, 64);
        assert_eq!(opts.input_shape, vec![1, 3, 32, 32]);
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(RunOptions::from_kv_pairs(&["bogus=1".into()]).is_err());
    }

    #[test]
    fn config_key_applies_named_bench_flags() {
        let opts = RunOptions::from_kv_pairs(&["config=flexnn_parallel".into()]).unwrap();
        assert_eq!(opts.bench, named_bench_config("flexnn_parallel").unwrap());
        assert!(RunOptions::from_kv_pairs(&["config=nonexistent".into()]).is_err());
    }

    #[test]
    fn named_configs_cover_spec_list() {
        for name in ["ncnn_default", "ncnn_ondemand", "ncnn_parallel", "ncnn_direct_conv", "flexnn_profile", "flexnn_ondemand", "flexnn_parallel", "ncnn_ondemand_gemm", "ncnn_default_gemm", "ncnn_ondemand_direct"] {
            assert!(named_bench_config(name).is_some(), "missing bench config {name}");
        }
        assert!(named_bench_config("nonexistent").is_none());
    }
}
