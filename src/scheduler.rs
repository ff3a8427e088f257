//! Space-time placement: turns a memory + time profile set into a malloc
//! plan, a layer-dependency vector, and optionally a set of
//! persistent-weight offsets. Grounded on `examples/flexnnschedule.h`'s
//! `schedule_naive`/`resolve_layer_dependencies`/`predict_latency`.

use std::collections::HashMap;

use crate::config::SchedulerParams;
use crate::errors::{FlexError, FlexResult};
use crate::profiler::{LayerTimeProfile, MemoryProfiler};
use crate::types::MemoryClass;
use crate::xyplane::XyPlane;

fn align_up(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}

fn align_down(v: usize, align: usize) -> usize {
    (v / align) * align
}

/// One scheduled allocation: a `MemoryProfile` plus the `(x, y)` placement
/// decision. `x` is the operator index at which the region becomes live
/// (`x <= start_layer_index` for preloaded weights); `y` is its offset.
#[derive(Debug, Clone, Copy)]
pub struct PlacedProfile {
    pub memory_type: MemoryClass,
    pub malloc_count: usize,
    pub size: usize,
    pub start_layer_index: usize,
    pub end_layer_index: usize,
    pub x: usize,
    pub y: usize,
}

/// The ordered malloc plan: per-class offset sequences, replayed in FIFO
/// order by the planned allocator, plus the fixed persistent offsets
/// selected in Step 2.
#[derive(Debug, Clone, Default)]
pub struct MallocPlan {
    pub weight: Vec<usize>,
    pub blob: Vec<usize>,
    pub workspace: Vec<usize>,
    pub persistent: Vec<usize>,
}

/// The full result of one scheduling run.
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    pub plan: MallocPlan,
    pub dependencies: Vec<usize>,
    pub placements: Vec<PlacedProfile>,
    pub predicted_latency_ms: f64,
}

pub struct Scheduler {
    pub params: SchedulerParams,
    pub align: usize,
    pub skip_layer_count: usize,
}

impl Scheduler {
    pub fn new(params: SchedulerParams, align: usize, skip_layer_count: usize) -> Self {
        Scheduler { params, align, skip_layer_count }
    }

    /// Runs the full pipeline: peak estimation, persistent-weight
    /// selection, dynamic XY-plane placement, dependency derivation,
    /// malloc-plan emission and predicted-latency simulation.
    #[tracing::instrument(skip(self, memory_profiles, time_profiles), fields(layer_count, memory_budget))]
    pub fn schedule(&self, memory_profiles: &[crate::profiler::memory::MemoryProfile], time_profiles: &[LayerTimeProfile], layer_count: usize, memory_budget: usize) -> FlexResult<ScheduleResult> {
        let weights: Vec<_> = memory_profiles.iter().filter(|p| p.memory_type == MemoryClass::Weight).copied().collect();
        let blobs: Vec<_> = memory_profiles.iter().filter(|p| p.memory_type == MemoryClass::Blob).copied().collect();
        let workspaces: Vec<_> = memory_profiles.iter().filter(|p| p.memory_type == MemoryClass::Workspace).copied().collect();

        // --- Step 1: peak estimation ---
        let mut layer_memory = vec![0usize; layer_count];
        let mut layer_weight_memory = vec![0usize; layer_count];
        let mut total_weight_memory = 0usize;
        for p in memory_profiles {
            for i in p.start_layer_index..=p.end_layer_index.min(layer_count.saturating_sub(1)) {
                layer_memory[i] += p.size;
                if p.memory_type == MemoryClass::Weight {
                    layer_weight_memory[i] += p.size;
                    total_weight_memory += p.size;
                }
            }
        }
        let (peak_index, peak_memory) = layer_memory.iter().enumerate().fold((0usize, 0usize), |(bi, bv), (i, &v)| if v >= bv { (i, v) } else { (bi, bv) });
        if peak_memory > memory_budget {
            return Err(FlexError::SchedulingInfeasible { budget: memory_budget, reason: format!("peak usage {peak_memory} exceeds budget at layer {peak_index}") });
        }
        let max_memory_margin = memory_budget - peak_memory;
        tracing::info!(peak_memory, peak_index, max_memory_margin, "peak estimation complete");

        // --- Step 2: persistent-weight selection ---
        let total_compute: f64 = time_profiles.iter().map(|t| t.computing_duration).sum();
        let total_load: f64 = time_profiles.iter().map(|t| t.loading_duration).sum();
        let io_bound = total_compute < self.params.io_bound_compute_factor * total_load;
        let margin_ok = self.params.persistent_margin_factor * (total_weight_memory.saturating_sub(layer_weight_memory[peak_index])) as f64 <= max_memory_margin as f64;

        let mut scores: Vec<(usize, i64)> = weights
            .iter()
            .enumerate()
            .map(|(idx, p)| {
                let peak = peak_index as i64;
                let start = p.start_layer_index as i64;
                let end = p.end_layer_index as i64;
                let score = if start <= peak && end >= peak { (peak - start).max(end - peak) } else { (start - peak).abs().min((end - peak).abs()) };
                (idx, score)
            })
            .collect();

        let mut persistent_weights: HashMap<usize, usize> = HashMap::new();
        if io_bound && margin_ok {
            // Highest-score (most peak-adjacent) weights are reserved
            // first: they are the ones dynamic placement would otherwise
            // have to keep shuffling around the peak.
            scores.sort_by(|a, b| b.1.cmp(&a.1));
            let mut persistent_offset = align_down(memory_budget, self.align);
            let persistent_min_offset = align_up(memory_budget - max_memory_margin, self.align);
            for &(idx, _) in &scores {
                let size = weights[idx].size;
                if persistent_offset < size {
                    continue;
                }
                let next_offset = align_down(persistent_offset - size, self.align);
                if next_offset < persistent_min_offset {
                    continue;
                }
                persistent_offset = next_offset;
                persistent_weights.insert(idx, persistent_offset);
            }
            tracing::info!(selected = persistent_weights.len(), "persistent weights selected");
        }

        let dynamic_budget = if let Some(&min_offset) = persistent_weights.values().min() { align_down(min_offset, self.align) } else { align_down(memory_budget, self.align) };

        // --- Step 3: dynamic placement ---
        let mut plane = XyPlane::new(layer_count, dynamic_budget, self.align);
        let mut placements: Vec<PlacedProfile> = Vec::with_capacity(memory_profiles.len());

        // Blobs first, packed against the left (even producer) or right
        // (odd producer) side of the buffer.
        let mut left = 0usize;
        let mut right = dynamic_budget;
        let mut layer_cursor = 0usize;
        for blob in &blobs {
            if blob.start_layer_index > layer_cursor {
                layer_cursor = blob.start_layer_index;
                let mut next_left = 0usize;
                let mut next_right = dynamic_budget;
                for placed in &placements {
                    if placed.memory_type != MemoryClass::Blob || placed.end_layer_index < layer_cursor {
                        continue;
                    }
                    if placed.start_layer_index % 2 == 0 {
                        next_left = next_left.max(placed.y + placed.size);
                    } else {
                        next_right = next_right.min(placed.y);
                    }
                }
                left = next_left;
                right = next_right;
            }

            let dy = align_up(blob.size, self.align);
            let y = if layer_cursor % 2 == 0 {
                let y = align_up(left, self.align);
                left = y + dy;
                y
            } else {
                let y = align_down(right.saturating_sub(dy), self.align);
                right = y;
                y
            };
            plane
                .insert_xrange_y(blob.start_layer_index, blob.end_layer_index, y, dy)
                .map_err(|e| FlexError::SchedulingInfeasible { budget: memory_budget, reason: format!("blob placement failed: {e}") })?;
            placements.push(PlacedProfile { memory_type: blob.memory_type, malloc_count: blob.malloc_count, size: dy, start_layer_index: blob.start_layer_index, end_layer_index: blob.end_layer_index, x: blob.start_layer_index, y });
        }

        let mut weight_cursor = 0usize;
        let mut workspace_cursor = 0usize;
        let mut loading_x = 0usize;

        for i in 0..layer_count {
            plane.backup();
            let weight_backup = weight_cursor;
            let workspace_backup = workspace_cursor;
            let loading_x_backup = loading_x;
            let placements_backup_len = placements.len();

            let result = self.place_weights_and_workspaces(&mut plane, &weights, &workspaces, &persistent_weights, i, self.params.max_preload_count, &mut weight_cursor, &mut workspace_cursor, &mut loading_x, &mut placements);

            if result.is_err() {
                plane.restore();
                weight_cursor = weight_backup;
                workspace_cursor = workspace_backup;
                loading_x = loading_x_backup;
                placements.truncate(placements_backup_len);

                // Retry with no preloading: start exactly at this
                // operator instead of `loading_x`.
                let retry = self.place_weights_and_workspaces(&mut plane, &weights, &workspaces, &persistent_weights, i, 0, &mut weight_cursor, &mut workspace_cursor, &mut loading_x, &mut placements);
                if retry.is_err() {
                    tracing::error!(layer = i, budgets = ?plane.save_budgets(), payouts = ?plane.save_payouts(), "scheduling infeasible");
                    return Err(FlexError::SchedulingInfeasible { budget: memory_budget, reason: format!("no placement for layer {i} even without preloading") });
                }
            }
        }

        // --- Step 4: dependency vector ---
        let dependencies = self.resolve_dependencies(&placements, layer_count)?;

        // --- Step 5: emit malloc plan ---
        let mut sorted = placements.clone();
        sorted.sort_by_key(|p| (p.x, p.memory_type.as_index(), p.malloc_count));
        let mut plan = MallocPlan::default();
        for p in &sorted {
            match p.memory_type {
                MemoryClass::Weight => plan.weight.push(p.y),
                MemoryClass::Blob => plan.blob.push(p.y),
                MemoryClass::Workspace => plan.workspace.push(p.y),
            }
        }
        let mut persistent_sorted: Vec<(usize, usize)> = persistent_weights.into_iter().collect();
        persistent_sorted.sort_by_key(|&(idx, _)| idx);
        plan.persistent = persistent_sorted.iter().map(|&(_, offset)| offset).collect();

        // --- Step 6: predicted latency ---
        let predicted_latency_ms = self.predict_latency(time_profiles, &dependencies);

        Ok(ScheduleResult { plan, dependencies, placements: sorted, predicted_latency_ms })
    }

    #[allow(clippy::too_many_arguments)]
    fn place_weights_and_workspaces(
        &self,
        plane: &mut XyPlane,
        weights: &[crate::profiler::memory::MemoryProfile],
        workspaces: &[crate::profiler::memory::MemoryProfile],
        persistent_weights: &HashMap<usize, usize>,
        layer: usize,
        preload_lookback: usize,
        weight_cursor: &mut usize,
        workspace_cursor: &mut usize,
        loading_x: &mut usize,
        placements: &mut Vec<PlacedProfile>,
    ) -> Result<(), ()> {
        while *weight_cursor < weights.len() && weights[*weight_cursor].start_layer_index <= layer {
            let idx = *weight_cursor;
            let profile = weights[idx];
            let dy = align_up(profile.size, self.align);

            if let Some(&offset) = persistent_weights.get(&idx) {
                placements.push(PlacedProfile { memory_type: MemoryClass::Weight, malloc_count: profile.malloc_count, size: dy, start_layer_index: profile.start_layer_index, end_layer_index: profile.end_layer_index, x: *loading_x, y: offset });
                *weight_cursor += 1;
                continue;
            }

            *loading_x = (*loading_x).max(profile.start_layer_index.saturating_sub(preload_lookback));
            let (xs, y) = plane.insert_xrange(*loading_x, profile.end_layer_index, dy).map_err(|_| ())?;
            placements.push(PlacedProfile { memory_type: MemoryClass::Weight, malloc_count: profile.malloc_count, size: dy, start_layer_index: profile.start_layer_index, end_layer_index: profile.end_layer_index, x: xs, y });
            *loading_x = xs;
            *weight_cursor += 1;
        }

        while *workspace_cursor < workspaces.len() && workspaces[*workspace_cursor].start_layer_index <= layer {
            let profile = workspaces[*workspace_cursor];
            let dy = align_up(profile.size, self.align);
            let (xs, y) = plane.insert_xrange(profile.start_layer_index, profile.end_layer_index, dy).map_err(|_| ())?;
            placements.push(PlacedProfile { memory_type: MemoryClass::Workspace, malloc_count: profile.malloc_count, size: dy, start_layer_index: profile.start_layer_index, end_layer_index: profile.end_layer_index, x: xs, y });
            *workspace_cursor += 1;
        }

        Ok(())
    }

    /// `last_layer_before_loading[start] = max over weights starting there
    /// of (x - 1)`; then `dep[last-1] = min(dep[last-1], start)`; then a
    /// backward pass enforces monotonicity. Rejects `dep[i] == i+1`.
    fn resolve_dependencies(&self, placements: &[PlacedProfile], layer_count: usize) -> FlexResult<Vec<usize>> {
        let mut last_layer_before_loading: Vec<isize> = vec![-1; layer_count];
        for p in placements.iter().filter(|p| p.memory_type == MemoryClass::Weight) {
            let entry = &mut last_layer_before_loading[p.start_layer_index];
            *entry = (*entry).max(p.x as isize - 1);
        }

        let mut dep = vec![layer_count; layer_count];
        for d in dep.iter_mut().take(self.skip_layer_count) {
            *d = self.skip_layer_count + 1;
        }

        for i in 0..layer_count {
            let l = last_layer_before_loading[i];
            if l < self.skip_layer_count as isize {
                continue;
            }
            let slot = (l - 1) as usize;
            dep[slot] = dep[slot].min(i);
        }

        for i in (1..layer_count).rev() {
            dep[i - 1] = dep[i].min(dep[i - 1]);
        }

        for (i, &d) in dep.iter().enumerate().take(layer_count.saturating_sub(1)) {
            if d == i + 1 {
                return Err(FlexError::DependencyInvariantFailure { layer: i, reason: format!("layer {i} depends on the immediately next layer {}", i + 1) });
            }
        }
        Ok(dep)
    }

    /// Simulates execution with two cursors (`t_load`, `t_compute`) to
    /// verify the plan's predicted latency before committing to it.
    pub fn predict_latency(&self, time_profiles: &[LayerTimeProfile], dependencies: &[usize]) -> f64 {
        let layer_count = time_profiles.len();
        if layer_count == 0 || self.skip_layer_count >= layer_count {
            return 0.0;
        }
        let mut loading_end = vec![0.0f64; layer_count];
        let mut t_load = 0.0f64;
        let mut t_compute = 0.0f64;

        t_load += time_profiles[self.skip_layer_count].loading_duration;
        loading_end[self.skip_layer_count] = t_load;

        for i in self.skip_layer_count..layer_count {
            t_compute = t_compute.max(loading_end[i]);
            t_compute += time_profiles[i].computing_duration;

            if i == 0 {
                continue;
            }
            let start = dependencies[i - 1];
            let end = dependencies[i];
            for j in start..end.min(layer_count) {
                t_load += time_profiles[j].loading_duration;
                loading_end[j] = t_load;
            }
        }
        t_compute
    }
}

/// Convenience wrapper combining a `MemoryProfiler`'s collected profiles
/// with a time-profile slice for one `Scheduler::schedule` call.
pub fn schedule_from_profiler(scheduler: &Scheduler, memory_profiler: &MemoryProfiler, time_profiles: &[LayerTimeProfile], layer_count: usize, memory_budget: usize) -> FlexResult<ScheduleResult> {
    let profiles = memory_profiler.profiles();
    scheduler.schedule(&profiles, time_profiles, layer_count, memory_budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::memory::MemoryProfile;

    fn profile(class: MemoryClass, count: usize, size: usize, start: usize, end: usize) -> MemoryProfile {
        MemoryProfile { memory_type: class, malloc_count: count, size, start_layer_index: start, end_layer_index: end, x: None, y: None }
    }

    #[test]
    fn io_bound_chain_selects_persistent_weight() {
        // S3: 5-operator chain, compute=[0,10,10,10,0] ms, load=[0,30,30,30,0] ms,
        // budget exactly 2x peak.
        let memory_profiles = vec![
            profile(MemoryClass::Weight, 0, 100, 1, 1),
            profile(MemoryClass::Weight, 1, 100, 2, 2),
            profile(MemoryClass::Weight, 2, 100, 3, 3),
            profile(MemoryClass::Blob, 0, 50, 0, 4),
        ];
        let time_profiles: Vec<LayerTimeProfile> = [0.0, 10.0, 10.0, 10.0, 0.0]
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let load = if i == 0 || i == 4 { 0.0 } else { 30.0 };
                LayerTimeProfile::new(i, 0.0, load, 0.0, c)
            })
            .collect();
        let scheduler = Scheduler::new(SchedulerParams::default(), 16, 1);
        let peak = 100 * 3 + 50;
        let budget = peak * 2;
        let result = scheduler.schedule(&memory_profiles, &time_profiles, 5, budget).unwrap();
        assert!(!result.plan.persistent.is_empty(), "expected at least one persistent weight for the IO-bound scenario");
    }

    #[test]
    fn compute_bound_chain_selects_no_persistent_weight() {
        let memory_profiles = vec![profile(MemoryClass::Weight, 0, 100, 1, 1), profile(MemoryClass::Weight, 1, 100, 2, 2), profile(MemoryClass::Weight, 2, 100, 3, 3), profile(MemoryClass::Blob, 0, 50, 0, 4)];
        let time_profiles: Vec<LayerTimeProfile> = [0.0, 30.0, 30.0, 30.0, 0.0]
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let load = if i == 0 || i == 4 { 0.0 } else { 10.0 };
                LayerTimeProfile::new(i, 0.0, load, 0.0, c)
            })
            .collect();
        let scheduler = Scheduler::new(SchedulerParams::default(), 16, 1);
        let budget = (100 * 3 + 50) * 2;
        let result = scheduler.schedule(&memory_profiles, &time_profiles, 5, budget).unwrap();
        assert!(result.plan.persistent.is_empty(), "compute-bound scenario should not select persistent weights");
    }

    #[test]
    fn dependency_vector_is_monotone_and_never_points_to_next_layer() {
        let memory_profiles = vec![profile(MemoryClass::Weight, 0, 16, 2, 2), profile(MemoryClass::Blob, 0, 16, 0, 3)];
        let time_profiles: Vec<LayerTimeProfile> = (0..4).map(|i| LayerTimeProfile::new(i, 0.0, 5.0, 0.0, 5.0)).collect();
        let scheduler = Scheduler::new(SchedulerParams::default(), 16, 1);
        let result = scheduler.schedule(&memory_profiles, &time_profiles, 4, 4096).unwrap();
        for w in result.dependencies.windows(2) {
            assert!(w[0] <= w[1]);
        }
        for (i, &d) in result.dependencies.iter().enumerate().take(result.dependencies.len() - 1) {
            assert_ne!(d, i + 1);
        }
    }
}
