//! Shape-only dry run (spec components D+E): walks a topologically
//! sorted, shape-inferred graph once, driving each operator through a
//! synthetic load/compute timeline while the memory and time profilers
//! record what a real kernel would allocate and how long it would take.
//! No numeric kernel runs here — `KernelRunner` is an opaque seam this
//! crate never implements concretely, so durations are estimated from
//! byte/element counts rather than measured.

use std::collections::HashMap;

use crate::errors::FlexResult;
use crate::graph::Graph;
use crate::profiler::memory::{MemoryProfiler, MemoryProfilerEvent};
use crate::profiler::time::{LayerTimeProfile, TimeProfiler, UnlockedTimeProfiler};
use crate::types::MemoryClass;

/// Crude per-byte/per-element timing constants standing in for a real
/// kernel's measured durations.
const LOADING_MS_PER_BYTE: f64 = 2.0e-6;
const COMPUTING_MS_PER_ELEMENT: f64 = 5.0e-7;

pub struct DryRunResult {
    pub memory_events: Vec<MemoryProfilerEvent>,
    pub time_profiles: Vec<LayerTimeProfile>,
}

/// Runs the dry run over every layer in topological order. `graph` must
/// already be topo-sorted and shape-inferred (`Graph::topo_sort` then
/// `Graph::infer_shapes`). Every recorded malloc size is rounded up to
/// `align` bytes, matching the memory-profile entry's documented
/// `size_aligned_to_ALIGN` field.
pub fn dry_run(graph: &Graph, align: usize) -> FlexResult<DryRunResult> {
    let memory_profiler = MemoryProfiler::new(align);
    let time_profiler = UnlockedTimeProfiler::new();
    let layer_count = graph.layers.len();

    let mut blob_ptr: HashMap<usize, u64> = HashMap::new();
    let mut t = 0.0f64;

    for i in 0..layer_count {
        let layer = &graph.layers[i];
        let input_shapes: Vec<_> = layer
            .inputs
            .iter()
            .map(|&b| {
                graph.blobs[b.0].shape.ok_or_else(|| crate::errors::FlexError::ShapeInferenceIncomplete {
                    blob_index: b.0,
                    reason: format!("blob '{}' has no shape during dry run", graph.blobs[b.0].name),
                })
            })
            .collect::<FlexResult<_>>()?;
        let weight_bytes = layer.op.weight_bytes();
        let workspace_bytes = layer.op.workspace_bytes(&input_shapes);

        let loading_begin = t;
        if weight_bytes > 0 {
            let ptr = memory_profiler.malloc(i, MemoryClass::Weight, weight_bytes);
            memory_profiler.free(i, MemoryClass::Weight, ptr);
            t += weight_bytes as f64 * LOADING_MS_PER_BYTE;
        }
        let loading_end = t;

        let computing_begin = t;
        let ws_ptr = if workspace_bytes > 0 { Some(memory_profiler.malloc(i, MemoryClass::Workspace, workspace_bytes)) } else { None };

        let mut output_elements = 0usize;
        for &out_blob in &layer.outputs {
            let shape = graph.blobs[out_blob.0].shape.ok_or_else(|| crate::errors::FlexError::ShapeInferenceIncomplete {
                blob_index: out_blob.0,
                reason: format!("blob '{}' has no shape during dry run", graph.blobs[out_blob.0].name),
            })?;
            output_elements += shape.total();
            let ptr = memory_profiler.malloc(i, MemoryClass::Blob, shape.bytes());
            blob_ptr.insert(out_blob.0, ptr);
        }
        t += (output_elements.max(1)) as f64 * COMPUTING_MS_PER_ELEMENT;
        let computing_end = t;

        if let Some(ptr) = ws_ptr {
            memory_profiler.free(i, MemoryClass::Workspace, ptr);
        }

        for &in_blob in &layer.inputs {
            if graph.blobs[in_blob.0].consumer == Some(crate::types::OperatorId(i)) {
                if let Some(ptr) = blob_ptr.remove(&in_blob.0) {
                    memory_profiler.free(i, MemoryClass::Blob, ptr);
                }
            }
        }

        time_profiler.insert(LayerTimeProfile::new(i, loading_begin, loading_end, computing_begin, computing_end));
    }

    // Network outputs: still live when the graph ends, freed one past
    // the last operator index.
    for (&blob_idx, &ptr) in blob_ptr.iter() {
        let _ = blob_idx;
        memory_profiler.free(layer_count, MemoryClass::Blob, ptr);
    }

    Ok(DryRunResult { memory_events: memory_profiler.events(), time_profiles: time_profiler.profiles() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::{InnerProduct, ReLU};
    use crate::types::Shape;

    #[test]
    fn dry_run_produces_paired_memory_events_and_monotone_time_profiles() {
        let mut graph = Graph::new();
        let input = graph.add_input("input", Shape::vec(16).with_elemsize(4));
        let fc = graph.add_layer("fc1", Box::new(InnerProduct { name: "fc1".into(), in_features: 16, out_features: 8 }), vec![input], vec!["fc1_out".into()]).unwrap();
        let fc_out = graph.layer(fc).outputs[0];
        graph.add_layer("relu1", Box::new(ReLU { name: "relu1".into() }), vec![fc_out], vec!["relu1_out".into()]).unwrap();
        graph.topo_sort().unwrap();
        graph.infer_shapes().unwrap();

        let result = dry_run(&graph, 16).unwrap();
        assert_eq!(result.time_profiles.len(), 2);
        assert!(!result.memory_events.is_empty());
        for e in result.memory_events.iter().filter(|e| e.is_malloc) {
            assert_eq!(e.size % 16, 0, "recorded malloc size must be rounded up to align");
        }

        let mem = MemoryProfiler::new(16);
        for e in &result.memory_events {
            if e.is_malloc {
                mem.malloc(e.layer_index, e.memory_type, e.size);
            }
        }
        // every malloc in the dry run has a matching free by construction
        let malloc_count = result.memory_events.iter().filter(|e| e.is_malloc).count();
        let free_count = result.memory_events.iter().filter(|e| !e.is_malloc).count();
        assert_eq!(malloc_count, free_count);
    }
}
