//! Rewrites operators whose transient memory footprint exceeds a
//! per-operator budget into a `Split -> {op, op, ...} -> Concat`
//! subgraph, then picks each surviving convolution's runtime weight
//! layout. Grounded on `examples/flexnnslice.h`'s `slice_innerproduct`/
//! `slice_convolution`/`transform_kernel_convolution` family.

use std::collections::HashSet;

use crate::errors::{FlexError, FlexResult};
use crate::graph::ops::{Concat, ConcatAxis, ConvLayout, Convolution, InnerProduct, Split};
use crate::graph::{Blob, Graph};
use crate::types::{BlobId, OperatorId, Shape};

/// Per-operator-kind memory budgets, in bytes (as a CLI would hand them
/// in), holding `max_data_size` *elements* once converted — the original
/// CLI's `<conv_sz> <fc_sz>` arguments are bytes divided by 4 (the f32
/// element size) before reaching the slicing algorithms themselves.
#[derive(Debug, Clone, Copy)]
pub struct SliceCeilings {
    pub conv_ceiling: usize,
    pub fc_ceiling: usize,
}

impl Default for SliceCeilings {
    fn default() -> Self {
        // The original CLI's own hardcoded defaults (`max_fc_size` /
        // `max_conv_size` = 5e7) are already element counts, not bytes —
        // they only get the `/4` treatment when overridden from argv.
        SliceCeilings { conv_ceiling: 50_000_000, fc_ceiling: 50_000_000 }
    }
}

impl SliceCeilings {
    pub fn conv_budget_elems(&self) -> usize {
        self.conv_ceiling
    }

    pub fn fc_budget_elems(&self) -> usize {
        self.fc_ceiling
    }
}

/// Slices every oversize, splittable operator in `graph`, re-runs
/// topological sort + shape inference, then picks each surviving
/// convolution's pretransform layout against the same conv budget.
/// Returns the number of layers rewritten by slicing.
pub fn slice_graph(graph: &mut Graph, ceilings: SliceCeilings) -> FlexResult<usize> {
    let mut rewritten = 0;
    let mut retired: HashSet<usize> = HashSet::new();
    // Iterate only over layers present before any slicing began; fresh
    // fragments appended during the pass are always within budget by
    // construction and never need re-slicing.
    let original_len = graph.layers.len();
    for i in 0..original_len {
        let op = &graph.layers[i].op;
        if !op.is_splittable() {
            continue;
        }
        let sliced = match op.kind() {
            "InnerProduct" => slice_inner_product_if_oversize(graph, OperatorId(i), ceilings.fc_budget_elems())?,
            "Convolution" => slice_convolution_if_oversize(graph, OperatorId(i), ceilings.conv_budget_elems())?,
            _ => false,
        };
        if sliced {
            retired.insert(i);
            rewritten += 1;
        }
    }

    if !retired.is_empty() {
        compact(graph, &retired);
    }
    graph.topo_sort()?;
    graph.infer_shapes()?;
    pretransform_convolutions(graph, ceilings.conv_budget_elems())?;
    Ok(rewritten)
}

/// Splits `total` into slices of `slice_size` each, the last one taking
/// the remainder — the original's uniform `max_size`-per-slice pattern
/// (not an even split), shared by both InnerProduct and Convolution
/// slicing.
fn uniform_slices(total: usize, slice_size: usize) -> Vec<usize> {
    let num_slice = total.div_ceil(slice_size);
    let remainder = total % slice_size;
    (0..num_slice).map(|i| if i == num_slice - 1 && remainder > 0 { remainder } else { slice_size }).collect()
}

/// `N_max` is the largest per-slice `out_features` such that
/// `N_max * (1 + in_features) + in_features <= budget` (elements),
/// i.e. `N_max = floor((budget - in_features) / (1 + in_features))`,
/// grounded on `slice_innerproduct`'s `max_size = (max_data_size - insz)
/// / (1 + insz)`.
fn inner_product_n_max(operator: &str, in_features: usize, budget_elems: usize) -> FlexResult<usize> {
    if budget_elems <= in_features {
        return Err(FlexError::SlicingFailure {
            operator: operator.to_string(),
            reason: format!("budget of {budget_elems} elements cannot even hold in_features {in_features}"),
        });
    }
    let n_max = (budget_elems - in_features) / (1 + in_features);
    if n_max == 0 {
        return Err(FlexError::SlicingFailure {
            operator: operator.to_string(),
            reason: format!("budget of {budget_elems} elements is too small for in_features {in_features} to ever fit"),
        });
    }
    Ok(n_max)
}

fn slice_inner_product_if_oversize(graph: &mut Graph, target: OperatorId, budget_elems: usize) -> FlexResult<bool> {
    let layer = &graph.layers[target.0];
    let op = layer
        .op
        .as_any()
        .downcast_ref::<InnerProduct>()
        .ok_or_else(|| FlexError::SlicingFailure { operator: layer.name.clone(), reason: "expected InnerProduct".into() })?
        .clone();

    let n_max = inner_product_n_max(&op.name, op.in_features, budget_elems)?;
    if op.out_features <= n_max {
        return Ok(false);
    }

    let per_slice = uniform_slices(op.out_features, n_max);
    let input = layer.inputs[0];
    let output = layer.outputs[0];
    let base_name = layer.name.clone();

    splice_layers(graph, input, output, per_slice.len(), ConcatAxis::Width, |idx| {
        Box::new(InnerProduct { name: format!("{base_name}/slice{idx}"), in_features: op.in_features, out_features: per_slice[idx] })
    })?;
    Ok(true)
}

/// F(x,3) Winograd tile block side length in elements: `(x+2)^2`.
fn winograd_block_elems(x: usize) -> usize {
    (x + 2) * (x + 2)
}

fn winograd_tiles(out_w: usize, out_h: usize, x: usize) -> usize {
    out_w.div_ceil(x) * out_h.div_ceil(x)
}

/// Approximates `get_size_convolution`/`get_slice_outch_convolution`'s
/// Winograd transform-buffer estimate: `AT` (transformed weights) +
/// `BT` (transformed input tiles) + `top_tileX` (transformed output
/// tiles) on top of the untransformed input/output blobs. The original
/// derives `AT`/`BT`/`top_tileX`'s tile dimensions from ncnn's
/// `conv3x3s1_winograd_get_optimal_tile_mnk` GEMM tile-size search; with
/// no numeric kernel in this crate to supply that helper, tiling is
/// collapsed to a single block (`TILE_* == M/N/K`), which is the same
/// `B*K*M` / `B*K*N` / `N*B*M` layout the original uses, just untiled.
/// `in_total`/`out_total` stay fixed across a channel search (mirroring
/// the original, which captures them once before the search loop).
fn winograd_buffer_elems(m: usize, n: usize, k: usize, b: usize, in_total: usize, out_total: usize) -> usize {
    let at = b * k * m;
    let bt = b * k * n;
    let top_tile_x = n * b * m;
    in_total + at + bt + top_tile_x + out_total
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WinogradVariant {
    F63,
    F43,
}

impl WinogradVariant {
    fn tile_x(self) -> usize {
        match self {
            WinogradVariant::F63 => 6,
            WinogradVariant::F43 => 4,
        }
    }
}

/// Searches descending candidate output-channel counts — starting at
/// `(out_c + 1) / 2`, halving each step, aligned up to 8 — for the
/// largest one whose Winograd buffer estimate fits `budget_elems`.
/// Ports `get_slice_outch_convolution`'s search loop verbatim, including
/// its quirk of holding `in_total`/`out_total` fixed at the full tensor
/// size throughout the search (only the `M` dimension, i.e. the
/// candidate channel count, actually shrinks the estimate).
fn search_winograd_outch(variant: WinogradVariant, out_c: usize, in_c: usize, in_total: usize, out_w: usize, out_h: usize, out_total: usize, budget_elems: usize) -> Option<usize> {
    let x = variant.tile_x();
    let b = winograd_block_elems(x);
    let n = winograd_tiles(out_w, out_h, x);
    let mut ch = (out_c + 1) / 2;
    while ch >= 8 {
        ch = ch.div_ceil(8) * 8;
        let size = winograd_buffer_elems(ch, n, in_c, b, in_total, out_total);
        if size < budget_elems {
            return Some(ch);
        }
        ch -= ch / 2;
    }
    None
}

/// 3x3 stride-1 convolution with both `in_c >= 8` and `out_c >= 8`:
/// estimate Winograd F(6,3) (or F(4,3) once either channel count passes
/// 128, where F(6,3)'s larger transform block stops paying off) and, if
/// the full-channel estimate is oversize, search for the largest
/// 8-aligned output-channel count that fits, splitting along output
/// channels with the same Split/Concat pattern as InnerProduct.
fn slice_convolution_if_oversize(graph: &mut Graph, target: OperatorId, budget_elems: usize) -> FlexResult<bool> {
    let layer = &graph.layers[target.0];
    let op = layer
        .op
        .as_any()
        .downcast_ref::<Convolution>()
        .ok_or_else(|| FlexError::SlicingFailure { operator: layer.name.clone(), reason: "expected Convolution".into() })?
        .clone();

    if !(op.kernel == 3 && op.stride == 1 && op.c_in >= 8 && op.c_out >= 8) {
        // Other kernels (and 3x3 stride-1 with fewer than 8 channels)
        // are left as-is; the pretransform stage decides at runtime
        // whether Winograd / im2col-GEMM / direct is used.
        return Ok(false);
    }

    let input = layer.inputs[0];
    let output = layer.outputs[0];
    let in_shape = shape_of(graph, input, &op.name)?;
    let out_shape = shape_of(graph, output, &op.name)?;

    let variant = if op.c_in > 128 || op.c_out > 128 { WinogradVariant::F43 } else { WinogradVariant::F63 };
    let x = variant.tile_x();
    let tiles = winograd_tiles(out_shape.w, out_shape.h, x);
    let full_size = winograd_buffer_elems(op.c_out, tiles, op.c_in, winograd_block_elems(x), in_shape.total(), out_shape.total());
    if full_size < budget_elems {
        return Ok(false);
    }

    let max_ch = search_winograd_outch(variant, op.c_out, op.c_in, in_shape.total(), out_shape.w, out_shape.h, out_shape.total(), budget_elems);
    let max_ch = match (variant, max_ch) {
        (_, None) => return Ok(false),
        (WinogradVariant::F63, Some(ch)) => ch,
        // The original only actually slices the F(4,3) branch when the
        // narrowed channel search still lands above 128 channels;
        // below that it leaves the operator unsliced.
        (WinogradVariant::F43, Some(ch)) if ch > 128 => ch,
        (WinogradVariant::F43, Some(_)) => return Ok(false),
    };

    let per_slice = uniform_slices(op.c_out, max_ch);
    let base_name = op.name.clone();
    splice_layers(graph, input, output, per_slice.len(), ConcatAxis::Channel, |idx| {
        Box::new(Convolution {
            name: format!("{base_name}/slice{idx}"),
            c_in: op.c_in,
            c_out: per_slice[idx],
            kernel: op.kernel,
            stride: op.stride,
            pad: op.pad,
            layout: ConvLayout::Flat,
        })
    })?;
    Ok(true)
}

fn shape_of(graph: &Graph, blob: BlobId, operator: &str) -> FlexResult<Shape> {
    graph.blobs[blob.0]
        .shape
        .ok_or_else(|| FlexError::SlicingFailure { operator: operator.to_string(), reason: "missing shape; run shape inference before slicing".into() })
}

/// Approximates `get_size_convolution`'s im2col-GEMM buffer estimate
/// (`AT`/`BT`/`topT_tileX`, tiling collapsed for the same reason as the
/// Winograd estimate above): the flattened weight matrix, the unrolled
/// input patches, and an output transpose buffer, on top of the
/// untransformed input/output blobs.
fn im2col_gemm_buffer_elems(conv: &Convolution, in_shape: Shape, out_shape: Shape) -> usize {
    let m = conv.c_out;
    let n = out_shape.w * out_shape.h;
    let k = conv.c_in * conv.kernel * conv.kernel;
    let at = k * m;
    let bt = k * n;
    let top = m * n;
    in_shape.total() + at + bt + top + out_shape.total()
}

/// Picks each convolution's runtime weight layout: pointwise (1x1)
/// kernels always go direct, 3x3 stride-2 kernels get the dedicated
/// stride-2 layout, and everything else tries Winograd-63 -> Winograd-43
/// -> im2col-GEMM -> CHW direct, in that order, taking the first whose
/// predicted peak memory fits `budget_elems`. Grounded on
/// `transform_kernel_convolution`'s layout search; runs after slicing so
/// every surviving convolution is already within the conv budget on its
/// own weight footprint.
pub fn pretransform_convolutions(graph: &mut Graph, budget_elems: usize) -> FlexResult<usize> {
    let mut transformed = 0;
    for i in 0..graph.layers.len() {
        let layer = &graph.layers[i];
        if layer.op.kind() != "Convolution" {
            continue;
        }
        let conv = layer.op.as_any().downcast_ref::<Convolution>().cloned().expect("kind() == Convolution");
        let input = layer.inputs[0];
        let output = layer.outputs[0];
        let in_shape = shape_of(graph, input, &conv.name)?;
        let out_shape = shape_of(graph, output, &conv.name)?;

        let layout = select_conv_layout(&conv, in_shape, out_shape, budget_elems);
        if layout != conv.layout {
            transformed += 1;
        }
        let mut updated = conv;
        updated.layout = layout;
        graph.layers[i].op = Box::new(updated);
    }
    Ok(transformed)
}

fn select_conv_layout(conv: &Convolution, in_shape: Shape, out_shape: Shape, budget_elems: usize) -> ConvLayout {
    if conv.kernel == 1 {
        return ConvLayout::Flat;
    }
    if conv.kernel == 3 && conv.stride == 2 {
        return ConvLayout::Stride2x3x3;
    }
    if conv.kernel == 3 && conv.stride == 1 && conv.c_in >= 8 && conv.c_out >= 8 {
        let tiles63 = winograd_tiles(out_shape.w, out_shape.h, 6);
        let size63 = winograd_buffer_elems(conv.c_out, tiles63, conv.c_in, winograd_block_elems(6), in_shape.total(), out_shape.total());
        if size63 < budget_elems {
            return ConvLayout::Winograd63;
        }
        let tiles43 = winograd_tiles(out_shape.w, out_shape.h, 4);
        let size43 = winograd_buffer_elems(conv.c_out, tiles43, conv.c_in, winograd_block_elems(4), in_shape.total(), out_shape.total());
        if size43 < budget_elems {
            return ConvLayout::Winograd43;
        }
    }
    if im2col_gemm_buffer_elems(conv, in_shape, out_shape) < budget_elems {
        return ConvLayout::Im2colGemm;
    }
    ConvLayout::Chw
}

/// Shared rewrite shape: `input -> Split(n) -> [op_0..op_n) -> Concat -> output`.
/// `output`'s original consumer is repointed at the Concat's new output blob;
/// the caller is responsible for retiring the original layer slot.
fn splice_layers(
    graph: &mut Graph,
    input: BlobId,
    output: BlobId,
    n: usize,
    axis: ConcatAxis,
    mut make_op: impl FnMut(usize) -> Box<dyn crate::graph::Operator>,
) -> FlexResult<()> {
    let original_consumer = graph.blobs[output.0].consumer;
    let original_name = graph.blobs[output.0].name.clone();

    graph.blobs[input.0].consumer = None;
    let split_id = graph.add_layer(
        format!("split_for_{original_name}"),
        Box::new(Split { name: "split".into(), n }),
        vec![input],
        (0..n).map(|i| format!("{original_name}/split{i}")).collect(),
    )?;
    let split_outputs: Vec<BlobId> = graph.layer(split_id).outputs.clone();

    let mut concat_inputs = Vec::with_capacity(n);
    for (idx, split_out) in split_outputs.into_iter().enumerate() {
        let op_id = graph.add_layer(
            format!("{original_name}_op{idx}"),
            make_op(idx),
            vec![split_out],
            vec![format!("{original_name}/part{idx}")],
        )?;
        concat_inputs.push(graph.layer(op_id).outputs[0]);
    }

    let concat_id = graph.add_layer(
        format!("concat_for_{original_name}"),
        Box::new(Concat { name: "concat".into(), axis }),
        concat_inputs,
        vec![format!("{original_name}/merged")],
    )?;
    let merged = graph.layer(concat_id).outputs[0];

    if let Some(consumer_id) = original_consumer {
        for in_blob in graph.layers[consumer_id.0].inputs.iter_mut() {
            if *in_blob == output {
                *in_blob = merged;
            }
        }
        graph.blobs[merged.0].consumer = Some(consumer_id);
    }
    // The original output blob is now unreachable; its producer layer
    // is retired by the caller and `compact` drops both together.
    graph.blobs[output.0] = Blob { name: format!("{original_name}/retired"), producer: None, consumer: None, shape: None };

    Ok(())
}

/// Drops retired layer slots and the now-dead output blobs they alone
/// produced, remapping every remaining `OperatorId` reference.
fn compact(graph: &mut Graph, retired: &HashSet<usize>) {
    let n = graph.layers.len();
    let mut remap = vec![0usize; n];
    let mut kept_layers = Vec::with_capacity(n - retired.len());
    for (old_idx, layer) in std::mem::take(&mut graph.layers).into_iter().enumerate() {
        if retired.contains(&old_idx) {
            continue;
        }
        remap[old_idx] = kept_layers.len();
        kept_layers.push(layer);
    }
    graph.layers = kept_layers;

    let dead_blobs: HashSet<usize> = graph
        .blobs
        .iter()
        .enumerate()
        .filter(|(_, b)| b.producer.is_none() && b.consumer.is_none() && b.name.ends_with("/retired"))
        .map(|(i, _)| i)
        .collect();

    let mut blob_remap = vec![0usize; graph.blobs.len()];
    let mut kept_blobs = Vec::with_capacity(graph.blobs.len() - dead_blobs.len());
    for (old_idx, blob) in std::mem::take(&mut graph.blobs).into_iter().enumerate() {
        if dead_blobs.contains(&old_idx) {
            continue;
        }
        blob_remap[old_idx] = kept_blobs.len();
        kept_blobs.push(blob);
    }
    graph.blobs = kept_blobs;

    for blob in graph.blobs.iter_mut() {
        if let Some(p) = blob.producer {
            blob.producer = Some(OperatorId(remap[p.0]));
        }
        if let Some(c) = blob.consumer {
            blob.consumer = Some(OperatorId(remap[c.0]));
        }
    }
    for layer in graph.layers.iter_mut() {
        for b in layer.inputs.iter_mut().chain(layer.outputs.iter_mut()) {
            *b = BlobId(blob_remap[b.0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1-shaped scenario: one oversize InnerProduct gets rewritten into
    /// Split -> k InnerProducts -> Concat, with `k` matching the exact
    /// `N_max` formula (not a generic byte-ceiling divide): in_features
    /// = 1024, out_features = 10000, budget = 1,500,000 elements gives
    /// `N_max = floor((1_500_000 - 1024) / 1025) = 1462`, so
    /// `k = ceil(10000 / 1462) = 7`.
    #[test]
    fn oversize_inner_product_is_split_by_n_max_formula() {
        let mut graph = Graph::new();
        let input = graph.add_input("input", Shape::vec(1024).with_elemsize(4));
        graph
            .add_layer("fc1", Box::new(InnerProduct { name: "fc1".into(), in_features: 1024, out_features: 10_000 }), vec![input], vec!["fc1_out".into()])
            .unwrap();

        let ceilings = SliceCeilings { conv_ceiling: SliceCeilings::default().conv_ceiling, fc_ceiling: 1_500_000 };
        let rewritten = slice_graph(&mut graph, ceilings).unwrap();
        assert_eq!(rewritten, 1);

        let kinds: Vec<&str> = graph.layers.iter().map(|l| l.op.kind()).collect();
        assert_eq!(kinds.first(), Some(&"Split"));
        assert_eq!(kinds.last(), Some(&"Concat"));
        assert_eq!(kinds.iter().filter(|k| **k == "InnerProduct").count(), 7);

        let output = graph.layers.last().unwrap().outputs[0];
        let shape = graph.blobs[output.0].shape.unwrap();
        assert_eq!(shape.total(), 10_000);
    }

    #[test]
    fn operator_within_n_max_is_left_untouched() {
        let mut graph = Graph::new();
        let input = graph.add_input("input", Shape::vec(16).with_elemsize(4));
        graph.add_layer("fc1", Box::new(InnerProduct { name: "fc1".into(), in_features: 16, out_features: 8 }), vec![input], vec!["fc1_out".into()]).unwrap();

        let rewritten = slice_graph(&mut graph, SliceCeilings::default()).unwrap();
        assert_eq!(rewritten, 0);
        assert_eq!(graph.layers.len(), 1);
        assert_eq!(graph.layers[0].op.kind(), "InnerProduct");
    }

    /// 3x3 stride-1 convolution, both channel counts under 128 (so
    /// Winograd F(6,3) is the eligible variant), with a budget too small
    /// for the full-channel estimate but large enough for a 16-channel
    /// slice: the channel search should land on 16 and produce 4 equal
    /// slices (64 / 16).
    #[test]
    fn oversize_convolution_is_split_by_winograd_channel_search() {
        let mut graph = Graph::new();
        let input = graph.add_input("input", Shape::dim3(16, 16, 8).with_elemsize(4));
        graph
            .add_layer(
                "conv1",
                Box::new(Convolution { name: "conv1".into(), c_in: 8, c_out: 64, kernel: 3, stride: 1, pad: 1, layout: ConvLayout::Flat }),
                vec![input],
                vec!["conv1_out".into()],
            )
            .unwrap();

        let ceilings = SliceCeilings { conv_ceiling: 50_000, fc_ceiling: SliceCeilings::default().fc_ceiling };
        let rewritten = slice_graph(&mut graph, ceilings).unwrap();
        assert_eq!(rewritten, 1);

        let kinds: Vec<&str> = graph.layers.iter().map(|l| l.op.kind()).collect();
        assert_eq!(kinds.first(), Some(&"Split"));
        assert_eq!(kinds.last(), Some(&"Concat"));
        assert_eq!(kinds.iter().filter(|k| **k == "Convolution").count(), 4);

        let output = graph.layers.last().unwrap().outputs[0];
        let shape = graph.blobs[output.0].shape.unwrap();
        assert_eq!(shape.c, 64);
        assert_eq!(shape.w, 16);
        assert_eq!(shape.h, 16);
    }

    #[test]
    fn pointwise_convolution_gets_flat_layout() {
        let mut graph = Graph::new();
        let input = graph.add_input("input", Shape::dim3(8, 8, 16).with_elemsize(4));
        graph
            .add_layer(
                "conv1x1",
                Box::new(Convolution { name: "conv1x1".into(), c_in: 16, c_out: 16, kernel: 1, stride: 1, pad: 0, layout: ConvLayout::Flat }),
                vec![input],
                vec!["out".into()],
            )
            .unwrap();
        graph.topo_sort().unwrap();
        graph.infer_shapes().unwrap();

        pretransform_convolutions(&mut graph, 1_000_000).unwrap();
        let conv = graph.layers[0].op.as_any().downcast_ref::<Convolution>().unwrap();
        assert_eq!(conv.layout, ConvLayout::Flat);
    }

    #[test]
    fn ample_budget_picks_winograd63_layout() {
        let mut graph = Graph::new();
        let input = graph.add_input("input", Shape::dim3(16, 16, 8).with_elemsize(4));
        graph
            .add_layer(
                "conv1",
                Box::new(Convolution { name: "conv1".into(), c_in: 8, c_out: 16, kernel: 3, stride: 1, pad: 1, layout: ConvLayout::Flat }),
                vec![input],
                vec!["out".into()],
            )
            .unwrap();
        graph.topo_sort().unwrap();
        graph.infer_shapes().unwrap();

        pretransform_convolutions(&mut graph, 10_000_000).unwrap();
        let conv = graph.layers[0].op.as_any().downcast_ref::<Convolution>().unwrap();
        assert_eq!(conv.layout, ConvLayout::Winograd63);
    }
}
