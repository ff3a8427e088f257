use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::errors::{FlexError, FlexResult};
use crate::types::{BlobId, OperatorId, Shape};

pub mod ops;
pub mod slicer;

pub use ops::Operator;

/// A named tensor with at most one producing and one consuming layer.
/// `shape` is populated by [`Graph::infer_shapes`]; it is `None` before
/// that pass runs (or for a blob the slicer has not yet retargeted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub name: String,
    pub producer: Option<OperatorId>,
    pub consumer: Option<OperatorId>,
    pub shape: Option<Shape>,
}

impl Blob {
    fn input(name: impl Into<String>, shape: Shape) -> Self {
        Blob { name: name.into(), producer: None, consumer: None, shape: Some(shape) }
    }

    fn produced(name: impl Into<String>, producer: OperatorId) -> Self {
        Blob { name: name.into(), producer: Some(producer), consumer: None, shape: None }
    }
}

/// One node of the graph: a kind-tagged operator plus the ordered blob
/// indices it reads from and writes to.
#[derive(Debug, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub inputs: Vec<BlobId>,
    pub outputs: Vec<BlobId>,
    pub op: Box<dyn Operator>,
}

/// The computation DAG: a flat blob table plus a layer list. Layers are
/// kept in topological (and, after [`Graph::topo_sort`], execution) order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    pub blobs: Vec<Blob>,
    pub layers: Vec<Layer>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { blobs: Vec::new(), layers: Vec::new() }
    }

    /// Declares a graph input with a known shape. Inputs have no
    /// producer and are always kept at the front by [`Graph::topo_sort`].
    pub fn add_input(&mut self, name: impl Into<String>, shape: Shape) -> BlobId {
        self.blobs.push(Blob::input(name, shape));
        BlobId(self.blobs.len() - 1)
    }

    /// Appends a layer, wiring up consumer links and allocating a fresh
    /// output blob per name in `output_names`. Fails if an input blob
    /// already has a consumer (graph invariant: at most one consumer).
    pub fn add_layer(
        &mut self,
        name: impl Into<String>,
        op: Box<dyn Operator>,
        inputs: Vec<BlobId>,
        output_names: Vec<String>,
    ) -> FlexResult<OperatorId> {
        let layer_id = OperatorId(self.layers.len());
        for &b in &inputs {
            let blob = self.blobs.get_mut(b.0).ok_or_else(|| {
                FlexError::GraphInvariantViolation(format!("layer references unknown blob {}", b.0))
            })?;
            if blob.consumer.is_some() {
                return Err(FlexError::GraphInvariantViolation(format!(
                    "blob '{}' already has a consumer; at most one consumer is allowed",
                    blob.name
                )));
            }
            blob.consumer = Some(layer_id);
        }
        let mut outputs = Vec::with_capacity(output_names.len());
        for out_name in output_names {
            self.blobs.push(Blob::produced(out_name, layer_id));
            outputs.push(BlobId(self.blobs.len() - 1));
        }
        self.layers.push(Layer { name: name.into(), inputs, outputs, op });
        Ok(layer_id)
    }

    pub fn blob(&self, id: BlobId) -> &Blob {
        &self.blobs[id.0]
    }

    pub fn layer(&self, id: OperatorId) -> &Layer {
        &self.layers[id.0]
    }

    /// Kahn's algorithm over the layer list, seeded by zero-indegree
    /// layers in their original order. Input blobs are never reordered:
    /// they have no producer so they trivially precede everything.
    pub fn topo_sort(&mut self) -> FlexResult<()> {
        let n = self.layers.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, layer) in self.layers.iter().enumerate() {
            for &in_blob in &layer.inputs {
                if let Some(producer) = self.blobs[in_blob.0].producer {
                    dependents[producer.0].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if order.len() != n {
            return Err(FlexError::GraphInvariantViolation(
                "graph contains a cycle; topological sort did not cover all layers".into(),
            ));
        }

        let old_layers = std::mem::take(&mut self.layers);
        let mut remap = vec![0usize; n];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            remap[old_idx] = new_idx;
        }
        let mut by_old: Vec<Option<Layer>> = old_layers.into_iter().map(Some).collect();
        let mut new_layers = Vec::with_capacity(n);
        for &old_idx in &order {
            new_layers.push(by_old[old_idx].take().unwrap());
        }
        self.layers = new_layers;

        for blob in self.blobs.iter_mut() {
            if let Some(p) = blob.producer {
                blob.producer = Some(OperatorId(remap[p.0]));
            }
            if let Some(c) = blob.consumer {
                blob.consumer = Some(OperatorId(remap[c.0]));
            }
        }
        Ok(())
    }

    /// Propagates shapes forward over the (already topo-sorted) layer
    /// list. Every blob must end up with `shape = Some(_)`; a layer
    /// whose inputs are not yet resolved is an error rather than a
    /// silent skip, since shape inference must be total over one pass.
    pub fn infer_shapes(&mut self) -> FlexResult<()> {
        for i in 0..self.layers.len() {
            let input_shapes: Vec<Shape> = self.layers[i]
                .inputs
                .iter()
                .map(|&b| {
                    self.blobs[b.0].shape.ok_or_else(|| FlexError::ShapeInferenceIncomplete {
                        blob_index: b.0,
                        reason: format!("blob '{}' has no shape when layer '{}' ran", self.blobs[b.0].name, self.layers[i].name),
                    })
                })
                .collect::<FlexResult<_>>()?;

            let output_shapes = self.layers[i].op.infer_shapes(&input_shapes)?;
            let outputs = self.layers[i].outputs.clone();
            if output_shapes.len() != outputs.len() {
                return Err(FlexError::ShapeInferenceIncomplete {
                    blob_index: outputs.first().map(|b| b.0).unwrap_or(0),
                    reason: format!(
                        "layer '{}' produced {} shapes for {} declared outputs",
                        self.layers[i].name,
                        output_shapes.len(),
                        outputs.len()
                    ),
                });
            }
            for (out_blob, shape) in outputs.into_iter().zip(output_shapes) {
                self.blobs[out_blob.0].shape = Some(shape);
            }
        }
        Ok(())
    }

    /// Network inputs: blobs with no producer.
    pub fn inputs(&self) -> impl Iterator<Item = BlobId> + '_ {
        self.blobs.iter().enumerate().filter(|(_, b)| b.producer.is_none()).map(|(i, _)| BlobId(i))
    }

    /// Network outputs: blobs with no consumer.
    pub fn outputs(&self) -> impl Iterator<Item = BlobId> + '_ {
        self.blobs.iter().enumerate().filter(|(_, b)| b.consumer.is_none()).map(|(i, _)| BlobId(i))
    }

    /// Structural invariant check: every blob has at most one producer
    /// (guaranteed by construction) and at most one consumer, and every
    /// layer's input/output indices resolve within the blob table.
    pub fn check_invariants(&self) -> FlexResult<()> {
        for layer in &self.layers {
            for &b in layer.inputs.iter().chain(layer.outputs.iter()) {
                if b.0 >= self.blobs.len() {
                    return Err(FlexError::GraphInvariantViolation(format!(
                        "layer '{}' references out-of-range blob {}",
                        layer.name, b.0
                    )));
                }
            }
        }
        Ok(())
    }
}
