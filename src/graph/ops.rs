use serde::{Deserialize, Serialize};

use crate::errors::{FlexError, FlexResult};
use crate::types::Shape;

/// A graph node's kind-specific behaviour: shape propagation and the
/// weight footprint the profiler/scheduler need. Kernel math itself
/// (the actual convolution, matmul, winograd transform...) lives behind
/// the executor's `KernelRunner` seam, not here — this trait only ever
/// reasons about shapes and byte counts.
#[typetag::serde(tag = "kind")]
pub trait Operator: Send + Sync + std::fmt::Debug {
    /// Stable kind tag, e.g. "Convolution", "InnerProduct", "Split".
    fn kind(&self) -> &'static str;

    /// Propagates input shapes to this operator's output shapes.
    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>>;

    /// Bytes of persistent weight data this operator owns (0 for
    /// shape-only / data-movement operators).
    fn weight_bytes(&self) -> usize {
        0
    }

    /// Extra scratch space the kernel needs beyond its output blob
    /// (im2col buffers, Winograd transform tiles, ...).
    fn workspace_bytes(&self, _inputs: &[Shape]) -> usize {
        0
    }

    /// Whether the slicer is allowed to rewrite this operator into a
    /// Split/Concat subgraph when it exceeds the memory ceiling.
    fn is_splittable(&self) -> bool {
        false
    }

    /// Lets the slicer downcast back to a concrete operator kind to
    /// read kind-specific parameters (in/out features, kernel size...).
    fn as_any(&self) -> &dyn std::any::Any;
}

fn require_one<'a>(inputs: &'a [Shape], kind: &str) -> FlexResult<&'a Shape> {
    inputs.first().ok_or_else(|| FlexError::GraphInvariantViolation(format!("{kind} requires at least one input")))
}

/// Fully connected layer: `[rows, in_features] -> [rows, out_features]`.
/// `out_features` is split by the slicer along output rows when the
/// weight matrix exceeds a per-operator memory ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerProduct {
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
}

#[typetag::serde]
impl Operator for InnerProduct {
    fn kind(&self) -> &'static str {
        "InnerProduct"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        let x = require_one(inputs, "InnerProduct")?;
        if x.w != self.in_features {
            return Err(FlexError::GraphInvariantViolation(format!(
                "InnerProduct '{}' expected in_features {} but input has {}",
                self.name, self.in_features, x.w
            )));
        }
        Ok(vec![Shape::vec(self.out_features).with_elemsize(x.elemsize)])
    }

    fn weight_bytes(&self) -> usize {
        self.in_features * self.out_features * 4 + self.out_features * 4
    }

    fn is_splittable(&self) -> bool {
        true
    }
}

/// The storage/compute layout a convolution's weights are pretransformed
/// into, picked by the slicer's `pretransform_convolutions` pass. Carried
/// on the operator so the (out of scope) numeric kernel would know which
/// transform to apply; shape inference ignores it entirely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConvLayout {
    /// Direct, untransformed weights — used for pointwise (1x1) kernels
    /// and as the fallback when no transform fits the budget.
    #[default]
    Flat,
    /// Direct compute over CHW-ordered weights, no transform buffer.
    Chw,
    Im2colGemm,
    Winograd63,
    Winograd43,
    Stride2x3x3,
}

/// 2D convolution: `[w, h, c_in] -> [ow, oh, c_out]`, same padding
/// semantics as the profiler's dry run (shape-only, no boundary math
/// beyond the stride/kernel/pad arithmetic needed to size the output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Convolution {
    pub name: String,
    pub c_in: usize,
    pub c_out: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    #[serde(default)]
    pub layout: ConvLayout,
}

#[typetag::serde]
impl Operator for Convolution {
    fn kind(&self) -> &'static str {
        "Convolution"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        let x = require_one(inputs, "Convolution")?;
        if x.c != self.c_in {
            return Err(FlexError::GraphInvariantViolation(format!(
                "Convolution '{}' expected {} input channels, got {}",
                self.name, self.c_in, x.c
            )));
        }
        let ow = (x.w + 2 * self.pad - self.kernel) / self.stride + 1;
        let oh = (x.h + 2 * self.pad - self.kernel) / self.stride + 1;
        Ok(vec![Shape::dim3(ow, oh, self.c_out).with_elemsize(x.elemsize)])
    }

    fn weight_bytes(&self) -> usize {
        self.c_in * self.c_out * self.kernel * self.kernel * 4 + self.c_out * 4
    }

    fn workspace_bytes(&self, inputs: &[Shape]) -> usize {
        // im2col-style scratch estimate: one unrolled column per output pixel.
        let x = inputs.first().copied().unwrap_or(Shape::scalar());
        let ow = (x.w + 2 * self.pad - self.kernel) / self.stride.max(1) + 1;
        let oh = (x.h + 2 * self.pad - self.kernel) / self.stride.max(1) + 1;
        ow * oh * self.c_in * self.kernel * self.kernel * 4
    }

    fn is_splittable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pooling {
    pub name: String,
    pub kernel: usize,
    pub stride: usize,
}

#[typetag::serde]
impl Operator for Pooling {
    fn kind(&self) -> &'static str {
        "Pooling"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        let x = require_one(inputs, "Pooling")?;
        let ow = (x.w - self.kernel) / self.stride + 1;
        let oh = (x.h - self.kernel) / self.stride + 1;
        Ok(vec![Shape::dim3(ow, oh, x.c).with_elemsize(x.elemsize)])
    }
}

macro_rules! elementwise_op {
    ($ty:ident, $kind:literal) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $ty {
            pub name: String,
        }

        #[typetag::serde]
        impl Operator for $ty {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }

            fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
                Ok(vec![*require_one(inputs, $kind)?])
            }
        }
    };
}

elementwise_op!(ReLU, "ReLU");
elementwise_op!(Sigmoid, "Sigmoid");

/// Gather along axis 0: shape-preserving passthrough for the purposes
/// of the shape-only dry run (the index tensor does not change the
/// profiled output's byte size).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gather {
    pub name: String,
}

#[typetag::serde]
impl Operator for Gather {
    fn kind(&self) -> &'static str {
        "Gather"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        Ok(vec![*require_one(inputs, "Gather")?])
    }
}

/// Elementwise divide masked by a lower-triangular `where`; shape is
/// that of the first (numerator) input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivTrilWhere {
    pub name: String,
}

#[typetag::serde]
impl Operator for DivTrilWhere {
    fn kind(&self) -> &'static str {
        "DivTrilWhere"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        Ok(vec![*require_one(inputs, "DivTrilWhere")?])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eltwise {
    pub name: String,
}

#[typetag::serde]
impl Operator for Eltwise {
    fn kind(&self) -> &'static str {
        "Eltwise"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        let first = require_one(inputs, "Eltwise")?;
        for other in &inputs[1..] {
            if other.as_slice() != first.as_slice() {
                return Err(FlexError::GraphInvariantViolation(format!(
                    "Eltwise '{}' requires matching shapes, got {:?} and {:?}",
                    self.name,
                    first.as_slice(),
                    other.as_slice()
                )));
            }
        }
        Ok(vec![*first])
    }
}

/// Replicates a single input into `n` identical output blobs. Inserted
/// by the slicer ahead of a split operator group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub name: String,
    pub n: usize,
}

#[typetag::serde]
impl Operator for Split {
    fn kind(&self) -> &'static str {
        "Split"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        let x = require_one(inputs, "Split")?;
        Ok(vec![*x; self.n])
    }
}

/// Concatenates `n` partial outputs along `axis` back into one blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concat {
    pub name: String,
    pub axis: ConcatAxis,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConcatAxis {
    Width,
    Channel,
}

#[typetag::serde]
impl Operator for Concat {
    fn kind(&self) -> &'static str {
        "Concat"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn infer_shapes(&self, inputs: &[Shape]) -> FlexResult<Vec<Shape>> {
        if inputs.is_empty() {
            return Err(FlexError::GraphInvariantViolation(format!("Concat '{}' has no inputs", self.name)));
        }
        let mut out = inputs[0];
        match self.axis {
            ConcatAxis::Width => out.w = inputs.iter().map(|s| s.w).sum(),
            ConcatAxis::Channel => out.c = inputs.iter().map(|s| s.c).sum(),
        }
        Ok(vec![out])
    }
}
