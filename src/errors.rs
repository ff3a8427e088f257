use thiserror::Error;

/// Crate-wide error taxonomy. Every fallible operation in the slicer,
/// profiler, scheduler, allocator and executor surfaces one of these.
#[derive(Error, Debug)]
pub enum FlexError {
    #[error("graph invariant violated: {0}")]
    GraphInvariantViolation(String),

    #[error("shape inference incomplete for blob {blob_index}: {reason}")]
    ShapeInferenceIncomplete { blob_index: usize, reason: String },

    #[error("slicing failed for operator '{operator}': {reason}")]
    SlicingFailure { operator: String, reason: String },

    #[error("scheduling infeasible within budget {budget} bytes: {reason}")]
    SchedulingInfeasible { budget: usize, reason: String },

    #[error("layer-dependency invariant failed at layer {layer}: {reason}")]
    DependencyInvariantFailure { layer: usize, reason: String },

    #[error("planned allocator replay mismatch: expected {expected} calls in class {class:?}, got {actual}")]
    PlanReplayMismatch {
        class: crate::types::MemoryClass,
        expected: usize,
        actual: usize,
    },

    #[error("I/O failure reading/writing '{path}': {source}")]
    IoFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV/plan record: {0}")]
    CsvFormat(String),

    #[error("failed to parse field '{field}' in '{context}': {source}")]
    ParseFailure {
        field: String,
        context: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

pub type FlexResult<T> = Result<T, FlexError>;

impl FlexError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FlexError::IoFailure { path: path.into(), source }
    }
}
