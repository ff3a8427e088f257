use serde::{Deserialize, Serialize};

/// Index of a blob within a graph's flat blob table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub usize);

/// Index of an operator within a graph's flat operator table, in
/// topological (execution) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub usize);

/// The three memory classes the planned allocator tracks independently.
/// The discriminants match the bit-packed memory-profile key
/// (`memory_type` occupies bits 16-17) and the malloc-plan file's
/// column order, so do not reorder these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemoryClass {
    Weight = 0,
    Blob = 1,
    Workspace = 2,
}

impl MemoryClass {
    pub const ALL: [MemoryClass; 3] = [MemoryClass::Weight, MemoryClass::Blob, MemoryClass::Workspace];

    pub fn as_index(self) -> usize {
        self as u8 as usize
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(MemoryClass::Weight),
            1 => Some(MemoryClass::Blob),
            2 => Some(MemoryClass::Workspace),
            _ => None,
        }
    }
}

/// Whether the allocator is currently replaying the persistent-weight
/// loading pass or the transient (streamed) loading pass. Flips the
/// sense of `PlannedAllocator::is_persistent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadMode {
    Persistent,
    #[default]
    Transient,
}

/// A tensor's symbolic shape: 1 to 4 dims (w, h, d, c) plus element size,
/// carried through shape inference without backing storage. Mirrors the
/// original implementation's shape-only dry-run representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub dims: u8,
    pub w: usize,
    pub h: usize,
    pub d: usize,
    pub c: usize,
    pub elemsize: usize,
}

impl Shape {
    pub fn scalar() -> Self {
        Shape { dims: 0, w: 1, h: 1, d: 1, c: 1, elemsize: 4 }
    }

    pub fn vec(w: usize) -> Self {
        Shape { dims: 1, w, h: 1, d: 1, c: 1, elemsize: 4 }
    }

    pub fn image(w: usize, h: usize) -> Self {
        Shape { dims: 2, w, h, d: 1, c: 1, elemsize: 4 }
    }

    pub fn dim3(w: usize, h: usize, c: usize) -> Self {
        Shape { dims: 3, w, h, d: 1, c, elemsize: 4 }
    }

    pub fn dim4(w: usize, h: usize, d: usize, c: usize) -> Self {
        Shape { dims: 4, w, h, d, c, elemsize: 4 }
    }

    pub fn with_elemsize(mut self, elemsize: usize) -> Self {
        self.elemsize = elemsize;
        self
    }

    /// Total element count across all dims.
    pub fn total(&self) -> usize {
        self.w * self.h * self.d * self.c
    }

    /// Total size in bytes, as the profiler and allocator see it.
    pub fn bytes(&self) -> usize {
        self.total() * self.elemsize
    }

    pub fn as_slice(&self) -> Vec<usize> {
        match self.dims {
            0 => vec![],
            1 => vec![self.w],
            2 => vec![self.w, self.h],
            3 => vec![self.w, self.h, self.c],
            _ => vec![self.w, self.h, self.d, self.c],
        }
    }
}
