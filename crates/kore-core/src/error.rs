use crate::DType;

/// Errors produced by the Kore tensor engine.
#[derive(Debug, thiserror::Error)]
pub enum KoreError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("Cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("Axis {axis} out of range for {ndim}-D tensor")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("Shape {0:?} overflows the element count")]
    ShapeOverflow(Vec<usize>),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("DType mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("Index {index} is out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds { index: isize, axis: usize, size: usize },

    #[error("Too many indices: {got} given for a {ndim}-D tensor")]
    TooManyIndices { got: usize, ndim: usize },

    #[error("Unsupported index: {0}")]
    UnsupportedIndex(String),

    #[error("Unsupported input type: {0}")]
    TypeUnsupported(String),

    #[error("Backend cannot index natively ({0}) and fallback is disabled")]
    FallbackDisabled(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("CUDA error: {0}")]
    CudaError(String),
}
