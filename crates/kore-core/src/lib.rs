//! # kore-core
//!
//! Core tensor engine for the Kore ML framework.
//!
//! Provides the foundational `Tensor` type with:
//! - Byte-backed storage shared between views; writes are seen by every view
//! - CPU and CUDA device support, with a scoped current-device context
//! - Zero-copy views (reshape, transpose, basic indexing)
//! - Axis reductions and broadcast-reduction (`sum_to`)
//! - Strided gather/scatter indexing with integer index arrays

pub mod dtype;
pub mod device;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod autograd;
pub mod ops;
pub mod error;
pub mod prelude;

pub use dtype::DType;
pub use device::{Device, DeviceGuard};
pub use storage::Storage;
pub use shape::Shape;
pub use tensor::Tensor;
pub use error::KoreError;
pub use ops::indexing::{ScatterOrder, Slice, TensorIndex};

pub type Result<T> = std::result::Result<T, KoreError>;
