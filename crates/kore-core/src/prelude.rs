//! Convenience re-exports for common kore-core types.
//!
//! ```rust
//! use kore_core::prelude::*;
//! ```

pub use crate::Tensor;
pub use crate::DType;
pub use crate::{Device, DeviceGuard};
pub use crate::Shape;
pub use crate::{ScatterOrder, Slice, TensorIndex};
pub use crate::KoreError;
pub use crate::Result;
