//! Tensor operations: arithmetic, reduction, indexing.
//!
//! All operations return new tensors (functional style), except the
//! in-place indexed write `index_put`.

pub mod arithmetic;
pub mod reduction;
pub mod indexing;
