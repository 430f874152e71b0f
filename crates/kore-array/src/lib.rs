//! # kore-array
//!
//! Array helpers on top of `kore-core`:
//! - `size_of_shape` and the fixed-point `sum_to`
//! - `AccelArray`, an accelerator array with basic (view-only) indexing
//! - `getitem` / `setitem`, which run an indexing pattern on the array's
//!   own backend when it can and fall back to a `Tensor` when it cannot
//! - the deprecated `as_vec` / `as_mat` / `empty_like` shims
//!
//! ```
//! use kore_array::{getitem, Array, AccelArray, IndexItem};
//! use kore_core::Tensor;
//!
//! let x = Array::from(AccelArray::from_tensor(&Tensor::arange(0.0, 6.0, 1.0)));
//! let picks = Array::from(Tensor::from_i64(&[5, 0], &[2]));
//! let y = getitem(&x, &[IndexItem::Array(picks)]).unwrap();
//! assert!(matches!(y, Array::Accel(_)));
//! assert_eq!(y.to_f32_vec().unwrap(), vec![5.0, 0.0]);
//! ```

pub mod accel;
pub mod backend;
pub mod config;
pub mod indexing;
pub mod utils;

pub use accel::AccelArray;
pub use backend::{Array, ArrayBackend, ArrayKind, FallbackReason, IndexItem, IndexOutcome};
pub use config::ArrayConfig;
pub use indexing::{getitem, getitem_with, setitem, setitem_with};
#[allow(deprecated)]
pub use utils::{as_mat, as_vec, empty_like};
pub use utils::{size_of_shape, sum_to};
