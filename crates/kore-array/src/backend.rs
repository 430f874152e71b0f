//! The closed set of array backends and the capability interface the
//! fallback logic is written against.

use std::fmt;

use kore_core::{DType, Device, Result, ScatterOrder, Shape, Slice, Tensor, TensorIndex};

use crate::accel::AccelArray;

/// Which backend an [`Array`] lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Cpu,
    Gpu,
    Accel,
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKind::Cpu => write!(f, "cpu"),
            ArrayKind::Gpu => write!(f, "gpu"),
            ArrayKind::Accel => write!(f, "accel"),
        }
    }
}

/// Why a backend declined an indexing pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    /// The key holds an index array the backend cannot gather with.
    AdvancedIndex,
    /// The key has more items than the backend handles for this rank.
    DimensionMismatch,
    /// A slice runs backwards, which the backend cannot express as a view.
    NegativeStep,
    /// An index array lives on a backend this one cannot read.
    ForeignIndex,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackReason::AdvancedIndex => "advanced indexing not supported natively",
            FallbackReason::DimensionMismatch => "key longer than the native rank",
            FallbackReason::NegativeStep => "negative slice step not supported natively",
            FallbackReason::ForeignIndex => "index array from a foreign backend",
        };
        f.write_str(s)
    }
}

/// Result of a native indexing attempt.
#[must_use]
#[derive(Debug)]
pub enum IndexOutcome<T> {
    Done(T),
    Unsupported(FallbackReason),
}

impl<T> IndexOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> IndexOutcome<U> {
        match self {
            IndexOutcome::Done(v) => IndexOutcome::Done(f(v)),
            IndexOutcome::Unsupported(r) => IndexOutcome::Unsupported(r),
        }
    }
}

/// One item of a cross-backend indexing key.
#[derive(Debug, Clone)]
pub enum IndexItem {
    Int(isize),
    Slice(Slice),
    /// Integer index array on any backend.
    Array(Array),
}

impl From<isize> for IndexItem {
    fn from(i: isize) -> Self {
        IndexItem::Int(i)
    }
}

impl From<Slice> for IndexItem {
    fn from(s: Slice) -> Self {
        IndexItem::Slice(s)
    }
}

impl From<Array> for IndexItem {
    fn from(a: Array) -> Self {
        IndexItem::Array(a)
    }
}

/// An array on one of the supported backends.
///
/// `Cpu` and `Gpu` hold Kore tensors on host and CUDA memory; `Accel`
/// holds an [`AccelArray`].
#[derive(Debug, Clone)]
pub enum Array {
    Cpu(Tensor),
    Gpu(Tensor),
    Accel(AccelArray),
}

impl From<Tensor> for Array {
    /// Pick `Cpu` or `Gpu` from the tensor's device.
    fn from(t: Tensor) -> Self {
        if t.is_cuda() {
            Array::Gpu(t)
        } else {
            Array::Cpu(t)
        }
    }
}

impl From<AccelArray> for Array {
    fn from(a: AccelArray) -> Self {
        Array::Accel(a)
    }
}

impl Array {
    /// Wrap a fallback result back into the `kind` family.
    pub fn from_fallback(t: Tensor, kind: ArrayKind) -> Self {
        match kind {
            ArrayKind::Accel => Array::Accel(AccelArray::from_tensor(&t)),
            ArrayKind::Cpu | ArrayKind::Gpu => Array::from(t),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().ndim()
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => Some(t),
            Array::Accel(_) => None,
        }
    }

    pub fn as_accel(&self) -> Option<&AccelArray> {
        match self {
            Array::Accel(a) => Some(a),
            _ => None,
        }
    }

    /// Whether this is a tensor recording autograd history.
    pub fn requires_grad(&self) -> bool {
        self.as_tensor().is_some_and(Tensor::requires_grad)
    }

    /// Copy the elements out in logical order (f32 only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => t.to_f32_vec(),
            Array::Accel(a) => a.to_f32_vec(),
        }
    }
}

/// Capabilities every backend exposes to the fallback logic.
pub trait ArrayBackend {
    fn kind(&self) -> ArrayKind;

    fn shape(&self) -> &Shape;

    fn dtype(&self) -> DType;

    fn device(&self) -> Device;

    /// Try to read `self[key]` natively.
    fn try_getitem(&self, key: &[IndexItem]) -> Result<IndexOutcome<Array>>;

    /// The tensor this array falls back to. Shares storage where the
    /// backend allows it.
    fn to_fallback(&self) -> Result<Tensor>;

    /// How duplicate positions resolve when this array is written through
    /// its fallback tensor.
    fn scatter_order(&self) -> ScatterOrder {
        ScatterOrder::for_device(self.device())
    }
}

/// Lower a key to tensor items. Returns `None` if it holds an
/// accelerator index array.
pub(crate) fn native_key(key: &[IndexItem]) -> Option<Vec<TensorIndex>> {
    key.iter()
        .map(|item| match item {
            IndexItem::Int(i) => Some(TensorIndex::Int(*i)),
            IndexItem::Slice(s) => Some(TensorIndex::Slice(*s)),
            IndexItem::Array(a) => a.as_tensor().cloned().map(TensorIndex::Tensor),
        })
        .collect()
}

/// Lower a key to tensor items, converting any accelerator index arrays.
pub(crate) fn fallback_key(key: &[IndexItem]) -> Result<Vec<TensorIndex>> {
    key.iter()
        .map(|item| {
            Ok(match item {
                IndexItem::Int(i) => TensorIndex::Int(*i),
                IndexItem::Slice(s) => TensorIndex::Slice(*s),
                IndexItem::Array(a) => TensorIndex::Tensor(a.to_fallback()?),
            })
        })
        .collect()
}

impl ArrayBackend for Tensor {
    fn kind(&self) -> ArrayKind {
        if self.is_cuda() {
            ArrayKind::Gpu
        } else {
            ArrayKind::Cpu
        }
    }

    fn shape(&self) -> &Shape {
        Tensor::shape(self)
    }

    fn dtype(&self) -> DType {
        Tensor::dtype(self)
    }

    fn device(&self) -> Device {
        Tensor::device(self)
    }

    fn try_getitem(&self, key: &[IndexItem]) -> Result<IndexOutcome<Array>> {
        let Some(key) = native_key(key) else {
            return Ok(IndexOutcome::Unsupported(FallbackReason::ForeignIndex));
        };
        Ok(IndexOutcome::Done(Array::from(self.index(&key)?)))
    }

    fn to_fallback(&self) -> Result<Tensor> {
        Ok(self.clone())
    }
}

impl ArrayBackend for AccelArray {
    fn kind(&self) -> ArrayKind {
        ArrayKind::Accel
    }

    fn shape(&self) -> &Shape {
        AccelArray::shape(self)
    }

    fn dtype(&self) -> DType {
        AccelArray::dtype(self)
    }

    fn device(&self) -> Device {
        AccelArray::device(self)
    }

    fn try_getitem(&self, key: &[IndexItem]) -> Result<IndexOutcome<Array>> {
        Ok(self.try_index(key)?.map(Array::Accel))
    }

    fn to_fallback(&self) -> Result<Tensor> {
        self.to_tensor()
    }
}

impl ArrayBackend for Array {
    fn kind(&self) -> ArrayKind {
        match self {
            Array::Cpu(_) => ArrayKind::Cpu,
            Array::Gpu(_) => ArrayKind::Gpu,
            Array::Accel(_) => ArrayKind::Accel,
        }
    }

    fn shape(&self) -> &Shape {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => t.shape(),
            Array::Accel(a) => a.shape(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => t.dtype(),
            Array::Accel(a) => a.dtype(),
        }
    }

    fn device(&self) -> Device {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => t.device(),
            Array::Accel(a) => a.device(),
        }
    }

    fn try_getitem(&self, key: &[IndexItem]) -> Result<IndexOutcome<Array>> {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => t.try_getitem(key),
            Array::Accel(a) => a.try_getitem(key),
        }
    }

    fn to_fallback(&self) -> Result<Tensor> {
        match self {
            Array::Cpu(t) | Array::Gpu(t) => t.to_fallback(),
            Array::Accel(a) => a.to_fallback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_device() {
        let t = Tensor::ones(&[2]);
        assert_eq!(Array::from(t.clone()).kind(), ArrayKind::Cpu);
        assert_eq!(ArrayBackend::kind(&t), ArrayKind::Cpu);
        let a = Array::from(AccelArray::from_tensor(&t));
        assert_eq!(a.kind(), ArrayKind::Accel);
        assert_eq!(a.scatter_order(), ScatterOrder::Ordered);
    }

    #[test]
    fn test_tensor_rejects_accel_index_arrays() {
        let t = Tensor::arange(0.0, 4.0, 1.0);
        let picks = AccelArray::from_tensor(&Tensor::from_i64(&[1], &[1]));
        let outcome = t.try_getitem(&[IndexItem::Array(Array::from(picks))]).unwrap();
        assert!(matches!(outcome, IndexOutcome::Unsupported(FallbackReason::ForeignIndex)));
    }

    #[test]
    fn test_tensor_native_read() {
        let t = Tensor::arange(0.0, 4.0, 1.0);
        let picks = Array::from(Tensor::from_i64(&[3, 1], &[2]));
        let IndexOutcome::Done(r) = t.try_getitem(&[IndexItem::Array(picks)]).unwrap() else {
            panic!("tensor declined an integer index array");
        };
        assert_eq!(r.kind(), ArrayKind::Cpu);
        assert_eq!(r.to_f32_vec().unwrap(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_requires_grad() {
        let mut t = Tensor::ones(&[2]);
        t.set_requires_grad(true);
        assert!(Array::from(t.clone()).requires_grad());
        assert!(!Array::from(AccelArray::from_tensor(&t)).requires_grad());
    }

    #[test]
    fn test_outcome_map() {
        let o: IndexOutcome<i32> = IndexOutcome::Done(2);
        assert!(matches!(o.map(|v| v * 2), IndexOutcome::Done(4)));
        let u: IndexOutcome<i32> = IndexOutcome::Unsupported(FallbackReason::AdvancedIndex);
        assert!(matches!(
            u.map(|v| v * 2),
            IndexOutcome::Unsupported(FallbackReason::AdvancedIndex)
        ));
        assert_eq!(
            FallbackReason::DimensionMismatch.to_string(),
            "key longer than the native rank"
        );
    }
}
