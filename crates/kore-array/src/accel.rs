//! Accelerator array: a strided view over Kore storage with partial
//! indexing support.
//!
//! Only integer and positive-step slice items are handled natively, and
//! only up to the array's rank. Everything else is reported back as an
//! [`IndexOutcome::Unsupported`] so the caller can retry on a `Tensor`.

use std::fmt;

use smallvec::SmallVec;

use kore_core::{DType, Device, KoreError, Result, Shape, Slice, Storage, Tensor};

use crate::backend::{FallbackReason, IndexItem, IndexOutcome};

#[derive(Clone)]
pub struct AccelArray {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
    offset: usize,
}

impl AccelArray {
    /// Wrap a tensor's storage without copying.
    pub fn from_tensor(t: &Tensor) -> Self {
        Self {
            storage: t.storage_ref().clone(),
            shape: t.shape().clone(),
            strides: SmallVec::from_slice(t.strides()),
            offset: t.offset(),
        }
    }

    /// View this array as a tensor sharing the same storage.
    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::from_strided(self.storage.clone(), self.shape.clone(), &self.strides, self.offset)
    }

    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::from_tensor(&Tensor::from_f32(data, shape))
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::from_tensor(&Tensor::zeros(shape, dtype))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether `other` views the same buffer.
    pub fn shares_storage(&self, other: &AccelArray) -> bool {
        self.storage.same_buffer(&other.storage)
    }

    /// Copy the elements out in logical order (f32 only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.to_tensor()?.to_f32_vec()
    }

    /// Native indexing: basic keys produce a view over the same storage.
    ///
    /// Out-of-range integers are real errors; keys this array cannot
    /// express come back as `Unsupported`.
    pub fn try_index(&self, key: &[IndexItem]) -> Result<IndexOutcome<AccelArray>> {
        if key.iter().any(|k| matches!(k, IndexItem::Array(_))) {
            return Ok(IndexOutcome::Unsupported(FallbackReason::AdvancedIndex));
        }
        if key.len() > self.ndim() {
            return Ok(IndexOutcome::Unsupported(FallbackReason::DimensionMismatch));
        }

        let mut offset = self.offset;
        let mut dims = SmallVec::<[usize; 4]>::new();
        let mut strides = SmallVec::<[usize; 4]>::new();
        for (axis, (&size, &stride)) in self.shape.dims().iter().zip(&self.strides).enumerate() {
            match key.get(axis) {
                Some(IndexItem::Int(i)) => {
                    let resolved = if *i < 0 { *i + size as isize } else { *i };
                    if resolved < 0 || resolved >= size as isize {
                        return Err(KoreError::IndexOutOfBounds { index: *i, axis, size });
                    }
                    offset += resolved as usize * stride;
                }
                Some(IndexItem::Slice(s)) if s.step < 0 => {
                    return Ok(IndexOutcome::Unsupported(FallbackReason::NegativeStep));
                }
                item => {
                    let s = match item {
                        Some(IndexItem::Slice(s)) => *s,
                        _ => Slice::full(),
                    };
                    let (start, len, step) = s.indices(size)?;
                    if len > 0 {
                        offset += start as usize * stride;
                    }
                    dims.push(len);
                    strides.push(stride * step as usize);
                }
            }
        }

        let shape = Shape::new(&dims);
        if shape.numel() == 0 {
            offset = 0;
        }
        Ok(IndexOutcome::Done(Self {
            storage: self.storage.clone(),
            shape,
            strides,
            offset,
        }))
    }
}

impl fmt::Debug for AccelArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccelArray(shape={}, dtype={}, device={})",
            self.shape,
            self.dtype(),
            self.device()
        )
    }
}
