//! Reduction operations: sum, axis sums, broadcast-reduction.

use bytemuck::Pod;
use rayon::prelude::*;

use crate::autograd::{self, GradNode, SumBackward, SumToBackward};
use crate::dtype::DType;
use crate::error::KoreError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::tensor::Tensor;
use crate::Result;

const PAR_THRESHOLD: usize = 8192;

/// Element types `sum_axes` can reduce.
trait Accumulate: Pod + Default {
    fn accumulate(&mut self, v: Self);
}

impl Accumulate for f32 {
    fn accumulate(&mut self, v: Self) {
        *self += v;
    }
}

impl Accumulate for f64 {
    fn accumulate(&mut self, v: Self) {
        *self += v;
    }
}

impl Accumulate for i32 {
    fn accumulate(&mut self, v: Self) {
        *self = self.wrapping_add(v);
    }
}

impl Accumulate for i64 {
    fn accumulate(&mut self, v: Self) {
        *self = self.wrapping_add(v);
    }
}

impl Tensor {
    /// Sum all elements, returning a scalar tensor.
    pub fn sum(&self) -> Result<Tensor> {
        if self.dtype() != DType::F32 {
            return Err(KoreError::UnsupportedDType(self.dtype()));
        }
        let data = self.to_f32_vec()?;
        let total: f32 = if data.len() >= PAR_THRESHOLD {
            data.par_iter().sum()
        } else {
            data.iter().sum()
        };
        let result = Tensor::scalar(total);
        if self.tracks_grad() && autograd::is_grad_enabled() {
            let node = GradNode::with_grad_fn(
                Box::new(SumBackward { input_shape: self.shape().dims().to_vec() }),
                self.grad_node().into_iter().cloned().collect(),
            );
            Ok(result.with_grad_node(node))
        } else {
            Ok(result)
        }
    }

    /// Sum along a specific axis, removing that dimension.
    pub fn sum_axis(&self, axis: usize) -> Result<Tensor> {
        self.sum_axes(&[axis], false)
    }

    /// Sum over several axes at once.
    ///
    /// With `keepdims` the reduced axes stay in the result with size 1,
    /// otherwise they are removed. The result has this tensor's dtype;
    /// integer sums wrap on overflow. Duplicate axes are rejected. Never
    /// records autograd history.
    pub fn sum_axes(&self, axes: &[usize], keepdims: bool) -> Result<Tensor> {
        let ndim = self.ndim();
        let mut reduced = vec![false; ndim];
        for &axis in axes {
            if axis >= ndim {
                return Err(KoreError::InvalidAxis { axis, ndim });
            }
            if reduced[axis] {
                return Err(KoreError::StorageError(format!(
                    "sum_axes: axis {} given more than once",
                    axis
                )));
            }
            reduced[axis] = true;
        }

        let kept: Vec<usize> = self
            .shape()
            .dims()
            .iter()
            .zip(&reduced)
            .map(|(&d, &r)| if r { 1 } else { d })
            .collect();
        let storage = match self.dtype() {
            DType::F32 => self.sum_kept::<f32>(&reduced, &kept)?,
            DType::F64 => self.sum_kept::<f64>(&reduced, &kept)?,
            DType::I32 => self.sum_kept::<i32>(&reduced, &kept)?,
            DType::I64 => self.sum_kept::<i64>(&reduced, &kept)?,
        };

        let result = Tensor::from_storage(storage, &kept);
        if keepdims {
            Ok(result)
        } else {
            let squeezed: Vec<usize> = (0..ndim).filter(|&a| reduced[a]).collect();
            result.squeeze_axes(&squeezed)
        }
    }

    /// Accumulate every element into its slot of the keep-dims output.
    fn sum_kept<T: Accumulate>(&self, reduced: &[bool], kept: &[usize]) -> Result<Storage> {
        let dims = self.shape().dims();
        let kept_shape = Shape::new(kept);
        let kept_strides = kept_shape.contiguous_strides();

        let src: Vec<T> = self.to_pod_vec()?;
        let mut out = vec![T::default(); kept_shape.numel()];
        let mut coord = vec![0usize; dims.len()];
        for v in src {
            let dst: usize = coord
                .iter()
                .zip(reduced)
                .zip(kept_strides.iter())
                .map(|((&c, &r), &s)| if r { 0 } else { c * s })
                .sum();
            out[dst].accumulate(v);
            for axis in (0..dims.len()).rev() {
                coord[axis] += 1;
                if coord[axis] < dims[axis] {
                    break;
                }
                coord[axis] = 0;
            }
        }
        Ok(Storage::from_pod(&out, self.dtype()))
    }

    /// Remove the given size-1 axes (zero-copy view).
    pub fn squeeze_axes(&self, axes: &[usize]) -> Result<Tensor> {
        let ndim = self.ndim();
        for &axis in axes {
            match self.shape().dim(axis) {
                Some(1) => {}
                Some(size) => {
                    return Err(KoreError::StorageError(format!(
                        "cannot squeeze axis {} of size {}",
                        axis, size
                    )))
                }
                None => return Err(KoreError::InvalidAxis { axis, ndim }),
            }
        }
        let keep = |a: &usize| !axes.contains(a);
        let dims: Vec<usize> = (0..ndim).filter(keep).map(|a| self.shape().dims()[a]).collect();
        let strides: Vec<usize> = (0..ndim).filter(keep).map(|a| self.strides()[a]).collect();
        Tensor::from_strided(
            self.storage_ref().clone(),
            Shape::new(&dims),
            &strides,
            self.offset(),
        )
    }

    /// Sum this tensor down to `shape`, a broadcast-reduction target of
    /// its own shape. Leading axes are summed away; axes where `shape`
    /// is 1 are summed with keep-dims.
    ///
    /// Fixed-point: the result carries no autograd history. See
    /// [`Tensor::sum_to`] for the differentiable variant.
    pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Tensor> {
        let target = Shape::new(shape);
        if self.shape() == &target {
            return Ok(self.detach());
        }
        if !self.shape().reduces_to(&target) {
            return Err(KoreError::BroadcastError {
                a: self.shape().dims().to_vec(),
                b: shape.to_vec(),
            });
        }

        let lead = self.ndim() - target.ndim();
        let lead_axes: Vec<usize> = (0..lead).collect();
        let mut axes = lead_axes.clone();
        axes.extend(
            shape
                .iter()
                .enumerate()
                .filter(|&(_, &sx)| sx == 1)
                .map(|(i, _)| i + lead),
        );

        let y = self.sum_axes(&axes, true)?;
        if lead > 0 {
            y.squeeze_axes(&lead_axes)
        } else {
            Ok(y)
        }
    }

    /// Differentiable broadcast-reduction to `shape`.
    ///
    /// The backward pass broadcasts the incoming gradient back to this
    /// tensor's shape.
    pub fn sum_to(&self, shape: &[usize]) -> Result<Tensor> {
        if self.shape().dims() == shape {
            return Ok(self.clone());
        }
        let result = self.sum_to_shape(shape)?;
        if self.tracks_grad() {
            let node = GradNode::with_grad_fn(
                Box::new(SumToBackward { input_shape: self.shape().dims().to_vec() }),
                self.grad_node().into_iter().cloned().collect(),
            );
            Ok(result.with_grad_node(node))
        } else {
            Ok(result)
        }
    }
}
