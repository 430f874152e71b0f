//! Element-wise arithmetic and broadcasting.

use crate::autograd::{AddBackward, BroadcastToBackward, GradNode};
use crate::dtype::DType;
use crate::error::KoreError;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Element-wise addition with broadcasting: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let result = binary_op(self, other, |a, b| a + b)?;
        let tracked: Vec<&Tensor> = [self, other]
            .into_iter()
            .filter(|t| t.tracks_grad())
            .collect();
        if tracked.is_empty() {
            return Ok(result);
        }
        let node = GradNode::with_grad_fn(
            Box::new(AddBackward {
                input_shapes: tracked.iter().map(|t| t.shape().dims().to_vec()).collect(),
            }),
            tracked.iter().filter_map(|t| t.grad_node().cloned()).collect(),
        );
        Ok(result.with_grad_node(node))
    }

    /// Materialize this tensor broadcast to `shape` (NumPy rules).
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        let target = Shape::new(shape);
        if !self.shape().broadcasts_to(&target) {
            return Err(KoreError::BroadcastError {
                a: self.shape().dims().to_vec(),
                b: shape.to_vec(),
            });
        }
        if self.dtype() != DType::F32 {
            return Err(KoreError::UnsupportedDType(self.dtype()));
        }

        let src = self.to_f32_vec()?;
        let data: Vec<f32> = (0..target.numel())
            .map(|i| src[broadcast_index(i, &target, self.shape())])
            .collect();
        let result = Tensor::from_f32(&data, shape);

        if self.tracks_grad() {
            let node = GradNode::with_grad_fn(
                Box::new(BroadcastToBackward {
                    input_shape: self.shape().dims().to_vec(),
                }),
                self.grad_node().into_iter().cloned().collect(),
            );
            Ok(result.with_grad_node(node))
        } else {
            Ok(result)
        }
    }
}

/// Apply a binary operation element-wise with broadcasting (f32 only for now).
fn binary_op(a: &Tensor, b: &Tensor, op: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    if a.dtype() != DType::F32 || b.dtype() != DType::F32 {
        return Err(KoreError::DTypeMismatch {
            expected: a.dtype(),
            got: b.dtype(),
        });
    }

    let out_shape = a.shape().broadcast_with(b.shape()).ok_or_else(|| {
        KoreError::BroadcastError {
            a: a.shape().dims().to_vec(),
            b: b.shape().dims().to_vec(),
        }
    })?;

    let a_data = a.to_f32_vec()?;
    let b_data = b.to_f32_vec()?;

    let result: Vec<f32> = if a.shape() == b.shape() {
        // Fast path: same shape
        a_data.iter().zip(&b_data).map(|(&x, &y)| op(x, y)).collect()
    } else {
        (0..out_shape.numel())
            .map(|i| {
                let a_idx = broadcast_index(i, &out_shape, a.shape());
                let b_idx = broadcast_index(i, &out_shape, b.shape());
                op(a_data[a_idx], b_data[b_idx])
            })
            .collect()
    };

    Ok(Tensor::from_f32(&result, out_shape.dims()))
}

/// Compute the source index for a broadcasted element.
pub(crate) fn broadcast_index(flat_idx: usize, out_shape: &Shape, src_shape: &Shape) -> usize {
    let src_dims = src_shape.dims();
    let out_ndim = out_shape.ndim();
    let src_ndim = src_dims.len();

    let mut remaining = flat_idx;
    let mut src_idx = 0;
    let out_strides = out_shape.contiguous_strides();
    let src_strides = src_shape.contiguous_strides();

    for i in 0..out_ndim {
        let coord = remaining / out_strides[i];
        remaining %= out_strides[i];

        let src_dim_idx = i as isize - (out_ndim as isize - src_ndim as isize);
        if src_dim_idx >= 0 {
            let si = src_dim_idx as usize;
            // size-1 source dims are broadcast: coord maps to 0
            if src_dims[si] > 1 {
                src_idx += coord * src_strides[si];
            }
        }
    }

    src_idx
}

#[cfg(test)]
mod tests {
    use crate::Tensor;

    #[test]
    fn test_add_same_shape() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let b = Tensor::from_f32(&[10.0, 20.0, 30.0], &[3]);
        assert_eq!(a.add(&b).unwrap().to_f32_vec().unwrap(), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_add_broadcast() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = Tensor::from_f32(&[10.0, 20.0, 30.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape().dims(), &[2, 3]);
        assert_eq!(c.to_f32_vec().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_add_incompatible() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_broadcast_to() {
        let t = Tensor::from_f32(&[1.0, 2.0], &[2, 1]);
        let b = t.broadcast_to(&[2, 3]).unwrap();
        assert_eq!(b.to_f32_vec().unwrap(), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(t.broadcast_to(&[3, 3]).is_err());
    }

    #[test]
    fn test_broadcast_to_backward_sums() {
        let mut t = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        t.set_requires_grad(true);
        let b = t.broadcast_to(&[2, 3]).unwrap();
        b.sum().unwrap().backward().unwrap();
        let g = t.grad().unwrap();
        assert_eq!(g.to_f32_vec().unwrap(), vec![2.0, 2.0, 2.0]);
    }
}
