//! Shape and reduction helpers, plus the deprecated array shims.

use std::borrow::Cow;

use kore_core::{DeviceGuard, KoreError, Result, Tensor};

use crate::accel::AccelArray;
use crate::backend::{Array, ArrayBackend};

/// Number of elements in an array of shape `shape`; 1 for `[]`.
///
/// ```
/// assert_eq!(kore_array::size_of_shape(&[2, 3, 4]).unwrap(), 24);
/// assert_eq!(kore_array::size_of_shape(&[]).unwrap(), 1);
/// ```
pub fn size_of_shape(shape: &[usize]) -> Result<usize> {
    if shape.contains(&0) {
        return Ok(0);
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| KoreError::ShapeOverflow(shape.to_vec()))
}

/// Sum `x` down to `shape`.
///
/// `shape` must be a broadcast-reduction target of `x`'s shape: leading
/// axes are summed away and axes where `shape` is 1 are summed with
/// keep-dims. When the shapes already match, `x` itself is returned.
///
/// This is a fixed-point operation. Tensors tracking gradients are
/// rejected; use [`Tensor::sum_to`] to keep the graph.
pub fn sum_to<'a>(x: &'a Array, shape: &[usize]) -> Result<Cow<'a, Array>> {
    if x.requires_grad() {
        return Err(KoreError::TypeUnsupported(
            "sum_to does not support tensors that track gradients, use Tensor::sum_to instead"
                .into(),
        ));
    }
    if x.shape().dims() == shape {
        return Ok(Cow::Borrowed(x));
    }

    let device = x.device();
    let _scope = DeviceGuard::new(device)?;
    let reduced = match x {
        Array::Cpu(t) | Array::Gpu(t) => Array::from(t.sum_to_shape(shape)?.to(device)?),
        Array::Accel(a) => {
            let t = a.to_tensor()?.sum_to_shape(shape)?.to(device)?;
            Array::Accel(AccelArray::from_tensor(&t))
        }
    };
    Ok(Cow::Owned(reduced))
}

fn warn_deprecated(helper: &str, replacement: &str) {
    tracing::warn!(
        target: "kore_array::deprecated",
        helper,
        replacement,
        "{helper} is deprecated, use {replacement} instead"
    );
}

/// Return `x` if it is 1-D, otherwise a flattened copy or view.
#[deprecated(note = "use `Tensor::reshape(&[-1])` instead")]
pub fn as_vec(x: &Array) -> Result<Array> {
    warn_deprecated("as_vec", "Tensor::reshape(&[-1])");
    if x.ndim() == 1 {
        return Ok(x.clone());
    }
    let flat = x.to_fallback()?.contiguous()?.reshape(&[-1])?;
    Ok(Array::from_fallback(flat, x.kind()))
}

/// Return `x` if it is 2-D, otherwise `x` reshaped to `(len(x), -1)`.
#[deprecated(note = "use `Tensor::reshape` instead")]
pub fn as_mat(x: &Array) -> Result<Array> {
    warn_deprecated("as_mat", "Tensor::reshape");
    if x.ndim() == 2 {
        return Ok(x.clone());
    }
    let Some(&len) = x.shape().dims().first() else {
        return Err(KoreError::TypeUnsupported("as_mat: a 0-d array has no length".into()));
    };
    let mat = x.to_fallback()?.contiguous()?.reshape(&[len as isize, -1])?;
    Ok(Array::from_fallback(mat, x.kind()))
}

/// A zero-filled array with `x`'s shape and dtype.
///
/// GPU inputs allocate on their device. Everything else, accelerator
/// arrays included, allocates on the CPU.
#[deprecated(note = "use `Tensor::zeros` instead")]
pub fn empty_like(x: &Array) -> Result<Array> {
    warn_deprecated("empty_like", "Tensor::zeros");
    let dims = x.shape().dims();
    match x {
        Array::Gpu(t) => Ok(Array::Gpu(Tensor::zeros_on(dims, t.dtype(), t.device())?)),
        _ => Ok(Array::Cpu(Tensor::zeros(dims, x.dtype()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore_core::DType;

    #[test]
    fn test_size_of_shape() {
        assert_eq!(size_of_shape(&[]).unwrap(), 1);
        assert_eq!(size_of_shape(&[2, 3, 4]).unwrap(), 24);
        assert_eq!(size_of_shape(&[5, 0, 7]).unwrap(), 0);
        assert!(matches!(
            size_of_shape(&[usize::MAX, 2]),
            Err(KoreError::ShapeOverflow(_))
        ));
        assert_eq!(size_of_shape(&[usize::MAX, usize::MAX, 0]).unwrap(), 0);
    }

    #[test]
    fn test_sum_to_identity_borrows() {
        let x = Array::from(Tensor::ones(&[2, 3]));
        let y = sum_to(&x, &[2, 3]).unwrap();
        assert!(matches!(y, Cow::Borrowed(b) if std::ptr::eq(b, &x)));
    }

    #[test]
    fn test_sum_to_leading_axis() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let x = Array::from(Tensor::from_f32(&data, &[3, 4]));
        let y = sum_to(&x, &[4]).unwrap();
        assert_eq!(y.shape().dims(), &[4]);
        assert_eq!(y.to_f32_vec().unwrap(), vec![12.0, 15.0, 18.0, 21.0]);
    }

    #[test]
    fn test_sum_to_keeps_unit_dims() {
        let x = Array::from(Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]));
        let y = sum_to(&x, &[1, 3]).unwrap();
        assert_eq!(y.shape().dims(), &[1, 3]);
        assert_eq!(y.to_f32_vec().unwrap(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_sum_to_rejects_grad_tracking_first() {
        let mut t = Tensor::ones(&[2, 3]);
        t.set_requires_grad(true);
        let x = Array::from(t);
        // rejected even for the identity target and for incompatible targets
        for target in [&[2usize, 3][..], &[3][..], &[7, 7][..]] {
            assert!(matches!(sum_to(&x, target), Err(KoreError::TypeUnsupported(_))));
        }
    }

    #[test]
    fn test_sum_to_accel_stays_accel() {
        let x = Array::from(AccelArray::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]));
        let y = sum_to(&x, &[2]).unwrap();
        assert!(matches!(y.as_ref(), Array::Accel(_)));
        assert_eq!(y.to_f32_vec().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_sum_to_incompatible() {
        let x = Array::from(Tensor::ones(&[2, 3]));
        assert!(matches!(sum_to(&x, &[2]), Err(KoreError::BroadcastError { .. })));
    }

    #[test]
    #[allow(deprecated)]
    fn test_as_vec_and_as_mat() {
        let m = Array::from(Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]));
        let v = as_vec(&m).unwrap();
        assert_eq!(v.shape().dims(), &[6]);
        assert_eq!(as_vec(&v).unwrap().shape().dims(), &[6]);

        let cube = Array::from(Tensor::ones(&[2, 3, 4]));
        assert_eq!(as_mat(&cube).unwrap().shape().dims(), &[2, 12]);
        assert_eq!(as_mat(&v).unwrap().shape().dims(), &[6, 1]);
        assert_eq!(as_mat(&m).unwrap().shape().dims(), &[2, 3]);
        assert!(as_mat(&Array::from(Tensor::scalar(1.0))).is_err());
    }

    #[test]
    #[allow(deprecated)]
    fn test_as_vec_transposed_accel() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).transpose().unwrap();
        let v = as_vec(&Array::from(AccelArray::from_tensor(&t))).unwrap();
        assert!(matches!(v, Array::Accel(_)));
        assert_eq!(v.to_f32_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    #[allow(deprecated)]
    fn test_empty_like() {
        let x = Array::from(AccelArray::zeros(&[2, 2], DType::I64));
        let e = empty_like(&x).unwrap();
        assert!(matches!(e, Array::Cpu(_)));
        assert_eq!(e.shape().dims(), &[2, 2]);
        assert_eq!(e.dtype(), DType::I64);
    }
}
