//! Behavioural properties of the array helpers across backends.

use std::borrow::Cow;

use kore_array::{
    getitem, setitem, size_of_shape, sum_to, AccelArray, Array, ArrayBackend, ArrayKind,
    IndexItem,
};
use kore_core::{DType, Device, DeviceGuard, KoreError, ScatterOrder, Slice, Tensor};

fn index_array(values: &[i64]) -> IndexItem {
    IndexItem::Array(Array::from(Tensor::from_i64(values, &[values.len()])))
}

fn cpu_range(n: usize, shape: &[usize]) -> Tensor {
    let data: Vec<f32> = (0..n).map(|v| v as f32).collect();
    Tensor::from_f32(&data, shape)
}

// ============================================================================
// size_of_shape
// ============================================================================

#[test]
fn size_is_the_product_of_dims() {
    let cases: [&[usize]; 5] = [&[], &[7], &[2, 3, 4], &[1, 1, 1, 1], &[4, 0, 2]];
    for dims in cases {
        assert_eq!(size_of_shape(dims).unwrap(), dims.iter().product::<usize>());
    }
}

#[test]
fn size_overflow_is_reported() {
    let err = size_of_shape(&[usize::MAX / 2 + 1, 2]).unwrap_err();
    assert!(matches!(err, KoreError::ShapeOverflow(dims) if dims.len() == 2));
}

// ============================================================================
// sum_to
// ============================================================================

#[test]
fn sum_to_drops_leading_axis() {
    let x = Array::from(cpu_range(12, &[3, 4]));
    let y = sum_to(&x, &[4]).unwrap();
    assert_eq!(y.shape().dims(), &[4]);
    // each output is the column sum over the first axis
    let cols: Vec<f32> = (0..4).map(|c| (0..3).map(|r| (r * 4 + c) as f32).sum()).collect();
    assert_eq!(y.to_f32_vec().unwrap(), cols);
}

#[test]
fn sum_to_keeps_unit_axis() {
    let x = Array::from(cpu_range(6, &[2, 3]));
    let y = sum_to(&x, &[1, 3]).unwrap();
    assert_eq!(y.shape().dims(), &[1, 3]);
    assert_eq!(y.to_f32_vec().unwrap(), vec![3.0, 5.0, 7.0]);
}

#[test]
fn sum_to_same_shape_is_the_same_object() {
    let x = Array::from(cpu_range(6, &[2, 3]));
    match sum_to(&x, &[2, 3]).unwrap() {
        Cow::Borrowed(y) => assert!(std::ptr::eq(y, &x)),
        Cow::Owned(_) => panic!("identity reduction copied its input"),
    }
}

#[test]
fn sum_to_rejects_tracked_tensors() {
    let mut t = cpu_range(6, &[2, 3]);
    t.set_requires_grad(true);
    let x = Array::from(t);
    for target in [&[2usize, 3][..], &[3][..], &[4, 4][..]] {
        match sum_to(&x, target) {
            Err(KoreError::TypeUnsupported(msg)) => assert!(msg.contains("Tensor::sum_to")),
            other => panic!("expected TypeUnsupported, got {:?}", other.map(|_| ())),
        }
    }
}

#[test]
fn sum_to_keeps_float64_and_integer_dtypes() {
    let x = Array::from(Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]));
    let y = sum_to(&x, &[3]).unwrap();
    assert_eq!(y.dtype(), DType::F64);
    assert_eq!(y.to_fallback().unwrap().to_pod_vec::<f64>().unwrap(), vec![5.0, 7.0, 9.0]);

    let ints = Tensor::from_i64(&[1, 2, 3, 4, 5, 6], &[2, 3]);
    let x = Array::from(AccelArray::from_tensor(&ints));
    let y = sum_to(&x, &[1, 3]).unwrap();
    assert_eq!(y.kind(), ArrayKind::Accel);
    assert_eq!(y.dtype(), DType::I64);
    assert_eq!(y.shape().dims(), &[1, 3]);
    assert_eq!(y.to_fallback().unwrap().to_i64_vec().unwrap(), vec![5, 7, 9]);
}

#[cfg(feature = "cuda")]
#[test]
fn sum_to_on_gpu_stays_on_device() {
    let x = Array::from(cpu_range(6, &[2, 3]).cuda(0).unwrap());
    assert_eq!(x.kind(), ArrayKind::Gpu);
    let y = sum_to(&x, &[3]).unwrap();
    assert_eq!(y.kind(), ArrayKind::Gpu);
    assert_eq!(y.device(), Device::Cuda(0));
    assert_eq!(y.to_f32_vec().unwrap(), vec![3.0, 5.0, 7.0]);
}

#[test]
fn sum_to_result_is_detached() {
    let x = Array::from(cpu_range(6, &[2, 3]));
    let y = sum_to(&x, &[3]).unwrap();
    assert!(!y.requires_grad());
}

// ============================================================================
// getitem
// ============================================================================

#[test]
fn accel_fallback_read_matches_cpu() {
    let t = cpu_range(24, &[2, 3, 4]);
    let accel = Array::from(AccelArray::from_tensor(&t));
    let cpu = Array::from(t);

    let keys: Vec<Vec<IndexItem>> = vec![
        vec![index_array(&[1, 0, 1])],
        vec![IndexItem::Slice(Slice::full()), index_array(&[-1, 0])],
        vec![IndexItem::Int(0), IndexItem::Slice(Slice::full()), index_array(&[3, 3])],
        vec![IndexItem::Slice(Slice::new(None, None, -1))],
        vec![IndexItem::Int(1), IndexItem::Int(2), IndexItem::Int(3)],
    ];
    for key in &keys {
        let a = getitem(&accel, key).unwrap();
        let c = getitem(&cpu, key).unwrap();
        assert_eq!(a.kind(), ArrayKind::Accel);
        assert_eq!(c.kind(), ArrayKind::Cpu);
        assert_eq!(a.shape(), c.shape());
        assert_eq!(a.to_f32_vec().unwrap(), c.to_f32_vec().unwrap());
    }
}

#[test]
fn accel_index_array_in_key_of_cpu_tensor() {
    let cpu = Array::from(cpu_range(5, &[5]));
    let picks = AccelArray::from_tensor(&Tensor::from_i64(&[4, 4, 0], &[3]));
    let y = getitem(&cpu, &[IndexItem::Array(Array::from(picks))]).unwrap();
    assert_eq!(y.kind(), ArrayKind::Cpu);
    assert_eq!(y.to_f32_vec().unwrap(), vec![4.0, 4.0, 0.0]);
}

#[test]
fn too_many_indices_on_accel_falls_back_then_fails() {
    let accel = Array::from(AccelArray::from_tensor(&cpu_range(4, &[4])));
    let err = getitem(&accel, &[IndexItem::Int(0), IndexItem::Int(0)]).unwrap_err();
    assert!(matches!(err, KoreError::TooManyIndices { got: 2, ndim: 1 }));
}

#[test]
fn getitem_results_are_not_differentiable() {
    let mut t = cpu_range(4, &[4]);
    t.set_requires_grad(true);
    let y = getitem(&Array::from(t), &[index_array(&[0, 1])]).unwrap();
    assert!(!y.requires_grad());
}

#[test]
fn failed_fallback_restores_current_device() {
    let accel = Array::from(AccelArray::from_tensor(&cpu_range(4, &[4])));
    let mut cpu = Array::from(cpu_range(4, &[4]));
    let _outer = DeviceGuard::new(Device::Cuda(0)).unwrap();

    // both fail inside a host-device scope
    let err = getitem(&accel, &[index_array(&[9])]).unwrap_err();
    assert!(matches!(err, KoreError::IndexOutOfBounds { .. }));
    assert_eq!(kore_core::device::current_device(), Device::Cuda(0));

    let err = setitem(&mut cpu, &[index_array(&[9])], &Array::from(Tensor::scalar(1.0)));
    assert!(matches!(err, Err(KoreError::IndexOutOfBounds { .. })));
    assert_eq!(kore_core::device::current_device(), Device::Cuda(0));
}

// ============================================================================
// setitem
// ============================================================================

#[test]
fn cpu_duplicate_writes_keep_the_last() {
    let mut x = Array::from(Tensor::zeros(&[3], DType::F32));
    let key = [index_array(&[2, 0, 2, 0, 2])];
    let value = Array::from(Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0], &[5]));
    setitem(&mut x, &key, &value).unwrap();
    assert_eq!(x.to_f32_vec().unwrap(), vec![4.0, 0.0, 5.0]);
}

#[test]
fn accel_duplicate_writes_keep_the_last() {
    let mut x = Array::from(AccelArray::zeros(&[2, 2], DType::F32));
    let key = [index_array(&[1, 1]), IndexItem::Slice(Slice::full())];
    let value = Array::from(Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]));
    setitem(&mut x, &key, &value).unwrap();
    assert_eq!(x.kind(), ArrayKind::Accel);
    assert_eq!(x.to_f32_vec().unwrap(), vec![0.0, 0.0, 3.0, 4.0]);
}

#[test]
fn setitem_is_seen_by_every_handle() {
    let t = cpu_range(4, &[4]);
    let mut x = Array::from(t.clone());
    setitem(&mut x, &[IndexItem::Int(0)], &Array::from(Tensor::scalar(9.0))).unwrap();
    assert_eq!(x.to_f32_vec().unwrap()[0], 9.0);
    assert_eq!(t.to_f32_vec().unwrap()[0], 9.0);
}

#[test]
fn setitem_through_accel_views_reaches_base() {
    let base = Array::from(AccelArray::from_f32(&[0.0, 1.0, 2.0, 3.0], &[2, 2]));

    // offset view
    let mut row = getitem(&base, &[IndexItem::Int(1)]).unwrap();
    setitem(&mut row, &[IndexItem::Int(0)], &Array::from(Tensor::scalar(9.0))).unwrap();
    assert_eq!(row.to_f32_vec().unwrap(), vec![9.0, 3.0]);
    assert_eq!(base.to_f32_vec().unwrap(), vec![0.0, 1.0, 9.0, 3.0]);

    // strided view, written through an index array
    let mut col = getitem(&base, &[IndexItem::Slice(Slice::full()), IndexItem::Int(1)]).unwrap();
    assert_eq!(col.kind(), ArrayKind::Accel);
    let value = Array::from(Tensor::from_f32(&[7.0, 8.0], &[2]));
    setitem(&mut col, &[index_array(&[1, 0])], &value).unwrap();
    assert_eq!(col.to_f32_vec().unwrap(), vec![8.0, 7.0]);
    assert_eq!(base.to_f32_vec().unwrap(), vec![0.0, 8.0, 9.0, 7.0]);
}

#[cfg(feature = "cuda")]
#[test]
fn setitem_through_gpu_view_reaches_base() {
    let base = Array::from(cpu_range(4, &[2, 2]).cuda(0).unwrap());
    let mut row = getitem(&base, &[IndexItem::Int(0)]).unwrap();
    assert_eq!(row.kind(), ArrayKind::Gpu);
    setitem(&mut row, &[IndexItem::Int(1)], &Array::from(Tensor::scalar(9.0))).unwrap();
    assert_eq!(base.to_f32_vec().unwrap(), vec![0.0, 9.0, 2.0, 3.0]);
}

#[test]
fn setitem_dtype_mismatch() {
    let mut x = Array::from(Tensor::zeros(&[2], DType::F32));
    let value = Array::from(Tensor::from_i64(&[1], &[1]));
    let err = setitem(&mut x, &[IndexItem::Int(0)], &value).unwrap_err();
    assert!(matches!(err, KoreError::DTypeMismatch { expected: DType::F32, got: DType::I64 }));
}

#[test]
fn host_backends_write_in_order() {
    let cpu = Array::from(Tensor::ones(&[1]));
    let accel = Array::from(AccelArray::zeros(&[1], DType::F32));
    assert_eq!(cpu.device(), Device::Cpu);
    assert_eq!(cpu.scatter_order(), ScatterOrder::Ordered);
    assert_eq!(accel.scatter_order(), ScatterOrder::Ordered);
}
