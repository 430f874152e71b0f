use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use smallvec::SmallVec;

use crate::autograd::GradNode;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::KoreError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A multi-dimensional array — the fundamental data structure in Kore.
///
/// Tensors support:
/// - F32/F64/I32/I64 dtypes over shared byte storage
/// - Zero-copy views (reshape, transpose, basic indexing share storage)
/// - CPU and CUDA devices
/// - Automatic gradient tracking
///
/// # Examples
///
/// ```
/// use kore_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.numel(), 4);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.shape().dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
    offset: usize,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::check_len(data.len(), shape);
        Self::from_storage(Storage::from_f32(data), shape)
    }

    /// Create a tensor from f64 data with the given shape.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        Self::check_len(data.len(), shape);
        Self::from_storage(Storage::from_f64(data), shape)
    }

    /// Create a tensor from i32 data with the given shape.
    pub fn from_i32(data: &[i32], shape: &[usize]) -> Self {
        Self::check_len(data.len(), shape);
        Self::from_storage(Storage::from_i32(data), shape)
    }

    /// Create an i64 tensor, typically used as an index array.
    pub fn from_i64(data: &[i64], shape: &[usize]) -> Self {
        Self::check_len(data.len(), shape);
        Self::from_storage(Storage::from_i64(data), shape)
    }

    fn check_len(len: usize, shape: &[usize]) {
        let numel: usize = shape.iter().product();
        assert_eq!(
            numel, len,
            "Shape {:?} requires {} elements, got {}",
            shape, numel, len
        );
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(dtype, s.numel()), shape)
    }

    /// Create a tensor of zeros directly on `device`.
    pub fn zeros_on(shape: &[usize], dtype: DType, device: Device) -> Result<Self> {
        let s = Shape::new(shape);
        let storage = Storage::zeros_on(dtype, s.numel(), device)?;
        Ok(Self::from_storage(storage, shape))
    }

    /// Create a tensor of ones (f32).
    pub fn ones(shape: &[usize]) -> Self {
        let numel = Shape::new(shape).numel();
        Self::from_f32(&vec![1.0; numel], shape)
    }

    /// Create a 1-D f32 tensor with values from `start` to `end` (exclusive).
    ///
    /// # Panics
    /// Panics if `step` is zero.
    pub fn arange(start: f32, end: f32, step: f32) -> Self {
        assert!(step != 0.0, "arange: step must be non-zero");
        let mut data = Vec::new();
        let mut v = start;
        while (step > 0.0 && v < end) || (step < 0.0 && v > end) {
            data.push(v);
            v += step;
        }
        let len = data.len();
        Self::from_f32(&data, &[len])
    }

    /// Create a scalar tensor from a single f32 value.
    pub fn scalar(value: f32) -> Self {
        Self::from_storage(Storage::from_f32(&[value]), &[])
    }

    /// Create a contiguous tensor from pre-built Storage and shape.
    pub fn from_storage(storage: Storage, shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        let strides = s.contiguous_strides();
        Self {
            storage,
            shape: s,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a strided view over existing storage.
    ///
    /// Strides and offset are in elements. Returns an error if the view
    /// would reach past the end of the storage.
    pub fn from_strided(
        storage: Storage,
        shape: Shape,
        strides: &[usize],
        offset: usize,
    ) -> Result<Self> {
        if strides.len() != shape.ndim() {
            return Err(KoreError::StorageError(format!(
                "{} strides given for a {}-D view",
                strides.len(),
                shape.ndim()
            )));
        }
        if shape.numel() > 0 {
            let last: usize = shape
                .dims()
                .iter()
                .zip(strides)
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>()
                + offset;
            if last >= storage.numel() {
                return Err(KoreError::StorageError(format!(
                    "view {} with offset {} reaches element {} of a {}-element storage",
                    shape,
                    offset,
                    last,
                    storage.numel()
                )));
            }
        }
        Ok(Self {
            storage,
            shape,
            strides: SmallVec::from_slice(strides),
            offset,
            requires_grad: false,
            grad_node: None,
        })
    }

    /// Get a reference to the underlying storage.
    pub fn storage_ref(&self) -> &Storage {
        &self.storage
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Device.
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Strides (in elements, not bytes).
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset of the first element in the storage (in elements).
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether this tensor requires gradient computation.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set whether this tensor requires gradient computation.
    /// When enabled, creates a leaf GradNode for this tensor.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    /// Get the GradNode for this tensor (if tracking gradients).
    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a GradNode to this tensor (used by op dispatch).
    /// Also sets requires_grad=true since this tensor is part of the computation graph.
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self.requires_grad = true;
        self
    }

    /// A copy of this tensor's handle with no autograd history.
    pub fn detach(&self) -> Tensor {
        let mut t = self.clone();
        t.requires_grad = false;
        t.grad_node = None;
        t
    }

    /// Get the accumulated gradient for this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    /// Clear accumulated gradients.
    pub fn zero_grad(&self) {
        if let Some(ref node) = self.grad_node {
            node.zero_grad();
        }
    }

    /// Run backward pass from this tensor (must be scalar).
    pub fn backward(&self) -> Result<()> {
        if self.numel() != 1 {
            return Err(KoreError::ShapeMismatch {
                expected: vec![1],
                got: self.shape().dims().to_vec(),
            });
        }
        let node = self.grad_node.as_ref().ok_or_else(|| {
            KoreError::StorageError("backward() called on tensor without grad tracking".into())
        })?;
        crate::autograd::backward(node, Tensor::scalar(1.0))
    }

    /// Whether ops on this tensor should record a graph node.
    pub fn tracks_grad(&self) -> bool {
        self.requires_grad && self.grad_node.is_some() && crate::autograd::is_grad_enabled()
    }

    /// Whether this tensor is contiguous in memory (row-major).
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.contiguous_strides() && self.offset == 0
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Get a single f32 element by flat (logical) index.
    pub fn get_f32(&self, flat_index: usize) -> Option<f32> {
        let slice = self.storage.as_f32_slice()?;
        let physical = self.flat_to_physical(flat_index)?;
        slice.get(physical).copied()
    }

    /// Copy the elements out in logical row-major order (f32 only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let host = self.to(Device::Cpu)?;
        let data = host
            .storage
            .as_f32_slice()
            .ok_or(KoreError::UnsupportedDType(self.dtype()))?;
        Ok(host.physical_offsets().into_iter().map(|p| data[p]).collect())
    }

    /// Copy the elements out in logical order as `T`, whose size must
    /// match the element size of this tensor's dtype.
    pub fn to_pod_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let elem = self.dtype().element_size();
        if std::mem::size_of::<T>() != elem {
            return Err(KoreError::UnsupportedDType(self.dtype()));
        }
        let host = self.to(Device::Cpu)?;
        let bytes = host.storage.as_bytes()?;
        Ok(host
            .physical_offsets()
            .into_iter()
            .map(|p| bytemuck::pod_read_unaligned(&bytes[p * elem..(p + 1) * elem]))
            .collect())
    }

    /// Copy the elements out as i64 in logical order (integer dtypes only).
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        let host = self.to(Device::Cpu)?;
        let offsets = host.physical_offsets();
        match self.dtype() {
            DType::I64 => {
                let data = host.storage.as_i64_slice().ok_or_else(|| {
                    KoreError::StorageError("misaligned i64 storage".into())
                })?;
                Ok(offsets.into_iter().map(|p| data[p]).collect())
            }
            DType::I32 => {
                let data = host.storage.as_i32_slice().ok_or_else(|| {
                    KoreError::StorageError("misaligned i32 storage".into())
                })?;
                Ok(offsets.into_iter().map(|p| data[p] as i64).collect())
            }
            other => Err(KoreError::UnsupportedDType(other)),
        }
    }

    /// Convert a flat (logical) index to a physical storage index.
    fn flat_to_physical(&self, flat_index: usize) -> Option<usize> {
        if flat_index >= self.numel() {
            return None;
        }

        let mut remaining = flat_index;
        let mut physical = self.offset;
        let contiguous_strides = self.shape.contiguous_strides();

        for (i, &cs) in contiguous_strides.iter().enumerate() {
            let idx = remaining / cs;
            remaining %= cs;
            physical += idx * self.strides[i];
        }

        Some(physical)
    }

    /// Physical storage index of every element, in logical row-major order.
    pub(crate) fn physical_offsets(&self) -> Vec<usize> {
        let numel = self.numel();
        if self.is_contiguous() {
            return (0..numel).collect();
        }
        let dims = self.shape.dims();
        let mut out = Vec::with_capacity(numel);
        let mut coord = vec![0usize; dims.len()];
        for _ in 0..numel {
            let physical: usize = self.offset
                + coord
                    .iter()
                    .zip(self.strides.iter())
                    .map(|(&c, &s)| c * s)
                    .sum::<usize>();
            out.push(physical);
            // odometer increment, last axis fastest
            for axis in (0..dims.len()).rev() {
                coord[axis] += 1;
                if coord[axis] < dims[axis] {
                    break;
                }
                coord[axis] = 0;
            }
        }
        out
    }

    // =========================================================================
    // Shape operations (zero-copy views)
    // =========================================================================

    /// Reshape the tensor (zero-copy; the tensor must be contiguous).
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            KoreError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.iter().map(|&d| d.max(0) as usize).collect(),
            }
        })?;

        if !self.is_contiguous() {
            return Err(KoreError::StorageError(
                "Cannot reshape non-contiguous tensor (call .contiguous() first)".into(),
            ));
        }

        let strides = resolved.contiguous_strides();
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: resolved,
            strides,
            offset: self.offset,
            requires_grad: self.requires_grad,
            grad_node: self.grad_node.clone(),
        })
    }

    /// Transpose the last two dimensions (zero-copy view).
    pub fn transpose(&self) -> Result<Tensor> {
        let new_shape = self.shape.transpose().ok_or(KoreError::InvalidAxis {
            axis: 0,
            ndim: self.ndim(),
        })?;

        let ndim = self.ndim();
        let mut new_strides = self.strides.clone();
        new_strides.swap(ndim - 2, ndim - 1);

        Ok(Tensor {
            storage: self.storage.clone(),
            shape: new_shape,
            strides: new_strides,
            offset: self.offset,
            requires_grad: self.requires_grad,
            grad_node: self.grad_node.clone(),
        })
    }

    // =========================================================================
    // Device transfer
    // =========================================================================

    /// Whether this tensor is on CPU.
    pub fn is_cpu(&self) -> bool {
        self.storage.is_cpu()
    }

    /// Whether this tensor is on a CUDA device.
    pub fn is_cuda(&self) -> bool {
        self.storage.is_cuda()
    }

    /// Move tensor to the specified device. No-op if already there.
    pub fn to(&self, device: Device) -> Result<Tensor> {
        if self.device() == device {
            return Ok(self.clone());
        }
        let storage = match device {
            Device::Cpu => self.storage.to_cpu()?,
            Device::Cuda(idx) => {
                // Must be contiguous before transfer
                let cont = self.contiguous()?;
                cont.storage.to_cuda(idx)?
            }
        };
        let mut moved = Tensor::from_storage(storage, self.shape.dims());
        if device.is_cpu() {
            // D2H keeps the original layout
            moved.strides = self.strides.clone();
            moved.offset = self.offset;
        }
        moved.requires_grad = self.requires_grad;
        moved.grad_node = self.grad_node.clone();
        Ok(moved)
    }

    /// Move tensor to CUDA device (convenience for `.to(Device::Cuda(idx))`).
    pub fn cuda(&self, device_idx: usize) -> Result<Tensor> {
        self.to(Device::Cuda(device_idx))
    }

    /// Move tensor to CPU (convenience for `.to(Device::Cpu)`).
    pub fn cpu(&self) -> Result<Tensor> {
        self.to(Device::Cpu)
    }

    /// Return a contiguous copy of this tensor if it isn't already contiguous.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }

        let device = self.device();
        let host = self.to(Device::Cpu)?;
        let elem = self.dtype().element_size();
        let src = host.storage.as_bytes()?;
        let mut bytes = Vec::with_capacity(self.numel() * elem);
        for p in host.physical_offsets() {
            bytes.extend_from_slice(&src[p * elem..(p + 1) * elem]);
        }
        let storage = Storage::from_bytes(self.dtype(), self.numel(), bytes)?;
        let mut t = Tensor::from_storage(storage, self.shape.dims()).to(device)?;
        t.requires_grad = self.requires_grad;
        t.grad_node = self.grad_node.clone();
        Ok(t)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, contiguous={}, requires_grad={})",
            self.shape,
            self.dtype(),
            self.device(),
            self.is_contiguous(),
            self.requires_grad,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_f32_vec() {
            Ok(data) if data.len() <= 20 => write!(f, "tensor({:?}, shape={})", data, self.shape),
            Ok(data) => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape
            ),
            Err(_) => write!(f, "tensor(shape={}, dtype={})", self.shape, self.dtype()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(t.shape().dims(), &[2, 3]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.dtype(), DType::F32);
        assert!(t.is_contiguous());
    }

    #[test]
    fn test_zeros() {
        let t = Tensor::zeros(&[3, 4], DType::F32);
        assert_eq!(t.numel(), 12);
        assert!(t.to_f32_vec().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_ones() {
        let t = Tensor::ones(&[2, 2]);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_scalar() {
        let t = Tensor::scalar(3.5);
        assert!(t.shape().is_scalar());
        assert_eq!(t.numel(), 1);
        assert_eq!(t.get_f32(0), Some(3.5));
    }

    #[test]
    fn test_arange() {
        let t = Tensor::arange(0.0, 5.0, 1.0);
        assert_eq!(t.to_f32_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let t = Tensor::arange(3.0, 0.0, -1.0);
        assert_eq!(t.to_f32_vec().unwrap(), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.shape().dims(), &[3, 2]);
        assert!(r.storage_ref().same_buffer(t.storage_ref()));
        let r = t.reshape(&[-1]).unwrap();
        assert_eq!(r.shape().dims(), &[6]);
    }

    #[test]
    fn test_reshape_non_contiguous_fails() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert!(t.transpose().unwrap().reshape(&[6]).is_err());
    }

    #[test]
    fn test_transpose_and_contiguous() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let tr = t.transpose().unwrap();
        assert!(!tr.is_contiguous());
        assert_eq!(tr.get_f32(1), Some(4.0));

        let c = tr.contiguous().unwrap();
        assert!(c.is_contiguous());
        assert_eq!(c.to_f32_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_contiguous_integer_dtype() {
        let t = Tensor::from_i64(&[1, 2, 3, 4, 5, 6], &[2, 3]);
        let c = t.transpose().unwrap().contiguous().unwrap();
        assert_eq!(c.to_i64_vec().unwrap(), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_from_strided_bounds() {
        let storage = Storage::from_f32(&[0.0, 1.0, 2.0, 3.0]);
        let view = Tensor::from_strided(storage.clone(), Shape::new(&[2]), &[2], 1).unwrap();
        assert_eq!(view.to_f32_vec().unwrap(), vec![1.0, 3.0]);
        assert!(Tensor::from_strided(storage, Shape::new(&[3]), &[2], 0).is_err());
    }

    #[test]
    fn test_requires_grad_and_detach() {
        let mut t = Tensor::zeros(&[2, 2], DType::F32);
        assert!(!t.requires_grad());
        t.set_requires_grad(true);
        assert!(t.requires_grad());
        assert!(t.tracks_grad());
        let d = t.detach();
        assert!(!d.requires_grad());
        assert!(d.grad_node().is_none());
    }

    #[test]
    fn test_cpu_to_cpu_is_noop() {
        let t = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let c = t.cpu().unwrap();
        assert!(c.storage_ref().same_buffer(t.storage_ref()));
    }

    #[test]
    fn test_debug_display() {
        let t = Tensor::from_f32(&[1.0, 2.0], &[2]);
        assert!(format!("{:?}", t).contains("f32"));
        assert!(format!("{}", t).contains("tensor"));
    }
}
