use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::{DType, Device, KoreError, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaSlice, DeviceSlice};

/// Backing storage for tensor data.
#[derive(Debug)]
pub enum StorageData {
    /// CPU heap-allocated storage.
    Cpu(Vec<u8>),
    /// CUDA GPU storage with device handle and raw byte buffer.
    #[cfg(feature = "cuda")]
    Cuda {
        device: Arc<CudaDevice>,
        buffer: CudaSlice<u8>,
        device_idx: usize,
    },
}

/// Shared, reference-counted tensor storage.
///
/// Cloning a `Storage` clones the handle, not the data: views from
/// reshape, transpose and indexing, and accelerator arrays converted from
/// a tensor, all alias one buffer. A write through any handle is seen by
/// every other handle on that buffer.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<RwLock<StorageData>>,
    dtype: DType,
    device: Device,
    /// Number of logical elements (not bytes).
    numel: usize,
}

/// Read guard over a typed view of host storage.
pub type HostSlice<'a, T> = MappedRwLockReadGuard<'a, [T]>;

fn cast<T: Pod>(bytes: &[u8]) -> Option<&[T]> {
    if bytes.is_empty() {
        return Some(&[]);
    }
    bytemuck::try_cast_slice(bytes).ok()
}

fn host_bytes(data: &StorageData) -> Option<&[u8]> {
    match data {
        StorageData::Cpu(v) => Some(v),
        #[cfg(feature = "cuda")]
        StorageData::Cuda { .. } => None,
    }
}

fn host_bytes_mut(data: &mut StorageData) -> Option<&mut [u8]> {
    match data {
        StorageData::Cpu(v) => Some(v),
        #[cfg(feature = "cuda")]
        StorageData::Cuda { .. } => None,
    }
}

impl Storage {
    fn new(data: StorageData, dtype: DType, device: Device, numel: usize) -> Self {
        Self { data: Arc::new(RwLock::new(data)), dtype, device, numel }
    }

    /// Allocate new zeroed CPU storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let nbytes = dtype.storage_bytes(numel);
        Self::new(StorageData::Cpu(vec![0u8; nbytes]), dtype, Device::Cpu, numel)
    }

    /// Create storage from raw bytes (CPU).
    pub fn from_bytes(dtype: DType, numel: usize, bytes: Vec<u8>) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(KoreError::StorageError(format!(
                "Expected {} bytes for {} elements of {}, got {}",
                expected,
                numel,
                dtype,
                bytes.len()
            )));
        }
        Ok(Self::new(StorageData::Cpu(bytes), dtype, Device::Cpu, numel))
    }

    pub(crate) fn from_pod<T: Pod>(data: &[T], dtype: DType) -> Self {
        let bytes: Vec<u8> = bytemuck::cast_slice(data).to_vec();
        Self::new(StorageData::Cpu(bytes), dtype, Device::Cpu, data.len())
    }

    /// Create storage from a slice of f32 values.
    pub fn from_f32(data: &[f32]) -> Self {
        Self::from_pod(data, DType::F32)
    }

    /// Create storage from a slice of f64 values.
    pub fn from_f64(data: &[f64]) -> Self {
        Self::from_pod(data, DType::F64)
    }

    /// Create storage from a slice of i32 values.
    pub fn from_i32(data: &[i32]) -> Self {
        Self::from_pod(data, DType::I32)
    }

    /// Create storage from a slice of i64 values.
    pub fn from_i64(data: &[i64]) -> Self {
        Self::from_pod(data, DType::I64)
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the device of this storage.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        match &*self.data.read() {
            StorageData::Cpu(v) => v.len(),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { buffer, .. } => buffer.len(),
        }
    }

    /// Read the raw host bytes.
    ///
    /// Fails for GPU storage; transfer to CPU first. Writers on the same
    /// buffer block while the guard is held.
    pub fn as_bytes(&self) -> Result<HostSlice<'_, u8>> {
        RwLockReadGuard::try_map(self.data.read(), host_bytes).map_err(|_| self.off_host("read"))
    }

    /// Write the raw host bytes in place.
    ///
    /// The write lands in the shared buffer, so every handle aliasing it
    /// observes the change. Fails for GPU storage.
    pub fn as_bytes_mut(&self) -> Result<MappedRwLockWriteGuard<'_, [u8]>> {
        RwLockWriteGuard::try_map(self.data.write(), host_bytes_mut)
            .map_err(|_| self.off_host("write"))
    }

    fn off_host(&self, action: &str) -> KoreError {
        KoreError::StorageError(format!(
            "cannot {action} {} storage from host, transfer to CPU first",
            self.device
        ))
    }

    fn typed<T: Pod>(&self, dtype: DType) -> Option<HostSlice<'_, T>> {
        if self.dtype != dtype {
            return None;
        }
        MappedRwLockReadGuard::try_map(self.as_bytes().ok()?, cast::<T>).ok()
    }

    /// Interpret storage as a slice of f32 values.
    /// Returns None if dtype is not F32, data is misaligned, or it lives on GPU.
    pub fn as_f32_slice(&self) -> Option<HostSlice<'_, f32>> {
        self.typed(DType::F32)
    }

    /// Interpret storage as a slice of f64 values.
    pub fn as_f64_slice(&self) -> Option<HostSlice<'_, f64>> {
        self.typed(DType::F64)
    }

    /// Interpret storage as a slice of i32 values.
    pub fn as_i32_slice(&self) -> Option<HostSlice<'_, i32>> {
        self.typed(DType::I32)
    }

    /// Interpret storage as a slice of i64 values.
    pub fn as_i64_slice(&self) -> Option<HostSlice<'_, i64>> {
        self.typed(DType::I64)
    }

    /// Whether this storage is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Whether two storages share the same underlying buffer.
    pub fn same_buffer(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Whether this storage is on CPU.
    pub fn is_cpu(&self) -> bool {
        self.device.is_cpu()
    }

    /// Whether this storage is on a CUDA device.
    pub fn is_cuda(&self) -> bool {
        self.device.is_cuda()
    }

    /// Create GPU storage from host bytes (H2D copy).
    #[cfg(feature = "cuda")]
    pub fn to_cuda(&self, device_idx: usize) -> Result<Self> {
        if let Device::Cuda(idx) = self.device {
            if idx == device_idx {
                return Ok(self.clone());
            }
        }
        let host = self.to_cpu()?;
        let host_bytes = host.as_bytes()?;
        let cuda_dev = cuda_device(device_idx)?;
        let gpu_buf = cuda_dev
            .htod_sync_copy(&host_bytes[..])
            .map_err(|e| KoreError::CudaError(format!("H2D copy: {}", e)))?;
        Ok(Self::new(
            StorageData::Cuda { device: cuda_dev, buffer: gpu_buf, device_idx },
            self.dtype,
            Device::Cuda(device_idx),
            self.numel,
        ))
    }

    /// Copy GPU storage back to CPU (D2H copy). No-op for CPU storage.
    #[cfg(feature = "cuda")]
    pub fn to_cpu(&self) -> Result<Self> {
        match &*self.data.read() {
            StorageData::Cpu(_) => Ok(self.clone()),
            StorageData::Cuda { device, buffer, .. } => {
                let host_data: Vec<u8> = device
                    .dtoh_sync_copy(buffer)
                    .map_err(|e| KoreError::CudaError(format!("D2H copy: {}", e)))?;
                Ok(Self::new(StorageData::Cpu(host_data), self.dtype, Device::Cpu, self.numel))
            }
        }
    }

    /// Overwrite GPU storage in place with `bytes` (H2D copy into the
    /// existing buffer, so every handle on it sees the new data).
    #[cfg(feature = "cuda")]
    pub fn upload(&self, bytes: &[u8]) -> Result<()> {
        match &mut *self.data.write() {
            StorageData::Cuda { device, buffer, .. } => {
                if bytes.len() != buffer.len() {
                    return Err(KoreError::StorageError(format!(
                        "upload of {} bytes into a {}-byte buffer",
                        bytes.len(),
                        buffer.len()
                    )));
                }
                device
                    .htod_sync_copy_into(bytes, buffer)
                    .map_err(|e| KoreError::CudaError(format!("H2D copy: {}", e)))
            }
            StorageData::Cpu(_) => {
                Err(KoreError::StorageError("upload target is host storage".into()))
            }
        }
    }

    /// Copy GPU storage back to CPU. Without the `cuda` feature every
    /// storage already lives on the host.
    #[cfg(not(feature = "cuda"))]
    pub fn to_cpu(&self) -> Result<Self> {
        Ok(self.clone())
    }

    /// Without the `cuda` feature there is no device to copy to.
    #[cfg(not(feature = "cuda"))]
    pub fn to_cuda(&self, device_idx: usize) -> Result<Self> {
        Err(KoreError::CudaError(format!(
            "cuda:{device_idx} requested but kore-core was built without the `cuda` feature"
        )))
    }

    #[cfg(not(feature = "cuda"))]
    pub fn upload(&self, _bytes: &[u8]) -> Result<()> {
        Err(KoreError::StorageError("upload target is host storage".into()))
    }

    /// Allocate zeroed storage on the given device.
    pub fn zeros_on(dtype: DType, numel: usize, device: Device) -> Result<Self> {
        match device {
            Device::Cpu => Ok(Self::zeros(dtype, numel)),
            Device::Cuda(idx) => Self::cuda_zeros(dtype, numel, idx),
        }
    }

    /// Create GPU storage with zeroed memory.
    #[cfg(feature = "cuda")]
    pub fn cuda_zeros(dtype: DType, numel: usize, device_idx: usize) -> Result<Self> {
        let nbytes = dtype.storage_bytes(numel);
        let cuda_dev = cuda_device(device_idx)?;
        let gpu_buf = cuda_dev
            .alloc_zeros::<u8>(nbytes)
            .map_err(|e| KoreError::CudaError(format!("alloc_zeros: {}", e)))?;
        Ok(Self::new(
            StorageData::Cuda { device: cuda_dev, buffer: gpu_buf, device_idx },
            dtype,
            Device::Cuda(device_idx),
            numel,
        ))
    }

    #[cfg(not(feature = "cuda"))]
    pub fn cuda_zeros(_dtype: DType, _numel: usize, device_idx: usize) -> Result<Self> {
        Self::zeros(DType::F32, 0).to_cuda(device_idx)
    }
}

/// Handle to CUDA device `idx` (its primary context).
#[cfg(feature = "cuda")]
pub(crate) fn cuda_device(idx: usize) -> Result<Arc<CudaDevice>> {
    CudaDevice::new(idx).map_err(|e| KoreError::CudaError(format!("device init: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::F32, 10);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.device(), Device::Cpu);
        assert_eq!(s.numel(), 10);
        assert_eq!(s.nbytes(), 40);
        assert!(s.as_bytes().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_f32() {
        let s = Storage::from_f32(&[1.0, 2.0, 3.0]);
        assert_eq!(s.numel(), 3);
        assert_eq!(&*s.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0]);
        assert!(s.as_i64_slice().is_none());
    }

    #[test]
    fn test_from_i64() {
        let s = Storage::from_i64(&[0, -1, 7]);
        assert_eq!(s.dtype(), DType::I64);
        assert_eq!(&*s.as_i64_slice().unwrap(), &[0, -1, 7]);
    }

    #[test]
    fn test_empty_slices() {
        let s = Storage::from_f32(&[]);
        assert!(s.as_f32_slice().unwrap().is_empty());
    }

    #[test]
    fn test_writes_are_shared() {
        let s1 = Storage::from_f32(&[1.0, 2.0, 3.0]);
        let s2 = s1.clone();
        assert!(!s1.is_unique());
        assert!(s1.same_buffer(&s2));

        s2.as_bytes_mut().unwrap()[..4].copy_from_slice(&99.0f32.to_ne_bytes());

        assert!(s1.same_buffer(&s2));
        assert_eq!(s1.as_f32_slice().unwrap()[0], 99.0);
    }

    #[test]
    fn test_from_bytes_validation() {
        assert!(Storage::from_bytes(DType::F32, 3, vec![0u8; 11]).is_err());
        assert!(Storage::from_bytes(DType::F32, 3, vec![0u8; 12]).is_ok());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_unavailable_without_feature() {
        let s = Storage::from_f32(&[1.0]);
        assert!(matches!(s.to_cuda(0), Err(KoreError::CudaError(_))));
        assert!(matches!(
            Storage::zeros_on(DType::F32, 4, Device::Cuda(0)),
            Err(KoreError::CudaError(_))
        ));
    }
}
