use std::cell::Cell;
use std::fmt;

use crate::error::KoreError;
use crate::Result;

/// Compute device for tensor storage and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory
    #[default]
    Cpu,
    /// CUDA GPU with device index
    Cuda(usize),
}

impl Device {
    /// Whether this is a CPU device.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Get the CUDA device index, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

// ============================================================================
// Current-device scope
// ============================================================================

thread_local! {
    static CURRENT_DEVICE: Cell<Device> = const { Cell::new(Device::Cpu) };
}

/// The device whose context is current on this thread.
pub fn current_device() -> Device {
    CURRENT_DEVICE.with(|d| d.get())
}

fn set_current_device(device: Device) -> Device {
    CURRENT_DEVICE.with(|d| d.replace(device))
}

/// Make `device`'s driver context current on this thread. The host needs
/// no context.
#[cfg(feature = "cuda")]
fn bind_context(device: Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        Device::Cuda(idx) => crate::storage::cuda_device(idx)?
            .bind_to_thread()
            .map_err(|e| KoreError::CudaError(format!("bind cuda:{idx} context: {e}"))),
    }
}

#[cfg(not(feature = "cuda"))]
fn bind_context(_device: Device) -> Result<()> {
    Ok(())
}

/// RAII guard that makes `device` current for its scope.
///
/// With the `cuda` feature, entering a CUDA scope binds that device's
/// context to the thread, so driver work issued inside the scope targets
/// it. The previous device is restored when the guard drops, which covers
/// normal returns, `?` early returns and unwinding.
///
/// # Example
/// ```
/// use kore_core::{Device, DeviceGuard};
/// use kore_core::device::current_device;
///
/// {
///     let _guard = DeviceGuard::new(Device::Cpu).unwrap();
///     assert_eq!(current_device(), Device::Cpu);
/// }
/// assert_eq!(current_device(), Device::Cpu);
/// ```
#[must_use = "the device is restored as soon as the guard is dropped"]
pub struct DeviceGuard {
    prev: Device,
}

impl DeviceGuard {
    /// Enter a scope where `device` is current.
    ///
    /// Fails if the device's context cannot be bound; the current device
    /// is then left unchanged.
    pub fn new(device: Device) -> Result<Self> {
        bind_context(device)?;
        let prev = set_current_device(device);
        tracing::trace!(%device, %prev, "enter device scope");
        Ok(Self { prev })
    }

    /// The device that will be restored on drop.
    pub fn previous(&self) -> Device {
        self.prev
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        let left = set_current_device(self.prev);
        // a host scope leaves the last bound context in place
        if let Err(e) = bind_context(self.prev) {
            tracing::warn!(device = %self.prev, error = %e, "failed to rebind device context");
        }
        tracing::trace!(device = %left, restored = %self.prev, "leave device scope");
    }
}
