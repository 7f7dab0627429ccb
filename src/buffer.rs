//! Device memory buffers and views.
//!
//! [`DeviceBuffer`] owns one device allocation whose capacity only ever
//! grows. [`DeviceView`] is a borrowed, non-owning description of device
//! memory (address, shape and dtype) used for zero-copy inputs and outputs.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::backend::{Device, DevicePtr};
use crate::error::RunnerError;
use crate::stream::Stream;
use crate::tensor::{DataType, Tensor};

/// Non-owning view of typed device memory.
///
/// The memory is owned elsewhere (a caller allocation or a runner buffer) and
/// is only valid as long as its owner keeps it alive and does not resize it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceView {
    pub ptr: DevicePtr,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl DeviceView {
    pub fn new(ptr: DevicePtr, shape: Vec<usize>, dtype: DataType) -> Self {
        Self { ptr, shape, dtype }
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.n_elements() * self.dtype.size()
    }
}

/// A tensor supplied to or returned from the runner, resident either in host
/// memory or on the device.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorView {
    Host(Tensor),
    Device(DeviceView),
}

impl TensorView {
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorView::Host(t) => t.shape(),
            TensorView::Device(v) => &v.shape,
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorView::Host(t) => t.dtype(),
            TensorView::Device(v) => v.dtype,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, TensorView::Device(_))
    }

    pub fn as_host(&self) -> Option<&Tensor> {
        match self {
            TensorView::Host(t) => Some(t),
            TensorView::Device(_) => None,
        }
    }

    pub fn as_device(&self) -> Option<&DeviceView> {
        match self {
            TensorView::Host(_) => None,
            TensorView::Device(v) => Some(v),
        }
    }

    pub fn into_host(self) -> Option<Tensor> {
        match self {
            TensorView::Host(t) => Some(t),
            TensorView::Device(_) => None,
        }
    }
}

impl From<Tensor> for TensorView {
    fn from(t: Tensor) -> Self {
        TensorView::Host(t)
    }
}

impl From<DeviceView> for TensorView {
    fn from(v: DeviceView) -> Self {
        TensorView::Device(v)
    }
}

/// An owned, growable device allocation.
///
/// `capacity()` is the allocated size and never shrinks; `len()` is the
/// number of bytes most recently requested through [`DeviceBuffer::resize`].
/// The base address is stable until a resize grows the allocation, at which
/// point the previous contents are discarded.
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    ptr: DevicePtr,
    capacity: usize,
    len: usize,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("0x{:x}", self.ptr))
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceBuffer {
    /// Create an empty buffer. No device memory is allocated until the first
    /// non-zero resize.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            ptr: 0,
            capacity: 0,
            len: 0,
        }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ensure the buffer holds at least `bytes` bytes.
    ///
    /// A no-op on the allocation when `bytes <= capacity()`. Otherwise the old
    /// allocation is freed before the new one is made; if that allocation
    /// fails the buffer is left empty and the error is returned.
    pub fn resize(&mut self, bytes: usize) -> Result<(), RunnerError> {
        if bytes > self.capacity {
            self.free()?;
            self.ptr = self.device.mem_alloc(bytes)?;
            self.capacity = bytes;
            trace!(
                ptr = format_args!("0x{:x}", self.ptr),
                bytes,
                "DeviceBuffer reallocated"
            );
        }
        self.len = bytes;
        Ok(())
    }

    /// Resize to fit `data` and enqueue a host-to-device copy on `stream`.
    pub fn copy_from_host(&mut self, data: &[u8], stream: &Stream) -> Result<(), RunnerError> {
        self.resize(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.device
            .memcpy_htod_async(self.ptr, data, stream.handle()?)
    }

    /// Resize to fit `src` and enqueue a device-to-device copy on `stream`.
    pub fn copy_from_device(
        &mut self,
        src: &DeviceView,
        stream: &Stream,
    ) -> Result<(), RunnerError> {
        let bytes = src.nbytes();
        self.resize(bytes)?;
        if bytes == 0 {
            return Ok(());
        }
        self.device
            .memcpy_dtod_async(self.ptr, src.ptr, bytes, stream.handle()?)
    }

    /// Enqueue a device-to-host copy of `dst.len()` bytes on `stream`.
    pub fn copy_to_host(&self, dst: &mut [u8], stream: &Stream) -> Result<(), RunnerError> {
        if dst.len() > self.capacity {
            return Err(RunnerError::Device(format!(
                "copy of {} bytes exceeds buffer capacity {}",
                dst.len(),
                self.capacity
            )));
        }
        if dst.is_empty() {
            return Ok(());
        }
        self.device
            .memcpy_dtoh_async(dst, self.ptr, stream.handle()?)
    }

    /// Describe the buffer's memory as a typed view.
    pub fn view(&self, shape: Vec<usize>, dtype: DataType) -> DeviceView {
        DeviceView::new(self.ptr, shape, dtype)
    }

    /// Release the allocation. Safe to call repeatedly: the address is
    /// cleared before the driver is asked to free it.
    pub fn free(&mut self) -> Result<(), RunnerError> {
        let ptr = std::mem::take(&mut self.ptr);
        self.capacity = 0;
        self.len = 0;
        if ptr != 0 {
            self.device.mem_free(ptr)?;
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(error = %e, "Failed to free device buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;

    fn setup() -> (Arc<HostDevice>, Stream) {
        let device = Arc::new(HostDevice::new());
        let stream = Stream::new(device.clone()).unwrap();
        (device, stream)
    }

    #[test]
    fn test_new_buffer_allocates_nothing() {
        let (device, _stream) = setup();
        let buf = DeviceBuffer::new(device.clone());
        assert_eq!(buf.ptr(), 0);
        assert_eq!(buf.capacity(), 0);
        assert_eq!(device.stats().allocations, 0);
    }

    #[test]
    fn test_resize_is_monotonic() {
        let (device, _stream) = setup();
        let mut buf = DeviceBuffer::new(device.clone());
        let requests = [16usize, 4, 64, 8, 64, 32, 0, 100, 1];
        let mut max = 0;
        for &r in &requests {
            buf.resize(r).unwrap();
            max = max.max(r);
            assert!(buf.capacity() >= max);
            assert_eq!(buf.len(), r);
        }
        assert_eq!(buf.capacity(), 100);
        // Only strictly growing requests reallocate: 16, 64, 100.
        assert_eq!(device.stats().allocations, 3);
    }

    #[test]
    fn test_resize_within_capacity_keeps_address() {
        let (device, _stream) = setup();
        let mut buf = DeviceBuffer::new(device);
        buf.resize(64).unwrap();
        let ptr = buf.ptr();
        buf.resize(10).unwrap();
        buf.resize(64).unwrap();
        assert_eq!(buf.ptr(), ptr);
    }

    #[test]
    fn test_resize_exhausted() {
        let device = Arc::new(HostDevice::with_memory_limit(32));
        let mut buf = DeviceBuffer::new(device.clone());
        buf.resize(16).unwrap();
        let err = buf.resize(64).unwrap_err();
        assert!(matches!(err, RunnerError::ResourceExhausted { requested: 64, .. }));
        assert_eq!(buf.capacity(), 0);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_host_round_trip() {
        let (device, stream) = setup();
        let mut buf = DeviceBuffer::new(device);
        let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        buf.copy_from_host(t.as_bytes(), &stream).unwrap();
        let mut out = vec![0u8; t.nbytes()];
        buf.copy_to_host(&mut out, &stream).unwrap();
        stream.synchronize().unwrap();
        let back = Tensor::from_bytes(&[2, 2], DataType::F32, &out).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_copy_from_device() {
        let (device, stream) = setup();
        let mut a = DeviceBuffer::new(device.clone());
        let mut b = DeviceBuffer::new(device);
        a.copy_from_host(&[9, 8, 7, 6], &stream).unwrap();
        b.copy_from_device(&a.view(vec![4], DataType::U8), &stream).unwrap();
        let mut out = [0u8; 4];
        b.copy_to_host(&mut out, &stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(out, [9, 8, 7, 6]);
        assert_ne!(a.ptr(), b.ptr());
    }

    #[test]
    fn test_copy_to_host_larger_than_capacity() {
        let (device, stream) = setup();
        let mut buf = DeviceBuffer::new(device);
        buf.resize(4).unwrap();
        let mut out = [0u8; 8];
        assert!(buf.copy_to_host(&mut out, &stream).is_err());
    }

    #[test]
    fn test_free_is_idempotent_and_drop_releases() {
        let (device, _stream) = setup();
        {
            let mut buf = DeviceBuffer::new(device.clone());
            buf.resize(8).unwrap();
            buf.free().unwrap();
            buf.free().unwrap();
            buf.resize(8).unwrap();
        }
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.stats().frees, 2);
    }

    #[test]
    fn test_tensor_view_accessors() {
        let host: TensorView = Tensor::zeros(&[2, 3], DataType::I32).into();
        assert_eq!(host.shape(), &[2, 3]);
        assert_eq!(host.dtype(), DataType::I32);
        assert!(!host.is_device());

        let dev: TensorView = DeviceView::new(0x1000, vec![4], DataType::F16).into();
        assert!(dev.is_device());
        assert_eq!(dev.as_device().map(|v| v.nbytes()), Some(8));
        assert!(dev.into_host().is_none());
    }
}
