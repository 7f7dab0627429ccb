//! Output allocator handed to name-based execution contexts.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{Device, DevicePtr};
use crate::buffer::DeviceBuffer;
use crate::engine::OutputAllocator;
use crate::error::RunnerError;

/// Grows one device buffer per output on request and records the shape the
/// engine reports for it.
///
/// Buffers only grow, so an output keeps its address across calls whose
/// sizes fit, which is what lets a captured graph stay valid.
pub struct RunnerOutputAllocator {
    device: Arc<dyn Device>,
    buffers: HashMap<String, DeviceBuffer>,
    shapes: HashMap<String, Vec<usize>>,
    error: Option<RunnerError>,
}

impl RunnerOutputAllocator {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            buffers: HashMap::new(),
            shapes: HashMap::new(),
            error: None,
        }
    }

    /// Current address of an output's buffer, `0` if never allocated.
    pub fn address(&self, name: &str) -> DevicePtr {
        self.buffers.get(name).map(|b| b.ptr()).unwrap_or(0)
    }

    pub fn capacity(&self, name: &str) -> usize {
        self.buffers.get(name).map(|b| b.capacity()).unwrap_or(0)
    }

    /// Shape reported for `name` by the most recent execution.
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.shapes.get(name).map(|s| s.as_slice())
    }

    /// The allocation error raised during the last execution, if any.
    pub fn take_error(&mut self) -> Option<RunnerError> {
        self.error.take()
    }

    /// Free every buffer, returning the failures.
    pub fn release(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, buf) in self.buffers.iter_mut() {
            if let Err(e) = buf.free() {
                errors.push(format!("output buffer '{}': {}", name, e));
            }
        }
        self.buffers.clear();
        self.shapes.clear();
        errors
    }
}

impl OutputAllocator for RunnerOutputAllocator {
    fn reallocate_output(
        &mut self,
        name: &str,
        size: usize,
        alignment: usize,
    ) -> Option<DevicePtr> {
        trace!(name, size, alignment, "reallocate_output");
        let device = &self.device;
        let buf = self
            .buffers
            .entry(name.to_string())
            .or_insert_with(|| DeviceBuffer::new(device.clone()));
        match buf.resize(size) {
            Ok(()) => Some(buf.ptr()),
            Err(e) => {
                debug!(name, size, error = %e, "Output allocation failed");
                self.error = Some(e);
                None
            }
        }
    }

    fn notify_shape(&mut self, name: &str, shape: &[usize]) {
        trace!(name, shape = ?shape, "notify_shape");
        self.shapes.insert(name.to_string(), shape.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;

    #[test]
    fn test_grow_only_keeps_address() {
        let device = Arc::new(HostDevice::new());
        let mut alloc = RunnerOutputAllocator::new(device.clone());
        let a = alloc.reallocate_output("y", 64, 256).unwrap();
        let b = alloc.reallocate_output("y", 16, 256).unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.capacity("y"), 64);
        let c = alloc.reallocate_output("y", 128, 256).unwrap();
        assert_ne!(a, c);
        assert_eq!(alloc.address("y"), c);
        assert_eq!(device.live_allocations(), 1);
    }

    #[test]
    fn test_notify_shape() {
        let device = Arc::new(HostDevice::new());
        let mut alloc = RunnerOutputAllocator::new(device);
        assert!(alloc.shape("y").is_none());
        alloc.notify_shape("y", &[2, 3]);
        assert_eq!(alloc.shape("y"), Some(&[2usize, 3][..]));
    }

    #[test]
    fn test_allocation_failure_recorded() {
        let device = Arc::new(HostDevice::with_memory_limit(8));
        let mut alloc = RunnerOutputAllocator::new(device);
        assert!(alloc.reallocate_output("y", 64, 256).is_none());
        assert!(matches!(
            alloc.take_error(),
            Some(RunnerError::ResourceExhausted { requested: 64, .. })
        ));
        assert!(alloc.take_error().is_none());
    }

    #[test]
    fn test_release_frees_buffers() {
        let device = Arc::new(HostDevice::new());
        let mut alloc = RunnerOutputAllocator::new(device.clone());
        alloc.reallocate_output("a", 8, 256).unwrap();
        alloc.reallocate_output("b", 8, 256).unwrap();
        assert!(alloc.release().is_empty());
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(alloc.address("a"), 0);
    }
}
