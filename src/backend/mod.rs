//! Accelerator driver trait and device handle types.
//!
//! Defines the [`Device`] trait: the minimal driver surface the runner needs
//! (memory, streams, async copies, stream capture and graph replay). All
//! resource wrappers in [`crate::buffer`] and [`crate::stream`] are built on
//! it, so the runner never talks to a driver directly.
//!
//! Implementations exist for a host-memory reference device ([`host`]) and
//! the CUDA driver ([`cuda`], behind the `cuda` feature).
//!
//! The runner takes its device from [`crate::engine::Engine::device`], so an
//! engine implemented outside this crate (for example over a vendor runtime)
//! runs on CUDA by returning the device from [`select_device`]. The bundled
//! [`crate::engine::host::HostEngine`] executes its kernels on host memory and
//! is tied to [`host::HostDevice`].

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::RunnerError;

/// Address of device memory. `0` is the null address.
pub type DevicePtr = u64;

/// Opaque handle to a driver stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Opaque handle to a captured (not yet instantiated) graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphHandle(pub u64);

/// Opaque handle to an instantiated, launchable graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphExecHandle(pub u64);

/// Driver operations used by the runner.
///
/// Work submitted to one stream executes in submission order. Copies are
/// asynchronous: the caller's host slice is consumed (or filled) by the time
/// the call returns, but device-side completion is only guaranteed after
/// [`Device::stream_synchronize`].
pub trait Device: Send + Sync + fmt::Debug {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Allocate `bytes` of device memory. Fails with
    /// [`RunnerError::ResourceExhausted`] when memory is exhausted.
    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, RunnerError>;

    /// Free an allocation made by [`Device::mem_alloc`].
    fn mem_free(&self, ptr: DevicePtr) -> Result<(), RunnerError>;

    fn stream_create(&self) -> Result<StreamHandle, RunnerError>;

    fn stream_destroy(&self, stream: StreamHandle) -> Result<(), RunnerError>;

    /// Block until all work enqueued on `stream` has completed. Errors raised
    /// by asynchronous work surface here.
    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), RunnerError>;

    /// Enqueue a host-to-device copy of `src` into `dst`.
    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> Result<(), RunnerError>;

    /// Enqueue a device-to-host copy of `dst.len()` bytes from `src`.
    fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), RunnerError>;

    /// Enqueue a device-to-device copy of `bytes` bytes.
    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), RunnerError>;

    /// Start recording work submitted to `stream` instead of executing it.
    fn stream_begin_capture(&self, stream: StreamHandle) -> Result<(), RunnerError>;

    /// Stop recording and return the captured graph.
    fn stream_end_capture(&self, stream: StreamHandle) -> Result<GraphHandle, RunnerError>;

    fn graph_instantiate(&self, graph: GraphHandle) -> Result<GraphExecHandle, RunnerError>;

    /// Enqueue a replay of an instantiated graph on `stream`.
    fn graph_launch(&self, exec: GraphExecHandle, stream: StreamHandle)
        -> Result<(), RunnerError>;

    fn graph_destroy(&self, graph: GraphHandle) -> Result<(), RunnerError>;

    fn graph_exec_destroy(&self, exec: GraphExecHandle) -> Result<(), RunnerError>;
}

/// Auto-detect and return the best available device.
///
/// Priority: CUDA > host reference device.
pub fn select_device() -> Arc<dyn Device> {
    #[cfg(feature = "cuda")]
    {
        match cuda::CudaDevice::try_new() {
            Ok(device) => {
                info!(device = device.name(), "Selected CUDA device");
                return Arc::new(device);
            }
            Err(e) => {
                info!(error = %e, "CUDA not available, falling back to host device");
            }
        }
    }

    info!("Selected host reference device");
    Arc::new(host::HostDevice::new())
}
