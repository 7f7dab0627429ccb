//! CUDA driver device.
//!
//! Loads the CUDA driver at runtime (no link-time dependency) and exposes
//! device memory, streams and stream capture through the [`Device`] trait.
//! `CudaDevice::try_new()` returns `Err` when no driver or GPU is present and
//! the device selector moves on to the host device.

use std::sync::Arc;

use tracing::debug;

use crate::error::RunnerError;

use super::{Device, DevicePtr, GraphExecHandle, GraphHandle, StreamHandle};
use ffi::{CUgraph, CUgraphExec, CUstream, CudaApi};

pub mod ffi;

fn stream_ptr(stream: StreamHandle) -> CUstream {
    stream.0 as usize as CUstream
}

fn graph_ptr(graph: GraphHandle) -> CUgraph {
    graph.0 as usize as CUgraph
}

fn exec_ptr(exec: GraphExecHandle) -> CUgraphExec {
    exec.0 as usize as CUgraphExec
}

fn driver(e: String) -> RunnerError {
    RunnerError::Device(e)
}

/// Device 0 of the CUDA driver, using its primary context.
pub struct CudaDevice {
    api: Arc<CudaApi>,
    name: String,
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice").field("name", &self.name).finish()
    }
}

impl CudaDevice {
    /// Attempt to open the CUDA driver and bind device 0.
    pub fn try_new() -> Result<Self, RunnerError> {
        let api = CudaApi::load().map_err(|e| RunnerError::Device(format!("CUDA load: {}", e)))?;
        let name = api.device_name().unwrap_or_else(|_| "cuda:0".to_string());
        debug!(device = %name, "CudaDevice initialized");
        Ok(Self {
            api: Arc::new(api),
            name,
        })
    }

    fn current(&self) -> Result<&CudaApi, RunnerError> {
        self.api.make_current().map_err(driver)?;
        Ok(&self.api)
    }
}

impl Device for CudaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, RunnerError> {
        self.current()?
            .mem_alloc(bytes)
            .map_err(|reason| RunnerError::ResourceExhausted {
                requested: bytes,
                reason,
            })
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), RunnerError> {
        self.current()?.mem_free(ptr).map_err(driver)
    }

    fn stream_create(&self) -> Result<StreamHandle, RunnerError> {
        let stream = self.current()?.stream_create().map_err(driver)?;
        Ok(StreamHandle(stream as usize as u64))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> Result<(), RunnerError> {
        self.current()?
            .stream_destroy(stream_ptr(stream))
            .map_err(driver)
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), RunnerError> {
        self.current()?
            .stream_synchronize(stream_ptr(stream))
            .map_err(RunnerError::ExecutionFailed)
    }

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.current()?
            .memcpy_htod_async(dst, src, stream_ptr(stream))
            .map_err(driver)
    }

    fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.current()?
            .memcpy_dtoh_async(dst, src, stream_ptr(stream))
            .map_err(driver)
    }

    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.current()?
            .memcpy_dtod_async(dst, src, bytes, stream_ptr(stream))
            .map_err(driver)
    }

    fn stream_begin_capture(&self, stream: StreamHandle) -> Result<(), RunnerError> {
        self.current()?
            .stream_begin_capture(stream_ptr(stream))
            .map_err(driver)
    }

    fn stream_end_capture(&self, stream: StreamHandle) -> Result<GraphHandle, RunnerError> {
        let graph = self
            .current()?
            .stream_end_capture(stream_ptr(stream))
            .map_err(driver)?;
        Ok(GraphHandle(graph as usize as u64))
    }

    fn graph_instantiate(&self, graph: GraphHandle) -> Result<GraphExecHandle, RunnerError> {
        let exec = self
            .current()?
            .graph_instantiate(graph_ptr(graph))
            .map_err(driver)?;
        Ok(GraphExecHandle(exec as usize as u64))
    }

    fn graph_launch(
        &self,
        exec: GraphExecHandle,
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.current()?
            .graph_launch(exec_ptr(exec), stream_ptr(stream))
            .map_err(RunnerError::ExecutionFailed)
    }

    fn graph_destroy(&self, graph: GraphHandle) -> Result<(), RunnerError> {
        self.current()?
            .graph_destroy(graph_ptr(graph))
            .map_err(driver)
    }

    fn graph_exec_destroy(&self, exec: GraphExecHandle) -> Result<(), RunnerError> {
        self.current()?
            .graph_exec_destroy(exec_ptr(exec))
            .map_err(driver)
    }
}
