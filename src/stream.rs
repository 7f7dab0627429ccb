//! Execution streams and captured graphs.
//!
//! RAII wrappers over the driver handles of [`crate::backend::Device`]. Each
//! wrapper releases its handle on drop and exposes an idempotent `free()` so
//! ordered teardown can report errors instead of swallowing them.

use std::sync::Arc;

use tracing::warn;

use crate::backend::{Device, GraphExecHandle, GraphHandle, StreamHandle};
use crate::error::RunnerError;

/// An ordered, asynchronous command queue on a device.
pub struct Stream {
    device: Arc<dyn Device>,
    handle: Option<StreamHandle>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("handle", &self.handle).finish()
    }
}

impl Stream {
    pub fn new(device: Arc<dyn Device>) -> Result<Self, RunnerError> {
        let handle = device.stream_create()?;
        Ok(Self {
            device,
            handle: Some(handle),
        })
    }

    /// Driver handle, or `InvalidState` once the stream has been freed.
    pub fn handle(&self) -> Result<StreamHandle, RunnerError> {
        self.handle
            .ok_or_else(|| RunnerError::InvalidState("stream has been freed".to_string()))
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Block until every operation enqueued so far has completed.
    pub fn synchronize(&self) -> Result<(), RunnerError> {
        self.device.stream_synchronize(self.handle()?)
    }

    /// Start recording subsequent work instead of executing it.
    pub fn begin_capture(&self) -> Result<(), RunnerError> {
        self.device.stream_begin_capture(self.handle()?)
    }

    /// Stop recording and return what was captured.
    pub fn end_capture(&self) -> Result<Graph, RunnerError> {
        let handle = self.device.stream_end_capture(self.handle()?)?;
        Ok(Graph {
            device: self.device.clone(),
            handle: Some(handle),
        })
    }

    pub fn free(&mut self) -> Result<(), RunnerError> {
        match self.handle.take() {
            Some(handle) => self.device.stream_destroy(handle),
            None => Ok(()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(error = %e, "Failed to destroy stream");
        }
    }
}

/// A captured, not yet instantiated, operation sequence.
pub struct Graph {
    device: Arc<dyn Device>,
    handle: Option<GraphHandle>,
}

impl Graph {
    pub fn instantiate(&self) -> Result<GraphExec, RunnerError> {
        let graph = self
            .handle
            .ok_or_else(|| RunnerError::InvalidState("graph has been freed".to_string()))?;
        let handle = self.device.graph_instantiate(graph)?;
        Ok(GraphExec {
            device: self.device.clone(),
            handle: Some(handle),
        })
    }

    pub fn free(&mut self) -> Result<(), RunnerError> {
        match self.handle.take() {
            Some(handle) => self.device.graph_destroy(handle),
            None => Ok(()),
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(error = %e, "Failed to destroy graph");
        }
    }
}

/// An instantiated graph that can be launched repeatedly.
pub struct GraphExec {
    device: Arc<dyn Device>,
    handle: Option<GraphExecHandle>,
}

impl GraphExec {
    /// Enqueue one replay of the graph on `stream`.
    pub fn launch(&self, stream: &Stream) -> Result<(), RunnerError> {
        let exec = self
            .handle
            .ok_or_else(|| RunnerError::InvalidState("graph exec has been freed".to_string()))?;
        self.device.graph_launch(exec, stream.handle()?)
    }

    pub fn free(&mut self) -> Result<(), RunnerError> {
        match self.handle.take() {
            Some(handle) => self.device.graph_exec_destroy(handle),
            None => Ok(()),
        }
    }
}

impl Drop for GraphExec {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(error = %e, "Failed to destroy graph exec");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;
    use crate::buffer::DeviceBuffer;

    #[test]
    fn test_stream_free_is_idempotent() {
        let device = Arc::new(HostDevice::new());
        let mut stream = Stream::new(device.clone()).unwrap();
        stream.free().unwrap();
        stream.free().unwrap();
        assert_eq!(device.live_streams(), 0);
        assert!(matches!(
            stream.synchronize(),
            Err(RunnerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = Arc::new(HostDevice::new());
        {
            let stream = Stream::new(device.clone()).unwrap();
            stream.begin_capture().unwrap();
            let graph = stream.end_capture().unwrap();
            let _exec = graph.instantiate().unwrap();
            assert_eq!(device.live_graphs(), 2);
        }
        assert_eq!(device.live_streams(), 0);
        assert_eq!(device.live_graphs(), 0);
    }

    #[test]
    fn test_captured_copy_replays() {
        let device = Arc::new(HostDevice::new());
        let stream = Stream::new(device.clone()).unwrap();
        let mut src = DeviceBuffer::new(device.clone());
        let mut dst = DeviceBuffer::new(device.clone());
        src.copy_from_host(&[1, 2, 3], &stream).unwrap();
        dst.resize(3).unwrap();

        stream.begin_capture().unwrap();
        dst.copy_from_device(&src.view(vec![3], crate::tensor::DataType::U8), &stream)
            .unwrap();
        let exec = stream.end_capture().unwrap().instantiate().unwrap();

        let mut out = [0u8; 3];
        dst.copy_to_host(&mut out, &stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(out, [0, 0, 0]);

        exec.launch(&stream).unwrap();
        dst.copy_to_host(&mut out, &stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(out, [1, 2, 3]);
    }
}
