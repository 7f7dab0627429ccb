//! Single-entry cache of captured execution graphs.
//!
//! A captured graph replays fixed device addresses and fixed shapes, so it
//! is only valid for the exact binding it was captured under. The cache is
//! keyed by the full resolved binding (every tensor's shape, shape-tensor
//! values and device address) and holds at most one entry.

use tracing::debug;

use crate::backend::DevicePtr;
use crate::error::RunnerError;
use crate::stream::{Graph, GraphExec, Stream};

/// One tensor's contribution to a [`GraphKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTensor {
    pub name: String,
    pub shape: Vec<i64>,
    /// Values of a shape tensor, `None` for data tensors.
    pub values: Option<Vec<i64>>,
    pub address: DevicePtr,
}

/// The resolved binding a graph was captured under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphKey {
    tensors: Vec<BoundTensor>,
}

impl GraphKey {
    pub fn new(tensors: Vec<BoundTensor>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &[BoundTensor] {
        &self.tensors
    }
}

struct CapturedGraph {
    key: GraphKey,
    graph: Graph,
    exec: GraphExec,
}

/// Holds the most recently captured graph, if it is still valid.
#[derive(Default)]
pub struct GraphCache {
    entry: Option<CapturedGraph>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// The cached executable if it was captured under `key`.
    pub fn lookup(&self, key: &GraphKey) -> Option<&GraphExec> {
        self.entry
            .as_ref()
            .filter(|e| &e.key == key)
            .map(|e| &e.exec)
    }

    pub fn store(&mut self, key: GraphKey, graph: Graph, exec: GraphExec) {
        debug!(tensors = key.tensors.len(), "Caching captured graph");
        self.entry = Some(CapturedGraph { key, graph, exec });
    }

    /// Replay the cached graph on `stream` if it matches `key`. Returns
    /// whether a replay was enqueued.
    pub fn replay(&self, key: &GraphKey, stream: &Stream) -> Result<bool, RunnerError> {
        match self.lookup(key) {
            Some(exec) => {
                exec.launch(stream)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Discard the cached graph. Returns whether one was discarded.
    pub fn invalidate(&mut self) -> bool {
        match self.entry.take() {
            Some(entry) => {
                debug!("Invalidating captured graph");
                drop(entry);
                true
            }
            None => false,
        }
    }

    /// Discard the cached graph, reporting driver errors instead of logging.
    pub fn release(&mut self) -> Result<(), RunnerError> {
        if let Some(mut entry) = self.entry.take() {
            let exec = entry.exec.free();
            let graph = entry.graph.free();
            exec?;
            graph?;
        }
        Ok(())
    }
}
