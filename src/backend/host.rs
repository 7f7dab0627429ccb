//! Host-memory reference device.
//!
//! Implements [`Device`] entirely in host memory. Device addresses are
//! synthetic, unique for the lifetime of the device and never reused, so two
//! live allocations never alias. Work submitted to a stream executes eagerly
//! in submission order; while a stream is capturing, copies and kernels are
//! recorded into a graph instead and re-executed on every launch. Kernel
//! failures are deferred to the next synchronize, mirroring how a real
//! driver reports asynchronous errors.
//!
//! The device counts every driver call in [`DeviceStats`] so tests can
//! observe exactly what the runner submitted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::error::RunnerError;

use super::{Device, DevicePtr, GraphExecHandle, GraphHandle, StreamHandle};

/// Base of the synthetic address space. Keeps `0` free as the null address.
const ADDRESS_BASE: u64 = 0x1000_0000;
const ALLOCATION_ALIGNMENT: u64 = 256;

/// A kernel runnable on the host device. Receives the whole device memory.
pub type HostKernel = Arc<dyn Fn(&mut HostMemory) -> Result<(), String> + Send + Sync>;

/// Device memory of a [`HostDevice`], keyed by allocation base address.
#[derive(Debug, Default)]
pub struct HostMemory {
    allocations: BTreeMap<DevicePtr, Vec<u8>>,
}

impl HostMemory {
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(DevicePtr, usize), String> {
        let (&base, buf) = self
            .allocations
            .range(..=ptr)
            .next_back()
            .ok_or_else(|| format!("invalid device address 0x{:x}", ptr))?;
        let offset = (ptr - base) as usize;
        if offset + len > buf.len() {
            return Err(format!(
                "access of {} bytes at 0x{:x} exceeds allocation 0x{:x} of {} bytes",
                len,
                ptr,
                base,
                buf.len()
            ));
        }
        Ok((base, offset))
    }

    /// Read `len` bytes starting at `ptr`.
    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], String> {
        if len == 0 {
            return Ok(&[]);
        }
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base][offset..offset + len])
    }

    /// Write `data` starting at `ptr`.
    pub fn write(&mut self, ptr: DevicePtr, data: &[u8]) -> Result<(), String> {
        if data.is_empty() {
            return Ok(());
        }
        let (base, offset) = self.locate(ptr, data.len())?;
        let buf = self
            .allocations
            .get_mut(&base)
            .ok_or_else(|| format!("allocation 0x{:x} vanished", base))?;
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<(), String> {
        let data = self.read(src, len)?.to_vec();
        self.write(dst, &data)
    }
}

#[derive(Clone)]
enum HostOp {
    HtoD { dst: DevicePtr, data: Vec<u8> },
    DtoD { dst: DevicePtr, src: DevicePtr, len: usize },
    Kernel(HostKernel),
}

impl HostOp {
    fn run(&self, memory: &mut HostMemory) -> Result<(), String> {
        match self {
            HostOp::HtoD { dst, data } => memory.write(*dst, data),
            HostOp::DtoD { dst, src, len } => memory.copy(*dst, *src, *len),
            HostOp::Kernel(kernel) => kernel(memory),
        }
    }
}

#[derive(Default)]
struct StreamState {
    capture: Option<Vec<HostOp>>,
    pending_error: Option<String>,
}

#[derive(Default)]
struct State {
    memory: HostMemory,
    next_address: u64,
    allocated_bytes: usize,
    next_handle: u64,
    streams: HashMap<u64, StreamState>,
    graphs: HashMap<u64, Arc<Vec<HostOp>>>,
    execs: HashMap<u64, Arc<Vec<HostOp>>>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn stream(&mut self, stream: StreamHandle) -> Result<&mut StreamState, RunnerError> {
        self.streams
            .get_mut(&stream.0)
            .ok_or_else(|| RunnerError::Device(format!("invalid stream handle {}", stream.0)))
    }

    /// Record `op` if the stream is capturing, otherwise run it now. Copy
    /// errors are returned immediately; kernel errors are deferred to the
    /// next synchronize.
    fn submit(&mut self, stream: StreamHandle, op: HostOp) -> Result<(), RunnerError> {
        let state = self
            .streams
            .get_mut(&stream.0)
            .ok_or_else(|| RunnerError::Device(format!("invalid stream handle {}", stream.0)))?;
        if let Some(recorded) = state.capture.as_mut() {
            recorded.push(op);
            return Ok(());
        }
        let deferred = matches!(op, HostOp::Kernel(_));
        match op.run(&mut self.memory) {
            Ok(()) => Ok(()),
            Err(e) if deferred => {
                if let Some(state) = self.streams.get_mut(&stream.0) {
                    state.pending_error.get_or_insert(e);
                }
                Ok(())
            }
            Err(e) => Err(RunnerError::Device(e)),
        }
    }
}

/// Snapshot of driver calls made against a [`HostDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub allocations: usize,
    pub frees: usize,
    pub htod_copies: usize,
    pub dtoh_copies: usize,
    pub kernel_launches: usize,
    pub synchronizations: usize,
    pub captures: usize,
    pub graph_launches: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    htod_copies: AtomicUsize,
    dtoh_copies: AtomicUsize,
    kernel_launches: AtomicUsize,
    synchronizations: AtomicUsize,
    captures: AtomicUsize,
    graph_launches: AtomicUsize,
}

/// Reference device backed by host memory.
pub struct HostDevice {
    name: String,
    memory_limit: Option<usize>,
    state: Mutex<State>,
    counters: Counters,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("name", &self.name)
            .field("memory_limit", &self.memory_limit)
            .finish()
    }
}

impl HostDevice {
    /// Create a host device with unbounded memory.
    pub fn new() -> Self {
        debug!("Initialized HostDevice");
        Self {
            name: "host".to_string(),
            memory_limit: None,
            state: Mutex::new(State {
                next_address: ADDRESS_BASE,
                ..State::default()
            }),
            counters: Counters::default(),
        }
    }

    /// Create a host device that refuses allocations beyond `bytes` in total.
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Self::new()
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, RunnerError> {
        self.state
            .lock()
            .map_err(|_| RunnerError::Device("host device state poisoned".to_string()))
    }

    /// Enqueue a kernel on `stream`.
    pub fn launch(&self, stream: StreamHandle, kernel: HostKernel) -> Result<(), RunnerError> {
        self.counters.kernel_launches.fetch_add(1, Ordering::Relaxed);
        self.lock()?.submit(stream, HostOp::Kernel(kernel))
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.lock().map(|s| s.allocated_bytes).unwrap_or(0)
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.lock().map(|s| s.memory.allocations.len()).unwrap_or(0)
    }

    /// Number of live streams.
    pub fn live_streams(&self) -> usize {
        self.lock().map(|s| s.streams.len()).unwrap_or(0)
    }

    /// Number of live graphs plus instantiated graphs.
    pub fn live_graphs(&self) -> usize {
        self.lock()
            .map(|s| s.graphs.len() + s.execs.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DeviceStats {
        let c = &self.counters;
        DeviceStats {
            allocations: c.allocations.load(Ordering::Relaxed),
            frees: c.frees.load(Ordering::Relaxed),
            htod_copies: c.htod_copies.load(Ordering::Relaxed),
            dtoh_copies: c.dtoh_copies.load(Ordering::Relaxed),
            kernel_launches: c.kernel_launches.load(Ordering::Relaxed),
            synchronizations: c.synchronizations.load(Ordering::Relaxed),
            captures: c.captures.load(Ordering::Relaxed),
            graph_launches: c.graph_launches.load(Ordering::Relaxed),
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, RunnerError> {
        let mut state = self.lock()?;
        if let Some(limit) = self.memory_limit {
            if state.allocated_bytes + bytes > limit {
                return Err(RunnerError::ResourceExhausted {
                    requested: bytes,
                    reason: format!(
                        "{} of {} bytes already in use",
                        state.allocated_bytes, limit
                    ),
                });
            }
        }
        let ptr = state.next_address;
        let span = (bytes as u64).max(1);
        state.next_address = (ptr + span).div_ceil(ALLOCATION_ALIGNMENT) * ALLOCATION_ALIGNMENT;
        state.allocated_bytes += bytes;
        state.memory.allocations.insert(ptr, vec![0u8; bytes]);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(ptr = format_args!("0x{:x}", ptr), bytes, "Host device alloc");
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), RunnerError> {
        let mut state = self.lock()?;
        let buf = state
            .memory
            .allocations
            .remove(&ptr)
            .ok_or_else(|| RunnerError::Device(format!("free of unknown address 0x{:x}", ptr)))?;
        state.allocated_bytes -= buf.len();
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stream_create(&self) -> Result<StreamHandle, RunnerError> {
        let mut state = self.lock()?;
        let id = state.handle();
        state.streams.insert(id, StreamState::default());
        Ok(StreamHandle(id))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> Result<(), RunnerError> {
        self.lock()?
            .streams
            .remove(&stream.0)
            .map(|_| ())
            .ok_or_else(|| RunnerError::Device(format!("invalid stream handle {}", stream.0)))
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), RunnerError> {
        self.counters.synchronizations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;
        let s = state.stream(stream)?;
        if s.capture.is_some() {
            return Err(RunnerError::Device(
                "cannot synchronize a stream that is capturing".to_string(),
            ));
        }
        match s.pending_error.take() {
            Some(e) => Err(RunnerError::ExecutionFailed(e)),
            None => Ok(()),
        }
    }

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.counters.htod_copies.fetch_add(1, Ordering::Relaxed);
        self.lock()?.submit(
            stream,
            HostOp::HtoD {
                dst,
                data: src.to_vec(),
            },
        )
    }

    fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.counters.dtoh_copies.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;
        if state.stream(stream)?.capture.is_some() {
            return Err(RunnerError::Device(
                "device-to-host copies cannot be captured".to_string(),
            ));
        }
        let data = state.memory.read(src, dst.len()).map_err(RunnerError::Device)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.lock()?.submit(
            stream,
            HostOp::DtoD {
                dst,
                src,
                len: bytes,
            },
        )
    }

    fn stream_begin_capture(&self, stream: StreamHandle) -> Result<(), RunnerError> {
        let mut state = self.lock()?;
        let s = state.stream(stream)?;
        if s.capture.is_some() {
            return Err(RunnerError::Device("stream is already capturing".to_string()));
        }
        s.capture = Some(Vec::new());
        Ok(())
    }

    fn stream_end_capture(&self, stream: StreamHandle) -> Result<GraphHandle, RunnerError> {
        let mut state = self.lock()?;
        let ops = state
            .stream(stream)?
            .capture
            .take()
            .ok_or_else(|| RunnerError::Device("stream is not capturing".to_string()))?;
        let id = state.handle();
        debug!(graph = id, ops = ops.len(), "Captured host graph");
        state.graphs.insert(id, Arc::new(ops));
        self.counters.captures.fetch_add(1, Ordering::Relaxed);
        Ok(GraphHandle(id))
    }

    fn graph_instantiate(&self, graph: GraphHandle) -> Result<GraphExecHandle, RunnerError> {
        let mut state = self.lock()?;
        let ops = state
            .graphs
            .get(&graph.0)
            .cloned()
            .ok_or_else(|| RunnerError::Device(format!("invalid graph handle {}", graph.0)))?;
        let id = state.handle();
        state.execs.insert(id, ops);
        Ok(GraphExecHandle(id))
    }

    fn graph_launch(
        &self,
        exec: GraphExecHandle,
        stream: StreamHandle,
    ) -> Result<(), RunnerError> {
        self.counters.graph_launches.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;
        let ops = state
            .execs
            .get(&exec.0)
            .cloned()
            .ok_or_else(|| RunnerError::Device(format!("invalid graph exec handle {}", exec.0)))?;
        if state.stream(stream)?.capture.is_some() {
            return Err(RunnerError::Device(
                "graph launch into a capturing stream is not supported".to_string(),
            ));
        }
        for op in ops.iter() {
            if let Err(e) = op.run(&mut state.memory) {
                state.stream(stream)?.pending_error.get_or_insert(e);
                break;
            }
        }
        Ok(())
    }

    fn graph_destroy(&self, graph: GraphHandle) -> Result<(), RunnerError> {
        self.lock()?
            .graphs
            .remove(&graph.0)
            .map(|_| ())
            .ok_or_else(|| RunnerError::Device(format!("invalid graph handle {}", graph.0)))
    }

    fn graph_exec_destroy(&self, exec: GraphExecHandle) -> Result<(), RunnerError> {
        self.lock()?
            .execs
            .remove(&exec.0)
            .map(|_| ())
            .ok_or_else(|| RunnerError::Device(format!("invalid graph exec handle {}", exec.0)))
    }
}
