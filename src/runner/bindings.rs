//! Shape resolution and buffer binding for the two context APIs.
//!
//! The runner selects one [`BindingStrategy`] at activation from the
//! engine's capability query and never branches on the API elsewhere.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::backend::{Device, DevicePtr};
use crate::buffer::{DeviceBuffer, DeviceView, TensorView};
use crate::engine::{
    BindingApi, Engine, ExecutionContext, LegacyContext, NamedContext, SharedOutputAllocator,
    TensorDesc,
};
use crate::error::RunnerError;
use crate::stream::Stream;

use super::allocator::RunnerOutputAllocator;
use super::graph::{BoundTensor, GraphKey};

/// One input of an inference call, already cast to the declared dtype.
pub(crate) struct Feed<'a> {
    pub desc: &'a TensorDesc,
    pub view: Cow<'a, TensorView>,
}

impl Feed<'_> {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn dims(&self) -> Vec<i64> {
        self.view.shape().iter().map(|&d| d as i64).collect()
    }

    /// Values of a shape-tensor feed. Shape tensors must be host-resident
    /// integers.
    fn shape_values(&self) -> Result<Vec<i64>, RunnerError> {
        let tensor = self.view.as_host().ok_or_else(|| RunnerError::InvalidInput {
            name: self.name().to_string(),
            reason: "shape tensors must reside in host memory".to_string(),
        })?;
        tensor.to_i64_vec().ok_or_else(|| RunnerError::InvalidInput {
            name: self.name().to_string(),
            reason: format!("shape tensor has non-integer dtype {:?}", tensor.dtype()),
        })
    }

    fn invalid_shape(&self, reason: &str) -> RunnerError {
        RunnerError::InvalidShape {
            name: self.name().to_string(),
            shape: self.dims(),
            reason: reason.to_string(),
        }
    }
}

/// Per-API binding behaviour.
pub(crate) trait BindingStrategy: Send {
    fn api(&self) -> BindingApi;

    /// Set input shapes (and shape-tensor values) on the context. Returns
    /// whether anything differs from what the context held before.
    fn resolve_shapes(
        &mut self,
        ctx: &mut ExecutionContext,
        feeds: &[Feed<'_>],
    ) -> Result<bool, RunnerError>;

    /// Size buffers for the resolved shapes and enqueue input copies.
    fn stage_inputs(
        &mut self,
        ctx: &mut ExecutionContext,
        feeds: &[Feed<'_>],
        stream: &Stream,
    ) -> Result<(), RunnerError>;

    /// Whether execution may be captured into a graph.
    fn supports_capture(&self) -> bool {
        false
    }

    /// The full binding the next execution will run under. Only called when
    /// [`BindingStrategy::supports_capture`] holds.
    fn graph_key(&self, _ctx: &ExecutionContext) -> Result<GraphKey, RunnerError> {
        Err(RunnerError::InvalidState(format!(
            "the {:?} binding API does not support graph capture",
            self.api()
        )))
    }

    /// Enqueue one execution on `stream`.
    fn execute(&mut self, ctx: &mut ExecutionContext, stream: &Stream) -> Result<(), RunnerError>;

    /// Device location, shape and dtype of every output after execution.
    fn outputs(&self, ctx: &ExecutionContext) -> Result<Vec<(String, DeviceView)>, RunnerError>;

    /// Free all device buffers, returning the failures.
    fn release(&mut self) -> Vec<String>;
}

fn mismatched(expected: BindingApi) -> RunnerError {
    RunnerError::InvalidState(format!(
        "execution context does not implement the {:?} binding API",
        expected
    ))
}

fn legacy(ctx: &mut ExecutionContext) -> Result<&mut dyn LegacyContext, RunnerError> {
    match ctx {
        ExecutionContext::Legacy(c) => Ok(c.as_mut()),
        ExecutionContext::Named(_) => Err(mismatched(BindingApi::Legacy)),
    }
}

fn named(ctx: &mut ExecutionContext) -> Result<&mut dyn NamedContext, RunnerError> {
    match ctx {
        ExecutionContext::Named(c) => Ok(c.as_mut()),
        ExecutionContext::Legacy(_) => Err(mismatched(BindingApi::Named)),
    }
}

fn concrete(name: &str, shape: &[i64]) -> Result<Vec<usize>, RunnerError> {
    shape
        .iter()
        .map(|&d| usize::try_from(d).ok())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            RunnerError::IncompleteShapeSpecification(format!(
                "tensor '{}' still has dynamic shape {:?}",
                name, shape
            ))
        })
}

fn nbytes(shape: &[usize], desc: &TensorDesc) -> usize {
    shape.iter().product::<usize>() * desc.dtype.size()
}

// ---------------------------------------------------------------------------
// Index-based bindings
// ---------------------------------------------------------------------------

/// Bindings for [`LegacyContext`]s.
///
/// Buffers are keyed by profile-0 binding names; the binding array passed to
/// execution is offset by the active profile's first binding index.
pub(crate) struct LegacyBindings {
    engine: Arc<dyn Engine>,
    buffers: HashMap<String, DeviceBuffer>,
    output_shapes: HashMap<String, Vec<usize>>,
    bindings: Vec<DevicePtr>,
}

impl LegacyBindings {
    pub fn new(engine: Arc<dyn Engine>, device: Arc<dyn Device>) -> Self {
        let buffers = engine
            .io_tensors()
            .iter()
            .map(|t| (t.name.clone(), DeviceBuffer::new(device.clone())))
            .collect();
        Self {
            engine,
            buffers,
            output_shapes: HashMap::new(),
            bindings: Vec::new(),
        }
    }

    fn start_binding(&self, ctx: &ExecutionContext) -> usize {
        ctx.active_profile() * self.engine.bindings_per_profile()
    }

    fn local_index(&self, name: &str) -> Option<usize> {
        self.engine.io_tensors().iter().position(|t| t.name == name)
    }
}

impl BindingStrategy for LegacyBindings {
    fn api(&self) -> BindingApi {
        BindingApi::Legacy
    }

    fn resolve_shapes(
        &mut self,
        ctx: &mut ExecutionContext,
        feeds: &[Feed<'_>],
    ) -> Result<bool, RunnerError> {
        let start = self.start_binding(ctx);
        let ctx = legacy(ctx)?;
        let mut changed = false;

        for feed in feeds {
            let Some(idx) = self.local_index(feed.name()) else {
                continue;
            };
            let binding = start + idx;
            if feed.desc.is_shape_tensor {
                let values = feed.shape_values()?;
                if ctx.shape_input(binding).as_deref() != Some(values.as_slice()) {
                    debug!(name = feed.name(), binding, values = ?values, "Setting shape binding");
                    if !ctx.set_shape_input(binding, &values) {
                        return Err(RunnerError::InvalidShape {
                            name: feed.name().to_string(),
                            shape: values,
                            reason: "shape binding values rejected by the active profile"
                                .to_string(),
                        });
                    }
                    changed = true;
                }
            } else if feed.desc.shape.is_dynamic() {
                let shape = feed.view.shape();
                if ctx.binding_shape(binding) != feed.dims() {
                    debug!(name = feed.name(), binding, shape = ?shape, "Setting binding shape");
                    if !ctx.set_binding_shape(binding, shape) {
                        return Err(feed.invalid_shape(
                            "shape is not valid for the binding in the active profile",
                        ));
                    }
                    changed = true;
                }
            } else if !feed.desc.shape.accepts(feed.view.shape()) {
                return Err(feed.invalid_shape(&format!(
                    "static binding expects {}",
                    feed.desc.shape
                )));
            }
        }

        if !ctx.all_binding_shapes_specified() {
            return Err(RunnerError::IncompleteShapeSpecification(
                "not all input binding shapes are specified".to_string(),
            ));
        }
        if !ctx.all_shape_inputs_specified() {
            return Err(RunnerError::IncompleteShapeSpecification(
                "not all shape binding values are specified".to_string(),
            ));
        }
        Ok(changed)
    }

    fn stage_inputs(
        &mut self,
        ctx: &mut ExecutionContext,
        feeds: &[Feed<'_>],
        stream: &Stream,
    ) -> Result<(), RunnerError> {
        let start = self.start_binding(ctx);
        let ctx = legacy(ctx)?;
        let n = self.engine.bindings_per_profile();

        // Only the active profile's output buffers are resized.
        self.output_shapes.clear();
        for (idx, desc) in self.engine.io_tensors().iter().enumerate() {
            if desc.is_input() {
                continue;
            }
            let shape = concrete(&desc.name, &ctx.binding_shape(start + idx))?;
            if let Some(buf) = self.buffers.get_mut(&desc.name) {
                buf.resize(nbytes(&shape, desc))?;
            }
            self.output_shapes.insert(desc.name.clone(), shape);
        }

        let mut addresses: HashMap<&str, DevicePtr> = HashMap::new();
        for feed in feeds {
            if feed.desc.is_shape_tensor {
                continue;
            }
            let ptr = match &*feed.view {
                TensorView::Device(view) => view.ptr,
                TensorView::Host(tensor) => {
                    let buf = self.buffers.get_mut(feed.name()).ok_or_else(|| {
                        RunnerError::InvalidState(format!("no buffer for '{}'", feed.name()))
                    })?;
                    buf.copy_from_host(tensor.as_bytes(), stream)?;
                    buf.ptr()
                }
            };
            addresses.insert(feed.name(), ptr);
        }

        // Lower profiles' bindings are padded with null addresses.
        let mut bindings = vec![0; start];
        bindings.extend(self.engine.io_tensors().iter().map(|t| {
            if t.is_shape_tensor {
                0
            } else {
                addresses
                    .get(t.name.as_str())
                    .copied()
                    .or_else(|| self.buffers.get(&t.name).map(|b| b.ptr()))
                    .unwrap_or(0)
            }
        }));
        debug_assert_eq!(bindings.len(), start + n);
        trace!(bindings = ?bindings, "Legacy binding array");
        self.bindings = bindings;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext, stream: &Stream) -> Result<(), RunnerError> {
        let handle = stream.handle()?;
        if !legacy(ctx)?.execute_async_v2(&self.bindings, handle) {
            return Err(RunnerError::ExecutionFailed(
                "execute_async_v2() failed".to_string(),
            ));
        }
        Ok(())
    }

    fn outputs(&self, ctx: &ExecutionContext) -> Result<Vec<(String, DeviceView)>, RunnerError> {
        let start = self.start_binding(ctx);
        self.engine
            .io_tensors()
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_input())
            .map(|(idx, t)| {
                let shape = self.output_shapes.get(&t.name).cloned().ok_or_else(|| {
                    RunnerError::ExecutionFailed(format!("output '{}' was not bound", t.name))
                })?;
                let ptr = self.bindings.get(start + idx).copied().unwrap_or(0);
                Ok((t.name.clone(), DeviceView::new(ptr, shape, t.dtype)))
            })
            .collect()
    }

    fn release(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, buf) in self.buffers.iter_mut() {
            if let Err(e) = buf.free() {
                errors.push(format!("buffer '{}': {}", name, e));
            }
        }
        self.bindings.clear();
        errors
    }
}

// ---------------------------------------------------------------------------
// Name-based bindings
// ---------------------------------------------------------------------------

/// Bindings for [`NamedContext`]s.
///
/// Input buffers are owned here; output buffers belong to the
/// [`RunnerOutputAllocator`] registered with the context, which the engine
/// calls during execution once the output sizes are known.
pub(crate) struct NamedBindings {
    engine: Arc<dyn Engine>,
    buffers: HashMap<String, DeviceBuffer>,
    allocator: Arc<Mutex<RunnerOutputAllocator>>,
}

impl NamedBindings {
    pub fn new(
        engine: Arc<dyn Engine>,
        device: Arc<dyn Device>,
        ctx: &mut ExecutionContext,
    ) -> Result<Self, RunnerError> {
        let ctx = named(ctx)?;
        let allocator = Arc::new(Mutex::new(RunnerOutputAllocator::new(device.clone())));
        let mut buffers = HashMap::new();
        for t in engine.io_tensors() {
            if t.is_input() {
                if !t.is_shape_tensor {
                    buffers.insert(t.name.clone(), DeviceBuffer::new(device.clone()));
                }
            } else {
                let shared: SharedOutputAllocator = allocator.clone();
                if !ctx.set_output_allocator(&t.name, shared) {
                    return Err(RunnerError::Activation(format!(
                        "failed to register output allocator for '{}'",
                        t.name
                    )));
                }
            }
        }
        Ok(Self {
            engine,
            buffers,
            allocator,
        })
    }

    fn allocator(&self) -> Result<std::sync::MutexGuard<'_, RunnerOutputAllocator>, RunnerError> {
        self.allocator
            .lock()
            .map_err(|_| RunnerError::InvalidState("output allocator poisoned".to_string()))
    }
}

impl BindingStrategy for NamedBindings {
    fn api(&self) -> BindingApi {
        BindingApi::Named
    }

    fn resolve_shapes(
        &mut self,
        ctx: &mut ExecutionContext,
        feeds: &[Feed<'_>],
    ) -> Result<bool, RunnerError> {
        let ctx = named(ctx)?;
        let mut changed = false;

        for feed in feeds {
            if feed.desc.is_shape_tensor {
                let values = feed.shape_values()?;
                if ctx.shape_input_values(feed.name()).as_deref() != Some(values.as_slice()) {
                    debug!(name = feed.name(), values = ?values, "Setting shape tensor values");
                    if !ctx.set_shape_input(feed.name(), &values) {
                        return Err(RunnerError::InvalidShape {
                            name: feed.name().to_string(),
                            shape: values,
                            reason: "shape tensor values rejected by the active profile"
                                .to_string(),
                        });
                    }
                    changed = true;
                }
                continue;
            }
            let current = ctx.tensor_shape(feed.name());
            if current.as_deref() != Some(feed.dims().as_slice()) {
                debug!(
                    name = feed.name(),
                    from = ?current,
                    to = ?feed.view.shape(),
                    "Setting input shape"
                );
                if !ctx.set_input_shape(feed.name(), feed.view.shape()) {
                    return Err(feed.invalid_shape(&format!(
                        "outside the bounds of the active profile (declared {})",
                        feed.desc.shape
                    )));
                }
                changed = true;
            }
        }

        if !ctx.all_input_shapes_specified() {
            return Err(RunnerError::IncompleteShapeSpecification(
                "not all input shapes are specified".to_string(),
            ));
        }
        Ok(changed)
    }

    fn stage_inputs(
        &mut self,
        ctx: &mut ExecutionContext,
        feeds: &[Feed<'_>],
        stream: &Stream,
    ) -> Result<(), RunnerError> {
        let ctx = named(ctx)?;
        for feed in feeds {
            if feed.desc.is_shape_tensor {
                continue;
            }
            let ptr = match &*feed.view {
                TensorView::Device(view) => view.ptr,
                TensorView::Host(tensor) => {
                    let buf = self.buffers.get_mut(feed.name()).ok_or_else(|| {
                        RunnerError::InvalidState(format!("no buffer for '{}'", feed.name()))
                    })?;
                    buf.copy_from_host(tensor.as_bytes(), stream)?;
                    buf.ptr()
                }
            };
            if ctx.tensor_address(feed.name()) == Some(ptr) {
                continue;
            }
            trace!(name = feed.name(), ptr = format_args!("0x{:x}", ptr), "Setting tensor address");
            if !ctx.set_tensor_address(feed.name(), ptr) {
                return Err(RunnerError::InvalidInput {
                    name: feed.name().to_string(),
                    reason: format!("failed to set tensor address to 0x{:x}", ptr),
                });
            }
        }
        Ok(())
    }

    fn supports_capture(&self) -> bool {
        true
    }

    fn graph_key(&self, ctx: &ExecutionContext) -> Result<GraphKey, RunnerError> {
        let ExecutionContext::Named(c) = ctx else {
            return Err(mismatched(BindingApi::Named));
        };
        let allocator = self.allocator()?;
        let tensors = self
            .engine
            .io_tensors()
            .iter()
            .map(|t| BoundTensor {
                name: t.name.clone(),
                shape: c.tensor_shape(&t.name).unwrap_or_default(),
                values: if t.is_shape_tensor {
                    c.shape_input_values(&t.name)
                } else {
                    None
                },
                address: if t.is_input() {
                    c.tensor_address(&t.name).unwrap_or(0)
                } else {
                    allocator.address(&t.name)
                },
            })
            .collect();
        Ok(GraphKey::new(tensors))
    }

    fn execute(&mut self, ctx: &mut ExecutionContext, stream: &Stream) -> Result<(), RunnerError> {
        let handle = stream.handle()?;
        let ok = named(ctx)?.enqueue_v3(handle);
        if let Some(e) = self.allocator()?.take_error() {
            return Err(e);
        }
        if !ok {
            return Err(RunnerError::ExecutionFailed("enqueue_v3() failed".to_string()));
        }
        Ok(())
    }

    fn outputs(&self, _ctx: &ExecutionContext) -> Result<Vec<(String, DeviceView)>, RunnerError> {
        let allocator = self.allocator()?;
        self.engine
            .io_tensors()
            .iter()
            .filter(|t| !t.is_input())
            .map(|t| {
                let shape = allocator.shape(&t.name).ok_or_else(|| {
                    RunnerError::ExecutionFailed(format!(
                        "engine did not report a shape for output '{}'",
                        t.name
                    ))
                })?;
                let view = DeviceView::new(allocator.address(&t.name), shape.to_vec(), t.dtype);
                Ok((t.name.clone(), view))
            })
            .collect()
    }

    fn release(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, buf) in self.buffers.iter_mut() {
            if let Err(e) = buf.free() {
                errors.push(format!("buffer '{}': {}", name, e));
            }
        }
        match self.allocator.lock() {
            Ok(mut a) => errors.extend(a.release()),
            Err(_) => errors.push("output allocator poisoned".to_string()),
        }
        errors
    }
}
