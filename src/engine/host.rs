//! Reference engine executing a host kernel on [`HostDevice`].
//!
//! `HostEngine` behaves like a compiled engine with dynamic shapes: it
//! declares I/O tensors and optimization profiles, validates shapes against
//! the active profile, derives output shapes from input shapes and enqueues
//! its kernel on the device stream, where it can be captured and replayed
//! like any other device work. It speaks either binding API.
//!
//! Every context call is counted in [`EngineStats`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::host::{HostDevice, HostKernel, HostMemory};
use crate::backend::{Device, DevicePtr, StreamHandle};
use crate::tensor::{DataType, Tensor};

use super::{
    BindingApi, ContextProfiles, Engine, ExecutionContext, LegacyContext, NamedContext,
    SharedOutputAllocator, ShapeTemplate, TensorDesc, TensorIoMode,
};

/// Computes the engine's outputs from its inputs, in declaration order.
/// Shape-tensor inputs are passed as 1-D tensors of their values.
pub type KernelFn = Arc<dyn Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync>;

/// Derives output shapes from input dims, in declaration order. Shape-tensor
/// inputs contribute their values instead of their shape.
pub type OutputShapeFn =
    Arc<dyn Fn(&[Vec<usize>]) -> Result<Vec<Vec<usize>>, String> + Send + Sync>;

const OUTPUT_ALIGNMENT: usize = 256;

/// Inclusive per-input bounds of one optimization profile. For shape
/// tensors the bounds apply to the values.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    bounds: HashMap<String, (Vec<i64>, Vec<i64>)>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(mut self, name: &str, min: &[i64], max: &[i64]) -> Self {
        self.bounds
            .insert(name.to_string(), (min.to_vec(), max.to_vec()));
        self
    }

    fn admits(&self, name: &str, values: &[i64]) -> bool {
        match self.bounds.get(name) {
            None => true,
            Some((min, max)) => {
                min.len() == values.len()
                    && max.len() == values.len()
                    && values
                        .iter()
                        .zip(min.iter().zip(max))
                        .all(|(v, (lo, hi))| lo <= v && v <= hi)
            }
        }
    }
}

/// Snapshot of calls made against a [`HostEngine`] and its contexts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub contexts_created: usize,
    pub live_contexts: usize,
    /// `execute_async_v2` / `enqueue_v3` calls.
    pub executions: usize,
    /// Successful input shape or shape-tensor value updates.
    pub shape_updates: usize,
    /// Kernel bodies run on the device, including graph replays.
    pub kernel_runs: usize,
    pub output_allocations: usize,
    pub profile_switches: usize,
}

#[derive(Debug, Default)]
struct Counters {
    contexts_created: AtomicUsize,
    live_contexts: AtomicUsize,
    executions: AtomicUsize,
    shape_updates: AtomicUsize,
    kernel_runs: Arc<AtomicUsize>,
    output_allocations: AtomicUsize,
    profile_switches: AtomicUsize,
}

struct Inner {
    device: Arc<HostDevice>,
    tensors: Vec<TensorDesc>,
    profiles: Vec<Profile>,
    api: BindingApi,
    async_profile_switch: bool,
    output_shapes: OutputShapeFn,
    kernel: KernelFn,
    fail_context_creation: AtomicBool,
    fail_execution: AtomicBool,
    counters: Counters,
}

/// Reference engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HostEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HostEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEngine")
            .field("tensors", &self.inner.tensors)
            .field("profiles", &self.inner.profiles.len())
            .field("api", &self.inner.api)
            .finish()
    }
}

/// Builder for [`HostEngine`].
pub struct HostEngineBuilder {
    device: Arc<HostDevice>,
    tensors: Vec<TensorDesc>,
    profiles: Vec<Profile>,
    api: BindingApi,
    async_profile_switch: bool,
    output_shapes: Option<OutputShapeFn>,
    kernel: Option<KernelFn>,
    fail_context_creation: bool,
}

impl HostEngineBuilder {
    fn tensor(
        mut self,
        name: &str,
        mode: TensorIoMode,
        shape: Vec<i64>,
        dtype: DataType,
        is_shape_tensor: bool,
    ) -> Self {
        self.tensors.push(TensorDesc {
            name: name.to_string(),
            mode,
            shape: ShapeTemplate::new(shape),
            dtype,
            is_shape_tensor,
        });
        self
    }

    pub fn input(self, name: &str, shape: Vec<i64>, dtype: DataType) -> Self {
        self.tensor(name, TensorIoMode::Input, shape, dtype, false)
    }

    /// Declare a 1-D shape-tensor input holding `len` integer values.
    pub fn shape_input(self, name: &str, len: usize, dtype: DataType) -> Self {
        self.tensor(name, TensorIoMode::Input, vec![len as i64], dtype, true)
    }

    pub fn output(self, name: &str, shape: Vec<i64>, dtype: DataType) -> Self {
        self.tensor(name, TensorIoMode::Output, shape, dtype, false)
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn api(mut self, api: BindingApi) -> Self {
        self.api = api;
        self
    }

    /// Contexts only support the synchronous profile switch.
    pub fn sync_profile_switch_only(mut self) -> Self {
        self.async_profile_switch = false;
        self
    }

    pub fn output_shapes<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Vec<usize>]) -> Result<Vec<Vec<usize>>, String> + Send + Sync + 'static,
    {
        self.output_shapes = Some(Arc::new(f));
        self
    }

    pub fn kernel<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync + 'static,
    {
        self.kernel = Some(Arc::new(f));
        self
    }

    /// `create_execution_context` returns `None`.
    pub fn fail_context_creation(mut self) -> Self {
        self.fail_context_creation = true;
        self
    }

    pub fn build(self) -> HostEngine {
        let n_outputs = self
            .tensors
            .iter()
            .filter(|t| t.mode == TensorIoMode::Output)
            .count();
        // Default: every output takes the shape of the first input.
        let output_shapes: OutputShapeFn = match self.output_shapes {
            Some(f) => f,
            None => Arc::new(
                move |dims: &[Vec<usize>]| -> Result<Vec<Vec<usize>>, String> {
                    let first = dims.first().cloned().unwrap_or_default();
                    Ok(vec![first; n_outputs])
                },
            ),
        };
        // Default: every output is a copy of the first input.
        let kernel: KernelFn = match self.kernel {
            Some(f) => f,
            None => Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>, String> {
                let first = inputs
                    .first()
                    .ok_or_else(|| "engine has no inputs".to_string())?;
                Ok(vec![first.clone(); n_outputs])
            }),
        };
        let mut profiles = self.profiles;
        if profiles.is_empty() {
            profiles.push(Profile::new());
        }
        debug!(
            tensors = self.tensors.len(),
            profiles = profiles.len(),
            api = ?self.api,
            "Built HostEngine"
        );
        HostEngine {
            inner: Arc::new(Inner {
                device: self.device,
                tensors: self.tensors,
                profiles,
                api: self.api,
                async_profile_switch: self.async_profile_switch,
                output_shapes,
                kernel,
                fail_context_creation: AtomicBool::new(self.fail_context_creation),
                fail_execution: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }
}

impl HostEngine {
    pub fn builder(device: Arc<HostDevice>) -> HostEngineBuilder {
        HostEngineBuilder {
            device,
            tensors: Vec::new(),
            profiles: Vec::new(),
            api: BindingApi::Named,
            async_profile_switch: true,
            output_shapes: None,
            kernel: None,
            fail_context_creation: false,
        }
    }

    pub fn host_device(&self) -> &Arc<HostDevice> {
        &self.inner.device
    }

    /// Make every subsequent execution call report failure (or stop doing so).
    pub fn set_fail_execution(&self, fail: bool) {
        self.inner.fail_execution.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_context_creation(&self, fail: bool) {
        self.inner.fail_context_creation.store(fail, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            contexts_created: c.contexts_created.load(Ordering::Relaxed),
            live_contexts: c.live_contexts.load(Ordering::Relaxed),
            executions: c.executions.load(Ordering::Relaxed),
            shape_updates: c.shape_updates.load(Ordering::Relaxed),
            kernel_runs: c.kernel_runs.load(Ordering::Relaxed),
            output_allocations: c.output_allocations.load(Ordering::Relaxed),
            profile_switches: c.profile_switches.load(Ordering::Relaxed),
        }
    }
}

impl Engine for HostEngine {
    fn io_tensors(&self) -> &[TensorDesc] {
        &self.inner.tensors
    }

    fn num_profiles(&self) -> usize {
        self.inner.profiles.len()
    }

    fn binding_api(&self) -> BindingApi {
        self.inner.api
    }

    fn device(&self) -> Arc<dyn Device> {
        self.inner.device.clone()
    }

    fn create_execution_context(&self) -> Option<ExecutionContext> {
        if self.inner.fail_context_creation.load(Ordering::Relaxed) {
            debug!("HostEngine refusing to create execution context");
            return None;
        }
        let state = ContextState::new(self.clone());
        Some(match self.inner.api {
            BindingApi::Legacy => ExecutionContext::Legacy(Box::new(HostLegacyContext(state))),
            BindingApi::Named => ExecutionContext::Named(Box::new(HostNamedContext(state))),
        })
    }
}

/// Where a kernel input comes from at execution time.
enum KernelInput {
    Device {
        ptr: DevicePtr,
        shape: Vec<usize>,
        dtype: DataType,
    },
    Values(Tensor),
}

struct KernelOutput {
    ptr: DevicePtr,
    shape: Vec<usize>,
    dtype: DataType,
}

/// State common to both context flavours. Indices are profile-relative.
struct ContextState {
    engine: HostEngine,
    active_profile: usize,
    shapes: Vec<Option<Vec<usize>>>,
    values: Vec<Option<Vec<i64>>>,
    addresses: Vec<DevicePtr>,
    allocators: HashMap<String, SharedOutputAllocator>,
}

impl ContextState {
    fn new(engine: HostEngine) -> Self {
        let n = engine.inner.tensors.len();
        let counters = &engine.inner.counters;
        counters.contexts_created.fetch_add(1, Ordering::Relaxed);
        counters.live_contexts.fetch_add(1, Ordering::Relaxed);
        Self {
            engine,
            active_profile: 0,
            shapes: vec![None; n],
            values: vec![None; n],
            addresses: vec![0; n],
            allocators: HashMap::new(),
        }
    }

    fn tensors(&self) -> &[TensorDesc] {
        &self.engine.inner.tensors
    }

    fn counters(&self) -> &Counters {
        &self.engine.inner.counters
    }

    fn profile(&self) -> &Profile {
        &self.engine.inner.profiles[self.active_profile]
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.tensors().iter().position(|t| t.name == name)
    }

    fn switch_profile(&mut self, index: usize) -> bool {
        if index >= self.engine.inner.profiles.len() {
            return false;
        }
        if index != self.active_profile {
            // Bindings of the new profile start unspecified.
            let n = self.tensors().len();
            self.shapes = vec![None; n];
            self.values = vec![None; n];
        }
        self.active_profile = index;
        self.counters().profile_switches.fetch_add(1, Ordering::Relaxed);
        debug!(profile = index, "HostEngine context switched profile");
        true
    }

    fn set_shape(&mut self, idx: usize, shape: &[usize]) -> bool {
        let desc = &self.tensors()[idx];
        if !desc.is_input() || desc.is_shape_tensor || !desc.shape.accepts(shape) {
            return false;
        }
        let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        if !self.profile().admits(&desc.name, &dims) {
            trace!(name = %desc.name, shape = ?shape, "Shape outside active profile");
            return false;
        }
        self.shapes[idx] = Some(shape.to_vec());
        self.counters().shape_updates.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn set_values(&mut self, idx: usize, values: &[i64]) -> bool {
        let desc = &self.tensors()[idx];
        if !desc.is_input()
            || !desc.is_shape_tensor
            || desc.shape.to_concrete() != Some(vec![values.len()])
        {
            return false;
        }
        if values.iter().any(|&v| v < 0) || !self.profile().admits(&desc.name, values) {
            return false;
        }
        self.values[idx] = Some(values.to_vec());
        self.counters().shape_updates.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Shape of a data input: the one set on the context, or the template
    /// if it is fully static.
    fn input_shape(&self, idx: usize) -> Option<Vec<usize>> {
        self.shapes[idx]
            .clone()
            .or_else(|| self.tensors()[idx].shape.to_concrete())
    }

    fn inputs_specified(&self) -> bool {
        self.tensors().iter().enumerate().all(|(i, t)| {
            !t.is_input()
                || if t.is_shape_tensor {
                    self.values[i].is_some()
                } else {
                    self.input_shape(i).is_some()
                }
        })
    }

    /// Input dims as seen by the output shape function.
    fn input_dims(&self) -> Option<Vec<Vec<usize>>> {
        self.tensors()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_input())
            .map(|(i, t)| {
                if t.is_shape_tensor {
                    self.values[i]
                        .as_ref()
                        .map(|v| v.iter().map(|&x| x as usize).collect())
                } else {
                    self.input_shape(i)
                }
            })
            .collect()
    }

    /// Output shapes keyed by profile-relative index, if resolvable.
    fn output_shapes(&self) -> Option<HashMap<usize, Vec<usize>>> {
        let dims = self.input_dims()?;
        let shapes = (self.engine.inner.output_shapes)(&dims).ok()?;
        let outputs: Vec<usize> = self
            .tensors()
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_input())
            .map(|(i, _)| i)
            .collect();
        if shapes.len() != outputs.len() {
            return None;
        }
        let resolved: HashMap<usize, Vec<usize>> = outputs.into_iter().zip(shapes).collect();
        let consistent = resolved
            .iter()
            .all(|(&i, s)| self.tensors()[i].shape.accepts(s));
        consistent.then_some(resolved)
    }

    fn shape_of(&self, idx: usize) -> Vec<i64> {
        let desc = &self.tensors()[idx];
        let concrete = if desc.is_input() {
            if desc.is_shape_tensor {
                None
            } else {
                self.input_shape(idx)
            }
        } else {
            self.output_shapes().and_then(|mut m| m.remove(&idx))
        };
        match concrete {
            Some(s) => s.into_iter().map(|d| d as i64).collect(),
            None => desc.shape.dims().to_vec(),
        }
    }

    fn begin_execution(&self) -> bool {
        self.counters().executions.fetch_add(1, Ordering::Relaxed);
        if self.engine.inner.fail_execution.load(Ordering::Relaxed) {
            debug!("HostEngine execution failure injected");
            return false;
        }
        self.inputs_specified()
    }

    fn kernel_inputs(&self, addresses: &[DevicePtr]) -> Option<Vec<KernelInput>> {
        self.tensors()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_input())
            .map(|(i, t)| {
                if t.is_shape_tensor {
                    let values = self.values[i].clone()?;
                    let n = values.len();
                    Some(KernelInput::Values(
                        Tensor::from_i64(vec![n], values).cast(t.dtype),
                    ))
                } else {
                    let ptr = addresses[i];
                    let shape = self.input_shape(i)?;
                    if ptr == 0 && shape.iter().product::<usize>() > 0 {
                        return None;
                    }
                    Some(KernelInput::Device {
                        ptr,
                        shape,
                        dtype: t.dtype,
                    })
                }
            })
            .collect()
    }

    fn launch(
        &self,
        inputs: Vec<KernelInput>,
        outputs: Vec<KernelOutput>,
        stream: StreamHandle,
    ) -> bool {
        let kernel = self.engine.inner.kernel.clone();
        let runs = self.counters().kernel_runs.clone();
        let body: HostKernel = Arc::new(move |mem: &mut HostMemory| -> Result<(), String> {
            let mut tensors = Vec::with_capacity(inputs.len());
            for input in &inputs {
                match input {
                    KernelInput::Device { ptr, shape, dtype } => {
                        let n: usize = shape.iter().product();
                        let bytes = mem.read(*ptr, n * dtype.size())?;
                        let t = Tensor::from_bytes(shape, *dtype, bytes)
                            .map_err(|e| e.to_string())?;
                        tensors.push(t);
                    }
                    KernelInput::Values(t) => tensors.push(t.clone()),
                }
            }
            let results = kernel(&tensors)?;
            if results.len() != outputs.len() {
                return Err(format!(
                    "kernel produced {} outputs, engine declares {}",
                    results.len(),
                    outputs.len()
                ));
            }
            for (result, out) in results.iter().zip(&outputs) {
                if result.shape() != out.shape.as_slice() {
                    return Err(format!(
                        "kernel output shape {:?} differs from resolved shape {:?}",
                        result.shape(),
                        out.shape
                    ));
                }
                mem.write(out.ptr, result.cast(out.dtype).as_bytes())?;
            }
            runs.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        match self.engine.inner.device.launch(stream, body) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "HostEngine kernel launch failed");
                false
            }
        }
    }
}

impl Drop for ContextState {
    fn drop(&mut self) {
        self.counters().live_contexts.fetch_sub(1, Ordering::Relaxed);
    }
}

macro_rules! impl_context_profiles {
    ($ty:ident) => {
        impl ContextProfiles for $ty {
            fn engine(&self) -> Arc<dyn Engine> {
                Arc::new(self.0.engine.clone())
            }

            fn active_profile(&self) -> usize {
                self.0.active_profile
            }

            fn supports_async_profile_switch(&self) -> bool {
                self.0.engine.inner.async_profile_switch
            }

            fn set_optimization_profile_async(
                &mut self,
                index: usize,
                _stream: StreamHandle,
            ) -> bool {
                self.supports_async_profile_switch() && self.0.switch_profile(index)
            }

            fn set_optimization_profile(&mut self, index: usize) -> bool {
                self.0.switch_profile(index)
            }
        }
    };
}

struct HostLegacyContext(ContextState);
struct HostNamedContext(ContextState);

impl_context_profiles!(HostLegacyContext);
impl_context_profiles!(HostNamedContext);

impl HostLegacyContext {
    /// Profile-relative index of a global binding in the active profile.
    fn local(&self, binding: usize) -> Option<usize> {
        let n = self.0.tensors().len();
        let start = self.0.active_profile * n;
        (start..start + n).contains(&binding).then(|| binding - start)
    }
}

impl LegacyContext for HostLegacyContext {
    fn binding_shape(&self, binding: usize) -> Vec<i64> {
        let n = self.0.tensors().len();
        match self.local(binding) {
            Some(idx) => self.0.shape_of(idx),
            None if n > 0 => self.0.tensors()[binding % n].shape.dims().to_vec(),
            None => Vec::new(),
        }
    }

    fn set_binding_shape(&mut self, binding: usize, shape: &[usize]) -> bool {
        match self.local(binding) {
            Some(idx) => self.0.set_shape(idx, shape),
            None => false,
        }
    }

    fn shape_input(&self, binding: usize) -> Option<Vec<i64>> {
        self.local(binding).and_then(|idx| self.0.values[idx].clone())
    }

    fn set_shape_input(&mut self, binding: usize, values: &[i64]) -> bool {
        match self.local(binding) {
            Some(idx) => self.0.set_values(idx, values),
            None => false,
        }
    }

    fn all_binding_shapes_specified(&self) -> bool {
        self.0
            .tensors()
            .iter()
            .enumerate()
            .all(|(i, t)| {
                !t.is_input() || t.is_shape_tensor || self.0.input_shape(i).is_some()
            })
    }

    fn all_shape_inputs_specified(&self) -> bool {
        self.0
            .tensors()
            .iter()
            .enumerate()
            .all(|(i, t)| !t.is_shape_tensor || self.0.values[i].is_some())
    }

    fn execute_async_v2(&mut self, bindings: &[DevicePtr], stream: StreamHandle) -> bool {
        if !self.0.begin_execution() {
            return false;
        }
        let n = self.0.tensors().len();
        let start = self.0.active_profile * n;
        if bindings.len() < start + n {
            debug!(
                got = bindings.len(),
                need = start + n,
                "Binding array too short for active profile"
            );
            return false;
        }
        let addresses = &bindings[start..start + n];
        let Some(inputs) = self.0.kernel_inputs(addresses) else {
            return false;
        };
        let Some(mut shapes) = self.0.output_shapes() else {
            return false;
        };
        let mut outputs = Vec::new();
        for (i, t) in self.0.tensors().iter().enumerate() {
            if t.is_input() {
                continue;
            }
            let Some(shape) = shapes.remove(&i) else {
                return false;
            };
            let nbytes = shape.iter().product::<usize>() * t.dtype.size();
            if addresses[i] == 0 && nbytes > 0 {
                return false;
            }
            outputs.push(KernelOutput {
                ptr: addresses[i],
                shape,
                dtype: t.dtype,
            });
        }
        self.0.launch(inputs, outputs, stream)
    }
}

impl NamedContext for HostNamedContext {
    fn tensor_shape(&self, name: &str) -> Option<Vec<i64>> {
        self.0.index(name).map(|idx| self.0.shape_of(idx))
    }

    fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> bool {
        match self.0.index(name) {
            Some(idx) => self.0.set_shape(idx, shape),
            None => false,
        }
    }

    fn shape_input_values(&self, name: &str) -> Option<Vec<i64>> {
        self.0.index(name).and_then(|idx| self.0.values[idx].clone())
    }

    fn set_shape_input(&mut self, name: &str, values: &[i64]) -> bool {
        match self.0.index(name) {
            Some(idx) => self.0.set_values(idx, values),
            None => false,
        }
    }

    fn tensor_address(&self, name: &str) -> Option<DevicePtr> {
        self.0.index(name).map(|idx| self.0.addresses[idx])
    }

    fn set_tensor_address(&mut self, name: &str, ptr: DevicePtr) -> bool {
        match self.0.index(name) {
            Some(idx) if self.0.tensors()[idx].is_input() => {
                self.0.addresses[idx] = ptr;
                true
            }
            _ => false,
        }
    }

    fn set_output_allocator(&mut self, name: &str, allocator: SharedOutputAllocator) -> bool {
        match self.0.index(name) {
            Some(idx) if !self.0.tensors()[idx].is_input() => {
                self.0.allocators.insert(name.to_string(), allocator);
                true
            }
            _ => false,
        }
    }

    fn all_input_shapes_specified(&self) -> bool {
        self.0.inputs_specified()
    }

    fn enqueue_v3(&mut self, stream: StreamHandle) -> bool {
        if !self.0.begin_execution() {
            return false;
        }
        let Some(mut shapes) = self.0.output_shapes() else {
            return false;
        };
        let mut outputs = Vec::new();
        let n = self.0.tensors().len();
        for i in 0..n {
            let t = self.0.tensors()[i].clone();
            if t.is_input() {
                continue;
            }
            let Some(shape) = shapes.remove(&i) else {
                return false;
            };
            let Some(allocator) = self.0.allocators.get(&t.name).cloned() else {
                debug!(name = %t.name, "No output allocator registered");
                return false;
            };
            let size = shape.iter().product::<usize>() * t.dtype.size();
            let ptr = {
                let Ok(mut alloc) = allocator.lock() else {
                    return false;
                };
                let Some(ptr) = alloc.reallocate_output(&t.name, size, OUTPUT_ALIGNMENT) else {
                    return false;
                };
                alloc.notify_shape(&t.name, &shape);
                ptr
            };
            self.0
                .counters()
                .output_allocations
                .fetch_add(1, Ordering::Relaxed);
            self.0.addresses[i] = ptr;
            outputs.push(KernelOutput {
                ptr,
                shape,
                dtype: t.dtype,
            });
        }
        let addresses = self.0.addresses.clone();
        let Some(inputs) = self.0.kernel_inputs(&addresses) else {
            return false;
        };
        self.0.launch(inputs, outputs, stream)
    }
}
