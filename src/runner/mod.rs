//! Inference runner for precompiled dynamic-shape engines.
//!
//! A [`Runner`] binds an [`Engine`] and an [`ExecutionContext`] to one
//! execution stream and serves repeated [`Runner::infer`] calls:
//!
//! 1. feeds are matched to the engine's declared inputs and cast to the
//!    declared dtype;
//! 2. input shapes are resolved on the context, discarding any captured graph
//!    when they change;
//! 3. host inputs are staged into runner-owned device buffers (device views
//!    are bound as-is);
//! 4. execution is enqueued directly, or through a captured graph when graph
//!    capture is enabled and the binding API supports it;
//! 5. outputs are copied back to host, or returned as device views.
//!
//! Resource ownership is explicit: engines and contexts the runner creates
//! are released on [`Runner::deactivate`], caller-supplied ones are only
//! detached.

pub mod allocator;
mod bindings;
pub mod graph;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::backend::Device;
use crate::buffer::{DeviceView, TensorView};
use crate::config::RunnerConfig;
use crate::engine::{BindingApi, Engine, ExecutionContext, TensorMetadata};
use crate::error::RunnerError;
use crate::stream::{Graph, GraphExec, Stream};
use crate::tensor::Tensor;

use bindings::{BindingStrategy, Feed, LegacyBindings, NamedBindings};
use graph::{GraphCache, GraphKey};

pub const RUNNER_NAME: &str = "TensorRT";
pub const CUDA_GRAPH_RUNNER_NAME: &str = "TensorRTCUDAGraph";

/// Loads an engine at activation time. The runner owns what it returns.
pub type EngineLoader = Box<dyn Fn() -> Result<Arc<dyn Engine>, RunnerError> + Send>;

/// Where a runner gets its engine and execution context from.
pub enum EngineSource {
    /// Engine created at activation and released on deactivation.
    Loader(EngineLoader),
    /// Caller-owned engine; the runner creates and owns the context.
    Engine(Arc<dyn Engine>),
    /// Caller-owned context; its engine is borrowed as well.
    Context(Arc<Mutex<ExecutionContext>>),
}

/// Whether a resource is released by the runner on deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Borrowed,
}

enum Held<T> {
    Owned(T),
    Borrowed(T),
}

impl<T> Held<T> {
    fn get(&self) -> &T {
        match self {
            Held::Owned(v) | Held::Borrowed(v) => v,
        }
    }

    fn ownership(&self) -> Ownership {
        match self {
            Held::Owned(_) => Ownership::Owned,
            Held::Borrowed(_) => Ownership::Borrowed,
        }
    }
}

/// Counters over the runner's lifetime, across activations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub inferences: usize,
    pub graph_captures: usize,
    pub graph_replays: usize,
    /// Captured graphs discarded because the binding changed.
    pub graph_invalidations: usize,
}

/// Everything that exists only while the runner is active.
struct ActiveState {
    engine: Held<Arc<dyn Engine>>,
    context: Held<Arc<Mutex<ExecutionContext>>>,
    device: Arc<dyn Device>,
    stream: Stream,
    bindings: Box<dyn BindingStrategy>,
    graphs: GraphCache,
    host_outputs: HashMap<String, Vec<u8>>,
}

impl ActiveState {
    fn dispatch(
        &mut self,
        ctx: &mut ExecutionContext,
        use_graphs: bool,
        stats: &mut RunnerStats,
    ) -> Result<(), RunnerError> {
        if !use_graphs || !self.bindings.supports_capture() {
            return self.bindings.execute(ctx, &self.stream);
        }

        let key = self.bindings.graph_key(ctx)?;
        if self.graphs.replay(&key, &self.stream)? {
            trace!("Replayed captured graph");
            stats.graph_replays += 1;
            return Ok(());
        }
        if self.graphs.invalidate() {
            stats.graph_invalidations += 1;
        }

        let (key, graph, exec) = self.capture(ctx)?;
        exec.launch(&self.stream)?;
        self.graphs.store(key, graph, exec);
        stats.graph_captures += 1;
        Ok(())
    }

    /// Prime, then record one execution. The priming run lets the engine
    /// settle output allocations outside of capture.
    fn capture(
        &mut self,
        ctx: &mut ExecutionContext,
    ) -> Result<(GraphKey, Graph, GraphExec), RunnerError> {
        self.bindings.execute(ctx, &self.stream)?;
        self.stream.synchronize()?;

        self.stream.begin_capture()?;
        let recorded = self.bindings.execute(ctx, &self.stream);
        // Capture must be ended even when the recorded execution failed.
        let graph = self.stream.end_capture();
        recorded?;
        let graph = graph?;
        self.stream.synchronize()?;

        let exec = graph.instantiate()?;
        let key = self.bindings.graph_key(ctx)?;
        debug!(tensors = key.tensors().len(), "Captured execution graph");
        Ok((key, graph, exec))
    }
}

/// Runs inference on one engine through one execution context and stream.
pub struct Runner {
    name: &'static str,
    source: EngineSource,
    config: RunnerConfig,
    output_metadata: Option<TensorMetadata>,
    state: Option<ActiveState>,
    stats: RunnerStats,
}

fn not_active(op: &str) -> RunnerError {
    RunnerError::InvalidState(format!("{}() requires an active runner", op))
}

fn lock_context(
    context: &Arc<Mutex<ExecutionContext>>,
) -> Result<MutexGuard<'_, ExecutionContext>, RunnerError> {
    context
        .lock()
        .map_err(|_| RunnerError::InvalidState("execution context mutex poisoned".to_string()))
}

/// Driver failures during dispatch are execution failures.
fn execution_failed(e: RunnerError) -> RunnerError {
    match e {
        RunnerError::Device(msg) => RunnerError::ExecutionFailed(msg),
        other => other,
    }
}

fn create_context(engine: &dyn Engine) -> Result<Arc<Mutex<ExecutionContext>>, RunnerError> {
    engine
        .create_execution_context()
        .map(|ctx| Arc::new(Mutex::new(ctx)))
        .ok_or_else(|| RunnerError::Activation("Failed to create execution context".to_string()))
}

/// Match feeds to the engine's declared inputs, in declaration order.
fn collect_feeds<'a>(
    engine: &'a dyn Engine,
    inputs: &'a HashMap<String, TensorView>,
) -> Result<Vec<Feed<'a>>, RunnerError> {
    for name in inputs.keys() {
        if !engine.tensor(name).is_some_and(|t| t.is_input()) {
            debug!(name = %name, "Ignoring feed not declared as an engine input");
        }
    }

    engine
        .io_tensors()
        .iter()
        .filter(|t| t.is_input())
        .map(|desc| {
            let view = match inputs.get(&desc.name) {
                Some(view) => view,
                // Nothing pins the dimensions of an absent dynamic input.
                None if desc.shape.is_dynamic() => {
                    return Err(RunnerError::IncompleteShapeSpecification(format!(
                        "input '{}' has dynamic shape {:?} and was not supplied",
                        desc.name,
                        desc.shape.dims()
                    )));
                }
                None => {
                    return Err(RunnerError::InvalidInput {
                        name: desc.name.clone(),
                        reason: "declared input was not supplied".to_string(),
                    });
                }
            };
            let view = match view {
                TensorView::Host(t) if t.dtype() != desc.dtype => {
                    trace!(name = %desc.name, from = ?t.dtype(), to = ?desc.dtype, "Casting input");
                    Cow::Owned(TensorView::Host(t.cast(desc.dtype)))
                }
                TensorView::Device(v) if v.dtype != desc.dtype => {
                    return Err(RunnerError::InvalidInput {
                        name: desc.name.clone(),
                        reason: format!(
                            "device view has dtype {:?}, engine expects {:?}",
                            v.dtype, desc.dtype
                        ),
                    });
                }
                _ => Cow::Borrowed(view),
            };
            Ok(Feed { desc, view })
        })
        .collect()
}

impl Runner {
    fn with_source(source: EngineSource) -> Self {
        Self {
            name: RUNNER_NAME,
            source,
            config: RunnerConfig::default(),
            output_metadata: None,
            state: None,
            stats: RunnerStats::default(),
        }
    }

    /// Runner over a caller-owned engine.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_source(EngineSource::Engine(engine))
    }

    /// Runner that loads (and owns) its engine on activation.
    pub fn from_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Engine>, RunnerError> + Send + 'static,
    {
        Self::with_source(EngineSource::Loader(Box::new(loader)))
    }

    /// Runner over a caller-owned execution context.
    pub fn from_context(context: Arc<Mutex<ExecutionContext>>) -> Self {
        Self::with_source(EngineSource::Context(context))
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict returned outputs to the names in `metadata`.
    pub fn with_output_metadata(mut self, metadata: TensorMetadata) -> Self {
        self.output_metadata = Some(metadata);
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// `(engine, context)` ownership while active.
    pub fn ownership(&self) -> Option<(Ownership, Ownership)> {
        self.state
            .as_ref()
            .map(|s| (s.engine.ownership(), s.context.ownership()))
    }

    pub fn activate(&mut self) -> Result<(), RunnerError> {
        if self.state.is_some() {
            return Err(RunnerError::InvalidState("runner is already active".to_string()));
        }

        let (engine, context) = match &self.source {
            EngineSource::Loader(load) => {
                let engine = load().map_err(|e| match e {
                    RunnerError::Activation(_) => e,
                    other => RunnerError::Activation(format!("Failed to load engine: {}", other)),
                })?;
                let context = create_context(engine.as_ref())?;
                (Held::Owned(engine), Held::Owned(context))
            }
            EngineSource::Engine(engine) => {
                let context = create_context(engine.as_ref())?;
                (Held::Borrowed(engine.clone()), Held::Owned(context))
            }
            EngineSource::Context(context) => {
                let engine = lock_context(context)?.engine();
                (Held::Borrowed(engine), Held::Borrowed(context.clone()))
            }
        };

        let api = engine.get().binding_api();
        let device = engine.get().device();
        let stream = Stream::new(device.clone())?;

        let bindings: Box<dyn BindingStrategy> = {
            let mut ctx = lock_context(context.get())?;
            if ctx.api() != api {
                return Err(RunnerError::Activation(format!(
                    "engine declares the {:?} binding API but its context implements {:?}",
                    api,
                    ctx.api()
                )));
            }
            let bindings: Box<dyn BindingStrategy> = match api {
                BindingApi::Legacy => {
                    Box::new(LegacyBindings::new(engine.get().clone(), device.clone()))
                }
                BindingApi::Named => Box::new(NamedBindings::new(
                    engine.get().clone(),
                    device.clone(),
                    &mut ctx,
                )?),
            };
            if let Some(index) = self.config.optimization_profile {
                ctx.set_profile(index, stream.handle()?)?;
            }
            bindings
        };

        if self.config.use_cuda_graphs && !bindings.supports_capture() {
            warn!(
                runner = self.name,
                api = ?bindings.api(),
                "Graph capture is not supported with this binding API, executing directly"
            );
        }

        info!(
            runner = self.name,
            api = ?api,
            device = device.name(),
            engine = ?engine.ownership(),
            context = ?context.ownership(),
            profile = ?self.config.optimization_profile,
            cuda_graphs = self.config.use_cuda_graphs,
            "Runner activated"
        );

        self.state = Some(ActiveState {
            engine,
            context,
            device,
            stream,
            bindings,
            graphs: GraphCache::new(),
            host_outputs: HashMap::new(),
        });
        Ok(())
    }

    /// Switch the context to optimization profile `index`. On failure the
    /// previous profile stays active.
    pub fn set_profile(&mut self, index: usize) -> Result<(), RunnerError> {
        let state = self.state.as_mut().ok_or_else(|| not_active("set_profile"))?;
        let handle = state.stream.handle()?;
        lock_context(state.context.get())?.set_profile(index, handle)?;
        if state.graphs.invalidate() {
            self.stats.graph_invalidations += 1;
        }
        info!(runner = self.name, profile = index, "Set optimization profile");
        Ok(())
    }

    /// Declared inputs of the engine: name, shape template and dtype.
    pub fn input_metadata(&self) -> Result<TensorMetadata, RunnerError> {
        let state = self.state.as_ref().ok_or_else(|| not_active("input_metadata"))?;
        let mut meta = TensorMetadata::new();
        for t in state.engine.get().io_tensors().iter().filter(|t| t.is_input()) {
            meta.insert(&t.name, t.shape.clone(), t.dtype);
        }
        Ok(meta)
    }

    /// Run one inference.
    ///
    /// Feeds not declared by the engine are ignored. With `return_on_device`
    /// the outputs are views of runner-owned device memory, valid until the
    /// next call or deactivation.
    pub fn infer(
        &mut self,
        inputs: &HashMap<String, TensorView>,
        return_on_device: bool,
    ) -> Result<HashMap<String, TensorView>, RunnerError> {
        let state = self.state.as_mut().ok_or_else(|| not_active("infer"))?;
        let engine = state.engine.get().clone();
        let feeds = collect_feeds(engine.as_ref(), inputs)?;

        let context = state.context.get().clone();
        let mut ctx = lock_context(&context)?;

        let changed = state.bindings.resolve_shapes(&mut ctx, &feeds)?;
        if changed && state.graphs.invalidate() {
            debug!(runner = self.name, "Input shapes changed, discarding captured graph");
            self.stats.graph_invalidations += 1;
        }

        state.bindings.stage_inputs(&mut ctx, &feeds, &state.stream)?;
        state
            .dispatch(&mut ctx, self.config.use_cuda_graphs, &mut self.stats)
            .map_err(execution_failed)?;

        let handle = state.stream.handle()?;
        let mut results = HashMap::new();
        let mut pending = Vec::new();
        for (name, view) in state.bindings.outputs(&ctx)? {
            if let Some(meta) = &self.output_metadata {
                if !meta.contains(&name) {
                    continue;
                }
            }
            if return_on_device {
                results.insert(name, TensorView::Device(view));
                continue;
            }
            let nbytes = view.nbytes();
            let buf = state.host_outputs.entry(name.clone()).or_default();
            if buf.len() < nbytes {
                buf.resize(nbytes, 0);
            }
            if nbytes > 0 {
                state
                    .device
                    .memcpy_dtoh_async(&mut buf[..nbytes], view.ptr, handle)
                    .map_err(execution_failed)?;
            }
            pending.push((name, view));
        }

        state.stream.synchronize().map_err(execution_failed)?;

        for (name, view) in pending {
            let bytes = state
                .host_outputs
                .get(&name)
                .map(|b| &b[..view.nbytes()])
                .unwrap_or_default();
            let tensor = Tensor::from_bytes(&view.shape, view.dtype, bytes)?;
            results.insert(name, TensorView::Host(tensor));
        }

        self.stats.inferences += 1;
        trace!(runner = self.name, outputs = results.len(), "Inference complete");
        Ok(results)
    }

    /// Copy a device view (typically an output returned with
    /// `return_on_device`) to a host tensor.
    pub fn fetch(&self, view: &DeviceView) -> Result<Tensor, RunnerError> {
        let state = self.state.as_ref().ok_or_else(|| not_active("fetch"))?;
        let mut bytes = vec![0u8; view.nbytes()];
        if !bytes.is_empty() {
            state
                .device
                .memcpy_dtoh_async(&mut bytes, view.ptr, state.stream.handle()?)?;
        }
        state.stream.synchronize()?;
        Tensor::from_bytes(&view.shape, view.dtype, &bytes)
    }

    /// Release everything acquired by [`Runner::activate`]: captured graph,
    /// buffers, stream, then the context and engine if owned.
    ///
    /// Every resource is attempted even if an earlier one fails, and the
    /// runner is inactive afterwards regardless. Failures are returned
    /// together as [`RunnerError::Release`].
    pub fn deactivate(&mut self) -> Result<(), RunnerError> {
        let state = self.state.take().ok_or_else(|| not_active("deactivate"))?;
        let ActiveState {
            engine,
            context,
            device: _,
            mut stream,
            mut bindings,
            mut graphs,
            host_outputs,
        } = state;

        let mut errors = Vec::new();
        if let Err(e) = graphs.release() {
            errors.push(format!("captured graph: {}", e));
        }
        errors.extend(bindings.release());
        drop(host_outputs);
        if let Err(e) = stream.free() {
            errors.push(format!("stream: {}", e));
        }

        match context {
            Held::Owned(ctx) => match Arc::try_unwrap(ctx) {
                Ok(ctx) => {
                    debug!("Releasing execution context");
                    drop(ctx);
                }
                Err(_) => errors.push("execution context is still referenced".to_string()),
            },
            Held::Borrowed(_) => debug!("Detaching caller-owned execution context"),
        }
        match engine {
            Held::Owned(engine) => {
                debug!("Releasing engine");
                drop(engine);
            }
            Held::Borrowed(_) => debug!("Detaching caller-owned engine"),
        }

        for e in &errors {
            warn!(runner = self.name, error = %e, "Failed to release runner resource");
        }
        info!(runner = self.name, "Runner deactivated");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Release(errors))
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(e) = self.deactivate() {
                warn!(runner = self.name, error = %e, "Failed to deactivate runner on drop");
            }
        }
    }
}

/// A [`Runner`] with graph capture enabled by default.
pub struct CudaGraphRunner {
    runner: Runner,
}

impl CudaGraphRunner {
    fn wrap(mut runner: Runner) -> Self {
        runner.name = CUDA_GRAPH_RUNNER_NAME;
        runner.config.use_cuda_graphs = true;
        Self { runner }
    }

    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::wrap(Runner::new(engine))
    }

    pub fn from_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Engine>, RunnerError> + Send + 'static,
    {
        Self::wrap(Runner::from_loader(loader))
    }

    pub fn from_context(context: Arc<Mutex<ExecutionContext>>) -> Self {
        Self::wrap(Runner::from_context(context))
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.runner.config = config;
        self
    }

    pub fn with_output_metadata(mut self, metadata: TensorMetadata) -> Self {
        self.runner.output_metadata = Some(metadata);
        self
    }
}

impl std::ops::Deref for CudaGraphRunner {
    type Target = Runner;

    fn deref(&self) -> &Runner {
        &self.runner
    }
}

impl std::ops::DerefMut for CudaGraphRunner {
    fn deref_mut(&mut self) -> &mut Runner {
        &mut self.runner
    }
}

/// The runner contract consumed by profiling and comparison tooling.
pub trait InferenceRunner {
    fn name(&self) -> &str;

    fn is_active(&self) -> bool;

    fn stats(&self) -> RunnerStats;

    fn activate(&mut self) -> Result<(), RunnerError>;

    fn set_profile(&mut self, index: usize) -> Result<(), RunnerError>;

    fn infer(
        &mut self,
        inputs: &HashMap<String, TensorView>,
        return_on_device: bool,
    ) -> Result<HashMap<String, TensorView>, RunnerError>;

    fn deactivate(&mut self) -> Result<(), RunnerError>;

    fn input_metadata(&self) -> Result<TensorMetadata, RunnerError>;
}

impl InferenceRunner for Runner {
    fn name(&self) -> &str {
        Runner::name(self)
    }

    fn is_active(&self) -> bool {
        Runner::is_active(self)
    }

    fn stats(&self) -> RunnerStats {
        Runner::stats(self)
    }

    fn activate(&mut self) -> Result<(), RunnerError> {
        Runner::activate(self)
    }

    fn set_profile(&mut self, index: usize) -> Result<(), RunnerError> {
        Runner::set_profile(self, index)
    }

    fn infer(
        &mut self,
        inputs: &HashMap<String, TensorView>,
        return_on_device: bool,
    ) -> Result<HashMap<String, TensorView>, RunnerError> {
        Runner::infer(self, inputs, return_on_device)
    }

    fn deactivate(&mut self) -> Result<(), RunnerError> {
        Runner::deactivate(self)
    }

    fn input_metadata(&self) -> Result<TensorMetadata, RunnerError> {
        Runner::input_metadata(self)
    }
}

impl InferenceRunner for CudaGraphRunner {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn is_active(&self) -> bool {
        self.runner.is_active()
    }

    fn stats(&self) -> RunnerStats {
        self.runner.stats()
    }

    fn activate(&mut self) -> Result<(), RunnerError> {
        self.runner.activate()
    }

    fn set_profile(&mut self, index: usize) -> Result<(), RunnerError> {
        self.runner.set_profile(index)
    }

    fn infer(
        &mut self,
        inputs: &HashMap<String, TensorView>,
        return_on_device: bool,
    ) -> Result<HashMap<String, TensorView>, RunnerError> {
        self.runner.infer(inputs, return_on_device)
    }

    fn deactivate(&mut self) -> Result<(), RunnerError> {
        self.runner.deactivate()
    }

    fn input_metadata(&self) -> Result<TensorMetadata, RunnerError> {
        self.runner.input_metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;
    use crate::engine::host::{HostEngine, Profile};
    use crate::tensor::DataType;

    fn device() -> Arc<HostDevice> {
        Arc::new(HostDevice::new())
    }

    /// `y = 2 * x`, `x: [-1, 3]`, batch 1..=8 in profile 0 and 9..=16 in
    /// profile 1.
    fn doubling_engine(device: Arc<HostDevice>, api: BindingApi) -> HostEngine {
        HostEngine::builder(device)
            .input("x", vec![-1, 3], DataType::F32)
            .output("y", vec![-1, 3], DataType::F32)
            .profile(Profile::new().bound("x", &[1, 3], &[8, 3]))
            .profile(Profile::new().bound("x", &[9, 3], &[16, 3]))
            .api(api)
            .kernel(|inputs| {
                let x = &inputs[0];
                let data = x.as_f32().iter().map(|v| v * 2.0).collect();
                Ok(vec![Tensor::new(x.shape().to_vec(), data)])
            })
            .build()
    }

    fn batch(n: usize) -> Tensor {
        Tensor::new(vec![n, 3], (0..n * 3).map(|v| v as f32).collect())
    }

    fn feeds(x: impl Into<TensorView>) -> HashMap<String, TensorView> {
        HashMap::from([("x".to_string(), x.into())])
    }

    fn host<'a>(outputs: &'a HashMap<String, TensorView>, name: &str) -> &'a Tensor {
        outputs[name].as_host().unwrap()
    }

    fn doubled(n: usize) -> Vec<f32> {
        (0..n * 3).map(|v| v as f32 * 2.0).collect()
    }

    #[test]
    fn test_infer_requires_active_runner() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        let err = runner.infer(&feeds(batch(2)), false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidState(_)));
        assert!(matches!(runner.input_metadata(), Err(RunnerError::InvalidState(_))));
        assert!(matches!(runner.set_profile(0), Err(RunnerError::InvalidState(_))));
        assert!(matches!(runner.deactivate(), Err(RunnerError::InvalidState(_))));

        runner.activate().unwrap();
        runner.infer(&feeds(batch(2)), false).unwrap();
        runner.deactivate().unwrap();

        let err = runner.infer(&feeds(batch(2)), false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidState(_)));
    }

    #[test]
    fn test_activate_twice() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        assert!(matches!(runner.activate(), Err(RunnerError::InvalidState(_))));
        assert!(runner.is_active());
    }

    #[test]
    fn test_named_infer() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let out = runner.infer(&feeds(batch(2)), false).unwrap();
        let y = host(&out, "y");
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.as_f32(), doubled(2).as_slice());
        assert_eq!(runner.stats().inferences, 1);
    }

    #[test]
    fn test_legacy_infer() {
        let engine = doubling_engine(device(), BindingApi::Legacy);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        for n in [3, 1, 8] {
            let out = runner.infer(&feeds(batch(n)), false).unwrap();
            assert_eq!(host(&out, "y").as_f32(), doubled(n).as_slice());
        }
    }

    #[test]
    fn test_legacy_infer_in_second_profile() {
        let engine = doubling_engine(device(), BindingApi::Legacy);
        let config = RunnerConfig {
            optimization_profile: Some(1),
            use_cuda_graphs: false,
        };
        let mut runner = Runner::new(Arc::new(engine)).with_config(config);
        runner.activate().unwrap();
        let out = runner.infer(&feeds(batch(10)), false).unwrap();
        let y = host(&out, "y");
        assert_eq!(y.shape(), &[10, 3]);
        assert_eq!(y.as_f32(), doubled(10).as_slice());

        // Batch 2 is outside profile 1.
        let err = runner.infer(&feeds(batch(2)), false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidShape { ref name, .. } if name == "x"));
    }

    #[test]
    fn test_capture_replay_and_recapture_on_shape_change() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Named);
        let mut runner = CudaGraphRunner::new(Arc::new(engine.clone()));
        runner.activate().unwrap();

        // Call 1: first call captures.
        let first = runner.infer(&feeds(batch(2)), false).unwrap();
        assert_eq!(host(&first, "y").as_f32(), doubled(2).as_slice());
        let stats = runner.stats();
        assert_eq!(stats.graph_captures, 1);
        assert_eq!(stats.graph_replays, 0);
        let after_first = engine.stats();
        assert_eq!(after_first.shape_updates, 1);
        assert_eq!(after_first.executions, 2, "priming run plus captured run");
        assert_eq!(device.stats().captures, 1);

        // Call 2: same shape replays without touching the context.
        let second = runner.infer(&feeds(batch(2)), false).unwrap();
        assert_eq!(host(&second, "y"), host(&first, "y"));
        let stats = runner.stats();
        assert_eq!(stats.graph_captures, 1);
        assert_eq!(stats.graph_replays, 1);
        let after_second = engine.stats();
        assert_eq!(after_second.shape_updates, after_first.shape_updates);
        assert_eq!(after_second.executions, after_first.executions);
        assert_eq!(after_second.kernel_runs, after_first.kernel_runs + 1);

        // Call 3: new batch size invalidates and recaptures.
        let third = runner.infer(&feeds(batch(5)), false).unwrap();
        let y = host(&third, "y");
        assert_eq!(y.shape(), &[5, 3]);
        assert_eq!(y.as_f32(), doubled(5).as_slice());
        let stats = runner.stats();
        assert_eq!(stats.graph_invalidations, 1);
        assert_eq!(stats.graph_captures, 2);
        assert_eq!(engine.stats().shape_updates, 2);
        assert_eq!(device.stats().captures, 2);
    }

    #[test]
    fn test_captured_results_match_direct_execution() {
        let device = device();
        let mut direct = Runner::new(Arc::new(doubling_engine(device.clone(), BindingApi::Named)));
        let mut graphed =
            CudaGraphRunner::new(Arc::new(doubling_engine(device, BindingApi::Named)));
        direct.activate().unwrap();
        graphed.activate().unwrap();
        for n in [4, 4, 4, 1, 1] {
            let a = direct.infer(&feeds(batch(n)), false).unwrap();
            let b = graphed.infer(&feeds(batch(n)), false).unwrap();
            assert_eq!(host(&a, "y"), host(&b, "y"));
        }
        assert_eq!(direct.stats().graph_captures, 0);
        assert_eq!(graphed.stats().graph_captures, 2);
        assert_eq!(graphed.stats().graph_replays, 3);
    }

    #[test]
    fn test_new_input_values_replay_same_graph() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = CudaGraphRunner::new(Arc::new(engine));
        runner.activate().unwrap();
        runner.infer(&feeds(batch(2)), false).unwrap();
        let x = Tensor::new(vec![2, 3], vec![1.0; 6]);
        let out = runner.infer(&feeds(x), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), &[2.0; 6]);
        assert_eq!(runner.stats().graph_replays, 1);
    }

    #[test]
    fn test_legacy_capture_is_noop() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Legacy);
        let mut runner = CudaGraphRunner::new(Arc::new(engine));
        runner.activate().unwrap();
        for _ in 0..2 {
            let out = runner.infer(&feeds(batch(2)), false).unwrap();
            assert_eq!(host(&out, "y").as_f32(), doubled(2).as_slice());
        }
        assert_eq!(runner.stats().graph_captures, 0);
        assert_eq!(runner.stats().graph_replays, 0);
        assert_eq!(device.stats().captures, 0);
    }

    #[test]
    fn test_outputs_restricted_to_output_metadata() {
        let engine = HostEngine::builder(device())
            .input("x", vec![-1], DataType::F32)
            .output("y", vec![-1], DataType::F32)
            .output("z", vec![-1], DataType::F32)
            .build();
        let meta = TensorMetadata::new()
            .add("y", vec![-1], DataType::F32)
            .add("w", vec![-1], DataType::F32);
        let mut runner = Runner::new(Arc::new(engine)).with_output_metadata(meta);
        runner.activate().unwrap();
        let out = runner
            .infer(&feeds(Tensor::new(vec![2], vec![1.0, 2.0])), false)
            .unwrap();
        let mut names: Vec<&String> = out.keys().collect();
        names.sort();
        assert_eq!(names, vec!["y"]);
    }

    #[test]
    fn test_all_outputs_without_metadata() {
        let engine = HostEngine::builder(device())
            .input("x", vec![-1], DataType::F32)
            .output("y", vec![-1], DataType::F32)
            .output("z", vec![-1], DataType::F32)
            .build();
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let out = runner
            .infer(&feeds(Tensor::new(vec![1], vec![3.0])), false)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(host(&out, "z").as_f32(), &[3.0]);
    }

    #[test]
    fn test_unknown_inputs_ignored() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let mut inputs = feeds(batch(1));
        inputs.insert("bogus".to_string(), Tensor::zeros(&[7], DataType::I8).into());
        let out = runner.infer(&inputs, false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(1).as_slice());
        assert!(!runner.input_metadata().unwrap().contains("bogus"));
    }

    #[test]
    fn test_missing_dynamic_input_is_incomplete() {
        for api in [BindingApi::Named, BindingApi::Legacy] {
            let engine = doubling_engine(device(), api);
            let mut runner = Runner::new(Arc::new(engine));
            runner.activate().unwrap();
            runner.infer(&feeds(batch(2)), false).unwrap();

            // The context still holds batch 2 from the previous call.
            let err = runner.infer(&HashMap::new(), false).unwrap_err();
            match err {
                RunnerError::IncompleteShapeSpecification(msg) => assert!(msg.contains("'x'")),
                other => panic!("expected IncompleteShapeSpecification, got {:?}", other),
            }
            assert!(runner.is_active());
            let out = runner.infer(&feeds(batch(3)), false).unwrap();
            assert_eq!(host(&out, "y").as_f32(), doubled(3).as_slice());
        }
    }

    #[test]
    fn test_missing_static_input() {
        let engine = HostEngine::builder(device())
            .input("x", vec![-1, 3], DataType::F32)
            .input("bias", vec![3], DataType::F32)
            .output("y", vec![-1, 3], DataType::F32)
            .build();
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let err = runner.infer(&feeds(batch(2)), false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput { ref name, .. } if name == "bias"));
    }

    #[test]
    fn test_inputs_cast_to_declared_dtype() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let x = Tensor::from_i32(vec![1, 3], vec![1, -2, 3]);
        let out = runner.infer(&feeds(x), false).unwrap();
        let y = host(&out, "y");
        assert_eq!(y.dtype(), DataType::F32);
        assert_eq!(y.as_f32(), &[2.0, -4.0, 6.0]);
    }

    #[test]
    fn test_invalid_shape_is_recoverable() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();

        let err = runner.infer(&feeds(batch(9)), false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidShape { ref shape, .. } if shape == &[9, 3]));

        let err = runner
            .infer(&feeds(Tensor::zeros(&[2, 4], DataType::F32)), false)
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidShape { .. }));

        assert!(runner.is_active());
        let out = runner.infer(&feeds(batch(2)), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(2).as_slice());
    }

    #[test]
    fn test_input_metadata() {
        let engine = HostEngine::builder(device())
            .input("tokens", vec![-1, 16], DataType::I32)
            .input("mask", vec![-1, 16], DataType::Bool)
            .output("logits", vec![-1, 4], DataType::F16)
            .build();
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let meta = runner.input_metadata().unwrap();
        let names: Vec<&str> = meta.names().collect();
        assert_eq!(names, vec!["tokens", "mask"]);
        let tokens = meta.get("tokens").unwrap();
        assert_eq!(tokens.shape.dims(), &[-1, 16]);
        assert_eq!(tokens.dtype, DataType::I32);
    }

    #[test]
    fn test_profile_switch_invalidates_graph() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = CudaGraphRunner::new(Arc::new(engine.clone()));
        runner.activate().unwrap();
        runner.infer(&feeds(batch(2)), false).unwrap();
        assert_eq!(runner.stats().graph_captures, 1);

        runner.set_profile(1).unwrap();
        assert_eq!(runner.stats().graph_invalidations, 1);

        let out = runner.infer(&feeds(batch(12)), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(12).as_slice());
        assert_eq!(runner.stats().graph_captures, 2);

        let err = runner.set_profile(5).unwrap_err();
        assert!(matches!(err, RunnerError::ProfileSet { index: 5, .. }));
        // Profile 1 is still active.
        runner.infer(&feeds(batch(12)), false).unwrap();
        assert_eq!(runner.stats().graph_replays, 1);
    }

    #[test]
    fn test_sync_profile_switch_fallback() {
        let engine = HostEngine::builder(device())
            .input("x", vec![-1], DataType::F32)
            .output("y", vec![-1], DataType::F32)
            .profile(Profile::new())
            .profile(Profile::new())
            .sync_profile_switch_only()
            .build();
        let mut runner = Runner::new(Arc::new(engine.clone()));
        runner.activate().unwrap();
        runner.set_profile(1).unwrap();
        assert_eq!(engine.stats().profile_switches, 1);
    }

    #[test]
    fn test_initial_profile_rejected() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let config = RunnerConfig {
            optimization_profile: Some(3),
            use_cuda_graphs: false,
        };
        let mut runner = Runner::new(Arc::new(engine.clone())).with_config(config);
        assert!(matches!(runner.activate(), Err(RunnerError::ProfileSet { index: 3, .. })));
        assert!(!runner.is_active());
        assert_eq!(engine.stats().live_contexts, 0);
    }

    #[test]
    fn test_owned_context_released() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Named);
        let mut runner = CudaGraphRunner::new(Arc::new(engine.clone()));
        runner.activate().unwrap();
        assert_eq!(runner.ownership(), Some((Ownership::Borrowed, Ownership::Owned)));
        runner.infer(&feeds(batch(3)), false).unwrap();
        assert_eq!(engine.stats().live_contexts, 1);

        runner.deactivate().unwrap();
        assert_eq!(engine.stats().live_contexts, 0);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.live_streams(), 0);
        assert_eq!(device.live_graphs(), 0);
        assert_eq!(runner.ownership(), None);
    }

    #[test]
    fn test_borrowed_context_survives_deactivate() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Legacy);
        let ctx = Arc::new(Mutex::new(engine.create_execution_context().unwrap()));
        let mut runner = Runner::from_context(ctx.clone());
        runner.activate().unwrap();
        assert_eq!(runner.ownership(), Some((Ownership::Borrowed, Ownership::Borrowed)));
        runner.infer(&feeds(batch(2)), false).unwrap();
        runner.deactivate().unwrap();

        assert_eq!(engine.stats().live_contexts, 1);
        assert_eq!(device.live_allocations(), 0);

        // The same context can be bound again.
        runner.activate().unwrap();
        let out = runner.infer(&feeds(batch(4)), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(4).as_slice());
    }

    #[test]
    fn test_loader_owns_engine() {
        let device = device();
        let engine = doubling_engine(device, BindingApi::Named);
        let loaded = engine.clone();
        let mut runner =
            Runner::from_loader(move || Ok(Arc::new(loaded.clone()) as Arc<dyn Engine>));
        runner.activate().unwrap();
        assert_eq!(runner.ownership(), Some((Ownership::Owned, Ownership::Owned)));
        runner.deactivate().unwrap();
        assert_eq!(engine.stats().live_contexts, 0);
    }

    #[test]
    fn test_loader_failure_is_activation_error() {
        let mut runner = Runner::from_loader(|| {
            Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "model.engine",
            )))
        });
        let err = runner.activate().unwrap_err();
        assert!(matches!(err, RunnerError::Activation(ref m) if m.contains("model.engine")));
        assert!(!runner.is_active());
    }

    #[test]
    fn test_context_creation_failure() {
        let device = device();
        let engine = HostEngine::builder(device.clone())
            .input("x", vec![1], DataType::F32)
            .output("y", vec![1], DataType::F32)
            .fail_context_creation()
            .build();
        let mut runner = Runner::new(Arc::new(engine));
        let err = runner.activate().unwrap_err();
        assert!(matches!(err, RunnerError::Activation(_)));
        assert!(!runner.is_active());
        assert_eq!(device.live_streams(), 0);
    }

    #[test]
    fn test_partial_release_failure_reported() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine.clone()));
        runner.activate().unwrap();
        let out = runner.infer(&feeds(batch(2)), true).unwrap();
        let y = out["y"].as_device().unwrap().clone();

        // Free the output buffer behind the runner's back.
        device.mem_free(y.ptr).unwrap();

        let err = runner.deactivate().unwrap_err();
        match err {
            RunnerError::Release(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("'y'"));
            }
            other => panic!("expected Release, got {:?}", other),
        }
        assert!(!runner.is_active());
        // The remaining resources were still released.
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.live_streams(), 0);
        assert_eq!(engine.stats().live_contexts, 0);
    }

    #[test]
    fn test_resource_exhausted_leaves_runner_active() {
        // Room for batch 2 (24 B in, 24 B out) but not batch 5.
        let device = Arc::new(HostDevice::with_memory_limit(64));
        let engine = doubling_engine(device.clone(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        runner.infer(&feeds(batch(2)), false).unwrap();

        let err = runner.infer(&feeds(batch(5)), false).unwrap_err();
        assert!(matches!(err, RunnerError::ResourceExhausted { .. }));
        assert!(runner.is_active());

        let out = runner.infer(&feeds(batch(2)), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(2).as_slice());
    }

    #[test]
    fn test_output_allocation_failure() {
        // Input fits, output does not.
        let device = Arc::new(HostDevice::with_memory_limit(40));
        let engine = doubling_engine(device, BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let err = runner.infer(&feeds(batch(2)), false).unwrap_err();
        assert!(matches!(err, RunnerError::ResourceExhausted { requested: 24, .. }));
    }

    #[test]
    fn test_execution_failure_leaves_runner_active() {
        let engine = doubling_engine(device(), BindingApi::Legacy);
        let mut runner = Runner::new(Arc::new(engine.clone()));
        runner.activate().unwrap();
        engine.set_fail_execution(true);
        let err = runner.infer(&feeds(batch(2)), false).unwrap_err();
        assert!(matches!(err, RunnerError::ExecutionFailed(_)));
        assert!(runner.is_active());
        assert_eq!(runner.stats().inferences, 0);

        engine.set_fail_execution(false);
        let out = runner.infer(&feeds(batch(2)), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(2).as_slice());
    }

    #[test]
    fn test_kernel_failure_surfaces_as_execution_failed() {
        let engine = HostEngine::builder(device())
            .input("x", vec![-1], DataType::F32)
            .output("y", vec![-1], DataType::F32)
            .kernel(|_| Err("numerical blow-up".to_string()))
            .build();
        let mut runner = CudaGraphRunner::new(Arc::new(engine));
        runner.activate().unwrap();
        let err = runner
            .infer(&feeds(Tensor::new(vec![1], vec![0.0])), false)
            .unwrap_err();
        assert!(matches!(err, RunnerError::ExecutionFailed(ref m) if m.contains("blow-up")));
        assert!(runner.is_active());
    }

    #[test]
    fn test_device_view_input_is_not_copied() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();

        let x = batch(3);
        let stream = device.stream_create().unwrap();
        let ptr = device.mem_alloc(x.nbytes()).unwrap();
        device.memcpy_htod_async(ptr, x.as_bytes(), stream).unwrap();
        device.stream_synchronize(stream).unwrap();

        let copies = device.stats().htod_copies;
        let view = DeviceView::new(ptr, vec![3, 3], DataType::F32);
        let out = runner.infer(&feeds(view), false).unwrap();
        assert_eq!(host(&out, "y").as_f32(), doubled(3).as_slice());
        assert_eq!(device.stats().htod_copies, copies);
    }

    #[test]
    fn test_device_view_dtype_mismatch() {
        let engine = doubling_engine(device(), BindingApi::Named);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let view = DeviceView::new(0x1000_0000, vec![1, 3], DataType::F16);
        let err = runner.infer(&feeds(view), false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput { .. }));
    }

    #[test]
    fn test_return_on_device_and_fetch() {
        let engine = doubling_engine(device(), BindingApi::Legacy);
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let out = runner.infer(&feeds(batch(2)), true).unwrap();
        let view = out["y"].as_device().unwrap();
        assert_eq!(view.shape, vec![2, 3]);
        let y = runner.fetch(view).unwrap();
        assert_eq!(y.as_f32(), doubled(2).as_slice());
    }

    fn reshape_engine(device: Arc<HostDevice>) -> HostEngine {
        HostEngine::builder(device)
            .input("x", vec![-1], DataType::F32)
            .shape_input("shape", 2, DataType::I64)
            .output("y", vec![-1, -1], DataType::F32)
            .output_shapes(|dims| Ok(vec![dims[1].clone()]))
            .kernel(|inputs| {
                let dims: Vec<usize> = inputs[1]
                    .to_i64_vec()
                    .ok_or_else(|| "shape tensor must be integer".to_string())?
                    .iter()
                    .map(|&d| d as usize)
                    .collect();
                Ok(vec![inputs[0].reshape(&dims)])
            })
            .build()
    }

    fn reshape_feeds(shape: [i64; 2]) -> HashMap<String, TensorView> {
        HashMap::from([
            (
                "x".to_string(),
                Tensor::new(vec![6], (0..6).map(|v| v as f32).collect()).into(),
            ),
            ("shape".to_string(), Tensor::from_i64(vec![2], shape.to_vec()).into()),
        ])
    }

    #[test]
    fn test_shape_tensor_value_change_recaptures() {
        let engine = reshape_engine(device());
        let mut runner = CudaGraphRunner::new(Arc::new(engine));
        runner.activate().unwrap();

        let out = runner.infer(&reshape_feeds([2, 3]), false).unwrap();
        assert_eq!(host(&out, "y").shape(), &[2, 3]);
        runner.infer(&reshape_feeds([2, 3]), false).unwrap();
        assert_eq!(runner.stats().graph_replays, 1);

        let out = runner.infer(&reshape_feeds([3, 2]), false).unwrap();
        assert_eq!(host(&out, "y").shape(), &[3, 2]);
        assert_eq!(runner.stats().graph_invalidations, 1);
        assert_eq!(runner.stats().graph_captures, 2);
    }

    #[test]
    fn test_shape_tensor_cast_from_i32() {
        let engine = reshape_engine(device());
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let mut inputs = reshape_feeds([1, 6]);
        inputs.insert("shape".to_string(), Tensor::from_i32(vec![2], vec![6, 1]).into());
        let out = runner.infer(&inputs, false).unwrap();
        assert_eq!(host(&out, "y").shape(), &[6, 1]);
    }

    #[test]
    fn test_shape_tensor_on_device_rejected() {
        let engine = reshape_engine(device());
        let mut runner = Runner::new(Arc::new(engine));
        runner.activate().unwrap();
        let mut inputs = reshape_feeds([2, 3]);
        inputs.insert(
            "shape".to_string(),
            DeviceView::new(0x1000_0000, vec![2], DataType::I64).into(),
        );
        let err = runner.infer(&inputs, false).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput { ref name, .. } if name == "shape"));
    }

    #[test]
    fn test_runner_names() {
        let engine: Arc<dyn Engine> = Arc::new(doubling_engine(device(), BindingApi::Named));
        let runner = Runner::new(engine.clone());
        let graphed = CudaGraphRunner::new(engine);
        assert_eq!(runner.name(), "TensorRT");
        assert_eq!(graphed.name(), "TensorRTCUDAGraph");
        assert!(!runner.config().use_cuda_graphs);
        assert!(graphed.config().use_cuda_graphs);
    }

    #[test]
    fn test_drop_releases_active_runner() {
        let device = device();
        let engine = doubling_engine(device.clone(), BindingApi::Named);
        {
            let mut runner = CudaGraphRunner::new(Arc::new(engine.clone()));
            runner.activate().unwrap();
            runner.infer(&feeds(batch(2)), false).unwrap();
        }
        assert_eq!(engine.stats().live_contexts, 0);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.live_graphs(), 0);
    }

    #[test]
    fn test_trait_object_usage() {
        let engine: Arc<dyn Engine> = Arc::new(doubling_engine(device(), BindingApi::Named));
        let mut runners: Vec<Box<dyn InferenceRunner>> = vec![
            Box::new(Runner::new(engine.clone())),
            Box::new(CudaGraphRunner::new(engine)),
        ];
        for runner in runners.iter_mut() {
            runner.activate().unwrap();
            let out = runner.infer(&feeds(batch(1)), false).unwrap();
            assert_eq!(host(&out, "y").as_f32(), doubled(1).as_slice());
            runner.deactivate().unwrap();
        }
    }

    #[test]
    fn test_runner_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Runner>();
        assert_send::<CudaGraphRunner>();
    }
}
