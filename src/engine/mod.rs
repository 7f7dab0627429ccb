//! Compiled-engine abstraction consumed by the runner.
//!
//! An [`Engine`] is an immutable, shareable description of a compiled
//! program: its I/O tensors, its optimization profiles and which binding API
//! its execution contexts speak. An [`ExecutionContext`] is the stateful,
//! per-stream object holding the current shape assignment and tensor
//! addresses. Two context flavours exist because the underlying APIs differ
//! structurally:
//!
//! - [`LegacyContext`]: bindings addressed by integer index, offset by
//!   `profile * bindings_per_profile`, executed with a flat address array.
//! - [`NamedContext`]: tensors addressed by name, with output memory
//!   requested from an [`OutputAllocator`] during execution.

pub mod host;

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Device, DevicePtr, StreamHandle};
use crate::error::RunnerError;
use crate::tensor::DataType;

/// Direction of an engine tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorIoMode {
    Input,
    Output,
}

/// A declared tensor shape in which `-1` marks a dynamic dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeTemplate(pub Vec<i64>);

impl ShapeTemplate {
    pub fn new(dims: Vec<i64>) -> Self {
        Self(dims)
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.0.iter().any(|&d| d < 0)
    }

    /// The concrete shape, or `None` if any dimension is dynamic.
    pub fn to_concrete(&self) -> Option<Vec<usize>> {
        self.0
            .iter()
            .map(|&d| usize::try_from(d).ok())
            .collect()
    }

    /// Whether `shape` has the same rank and agrees on every static dimension.
    pub fn accepts(&self, shape: &[usize]) -> bool {
        self.0.len() == shape.len()
            && self
                .0
                .iter()
                .zip(shape)
                .all(|(&t, &s)| t < 0 || t as usize == s)
    }
}

impl From<Vec<i64>> for ShapeTemplate {
    fn from(dims: Vec<i64>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for ShapeTemplate {
    fn from(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| d as i64).collect())
    }
}

impl fmt::Display for ShapeTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Declaration of one engine I/O tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub name: String,
    pub mode: TensorIoMode,
    pub shape: ShapeTemplate,
    pub dtype: DataType,
    /// Shape tensors carry integer values that determine other tensors'
    /// shapes. Their data must be host-resident.
    pub is_shape_tensor: bool,
}

impl TensorDesc {
    pub fn is_input(&self) -> bool {
        self.mode == TensorIoMode::Input
    }
}

/// Declared shape template and dtype of one named tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: ShapeTemplate,
    pub dtype: DataType,
}

/// Ordered mapping of tensor name to [`TensorSpec`].
///
/// Serializes as a JSON list of `{name, shape, dtype}` objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorMetadata {
    tensors: Vec<TensorSpec>,
}

impl TensorMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append (or replace) a tensor, keeping first-insertion order.
    pub fn add(mut self, name: &str, shape: impl Into<ShapeTemplate>, dtype: DataType) -> Self {
        self.insert(name, shape.into(), dtype);
        self
    }

    pub fn insert(&mut self, name: &str, shape: ShapeTemplate, dtype: DataType) {
        let spec = TensorSpec {
            name: name.to_string(),
            shape,
            dtype,
        };
        match self.tensors.iter_mut().find(|t| t.name == name) {
            Some(existing) => *existing = spec,
            None => self.tensors.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TensorSpec> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorSpec> {
        self.tensors.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Which binding API an engine's contexts implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingApi {
    Legacy,
    Named,
}

/// A compiled program. Immutable and safe to share across runners.
pub trait Engine: Send + Sync {
    /// I/O tensors in binding order, using profile-0 names.
    fn io_tensors(&self) -> &[TensorDesc];

    fn num_profiles(&self) -> usize;

    /// Capability query deciding the runner's binding strategy.
    fn binding_api(&self) -> BindingApi;

    /// Device the engine executes on.
    fn device(&self) -> Arc<dyn Device>;

    /// Create a new execution context, or `None` if the engine cannot.
    fn create_execution_context(&self) -> Option<ExecutionContext>;

    /// Number of bindings belonging to one optimization profile.
    fn bindings_per_profile(&self) -> usize {
        self.io_tensors().len()
    }

    fn tensor(&self, name: &str) -> Option<&TensorDesc> {
        self.io_tensors().iter().find(|t| t.name == name)
    }
}

/// Callback object the engine uses to obtain output memory during execution.
///
/// Both methods are invoked synchronously from within
/// [`NamedContext::enqueue_v3`], once per output per execution.
pub trait OutputAllocator: Send {
    /// Return the address of at least `size` bytes for `name`, or `None` if
    /// the memory cannot be provided.
    fn reallocate_output(&mut self, name: &str, size: usize, alignment: usize)
        -> Option<DevicePtr>;

    /// Record the final shape of output `name`.
    fn notify_shape(&mut self, name: &str, shape: &[usize]);
}

pub type SharedOutputAllocator = Arc<Mutex<dyn OutputAllocator>>;

/// Profile control shared by both context flavours.
pub trait ContextProfiles {
    fn engine(&self) -> Arc<dyn Engine>;

    fn active_profile(&self) -> usize;

    /// Whether [`ContextProfiles::set_optimization_profile_async`] exists.
    fn supports_async_profile_switch(&self) -> bool;

    fn set_optimization_profile_async(&mut self, index: usize, stream: StreamHandle) -> bool;

    /// Synchronous profile switch. May block until the device is idle.
    fn set_optimization_profile(&mut self, index: usize) -> bool;
}

/// Index-based execution context.
///
/// Binding indices are global: binding `i` of profile `p` is
/// `p * bindings_per_profile + i`.
pub trait LegacyContext: ContextProfiles + Send {
    /// Current shape of a binding. Dynamic dimensions not yet set read `-1`.
    fn binding_shape(&self, binding: usize) -> Vec<i64>;

    fn set_binding_shape(&mut self, binding: usize, shape: &[usize]) -> bool;

    /// Current values of a shape-tensor input, if set.
    fn shape_input(&self, binding: usize) -> Option<Vec<i64>>;

    fn set_shape_input(&mut self, binding: usize, values: &[i64]) -> bool;

    fn all_binding_shapes_specified(&self) -> bool;

    fn all_shape_inputs_specified(&self) -> bool;

    /// Enqueue execution. `bindings` holds one address per global binding up
    /// to the end of the active profile; shape-tensor slots may be null.
    fn execute_async_v2(&mut self, bindings: &[DevicePtr], stream: StreamHandle) -> bool;
}

/// Name-based execution context.
pub trait NamedContext: ContextProfiles + Send {
    /// Current shape of a tensor. Outputs report `-1` for dimensions that
    /// depend on inputs not yet set.
    fn tensor_shape(&self, name: &str) -> Option<Vec<i64>>;

    fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> bool;

    fn shape_input_values(&self, name: &str) -> Option<Vec<i64>>;

    fn set_shape_input(&mut self, name: &str, values: &[i64]) -> bool;

    fn tensor_address(&self, name: &str) -> Option<DevicePtr>;

    fn set_tensor_address(&mut self, name: &str, ptr: DevicePtr) -> bool;

    fn set_output_allocator(&mut self, name: &str, allocator: SharedOutputAllocator) -> bool;

    fn all_input_shapes_specified(&self) -> bool;

    /// Enqueue execution, requesting output memory from the registered
    /// allocators.
    fn enqueue_v3(&mut self, stream: StreamHandle) -> bool;
}

fn switch_profile<C>(ctx: &mut C, index: usize, stream: StreamHandle) -> bool
where
    C: ContextProfiles + ?Sized,
{
    if ctx.supports_async_profile_switch() {
        ctx.set_optimization_profile_async(index, stream)
    } else {
        debug!(index, "Async profile switch unavailable, switching synchronously");
        ctx.set_optimization_profile(index)
    }
}

/// An engine-derived execution context of either binding flavour.
pub enum ExecutionContext {
    Legacy(Box<dyn LegacyContext>),
    Named(Box<dyn NamedContext>),
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (api, profile) = match self {
            ExecutionContext::Legacy(c) => ("legacy", c.active_profile()),
            ExecutionContext::Named(c) => ("named", c.active_profile()),
        };
        f.debug_struct("ExecutionContext")
            .field("api", &api)
            .field("active_profile", &profile)
            .finish()
    }
}

impl ExecutionContext {
    pub fn api(&self) -> BindingApi {
        match self {
            ExecutionContext::Legacy(_) => BindingApi::Legacy,
            ExecutionContext::Named(_) => BindingApi::Named,
        }
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        match self {
            ExecutionContext::Legacy(c) => c.engine(),
            ExecutionContext::Named(c) => c.engine(),
        }
    }

    pub fn active_profile(&self) -> usize {
        match self {
            ExecutionContext::Legacy(c) => c.active_profile(),
            ExecutionContext::Named(c) => c.active_profile(),
        }
    }

    /// Switch optimization profile, asynchronously on `stream` when the
    /// context supports it and synchronously otherwise. On failure the
    /// previous profile stays active.
    pub fn set_profile(&mut self, index: usize, stream: StreamHandle) -> Result<(), RunnerError> {
        let num_profiles = self.engine().num_profiles();
        if index >= num_profiles {
            return Err(RunnerError::ProfileSet {
                index,
                reason: format!("engine has {} profile(s)", num_profiles),
            });
        }
        let ok = match self {
            ExecutionContext::Legacy(c) => switch_profile(c.as_mut(), index, stream),
            ExecutionContext::Named(c) => switch_profile(c.as_mut(), index, stream),
        };
        if !ok {
            return Err(RunnerError::ProfileSet {
                index,
                reason: "rejected by execution context".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_template() {
        let t = ShapeTemplate::new(vec![-1, 3]);
        assert!(t.is_dynamic());
        assert_eq!(t.rank(), 2);
        assert!(t.accepts(&[7, 3]));
        assert!(!t.accepts(&[7, 4]));
        assert!(!t.accepts(&[3]));
        assert_eq!(t.to_concrete(), None);
        assert_eq!(t.to_string(), "[-1, 3]");

        let s = ShapeTemplate::from(&[2usize, 3][..]);
        assert!(!s.is_dynamic());
        assert_eq!(s.to_concrete(), Some(vec![2, 3]));
    }

    #[test]
    fn test_scalar_template() {
        let t = ShapeTemplate::new(vec![]);
        assert!(!t.is_dynamic());
        assert!(t.accepts(&[]));
        assert_eq!(t.to_concrete(), Some(vec![]));
        assert_eq!(t.to_string(), "[]");
    }

    #[test]
    fn test_metadata_order_and_replace() {
        let meta = TensorMetadata::new()
            .add("b", vec![-1, 3], DataType::F32)
            .add("a", vec![1], DataType::I32)
            .add("b", vec![2, 3], DataType::F16);
        let names: Vec<&str> = meta.names().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(meta.get("b").map(|t| t.dtype), Some(DataType::F16));
        assert!(meta.contains("a"));
        assert!(!meta.contains("c"));
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn test_metadata_json() {
        let json = r#"[
            {"name": "x", "shape": [-1, 3], "dtype": "f32"},
            {"name": "n", "shape": [1], "dtype": "i64"}
        ]"#;
        let meta: TensorMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get("x").map(|t| t.shape.clone()), Some(ShapeTemplate::new(vec![-1, 3])));
        let back = serde_json::to_value(&meta).unwrap();
        let expected: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(back, expected);
    }
}
