pub mod error;
pub mod tensor;
pub mod backend;
pub mod buffer;
pub mod stream;
pub mod engine;
pub mod runner;
pub mod config;
pub mod profile;
pub mod cli;

pub use error::RunnerError;
pub use buffer::{DeviceBuffer, DeviceView, TensorView};
pub use config::RunnerConfig;
pub use engine::{Engine, ExecutionContext, TensorMetadata};
pub use runner::{CudaGraphRunner, InferenceRunner, Runner, RunnerStats};
pub use backend::select_device;
