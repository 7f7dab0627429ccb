use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Invalid runner state: {0}")]
    InvalidState(String),

    #[error("Invalid shape {shape:?} for '{name}': {reason}")]
    InvalidShape {
        name: String,
        shape: Vec<i64>,
        reason: String,
    },

    #[error("Incomplete shape specification: {0}")]
    IncompleteShapeSpecification(String),

    #[error("Invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("Resource exhausted: failed to allocate {requested} bytes ({reason})")]
    ResourceExhausted { requested: usize, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Failed to set optimization profile {index}: {reason}")]
    ProfileSet { index: usize, reason: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Failed to release {} resource(s): {}", .0.len(), .0.join("; "))]
    Release(Vec<String>),

    #[error("Config error: {0}")]
    Config(String),
}
