use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine environment error: {0}")]
    Environment(String),

    #[error("failed to load model from {path}: {message}")]
    LoadModel { path: PathBuf, message: String },

    #[error("failed to allocate {tensor} tensor: {message}")]
    Allocation {
        tensor: &'static str,
        message: String,
    },

    #[error("inference run failed: {0}")]
    Run(String),

    #[error("engine produced {actual} output values, expected {expected}")]
    OutputSize { expected: usize, actual: usize },

    #[error("failed to release engine resources: {0}")]
    Release(String),
}

/// A loaded model that can be run synchronously.
///
/// `input` always has the session's flat input size and `output` the class
/// count; the engine writes its result into `output` in place.
pub trait InferenceEngine: Send + 'static {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError>;

    /// Release the engine's session handle. Called at most once.
    fn release(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}
