//! ONNX Runtime engine.
//!
//! The runtime library is loaded dynamically (`ORT_DYLIB_PATH`), so a missing
//! library surfaces as a startup error from [`ModelSession::open`] rather than
//! at link time.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::{EngineError, InferenceEngine, ModelSession, ModelShape, SessionError};
use crate::environment::{Environment, EnvironmentBackend};

static ENVIRONMENT: OnceLock<Arc<Environment>> = OnceLock::new();

/// The process-wide ONNX Runtime environment.
pub fn environment() -> Arc<Environment> {
    Arc::clone(ENVIRONMENT.get_or_init(|| Environment::new("onnxruntime", OrtBackend)))
}

struct OrtBackend;

impl EnvironmentBackend for OrtBackend {
    fn init(&self) -> Result<(), EngineError> {
        // Dylib resolution failures panic inside ort; report them as errors.
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = ort::init().with_name("skinlens").commit();
        }))
        .map_err(|panic| {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_owned()))
                .unwrap_or_else(|| "onnxruntime initialisation panicked".to_owned());
            EngineError::Environment(message)
        })
    }

    fn teardown(&self) -> Result<(), EngineError> {
        // ort keeps its environment until process exit; nothing to free here.
        debug!("onnxruntime environment released");
        Ok(())
    }
}

/// Where to find the model and how it is wired.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub input_node: String,
    pub output_node: String,
    pub shape: ModelShape,
}

impl ModelConfig {
    /// Config for the reference deployment (`input_6` → `dense_11`, 180x180x3 → 8).
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            input_node: "input_6".to_owned(),
            output_node: "dense_11".to_owned(),
            shape: ModelShape::default(),
        }
    }
}

/// An ort session bound to one input and one output node.
pub struct OnnxEngine {
    session: Option<Session>,
    input_node: String,
    output_node: String,
    input: Tensor<f32>,
}

impl OnnxEngine {
    pub fn load(config: &ModelConfig) -> Result<Self, EngineError> {
        let load_error = |e: &dyn std::fmt::Display| EngineError::LoadModel {
            path: config.model_path.clone(),
            message: e.to_string(),
        };

        let session = Session::builder()
            .map_err(|e| load_error(&e))?
            .commit_from_file(&config.model_path)
            .map_err(|e| load_error(&e))?;

        let inputs: Vec<&str> = session.inputs().iter().map(|o| o.name()).collect();
        let outputs: Vec<&str> = session.outputs().iter().map(|o| o.name()).collect();
        check_node(config, "input", &config.input_node, &inputs)?;
        check_node(config, "output", &config.output_node, &outputs)?;

        let input = Tensor::<f32>::from_array((
            config.shape.input_dims(),
            vec![0.0_f32; config.shape.input_size()],
        ))
        .map_err(|e| EngineError::Allocation {
            tensor: "input",
            message: e.to_string(),
        })?;

        info!(
            model_path = %config.model_path.display(),
            input_node = %config.input_node,
            output_node = %config.output_node,
            input_dims = ?config.shape.input_dims(),
            output_dims = ?config.shape.output_dims(),
            "onnx model loaded"
        );

        Ok(Self {
            session: Some(session),
            input_node: config.input_node.clone(),
            output_node: config.output_node.clone(),
            input,
        })
    }
}

/// Fail the load when `wanted` is not one of the model's `kind` nodes.
fn check_node(
    config: &ModelConfig,
    kind: &str,
    wanted: &str,
    available: &[&str],
) -> Result<(), EngineError> {
    if available.contains(&wanted) {
        return Ok(());
    }
    Err(EngineError::LoadModel {
        path: config.model_path.clone(),
        message: format!("model has no {kind} node '{wanted}' (available: {available:?})"),
    })
}

impl InferenceEngine for OnnxEngine {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| EngineError::Run("session already released".to_owned()))?;

        let (_, data) = self.input.extract_tensor_mut();
        data.copy_from_slice(input);

        let outputs = session
            .run(ort::inputs![self.input_node.as_str() => &self.input])
            .map_err(|e| EngineError::Run(e.to_string()))?;
        let (_, values) = outputs
            .get(self.output_node.as_str())
            .ok_or_else(|| EngineError::Run(format!("no output named '{}'", self.output_node)))?
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Run(e.to_string()))?;

        if values.len() != output.len() {
            return Err(EngineError::OutputSize {
                expected: output.len(),
                actual: values.len(),
            });
        }
        output.copy_from_slice(values);
        Ok(())
    }

    fn release(&mut self) -> Result<(), EngineError> {
        drop(self.session.take());
        Ok(())
    }
}

impl ModelSession {
    /// Load an ONNX model under the process-wide ONNX Runtime environment.
    pub fn open(config: &ModelConfig) -> Result<Self, SessionError> {
        config.shape.validate()?;
        let lease = environment().acquire()?;
        let engine = OnnxEngine::load(config)?;
        ModelSession::with_engine(config.shape, engine, Some(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_nodes_pass() {
        let config = ModelConfig::new("model.onnx");
        assert!(check_node(&config, "input", "input_6", &["input_6"]).is_ok());
        assert!(check_node(&config, "output", "dense_11", &["logits", "dense_11"]).is_ok());
    }

    #[test]
    fn unknown_output_node_fails_the_load() {
        let config = ModelConfig::new("model.onnx");
        let err = check_node(&config, "output", "dense_12", &["dense_11"]).unwrap_err();
        assert!(matches!(err, EngineError::LoadModel { .. }));
        let message = err.to_string();
        assert!(message.contains("no output node 'dense_12'"), "{message}");
        assert!(message.contains("dense_11"), "{message}");
    }
}
