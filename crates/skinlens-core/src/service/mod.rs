//! Inference service.
//!
//! [`InferenceService`] is the shared front door to the single
//! [`ModelSession`].  Every operation that touches the session takes one
//! owned lock guard and runs the synchronous engine call on the blocking
//! pool, so at most one inference is ever in flight and the guard is dropped
//! on every exit path, including engine failure and panics.
//!
//! Execution order is lock-acquisition order (tokio's mutex is fair), not
//! request arrival order at the socket.

pub mod topk;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::dictionary::ClassDictionary;
use crate::session::{EngineError, ModelSession, ModelShape, ReleaseError, SessionError};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("invalid input size: expected {expected}, got {actual}")]
    InvalidInputSize { expected: usize, actual: usize },

    #[error("inference engine error: {0}")]
    Engine(#[source] EngineError),

    #[error("model session is closed")]
    SessionClosed,

    #[error("class dictionary is not set")]
    ClassDictionaryUnset,

    #[error("unknown class index: {index}")]
    UnknownClassIndex { index: usize },

    #[error("class dictionary has {actual} entries but the model has {expected} classes")]
    DictionaryMismatch { expected: usize, actual: usize },

    #[error("inference worker failed: {0}")]
    WorkerPanicked(String),
}

impl InferenceError {
    /// `true` when the caller's request was at fault rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            InferenceError::InvalidInputSize { .. } | InferenceError::UnknownClassIndex { .. }
        )
    }
}

impl From<SessionError> for InferenceError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InputSizeMismatch { expected, actual } => {
                InferenceError::InvalidInputSize { expected, actual }
            }
            SessionError::Closed => InferenceError::SessionClosed,
            SessionError::Engine(e) => InferenceError::Engine(e),
            SessionError::InvalidShape(shape) => {
                InferenceError::Engine(EngineError::Run(format!("invalid shape {shape:?}")))
            }
            SessionError::Environment(e) => {
                InferenceError::Engine(EngineError::Environment(e.to_string()))
            }
        }
    }
}

/// One ranked class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub class_index: usize,
    pub class_name: String,
    pub confidence: f32,
}

/// Serialized access to one model session plus its class dictionary.
#[derive(Debug)]
pub struct InferenceService {
    session: Arc<Mutex<ModelSession>>,
    dictionary: Option<Arc<ClassDictionary>>,
    shape: ModelShape,
}

impl InferenceService {
    /// Fails with [`InferenceError::DictionaryMismatch`] when the dictionary
    /// length differs from the model's class count.
    pub fn new(session: ModelSession, dictionary: ClassDictionary) -> Result<Self, InferenceError> {
        let shape = session.shape();
        if dictionary.len() != shape.num_classes {
            return Err(InferenceError::DictionaryMismatch {
                expected: shape.num_classes,
                actual: dictionary.len(),
            });
        }
        info!(
            input_size = shape.input_size(),
            num_classes = shape.num_classes,
            "inference service ready"
        );
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            dictionary: Some(Arc::new(dictionary)),
            shape,
        })
    }

    /// A service that only returns raw probabilities; class-name lookups fail
    /// with [`InferenceError::ClassDictionaryUnset`].
    pub fn without_dictionary(session: ModelSession) -> Self {
        let shape = session.shape();
        Self {
            session: Arc::new(Mutex::new(session)),
            dictionary: None,
            shape,
        }
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    pub fn expected_input_size(&self) -> usize {
        self.shape.input_size()
    }

    pub fn num_classes(&self) -> usize {
        self.shape.num_classes
    }

    /// Check the flat input length without touching the session.
    pub fn validate_input(&self, input: &[f32]) -> Result<(), InferenceError> {
        let expected = self.shape.input_size();
        if input.len() != expected {
            return Err(InferenceError::InvalidInputSize {
                expected,
                actual: input.len(),
            });
        }
        Ok(())
    }

    /// Full probability vector, one value per class. Values are returned as
    /// produced by the model and are not normalised.
    pub async fn predict(&self, input: Vec<f32>) -> Result<Vec<f32>, InferenceError> {
        self.with_session(move |session| Ok(session.predict(&input)?))
            .await
    }

    /// Most probable class and its confidence.
    pub async fn predict_class(&self, input: Vec<f32>) -> Result<(usize, f32), InferenceError> {
        self.with_session(move |session| {
            let probabilities = session.predict(&input)?;
            topk::argmax(&probabilities).ok_or(InferenceError::Engine(EngineError::OutputSize {
                expected: session.num_classes(),
                actual: 0,
            }))
        })
        .await
    }

    /// The `clamp(k, 1, K)` most probable classes, most confident first.
    pub async fn top_k(
        &self,
        input: Vec<f32>,
        k: i64,
    ) -> Result<Vec<PredictionResult>, InferenceError> {
        let dictionary = self.dictionary.clone();
        self.with_session(move |session| {
            let probabilities = session.predict(&input)?;
            topk::select_top_k(&probabilities, k)
                .into_iter()
                .map(|(class_index, confidence)| -> Result<_, InferenceError> {
                    Ok(PredictionResult {
                        class_index,
                        class_name: lookup(dictionary.as_deref(), class_index)?.to_owned(),
                        confidence,
                    })
                })
                .collect()
        })
        .await
    }

    /// Resolve a class index to its name.
    pub async fn class_name(&self, class_index: usize) -> Result<String, InferenceError> {
        let _guard = self.session.lock().await;
        lookup(self.dictionary.as_deref(), class_index).map(str::to_owned)
    }

    /// Close the underlying session. Later calls fail with
    /// [`InferenceError::SessionClosed`]; closing twice is a no-op.
    pub async fn close(&self) -> Result<(), ReleaseError> {
        let mut session = self.session.lock().await;
        let result = session.close();
        debug!(ok = result.is_ok(), "model session closed");
        result
    }

    async fn with_session<T, F>(&self, work: F) -> Result<T, InferenceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ModelSession) -> Result<T, InferenceError> + Send + 'static,
    {
        let mut guard = Arc::clone(&self.session).lock_owned().await;
        tokio::task::spawn_blocking(move || work(&mut guard))
            .await
            .map_err(|e| InferenceError::WorkerPanicked(e.to_string()))?
    }
}

fn lookup(
    dictionary: Option<&ClassDictionary>,
    class_index: usize,
) -> Result<&str, InferenceError> {
    dictionary
        .ok_or(InferenceError::ClassDictionaryUnset)?
        .get(class_index)
        .ok_or(InferenceError::UnknownClassIndex { index: class_index })
}
