//! skinlens-core – the inference-serving pipeline.
//!
//! - [`session`]: the model session wrapper with reused input/output buffers.
//! - [`environment`]: process-wide engine environment leases.
//! - [`dictionary`]: class-index → human-readable name mapping.
//! - [`service`]: serialized access to the session, validation and top-K.
//! - [`events`]: bounded audit-event pipeline with a single consumer.
//! - [`shutdown`]: cancellation fan-out and orderly component termination.

pub mod dictionary;
pub mod environment;
pub mod events;
pub mod service;
pub mod session;
pub mod shutdown;

pub use dictionary::{ClassDictionary, DictionaryError};
pub use environment::{
    Environment, EnvironmentBackend, EnvironmentError, EnvironmentLease, NoopBackend,
};
pub use events::{
    AuditEvent, ConsumerState, ConsumerStats, EventConsumer, EventPublisher, EventSink,
    EventStatus, PipelineError,
};
pub use service::{InferenceError, InferenceService, PredictionResult};
pub use session::{
    EngineError, InferenceEngine, ModelSession, ModelShape, ReleaseError, ReleaseFailure,
    SessionError, SessionResource,
};
pub use shutdown::{ShutdownCoordinator, ShutdownError};

#[cfg(feature = "onnx")]
pub use session::onnx::{ModelConfig, OnnxEngine};

pub use tokio_util::sync::CancellationToken;
