//! Model session wrapper.
//!
//! [`ModelSession`] binds one [`InferenceEngine`] to a fixed [`ModelShape`]
//! and owns the input/output buffers handed to it.  The buffers are allocated
//! once and overwritten on every call, which is why a session is `&mut` to
//! predict with: callers that share it must serialize access (see
//! [`crate::InferenceService`]).

mod engine;
#[cfg(feature = "onnx")]
pub mod onnx;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use engine::{EngineError, InferenceEngine};

use crate::environment::EnvironmentLease;

/// Fixed input/output geometry of a classification model (batch size 1, NHWC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub num_classes: usize,
}

impl Default for ModelShape {
    /// 180x180 RGB input, 8 classes.
    fn default() -> Self {
        Self::new(180, 180, 3, 8)
    }
}

impl ModelShape {
    pub const fn new(height: usize, width: usize, channels: usize, num_classes: usize) -> Self {
        Self {
            height,
            width,
            channels,
            num_classes,
        }
    }

    /// Flat element count of one input tensor.
    pub fn input_size(&self) -> usize {
        self.checked_input_size().unwrap_or(usize::MAX)
    }

    fn checked_input_size(&self) -> Option<usize> {
        self.height
            .checked_mul(self.width)?
            .checked_mul(self.channels)
    }

    pub fn input_dims(&self) -> [usize; 4] {
        [1, self.height, self.width, self.channels]
    }

    pub fn output_dims(&self) -> [usize; 2] {
        [1, self.num_classes]
    }

    fn validate(&self) -> Result<(), SessionError> {
        match self.checked_input_size() {
            Some(size) if size > 0 && self.num_classes > 0 => Ok(()),
            _ => Err(SessionError::InvalidShape(*self)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("input size mismatch: expected {expected}, got {actual}")]
    InputSizeMismatch { expected: usize, actual: usize },

    #[error("invalid model shape: {0:?}")]
    InvalidShape(ModelShape),

    #[error("model session is closed")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Environment(#[from] crate::environment::EnvironmentError),
}

/// Resource released by [`ModelSession::close`], in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionResource {
    InputBuffer,
    OutputBuffer,
    Session,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: SessionResource,
    pub message: String,
}

/// Every failure observed while closing a session.
#[derive(Debug, Clone)]
pub struct ReleaseError {
    pub failures: Vec<ReleaseFailure>,
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to release {} session resource(s)", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", failure.resource, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ReleaseError {}

/// One loaded classification model with reused I/O buffers.
pub struct ModelSession {
    shape: ModelShape,
    input: Option<Vec<f32>>,
    output: Option<Vec<f32>>,
    engine: Option<Box<dyn InferenceEngine>>,
    lease: Option<EnvironmentLease>,
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("shape", &self.shape)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ModelSession {
    /// Wrap an already-loaded engine.
    ///
    /// `lease` is the environment reference the engine was created under; it
    /// is released last when the session closes.
    pub fn with_engine(
        shape: ModelShape,
        engine: impl InferenceEngine,
        lease: Option<EnvironmentLease>,
    ) -> Result<Self, SessionError> {
        shape.validate()?;
        Ok(Self {
            shape,
            input: Some(vec![0.0; shape.input_size()]),
            output: Some(vec![0.0; shape.num_classes]),
            engine: Some(Box::new(engine)),
            lease,
        })
    }

    /// Run one inference.
    ///
    /// The returned vector is a copy; the internal output buffer is reused by
    /// the next call.
    pub fn predict(&mut self, input: &[f32]) -> Result<Vec<f32>, SessionError> {
        let expected = self.shape.input_size();
        if input.len() != expected {
            return Err(SessionError::InputSizeMismatch {
                expected,
                actual: input.len(),
            });
        }

        let (Some(input_buf), Some(output_buf), Some(engine)) = (
            self.input.as_mut(),
            self.output.as_mut(),
            self.engine.as_mut(),
        ) else {
            return Err(SessionError::Closed);
        };

        input_buf.copy_from_slice(input);
        engine.run(input_buf, output_buf)?;
        Ok(output_buf.clone())
    }

    /// Release the input buffer, output buffer, engine session and
    /// environment lease, in that order.
    ///
    /// Each step runs even if an earlier one failed; all failures are
    /// returned together.  Closing an already-closed session is a no-op.
    pub fn close(&mut self) -> Result<(), ReleaseError> {
        let mut failures = Vec::new();

        if self.input.take().is_some() {
            debug!(resource = %SessionResource::InputBuffer, "released");
        }
        if self.output.take().is_some() {
            debug!(resource = %SessionResource::OutputBuffer, "released");
        }
        if let Some(mut engine) = self.engine.take() {
            match engine.release() {
                Ok(()) => debug!(resource = %SessionResource::Session, "released"),
                Err(e) => failures.push(ReleaseFailure {
                    resource: SessionResource::Session,
                    message: e.to_string(),
                }),
            }
        }
        if let Some(mut lease) = self.lease.take() {
            match lease.release() {
                Ok(()) => debug!(resource = %SessionResource::Environment, "released"),
                Err(e) => failures.push(ReleaseFailure {
                    resource: SessionResource::Environment,
                    message: e.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReleaseError { failures })
        }
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_none()
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.shape.input_dims()
    }

    pub fn output_shape(&self) -> [usize; 2] {
        self.shape.output_dims()
    }

    pub fn expected_input_size(&self) -> usize {
        self.shape.input_size()
    }

    pub fn num_classes(&self) -> usize {
        self.shape.num_classes
    }
}

impl Drop for ModelSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to release model session on drop");
        }
    }
}
