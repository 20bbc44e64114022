//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] and converts into a [`tonic::Status`], so
//! both listeners map failures the same way.
//!
//! Internal errors are logged with full detail but only a generic message is
//! returned to the caller; model paths and engine messages never leak to
//! clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use skinlens_core::InferenceError;
use thiserror::Error;
use tracing::{debug, error};

/// All errors that can occur in the skinlens-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the inference service.
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    InvalidInput,
    Unavailable,
    Internal,
}

impl ServerError {
    fn kind(&self) -> Kind {
        match self {
            ServerError::BadRequest(_) => Kind::InvalidInput,
            ServerError::Inference(e) if e.is_client_error() => Kind::InvalidInput,
            ServerError::Inference(InferenceError::SessionClosed) => Kind::Unavailable,
            ServerError::Inference(_) | ServerError::Internal(_) => Kind::Internal,
        }
    }

    /// Log at the level matching the error kind and return the message that
    /// is safe to show the caller.
    fn client_message(&self) -> String {
        match self.kind() {
            Kind::InvalidInput => {
                debug!(error = %self, "rejected invalid request");
                match self {
                    ServerError::BadRequest(m) => m.clone(),
                    other => other.to_string(),
                }
            }
            Kind::Unavailable => {
                debug!(error = %self, "request during shutdown");
                "service is shutting down".to_owned()
            }
            Kind::Internal => {
                error!(error = %self, "request failed");
                "internal server error".to_owned()
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            Kind::InvalidInput => StatusCode::BAD_REQUEST,
            Kind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Kind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.client_message() }))).into_response()
    }
}

impl From<ServerError> for tonic::Status {
    fn from(e: ServerError) -> Self {
        let message = e.client_message();
        match e.kind() {
            Kind::InvalidInput => tonic::Status::invalid_argument(message),
            Kind::Unavailable => tonic::Status::unavailable(message),
            Kind::Internal => tonic::Status::internal(message),
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use skinlens_core::EngineError;

    async fn body_of(err: ServerError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn invalid_input_is_bad_request_with_detail() {
        let (status, body) = body_of(ServerError::Inference(InferenceError::InvalidInputSize {
            expected: 4,
            actual: 3,
        }))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("expected 4"));
    }

    #[tokio::test]
    async fn engine_failure_is_opaque_500() {
        let (status, body) = body_of(ServerError::Inference(InferenceError::Engine(
            EngineError::Run("/secret/model.onnx exploded".to_owned()),
        )))
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal server error");
    }

    #[test]
    fn grpc_status_codes() {
        let status: tonic::Status = ServerError::BadRequest("no info".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = ServerError::Inference(InferenceError::SessionClosed).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status =
            ServerError::Inference(InferenceError::WorkerPanicked("boom".into())).into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "internal server error");
    }
}
