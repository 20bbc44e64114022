//! One audit event per handled request.
//!
//! Publishing waits while the queue is full.  If the pipeline is shutting
//! down or gone the event is dropped with a warning; the caller's response is
//! never affected.

use serde::Serialize;
use serde_json::{Value, json};
use skinlens_core::{AuditEvent, EventPublisher, EventStatus};
use tracing::warn;

use crate::error::ServerError;

/// Publish the outcome of `operation`. `request` summarises the call and
/// never contains the raw tensor.
pub async fn record<T: Serialize>(
    events: &EventPublisher,
    operation: &str,
    request: Value,
    outcome: &Result<T, ServerError>,
) {
    match outcome {
        Ok(response) => {
            let payload =
                json!({ "operation": operation, "request": request, "response": response });
            publish(events, operation, EventStatus::Success, &payload).await;
        }
        Err(e) => record_failure(events, operation, request, e).await,
    }
}

/// Publish a failure that happened before a response could be built.
pub async fn record_failure(
    events: &EventPublisher,
    operation: &str,
    request: Value,
    error: &ServerError,
) {
    let payload = json!({ "operation": operation, "request": request, "error": error.to_string() });
    publish(events, operation, EventStatus::Fail, &payload).await;
}

async fn publish(events: &EventPublisher, operation: &str, status: EventStatus, payload: &Value) {
    if let Err(e) = events.publish(AuditEvent::json(status, payload)).await {
        warn!(error = %e, operation, %status, "audit event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skinlens_core::{CancellationToken, events};
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn shutting_down_pipeline_drops_with_warning() {
        let token = CancellationToken::new();
        let (publisher, _consumer) = events::bounded(4, token.clone());
        token.cancel();

        let outcome: Result<Value, ServerError> = Ok(json!({ "probabilities": [] }));
        record(&publisher, "predict", json!({}), &outcome).await;

        assert!(logs_contain("audit event dropped"));
        assert!(logs_contain("shutting down"));
    }
}
