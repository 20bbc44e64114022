//! Shared application state injected into every Axum handler and the gRPC
//! service.

use std::sync::Arc;

use skinlens_core::{EventPublisher, InferenceService};

use crate::config::Config;

/// State shared across all HTTP handlers and the gRPC listener.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The single model session behind its lock.
    pub inference: Arc<InferenceService>,
    /// Producing half of the audit-event pipeline.
    pub events: EventPublisher,
}
