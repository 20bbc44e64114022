//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - middleware layers (body limit, CORS, per-request trace-ID injection)
//! - the OpenAPI document at `/api-docs/openapi.json`
//! - health / heartbeat route
//! - `/v1` inference routes

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router, middleware};
use skinlens_core::CancellationToken;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::info;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api_doc = doc::get_docs();

    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router())
        .route("/api-docs/openapi.json", get(move || async move { Json(api_doc) }))
        // Outermost layers execute first on the way in.
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
                .layer(cors::cors_layer(&state)),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_middleware,
        ))
        .with_state(state)
}

/// Serve HTTP on `listener` until `shutdown` is cancelled, then finish
/// in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
