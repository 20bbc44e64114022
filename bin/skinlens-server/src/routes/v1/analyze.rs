//! Skin analysis upload route.
//!
//! Accepts a multipart form with the raw tensor in `file` plus optional
//! `metadata` (JSON object of strings), `user_id` and `top_k` fields, and
//! returns the ranked classes under a fresh analysis ID.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;
use utoipa::OpenApi;

use crate::analysis::{self, AnalysisRequest};
use crate::audit;
use crate::error::ServerError;
use crate::schemas::v1::analyze::{AnalysisResponse, AnalysisResult, AnalyzeSkinUpload};
use crate::schemas::v1::predict::default_top_k;
use crate::state::AppState;
use crate::tensor;

const OPERATION: &str = "analyze_skin";

#[derive(OpenApi)]
#[openapi(
    paths(analyze_skin),
    components(schemas(AnalyzeSkinUpload, AnalysisResponse, AnalysisResult))
)]
pub struct AnalyzeApi;

/// Register analysis routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/analyze-skin", post(analyze_skin))
}

/// Analyse an uploaded tensor (`POST /v1/analyze-skin`).
#[utoipa::path(
    post,
    path = "/v1/analyze-skin",
    tag = "inference",
    request_body(content = AnalyzeSkinUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Ranked analysis", body = AnalysisResponse),
        (status = 400, description = "Missing file, malformed field or wrong tensor size"),
        (status = 413, description = "Upload too large"),
        (status = 500, description = "Inference failed"),
    )
)]
pub async fn analyze_skin(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<AnalysisResponse>, ServerError> {
    let request = match read_upload(multipart).await {
        Ok(request) => request,
        Err(e) => {
            audit::record_failure(&state.events, OPERATION, json!({}), &e).await;
            return Err(e);
        }
    };
    debug!(
        user_id = %request.user_id,
        input_len = request.tensor.len(),
        top_k = request.top_k,
        "analysis upload received"
    );
    analysis::analyze(&state, OPERATION, request).await.map(Json)
}

async fn read_upload(mut multipart: Multipart) -> Result<AnalysisRequest, ServerError> {
    let mut request = AnalysisRequest {
        top_k: default_top_k(),
        ..Default::default()
    };
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                request.image_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_owned();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("failed to read file: {e}")))?;
                file = Some(bytes);
            }
            "metadata" => {
                let text = field_text(field).await?;
                if !text.trim().is_empty() {
                    request.metadata = serde_json::from_str::<HashMap<String, String>>(&text)
                        .map_err(|e| {
                            ServerError::BadRequest(format!("invalid metadata format: {e}"))
                        })?;
                }
            }
            "user_id" => request.user_id = field_text(field).await?,
            "top_k" => {
                let text = field_text(field).await?;
                request.top_k = text.trim().parse().map_err(|_| {
                    ServerError::BadRequest(format!("top_k must be an integer, got '{text}'"))
                })?;
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let file = file.ok_or_else(|| ServerError::BadRequest("missing 'file' field".to_owned()))?;
    request.tensor = tensor::decode_f32le(&file)?;
    Ok(request)
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ServerError> {
    let name = field.name().unwrap_or_default().to_owned();
    field
        .text()
        .await
        .map_err(|e| ServerError::BadRequest(format!("failed to read '{name}': {e}")))
}
