//! Skin analysis shared by the multipart HTTP route and the gRPC service.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::error::ServerError;
use crate::schemas::v1::analyze::{AnalysisResponse, AnalysisResult};
use crate::state::AppState;

/// A decoded analysis request, independent of the transport.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub user_id: String,
    pub image_type: String,
    pub metadata: HashMap<String, String>,
    pub top_k: i64,
    pub tensor: Vec<f32>,
}

/// Validate, rank and audit one analysis.
pub async fn analyze(
    state: &AppState,
    operation: &'static str,
    request: AnalysisRequest,
) -> Result<AnalysisResponse, ServerError> {
    let summary = json!({
        "user_id": request.user_id,
        "image_type": request.image_type,
        "metadata": request.metadata,
        "top_k": request.top_k,
        "input_len": request.tensor.len(),
    });
    let outcome = rank(state, request).await;
    audit::record(&state.events, operation, summary, &outcome).await;
    outcome
}

async fn rank(state: &AppState, request: AnalysisRequest) -> Result<AnalysisResponse, ServerError> {
    state.inference.validate_input(&request.tensor)?;
    let ranked = state.inference.top_k(request.tensor, request.top_k).await?;
    Ok(AnalysisResponse {
        analysis_id: Uuid::new_v4(),
        analysis_timestamp: Utc::now(),
        results: ranked
            .into_iter()
            .map(|r| AnalysisResult {
                label: r.class_name,
                confidence: r.confidence,
                class_index: r.class_index,
            })
            .collect(),
    })
}
