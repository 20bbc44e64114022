use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Multipart form accepted by `POST /v1/analyze-skin`.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
pub struct AnalyzeSkinUpload {
    /// Raw little-endian `f32` tensor.
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// JSON object of string values, e.g. `{"body_part":"arm"}`.
    pub metadata: Option<String>,
    pub user_id: Option<String>,
    /// Number of ranked classes to return (default `3`).
    pub top_k: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AnalysisResult {
    pub label: String,
    pub confidence: f32,
    pub class_index: usize,
}

/// Response body for `POST /v1/analyze-skin` (and the gRPC `AnalyzeSkin`).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AnalysisResponse {
    pub analysis_id: Uuid,
    pub analysis_timestamp: DateTime<Utc>,
    pub results: Vec<AnalysisResult>,
}
