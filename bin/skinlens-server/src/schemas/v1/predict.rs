use serde::{Deserialize, Serialize};
use skinlens_core::PredictionResult;
use utoipa::ToSchema;

/// Request body for `POST /v1/predict` and `POST /v1/predict-class`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PredictRequest {
    /// Flattened NHWC input tensor (`height * width * channels` values).
    pub input: Vec<f32>,
}

/// Response body for `POST /v1/predict`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PredictResponse {
    /// One probability per class, in model output order.
    pub probabilities: Vec<f32>,
}

/// Request body for `POST /v1/classify`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClassifyRequest {
    pub input: Vec<f32>,
    /// Number of ranked classes to return, clamped into `1..=num_classes`
    /// (default `3`).
    #[serde(default = "default_top_k")]
    pub top_k: i64,
}

pub fn default_top_k() -> i64 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Prediction {
    pub class_index: usize,
    pub class_name: String,
    pub confidence: f32,
}

impl From<PredictionResult> for Prediction {
    fn from(r: PredictionResult) -> Self {
        Self {
            class_index: r.class_index,
            class_name: r.class_name,
            confidence: r.confidence,
        }
    }
}

/// Response body for `POST /v1/classify`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClassifyResponse {
    /// Most confident first.
    pub results: Vec<Prediction>,
}
