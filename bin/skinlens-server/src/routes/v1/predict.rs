//! Tensor-in, probabilities-out inference routes.
//!
//! Bodies carry the flattened input tensor as a JSON array.  Every request,
//! successful or not, is recorded as one audit event.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;
use utoipa::OpenApi;

use crate::audit;
use crate::error::ServerError;
use crate::schemas::v1::predict::{
    ClassifyRequest, ClassifyResponse, PredictRequest, PredictResponse, Prediction,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(predict, predict_class, classify),
    components(schemas(
        PredictRequest,
        PredictResponse,
        ClassifyRequest,
        ClassifyResponse,
        Prediction
    ))
)]
pub struct PredictApi;

/// Register prediction routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/predict", post(predict))
        .route("/predict-class", post(predict_class))
        .route("/classify", post(classify))
}

/// Full probability vector (`POST /v1/predict`).
#[utoipa::path(
    post,
    path = "/v1/predict",
    tag = "inference",
    request_body = PredictRequest,
    responses(
        (status = 200, description = "One probability per class", body = PredictResponse),
        (status = 400, description = "Input tensor has the wrong size"),
        (status = 500, description = "Inference failed"),
    )
)]
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ServerError> {
    let summary = json!({ "input_len": req.input.len() });
    let outcome = run_predict(&state, req.input).await;
    audit::record(&state.events, "predict", summary, &outcome).await;
    outcome.map(Json)
}

async fn run_predict(state: &AppState, input: Vec<f32>) -> Result<PredictResponse, ServerError> {
    state.inference.validate_input(&input)?;
    let probabilities = state.inference.predict(input).await?;
    Ok(PredictResponse { probabilities })
}

/// Most probable class (`POST /v1/predict-class`).
#[utoipa::path(
    post,
    path = "/v1/predict-class",
    tag = "inference",
    request_body = PredictRequest,
    responses(
        (status = 200, description = "Top class", body = Prediction),
        (status = 400, description = "Input tensor has the wrong size"),
        (status = 500, description = "Inference failed"),
    )
)]
pub async fn predict_class(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<Prediction>, ServerError> {
    let summary = json!({ "input_len": req.input.len() });
    let outcome = run_predict_class(&state, req.input).await;
    audit::record(&state.events, "predict_class", summary, &outcome).await;
    outcome.map(Json)
}

async fn run_predict_class(state: &AppState, input: Vec<f32>) -> Result<Prediction, ServerError> {
    state.inference.validate_input(&input)?;
    let (class_index, confidence) = state.inference.predict_class(input).await?;
    let class_name = state.inference.class_name(class_index).await?;
    Ok(Prediction {
        class_index,
        class_name,
        confidence,
    })
}

/// Ranked classes (`POST /v1/classify`).
///
/// `top_k` is clamped into `1..=num_classes`.
#[utoipa::path(
    post,
    path = "/v1/classify",
    tag = "inference",
    request_body = ClassifyRequest,
    responses(
        (status = 200, description = "Most confident classes first", body = ClassifyResponse),
        (status = 400, description = "Input tensor has the wrong size"),
        (status = 500, description = "Inference failed"),
    )
)]
pub async fn classify(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClassifyRequest>,
) -> Result<Json<ClassifyResponse>, ServerError> {
    debug!(top_k = req.top_k, input_len = req.input.len(), "classify request");
    let summary = json!({ "input_len": req.input.len(), "top_k": req.top_k });
    let outcome = run_classify(&state, req).await;
    audit::record(&state.events, "classify", summary, &outcome).await;
    outcome.map(Json)
}

async fn run_classify(
    state: &AppState,
    req: ClassifyRequest,
) -> Result<ClassifyResponse, ServerError> {
    state.inference.validate_input(&req.input)?;
    let results = state.inference.top_k(req.input, req.top_k).await?;
    Ok(ClassifyResponse {
        results: results.into_iter().map(Prediction::from).collect(),
    })
}
