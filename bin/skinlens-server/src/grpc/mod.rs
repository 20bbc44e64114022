//! gRPC listener: `skinlens.v1.SkinAnalysisService`.
//!
//! `AnalyzeSkin` is client-streaming: an optional `info` message followed by
//! the tensor bytes split across any number of `chunk` messages.  Chunks are
//! concatenated in arrival order and decoded as little-endian `f32`.

use std::sync::Arc;

use futures::{Stream, TryStreamExt};
use skinlens_core::CancellationToken;
use skinlens_proto::v1::analyze_skin_request::RequestPayload;
use skinlens_proto::v1::{AnalysisResult, AnalyzeSkinRequest, AnalyzeSkinResponse, ImageInfo};
use skinlens_proto::{SkinAnalysisService, SkinAnalysisServiceServer};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::analysis::{self, AnalysisRequest};
use crate::audit;
use crate::error::ServerError;
use crate::state::AppState;
use crate::tensor;

const OPERATION: &str = "grpc_analyze_skin";

/// Serve gRPC on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let service = SkinAnalysisServiceServer::new(SkinAnalysisGrpc::new(state));
    tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await?;
    info!("gRPC server stopped");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SkinAnalysisGrpc {
    state: Arc<AppState>,
}

impl SkinAnalysisGrpc {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn analyze<S>(&self, stream: S) -> Result<AnalyzeSkinResponse, Status>
    where
        S: Stream<Item = Result<AnalyzeSkinRequest, Status>> + Unpin,
    {
        let request = match self.collect(stream).await {
            Ok(request) => request,
            Err(e) => {
                audit::record_failure(&self.state.events, OPERATION, serde_json::json!({}), &e)
                    .await;
                return Err(e.into());
            }
        };

        let analysis = analysis::analyze(&self.state, OPERATION, request).await?;
        Ok(AnalyzeSkinResponse {
            analysis_id: analysis.analysis_id.to_string(),
            analysis_timestamp: analysis.analysis_timestamp.to_rfc3339(),
            results: analysis
                .results
                .into_iter()
                .map(|r| AnalysisResult {
                    label: r.label,
                    confidence: r.confidence,
                    class_index: u32::try_from(r.class_index).unwrap_or(u32::MAX),
                })
                .collect(),
        })
    }

    /// Read the whole upload, enforcing the configured size limit.
    async fn collect<S>(&self, mut stream: S) -> Result<AnalysisRequest, ServerError>
    where
        S: Stream<Item = Result<AnalyzeSkinRequest, Status>> + Unpin,
    {
        let limit = self.state.config.max_body_bytes;
        let mut info: Option<ImageInfo> = None;
        let mut data = Vec::new();

        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|s| ServerError::BadRequest(format!("upload stream failed: {}", s.message())))?
        {
            match message.request_payload {
                Some(RequestPayload::Info(i)) => {
                    if info.replace(i).is_some() {
                        return Err(ServerError::BadRequest(
                            "image info sent more than once".to_owned(),
                        ));
                    }
                }
                Some(RequestPayload::Chunk(chunk)) => {
                    if data.len() + chunk.len() > limit {
                        return Err(ServerError::BadRequest(format!(
                            "upload exceeds {limit} bytes"
                        )));
                    }
                    data.extend_from_slice(&chunk);
                }
                None => debug!("ignoring empty upload message"),
            }
        }

        let info = info.unwrap_or_default();
        Ok(AnalysisRequest {
            user_id: info.user_id,
            image_type: info.image_type,
            metadata: info.metadata.into_iter().collect(),
            top_k: i64::from(info.top_k),
            tensor: tensor::decode_f32le(&data)?,
        })
    }
}

#[tonic::async_trait]
impl SkinAnalysisService for SkinAnalysisGrpc {
    async fn analyze_skin(
        &self,
        request: Request<Streaming<AnalyzeSkinRequest>>,
    ) -> Result<Response<AnalyzeSkinResponse>, Status> {
        self.analyze(request.into_inner()).await.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skinlens_core::EventStatus;

    use crate::test_support::{Harness, f32le, valid_input};

    fn info(top_k: i32) -> AnalyzeSkinRequest {
        AnalyzeSkinRequest {
            request_payload: Some(RequestPayload::Info(ImageInfo {
                user_id: "user-7".to_owned(),
                image_type: "f32le".to_owned(),
                metadata: [("source".to_owned(), "app".to_owned())].into(),
                top_k,
            })),
        }
    }

    fn chunk(bytes: &[u8]) -> AnalyzeSkinRequest {
        AnalyzeSkinRequest {
            request_payload: Some(RequestPayload::Chunk(bytes.to_vec())),
        }
    }

    fn stream(
        messages: Vec<AnalyzeSkinRequest>,
    ) -> impl Stream<Item = Result<AnalyzeSkinRequest, Status>> + Unpin {
        futures::stream::iter(messages.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn chunks_are_concatenated_in_order() {
        let harness = Harness::new().await;
        let service = SkinAnalysisGrpc::new(harness.state.clone());
        let bytes = f32le(&valid_input());
        let (head, tail) = bytes.split_at(5);

        let response = service
            .analyze(stream(vec![info(3), chunk(head), chunk(tail)]))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 3);
        assert_eq!(response.results[0].label, "eczema");
        assert_eq!(response.results[0].class_index, 1);
        assert!(chrono::DateTime::parse_from_rfc3339(&response.analysis_timestamp).is_ok());

        let rows = harness.drain().await.all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EventStatus::Success);
        assert!(rows[0].body.contains("user-7"));
    }

    #[tokio::test]
    async fn missing_info_uses_defaults() {
        let harness = Harness::new().await;
        let service = SkinAnalysisGrpc::new(harness.state.clone());
        let response = service
            .analyze(stream(vec![chunk(&f32le(&valid_input()))]))
            .await
            .unwrap();
        // top_k 0 clamps to a single result.
        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn wrong_size_is_invalid_argument() {
        let harness = Harness::new().await;
        let service = SkinAnalysisGrpc::new(harness.state.clone());
        let status = service
            .analyze(stream(vec![info(1), chunk(&f32le(&[1.0, 2.0]))]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let rows = harness.drain().await.all().await.unwrap();
        assert_eq!(rows[0].status, EventStatus::Fail);
    }

    #[tokio::test]
    async fn duplicate_info_is_rejected() {
        let harness = Harness::new().await;
        let service = SkinAnalysisGrpc::new(harness.state.clone());
        let status = service
            .analyze(stream(vec![info(1), info(2)]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn upload_over_limit_is_rejected() {
        let harness = Harness::new().await;
        let service = SkinAnalysisGrpc::new(harness.state.clone());
        let big = vec![0u8; harness.state.config.max_body_bytes + 4];
        let status = service
            .analyze(stream(vec![chunk(&big)]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("exceeds"));
    }
}
