//! Generated gRPC types for the skinlens services.

pub mod v1 {
    tonic::include_proto!("skinlens.v1");
}

pub use v1::skin_analysis_service_client::SkinAnalysisServiceClient;
pub use v1::skin_analysis_service_server::{SkinAnalysisService, SkinAnalysisServiceServer};
