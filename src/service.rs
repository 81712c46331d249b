use std::fmt;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::analyzer::Analyzer;
use crate::grpc;
use crate::overlay;
use crate::preprocess::decode_image;

/// The authentication collaborator, consumed as a black box: the pipeline
/// only runs for logged-in callers. The real subsystem (password storage,
/// email verification, token issuance) lives outside this crate.
pub trait AccessGate: Send + Sync {
    fn is_logged_in(&self) -> bool;
    fn username(&self) -> Option<String>;
}

/// Permissive gate for deployments that terminate authentication upstream.
#[derive(Debug, Default)]
pub struct OpenAccess;

impl AccessGate for OpenAccess {
    fn is_logged_in(&self) -> bool {
        true
    }

    fn username(&self) -> Option<String> {
        None
    }
}

/// The scan-analysis gRPC service.
pub struct ScanAnalyzerService {
    analyzer: Arc<Analyzer>,
    gate: Arc<dyn AccessGate>,
}

// Custom Debug implementation that doesn't try to print the gate.
impl fmt::Debug for ScanAnalyzerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanAnalyzerService")
            .field("analyzer", &self.analyzer)
            .finish_non_exhaustive()
    }
}

impl ScanAnalyzerService {
    pub fn new(analyzer: Arc<Analyzer>, gate: Arc<dyn AccessGate>) -> Self {
        Self { analyzer, gate }
    }

    /// Service with a permissive access gate.
    pub fn open(analyzer: Arc<Analyzer>) -> Self {
        Self::new(analyzer, Arc::new(OpenAccess))
    }
}

#[tonic::async_trait]
impl grpc::scan_analyzer_server::ScanAnalyzer for ScanAnalyzerService {
    async fn analyze_scan(
        &self,
        request: Request<grpc::ScanRequest>,
    ) -> Result<Response<grpc::ScanReply>, Status> {
        if !self.gate.is_logged_in() {
            return Err(Status::unauthenticated("login required"));
        }
        if let Some(user) = self.gate.username() {
            log::debug!("analyze request from {user}");
        }

        let req = request.into_inner();
        let image = decode_image(&req.image_data)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let report = self
            .analyzer
            .analyze(&image)
            .map_err(|e| Status::internal(e.to_string()))?;

        let overlay_png = match (&report.overlay, req.include_heatmap) {
            (Some(img), true) => match overlay::encode_png(img) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("{e}");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };
        let overlay_filename = if overlay_png.is_empty() {
            String::new()
        } else {
            overlay::DOWNLOAD_FILENAME.to_string()
        };

        Ok(Response::new(grpc::ScanReply {
            label: report.prediction.label.to_string(),
            probability: report.prediction.probability,
            confidence: report.prediction.confidence,
            overlay_png,
            overlay_filename,
        }))
    }
}
