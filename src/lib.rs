pub mod analyzer;
pub mod cli;
pub mod error;
pub mod gradcam;
pub mod model;
pub mod overlay;
pub mod preprocess;
pub mod service;

pub mod grpc {
    tonic::include_proto!("xvision");
}

pub use crate::analyzer::{Analyzer, AnalyzerConfig, ScanReport};
pub use crate::cli::Args;
pub use crate::error::PipelineError;
pub use crate::gradcam::GradCam;
pub use crate::model::{LabelPolarity, ModelConfig, OnnxClassifier, Prediction};
pub use crate::preprocess::{PreprocessConfig, Preprocessor, decode_image};
pub use crate::service::{AccessGate, OpenAccess, ScanAnalyzerService};
