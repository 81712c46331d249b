use thiserror::Error;

/// Per-stage pipeline failures. Every variant except `ModelLoad` is terminal
/// for the current request only; `ModelLoad` means no prediction is possible
/// at all and the process must stop serving.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("preprocessing failed: {0}")]
    Preprocess(String),

    #[error("failed to load the model: {0}")]
    ModelLoad(String),

    #[error("prediction failed: {0}")]
    Inference(String),

    #[error("heatmap unavailable: {0}")]
    Saliency(String),

    #[error("overlay unavailable: {0}")]
    Overlay(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::ModelLoad(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_model_load_is_fatal() {
        assert!(PipelineError::ModelLoad("missing file".into()).is_fatal());
        assert!(!PipelineError::Preprocess("bad image".into()).is_fatal());
        assert!(!PipelineError::Inference("shape mismatch".into()).is_fatal());
        assert!(!PipelineError::Saliency("no feature map".into()).is_fatal());
        assert!(!PipelineError::Overlay("encode error".into()).is_fatal());
    }

    #[test]
    fn messages_name_the_failed_stage() {
        let err = PipelineError::Preprocess("truncated file".into());
        assert!(err.to_string().starts_with("preprocessing failed"));
        let err = PipelineError::Saliency("empty feature map".into());
        assert!(err.to_string().starts_with("heatmap unavailable"));
    }
}
