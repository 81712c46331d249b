use std::fmt;

use anyhow::anyhow;
use clap::ValueEnum;
use ndarray::{Array3, Array4, ArrayD, Axis, CowArray, Ix4};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};

use crate::error::PipelineError;

/// Which pair of human-readable labels a deployment uses. In both variants
/// the above-threshold class is the benign one and the sub-threshold class
/// is the one that gets a heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LabelPolarity {
    NormalAbnormal,
    CancerNonCancer,
}

impl LabelPolarity {
    /// Label for probabilities >= 0.5.
    pub fn high(self) -> &'static str {
        match self {
            LabelPolarity::NormalAbnormal => "Normal",
            LabelPolarity::CancerNonCancer => "Non-Cancerous",
        }
    }

    /// Label for probabilities < 0.5.
    pub fn low(self) -> &'static str {
        match self {
            LabelPolarity::NormalAbnormal => "Abnormal",
            LabelPolarity::CancerNonCancer => "Cancerous",
        }
    }
}

impl fmt::Display for LabelPolarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LabelPolarity::NormalAbnormal => "normal-abnormal",
            LabelPolarity::CancerNonCancer => "cancer-non-cancer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub probability: f32,
    pub confidence: f32,
    pub label: &'static str,
    /// True for the sub-threshold class, which is the one that gets a heatmap.
    pub flagged: bool,
}

impl Prediction {
    pub fn from_probability(probability: f32, polarity: LabelPolarity) -> Self {
        let probability = probability.clamp(0.0, 1.0);
        let flagged = probability < 0.5;
        Self {
            probability,
            confidence: if flagged { 1.0 - probability } else { probability },
            label: if flagged { polarity.low() } else { polarity.high() },
            flagged,
        }
    }
}

/// Names of the two outputs the exported classifier graph exposes, and the
/// layout of the feature-map output.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub probability_output: String,
    pub feature_output: String,
    /// True when the feature map comes out NHWC (Keras-style exports).
    pub channels_last: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            probability_output: String::from("probability"),
            feature_output: String::from("conv_features"),
            channels_last: true,
        }
    }
}

/// The pre-trained classifier: a frozen backbone feeding a small trained
/// head, exported as a single ONNX graph. Loaded once per process and shared
/// read-only across requests; `run` takes `&self` so the session is reentrant.
pub struct OnnxClassifier {
    session: Session,
    config: ModelConfig,
}

impl fmt::Debug for OnnxClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxClassifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn build_session(model_path: &str, cuda: bool) -> ort::Result<Session> {
    let provider = if cuda {
        [CUDAExecutionProvider::default().build().error_on_failure()]
    } else {
        [CPUExecutionProvider::default().build()]
    };
    SessionBuilder::new()?
        .with_execution_providers(provider)?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)
}

impl OnnxClassifier {
    pub fn load(model_path: &str, cuda: bool, config: ModelConfig) -> Result<Self, PipelineError> {
        let session =
            build_session(model_path, cuda).map_err(|e| PipelineError::ModelLoad(e.to_string()))?;
        log::info!("model loaded from {model_path}");
        Ok(Self { session, config })
    }

    fn run_output(&self, input: &Array4<f32>, name: &str) -> anyhow::Result<ArrayD<f32>> {
        let xs = CowArray::from(input.to_owned().into_dyn());
        let input_data = ort::inputs![xs.view()]?;
        let outputs = self.session.run(input_data)?;
        let (_, value) = outputs
            .iter()
            .find(|(key, _)| *key == name)
            .ok_or_else(|| anyhow!("model has no output named {name:?}"))?;
        Ok(value.try_extract_tensor::<f32>()?.into_owned())
    }

    /// Forward pass through the full model, returning the scalar probability.
    /// Deterministic for a fixed input and fixed weights (the exported graph
    /// is an inference graph, so dropout and batchnorm are frozen).
    pub fn predict(&self, input: &Array4<f32>) -> Result<f32, PipelineError> {
        let scores = self
            .run_output(input, &self.config.probability_output)
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        scores
            .iter()
            .copied()
            .next()
            .ok_or_else(|| PipelineError::Inference("empty probability output".into()))
    }

    /// Forward pass capturing the named late convolutional feature map,
    /// normalized to channels-first (C, H, W). Failures here only cost the
    /// heatmap, so they surface as saliency errors.
    pub fn features(&self, input: &Array4<f32>) -> Result<Array3<f32>, PipelineError> {
        let raw = self
            .run_output(input, &self.config.feature_output)
            .map_err(|e| PipelineError::Saliency(e.to_string()))?;
        let fixed = raw
            .into_dimensionality::<Ix4>()
            .map_err(|e| PipelineError::Saliency(format!("feature map is not 4D: {e}")))?;
        let map = fixed.index_axis_move(Axis(0), 0);
        if self.config.channels_last {
            // (H, W, C) -> (C, H, W)
            Ok(map.permuted_axes([2, 0, 1]).as_standard_layout().to_owned())
        } else {
            Ok(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_monotonic() {
        for i in 0..=100 {
            let p = i as f32 / 100.0;
            let pred = Prediction::from_probability(p, LabelPolarity::NormalAbnormal);
            if p >= 0.5 {
                assert_eq!(pred.label, "Normal");
                assert!(!pred.flagged);
            } else {
                assert_eq!(pred.label, "Abnormal");
                assert!(pred.flagged);
            }
            assert!((0.5..=1.0).contains(&pred.confidence));
        }
    }

    #[test]
    fn confidence_is_max_of_p_and_complement() {
        let pred = Prediction::from_probability(0.7, LabelPolarity::NormalAbnormal);
        assert!((pred.confidence - 0.7).abs() < f32::EPSILON);
        let pred = Prediction::from_probability(0.3, LabelPolarity::NormalAbnormal);
        assert!((pred.confidence - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn polarity_variants_keep_the_flagged_class_sub_threshold() {
        let pred = Prediction::from_probability(0.9, LabelPolarity::CancerNonCancer);
        assert_eq!(pred.label, "Non-Cancerous");
        assert!(!pred.flagged);
        let pred = Prediction::from_probability(0.1, LabelPolarity::CancerNonCancer);
        assert_eq!(pred.label, "Cancerous");
        assert!(pred.flagged);
    }

    #[test]
    fn out_of_range_probabilities_are_clamped() {
        let pred = Prediction::from_probability(1.5, LabelPolarity::NormalAbnormal);
        assert_eq!(pred.probability, 1.0);
        let pred = Prediction::from_probability(-0.5, LabelPolarity::NormalAbnormal);
        assert_eq!(pred.probability, 0.0);
        assert_eq!(pred.confidence, 1.0);
    }
}
