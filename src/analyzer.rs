use image::{DynamicImage, RgbImage};
use ndarray::Array2;

use crate::error::PipelineError;
use crate::gradcam::{self, GradCam};
use crate::model::{LabelPolarity, ModelConfig, OnnxClassifier, Prediction};
use crate::overlay;
use crate::preprocess::{PreprocessConfig, Preprocessor};

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub cuda: bool,
    pub polarity: LabelPolarity,
    pub model: ModelConfig,
    pub seed: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            cuda: false,
            polarity: LabelPolarity::NormalAbnormal,
            model: ModelConfig::default(),
            seed: gradcam::DEFAULT_SEED,
        }
    }
}

/// Result of one scan analysis. The heatmap and overlay are only present for
/// the flagged class and only when their stages succeeded; their absence is
/// not an error for the request as a whole.
#[derive(Debug)]
pub struct ScanReport {
    pub prediction: Prediction,
    pub heatmap: Option<Array2<f32>>,
    pub overlay: Option<RgbImage>,
}

/// The per-process analysis pipeline: owns the loaded session, the
/// preprocessor, and the saliency extractor. Constructed once at startup and
/// shared read-only across requests; `analyze` is reentrant.
#[derive(Debug)]
pub struct Analyzer {
    classifier: OnnxClassifier,
    preprocessor: Preprocessor,
    extractor: GradCam,
    polarity: LabelPolarity,
}

impl Analyzer {
    /// Load the model from disk. Failure here is fatal: the process cannot
    /// serve predictions without a model.
    pub fn from_file(model_path: &str, config: AnalyzerConfig) -> Result<Self, PipelineError> {
        let classifier = OnnxClassifier::load(model_path, config.cuda, config.model)?;
        Ok(Self {
            classifier,
            preprocessor: Preprocessor::new(PreprocessConfig::default()),
            extractor: GradCam::new(config.seed),
            polarity: config.polarity,
        })
    }

    /// Run the full pipeline on one decoded image. The prediction and the
    /// heatmap are derived from the same tensor. Saliency and overlay are
    /// invoked only for the flagged class, and their failures degrade to a
    /// report without a heatmap rather than failing the request.
    pub fn analyze(&self, image: &DynamicImage) -> Result<ScanReport, PipelineError> {
        let tensor = self.preprocessor.preprocess(image)?;
        let probability = self.classifier.predict(&tensor)?;
        let prediction = Prediction::from_probability(probability, self.polarity);
        log::info!(
            "prediction: {} (p={:.4}, confidence={:.1}%)",
            prediction.label,
            prediction.probability,
            prediction.confidence * 100.0
        );

        let mut heatmap = None;
        let mut overlay_img = None;
        if prediction.flagged {
            match self
                .classifier
                .features(&tensor)
                .and_then(|f| self.extractor.heatmap(f.view()))
            {
                Ok(map) => {
                    match overlay::render(image, &map) {
                        Ok(img) => overlay_img = Some(img),
                        Err(e) => log::warn!("{e}"),
                    }
                    heatmap = Some(map);
                }
                Err(e) => log::warn!("{e}"),
            }
        }

        Ok(ScanReport {
            prediction,
            heatmap,
            overlay: overlay_img,
        })
    }
}
