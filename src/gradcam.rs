use std::sync::OnceLock;

use ndarray::{Array1, Array2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::PipelineError;

/// Batchnorm epsilon; with fresh statistics the inference-mode layer reduces
/// to multiplication by 1/sqrt(1 + epsilon).
const BN_EPSILON: f32 = 1e-3;
/// Guards the final division when the rectified map is all zero.
const NORM_EPSILON: f32 = 1e-10;
const HIDDEN: usize = 32;

pub const DEFAULT_SEED: u64 = 17;

/// Replica of the classification head's architecture, used only to obtain a
/// gradient signal over the feature map. Its weights are freshly initialized,
/// NOT the trained head's weights, so the visualized attention approximates
/// the decision boundary rather than reproducing it. This is intentional: do
/// not wire the heatmap to the trained head without a product decision.
///
/// Architecture: flatten -> norm -> dense(32) -> norm -> relu -> dropout ->
/// dense(32) -> norm -> relu -> dropout -> dense(32) -> norm -> relu ->
/// dense(1, sigmoid). Dropout is identity at inference and is omitted.
#[derive(Debug)]
struct DenseHead {
    input_len: usize,
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
    w3: Array2<f32>,
    b3: Array1<f32>,
    w4: Array1<f32>,
    b4: f32,
}

fn glorot_uniform(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

impl DenseHead {
    fn init(input_len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let w1 = glorot_uniform(&mut rng, HIDDEN, input_len);
        let w2 = glorot_uniform(&mut rng, HIDDEN, HIDDEN);
        let w3 = glorot_uniform(&mut rng, HIDDEN, HIDDEN);
        let w4 = glorot_uniform(&mut rng, 1, HIDDEN).row(0).to_owned();
        Self {
            input_len,
            w1,
            b1: Array1::zeros(HIDDEN),
            w2,
            b2: Array1::zeros(HIDDEN),
            w3,
            b3: Array1::zeros(HIDDEN),
            w4,
            b4: 0.0,
        }
    }

    /// Forward the flattened feature map through the replica head and
    /// backpropagate the scalar sigmoid output, returning dP'/dx.
    fn input_gradient(&self, x: &Array1<f32>) -> Array1<f32> {
        let scale = 1.0 / (1.0 + BN_EPSILON).sqrt();

        let h0 = x.mapv(|v| v * scale);
        let s1 = (self.w1.dot(&h0) + &self.b1).mapv(|v| v * scale);
        let a1 = s1.mapv(|v| v.max(0.0));
        let s2 = (self.w2.dot(&a1) + &self.b2).mapv(|v| v * scale);
        let a2 = s2.mapv(|v| v.max(0.0));
        let s3 = (self.w3.dot(&a2) + &self.b3).mapv(|v| v * scale);
        let a3 = s3.mapv(|v| v.max(0.0));
        let z4 = self.w4.dot(&a3) + self.b4;
        let p = sigmoid(z4);

        let dz4 = p * (1.0 - p);
        let d3 = self.w4.mapv(|v| v * dz4);
        let d3 = &d3 * &s3.mapv(|v| if v > 0.0 { scale } else { 0.0 });
        let d2 = self.w3.t().dot(&d3);
        let d2 = &d2 * &s2.mapv(|v| if v > 0.0 { scale } else { 0.0 });
        let d1 = self.w2.t().dot(&d2);
        let d1 = &d1 * &s1.mapv(|v| if v > 0.0 { scale } else { 0.0 });
        self.w1.t().dot(&d1).mapv(|v| v * scale)
    }
}

/// Gradient-weighted class activation mapping over a captured convolutional
/// feature map. The head is initialized once per extractor from a fixed seed,
/// so repeat calls on the same feature map are bit-identical.
#[derive(Debug)]
pub struct GradCam {
    seed: u64,
    head: OnceLock<DenseHead>,
}

impl Default for GradCam {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl GradCam {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            head: OnceLock::new(),
        }
    }

    /// Compute a heatmap from a (C, H, W) feature map: backpropagate the
    /// replica head's output to the feature map, average the gradient
    /// spatially to get per-channel weights, rectify the channel-weighted sum
    /// and normalize by its maximum. Output is H x W in [0,1].
    pub fn heatmap(&self, features: ArrayView3<f32>) -> Result<Array2<f32>, PipelineError> {
        let (c, h, w) = features.dim();
        let n = c * h * w;
        if n == 0 {
            return Err(PipelineError::Saliency("empty feature map".into()));
        }

        let head = self.head.get_or_init(|| DenseHead::init(n, self.seed));
        if head.input_len != n {
            return Err(PipelineError::Saliency(format!(
                "feature map has {n} elements, head expects {}",
                head.input_len
            )));
        }

        let flat = Array1::from_iter(features.iter().copied());
        let grad = head
            .input_gradient(&flat)
            .into_shape_with_order((c, h, w))
            .map_err(|e| PipelineError::Saliency(e.to_string()))?;

        let mut cam = Array2::<f32>::zeros((h, w));
        for ci in 0..c {
            let weight = grad.index_axis(Axis(0), ci).mean().unwrap_or(0.0);
            let channel = features.index_axis(Axis(0), ci);
            cam.zip_mut_with(&channel, |acc, &v| *acc += weight * v);
        }

        cam.mapv_inplace(|v| v.max(0.0));
        let max = cam.iter().cloned().fold(0.0f32, f32::max);
        cam.mapv_inplace(|v| v / (max + NORM_EPSILON));
        Ok(cam)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn synthetic_features(c: usize, h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((c, h, w), |(ci, y, x)| {
            ((ci * 31 + y * 7 + x * 3) % 13) as f32 / 13.0
        })
    }

    #[test]
    fn heatmap_shape_and_range() {
        let extractor = GradCam::default();
        let features = synthetic_features(8, 7, 7);
        let cam = extractor.heatmap(features.view()).unwrap();
        assert_eq!(cam.dim(), (7, 7));
        assert!(cam.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn maximum_normalizes_to_one_unless_rectified_to_zero() {
        let extractor = GradCam::default();
        let features = synthetic_features(8, 7, 7);
        let cam = extractor.heatmap(features.view()).unwrap();
        let max = cam.iter().cloned().fold(0.0f32, f32::max);
        // Post-normalization the peak is 1.0, except when the rectified map
        // was entirely zero (epsilon-guarded division).
        assert!(max > 0.999 || cam.iter().all(|&v| v == 0.0), "max was {max}");
    }

    #[test]
    fn repeat_calls_are_bit_identical() {
        let extractor = GradCam::default();
        let features = synthetic_features(16, 5, 5);
        let first = extractor.heatmap(features.view()).unwrap();
        let second = extractor.heatmap(features.view()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fixed_seed_is_reproducible_across_extractors() {
        let features = synthetic_features(4, 6, 6);
        let a = GradCam::new(99).heatmap(features.view()).unwrap();
        let b = GradCam::new(99).heatmap(features.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn all_zero_features_stay_zero() {
        let extractor = GradCam::default();
        let features = Array3::<f32>::zeros((8, 7, 7));
        let cam = extractor.heatmap(features.view()).unwrap();
        assert!(cam.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_feature_map_is_rejected() {
        let extractor = GradCam::default();
        let features = Array3::<f32>::zeros((0, 7, 7));
        assert!(matches!(
            extractor.heatmap(features.view()),
            Err(PipelineError::Saliency(_))
        ));
    }

    #[test]
    fn feature_size_must_match_the_initialized_head() {
        let extractor = GradCam::default();
        extractor.heatmap(synthetic_features(8, 7, 7).view()).unwrap();
        let err = extractor
            .heatmap(synthetic_features(4, 7, 7).view())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Saliency(_)));
    }
}
