use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::DynamicImage;
use ndarray::Array4;

use crate::error::PipelineError;

#[derive(Debug)]
pub struct PreprocessConfig {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            height: 224,
            width: 224,
            channels: 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct Preprocessor {
    pub config: PreprocessConfig,
}

/// Decode uploaded bytes into an image. DICOM uploads are accepted by
/// extension only and go through the same generic decoders.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(bytes).map_err(|e| PipelineError::Preprocess(e.to_string()))
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Convert a decoded image into the tensor the classifier expects:
    /// RGB, direct resize to width x height (aspect ratio is not preserved),
    /// scaled to [0,1], leading batch dimension of 1. Output layout is NHWC.
    pub fn preprocess(&self, x: &DynamicImage) -> Result<Array4<f32>, PipelineError> {
        let (w, h) = (self.config.width, self.config.height);
        let src = DynamicImage::ImageRgb8(x.to_rgb8());

        let mut dst = Image::new(w as u32, h as u32, PixelType::U8x3);
        let mut resizer = Resizer::new();
        let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
        resizer
            .resize(&src, &mut dst, Some(&options))
            .map_err(|e| PipelineError::Preprocess(e.to_string()))?;

        let mut tensor = Array4::<f32>::zeros((1, h, w, self.config.channels));
        for (i, rgb) in dst.buffer().chunks_exact(3).enumerate() {
            let y = i / w;
            let x = i % w;
            tensor[[0, y, x, 0]] = rgb[0] as f32 / 255.0;
            tensor[[0, y, x, 1]] = rgb[1] as f32 / 255.0;
            tensor[[0, y, x, 2]] = rgb[2] as f32 / 255.0;
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid_gray(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([128, 128, 128])))
    }

    #[test]
    fn output_shape_and_range() {
        let pre = Preprocessor::default();
        let tensor = pre.preprocess(&solid_gray(300, 400)).unwrap();
        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn uniform_input_stays_uniform() {
        let pre = Preprocessor::default();
        let tensor = pre.preprocess(&solid_gray(300, 400)).unwrap();
        let first = tensor[[0, 0, 0, 0]];
        assert!(tensor.iter().all(|&v| (v - first).abs() < 1e-6));
    }

    #[test]
    fn arbitrary_resolutions_are_distorted_to_fixed_size() {
        let pre = Preprocessor::default();
        for (w, h) in [(1u32, 1u32), (224, 224), (1920, 1080), (17, 503)] {
            let tensor = pre.preprocess(&solid_gray(w, h)).unwrap();
            assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        }
    }

    #[test]
    fn corrupt_upload_is_a_caught_error() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(_)));
        assert!(!err.is_fatal());
    }
}
