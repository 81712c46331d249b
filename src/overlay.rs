use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array2;

use crate::error::PipelineError;

/// Opacity of the color-mapped heatmap layer; the original keeps the rest.
pub const HEATMAP_ALPHA: f32 = 0.4;
/// File name offered for the downloadable overlay.
pub const DOWNLOAD_FILENAME: &str = "xvision_analysis.png";

/// Jet-style gradient via 5 anchors: blue -> cyan -> green -> yellow -> red.
fn colormap(val01: f32) -> Rgb<u8> {
    const C: [(f32, [u8; 3]); 5] = [
        (0.0, [0, 0, 255]),
        (0.25, [0, 255, 255]),
        (0.50, [0, 255, 0]),
        (0.75, [255, 255, 0]),
        (1.0, [255, 0, 0]),
    ];
    let x = val01.clamp(0.0, 1.0);
    let mut i = 0;
    while i + 1 < C.len() && x > C[i + 1].0 {
        i += 1;
    }
    let (x0, c0) = C[i];
    let (x1, c1) = C[i.min(C.len() - 2) + 1];
    let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
    let lerp = |a: u8, b: u8| -> u8 { (a as f32 + t * (b as f32 - a as f32)).round() as u8 };
    Rgb([lerp(c0[0], c1[0]), lerp(c0[1], c1[1]), lerp(c0[2], c1[2])])
}

/// Bilinear sample of an H x W scalar field at (u, v) in cell coordinates,
/// clamped to the field's interior.
fn bilinear_sample(field: &Array2<f32>, u: f32, v: f32) -> f32 {
    let (fh, fw) = field.dim();
    let uu = u.min(fw as f32 - 1.0001).max(0.0);
    let vv = v.min(fh as f32 - 1.0001).max(0.0);
    let x0 = uu.floor().max(0.0) as usize;
    let y0 = vv.floor().max(0.0) as usize;
    let x1 = (x0 + 1).min(fw - 1);
    let y1 = (y0 + 1).min(fh - 1);
    let dx = uu - x0 as f32;
    let dy = vv - y0 as f32;
    let f00 = field[[y0, x0]];
    let f10 = field[[y0, x1]];
    let f01 = field[[y1, x0]];
    let f11 = field[[y1, x1]];
    let f0 = f00 * (1.0 - dx) + f10 * dx;
    let f1 = f01 * (1.0 - dx) + f11 * dx;
    f0 * (1.0 - dy) + f1 * dy
}

/// Upsample the heatmap to the original image's resolution, color-map it, and
/// alpha-blend it over the original in RGB. Output dimensions always equal
/// the input image's.
pub fn render(original: &DynamicImage, heatmap: &Array2<f32>) -> Result<RgbImage, PipelineError> {
    let base = original.to_rgb8();
    let (w, h) = base.dimensions();
    if heatmap.is_empty() {
        return Err(PipelineError::Overlay("empty heatmap".into()));
    }
    if w == 0 || h == 0 {
        return Err(PipelineError::Overlay("zero-sized original image".into()));
    }

    let (fh, fw) = heatmap.dim();
    let mut out = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let u = (x as f32 / w as f32) * fw as f32;
            let v = (y as f32 / h as f32) * fh as f32;
            let heat = bilinear_sample(heatmap, u, v);
            let Rgb([hr, hg, hb]) = colormap(heat);
            let Rgb([br, bg, bb]) = *base.get_pixel(x, y);
            let a = HEATMAP_ALPHA;
            out.put_pixel(
                x,
                y,
                Rgb([
                    (a * hr as f32 + (1.0 - a) * br as f32).round() as u8,
                    (a * hg as f32 + (1.0 - a) * bg as f32).round() as u8,
                    (a * hb as f32 + (1.0 - a) * bb as f32).round() as u8,
                ]),
            );
        }
    }
    Ok(out)
}

/// Encode the overlay as the downloadable PNG byte stream.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| PipelineError::Overlay(e.to_string()))?;
    Ok(buf.into_inner())
}
