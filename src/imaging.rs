//! Deterministic image preprocessing for OCR.
//!
//! Operates on the in-memory capture. Steps run in a fixed order, each gated
//! by its config flag: ROI crop, greyscale, contrast, brightness, noise
//! reduction, sharpen, scale, binary threshold. No randomness anywhere —
//! the same input bytes and settings always produce the same output bytes.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, GrayImage, ImageFormat, Luma};

use crate::config::{PreprocessConfig, RoiConfig};
use crate::error::{Categorized, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("empty region of interest ({0}×{1} px)")]
    EmptyRoi(u32, u32),
}

impl Categorized for ImagingError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Parse
    }
}

/// Effective ROI in pixels, after percent→pixel conversion and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Output of the preprocess pipeline.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// PNG-encoded processed image handed to the OCR provider.
    pub bytes: Vec<u8>,
    /// The pixel rectangle the ROI percentages resolved to.
    pub roi_px: PixelRect,
    /// Fraction of lit pixels in the ROI; below ~5% the display is blank.
    pub ink_ratio: f64,
}

/// Run the preprocess pipeline over a captured frame.
pub fn preprocess(
    input: &[u8],
    cfg: &PreprocessConfig,
    roi: &RoiConfig,
) -> Result<Preprocessed, ImagingError> {
    let decoded = image::load_from_memory(input)?;

    let roi_px = resolve_roi(decoded.width(), decoded.height(), roi);
    if roi_px.width == 0 || roi_px.height == 0 {
        return Err(ImagingError::EmptyRoi(roi_px.width, roi_px.height));
    }
    let mut img = decoded.crop_imm(roi_px.x, roi_px.y, roi_px.width, roi_px.height);

    if cfg.grayscale {
        img = DynamicImage::ImageLuma8(img.to_luma8());
    }
    if cfg.contrast_enabled {
        // Factor 1.0 leaves the image unchanged.
        img = img.adjust_contrast(((cfg.contrast_factor - 1.0) * 100.0) as f32);
    }
    if cfg.brightness_enabled {
        img = img.brighten(cfg.brightness_offset as i32);
    }
    if cfg.noise_reduction {
        img = DynamicImage::ImageLuma8(median3x3(&img.to_luma8()));
    }
    if cfg.sharpen {
        img = img.filter3x3(&[0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0]);
    }
    if cfg.scale_enabled && (cfg.scale_factor - 1.0).abs() > f64::EPSILON {
        let w = ((f64::from(img.width()) * cfg.scale_factor).round() as u32).max(1);
        let h = ((f64::from(img.height()) * cfg.scale_factor).round() as u32).max(1);
        img = img.resize_exact(w, h, FilterType::Triangle);
    }

    // Ink ratio is measured against the configured threshold whether or not
    // the binarized image is what gets handed to OCR.
    let luma = img.to_luma8();
    let lit = luma
        .pixels()
        .filter(|p| p.0[0] >= cfg.threshold_value)
        .count();
    let ink_ratio = lit as f64 / f64::from(luma.width() * luma.height());

    if cfg.threshold_enabled {
        let mut bin = luma;
        for pixel in bin.pixels_mut() {
            pixel.0[0] = if pixel.0[0] >= cfg.threshold_value { 255 } else { 0 };
        }
        img = DynamicImage::ImageLuma8(bin);
    }

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

    Ok(Preprocessed {
        bytes,
        roi_px,
        ink_ratio,
    })
}

/// Convert the percent-based ROI to pixels, clamped to the frame.
fn resolve_roi(frame_w: u32, frame_h: u32, roi: &RoiConfig) -> PixelRect {
    let x = ((f64::from(frame_w) * roi.x_percent / 100.0).round() as u32).min(frame_w.saturating_sub(1));
    let y = ((f64::from(frame_h) * roi.y_percent / 100.0).round() as u32).min(frame_h.saturating_sub(1));
    let width = ((f64::from(frame_w) * roi.width_percent / 100.0).round() as u32)
        .min(frame_w - x)
        .max(1);
    let height = ((f64::from(frame_h) * roi.height_percent / 100.0).round() as u32)
        .min(frame_h - y)
        .max(1);
    PixelRect { x, y, width, height }
}

/// 3×3 median filter with edge replication.
fn median3x3(src: &GrayImage) -> GrayImage {
    let (w, h) = src.dimensions();
    let mut out = GrayImage::new(w, h);
    let mut window = [0u8; 9];

    for y in 0..h {
        for x in 0..w {
            let mut i = 0;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let sx = (i64::from(x) + dx).clamp(0, i64::from(w) - 1) as u32;
                    let sy = (i64::from(y) + dy).clamp(0, i64::from(h) - 1) as u32;
                    window[i] = src.get_pixel(sx, sy).0[0];
                    i += 1;
                }
            }
            window.sort_unstable();
            out.put_pixel(x, y, Luma([window[4]]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 100×100 frame: dark background with a lit 20×10 block at (40, 45).
    fn test_frame() -> Vec<u8> {
        let mut img = GrayImage::from_pixel(100, 100, Luma([10]));
        for y in 45..55 {
            for x in 40..60 {
                img.put_pixel(x, y, Luma([240]));
            }
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn full_frame_roi() -> RoiConfig {
        RoiConfig {
            x_percent: 0.0,
            y_percent: 0.0,
            width_percent: 100.0,
            height_percent: 100.0,
        }
    }

    #[test]
    fn test_deterministic_output() {
        let frame = test_frame();
        let cfg = PreprocessConfig::default();
        let roi = full_frame_roi();
        let a = preprocess(&frame, &cfg, &roi).unwrap();
        let b = preprocess(&frame, &cfg, &roi).unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.ink_ratio, b.ink_ratio);
        assert_eq!(a.roi_px, b.roi_px);
    }

    #[test]
    fn test_roi_resolution() {
        let roi = RoiConfig {
            x_percent: 30.0,
            y_percent: 40.0,
            width_percent: 40.0,
            height_percent: 20.0,
        };
        let rect = resolve_roi(200, 100, &roi);
        assert_eq!(rect, PixelRect { x: 60, y: 40, width: 80, height: 20 });
    }

    #[test]
    fn test_ink_ratio_reflects_lit_block() {
        let frame = test_frame();
        let mut cfg = PreprocessConfig::default();
        cfg.scale_enabled = false;
        let out = preprocess(&frame, &cfg, &full_frame_roi()).unwrap();
        // 20×10 lit block over 100×100 = 2% lit.
        assert!((out.ink_ratio - 0.02).abs() < 0.005, "ink={}", out.ink_ratio);
    }

    #[test]
    fn test_blank_frame_has_near_zero_ink() {
        let img = GrayImage::from_pixel(50, 50, Luma([5]));
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let out = preprocess(&bytes, &PreprocessConfig::default(), &full_frame_roi()).unwrap();
        assert!(out.ink_ratio < 0.01);
    }

    #[test]
    fn test_scale_changes_dimensions() {
        let frame = test_frame();
        let mut cfg = PreprocessConfig::default();
        cfg.scale_enabled = true;
        cfg.scale_factor = 2.0;
        cfg.threshold_enabled = false;
        let out = preprocess(&frame, &cfg, &full_frame_roi()).unwrap();
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 200);
    }

    #[test]
    fn test_median_filter_removes_salt_noise() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([0]));
        img.put_pixel(4, 4, Luma([255])); // lone bright pixel
        let filtered = median3x3(&img);
        assert_eq!(filtered.get_pixel(4, 4).0[0], 0);
    }
}
