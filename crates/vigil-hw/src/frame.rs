//! Frame type and image helpers: pixel format conversion, downscaling,
//! cropping and annotation.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::time::Instant;
use vigil_core::BoundingBox;

/// A captured colour camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: Instant,
    /// Producer-assigned sequence number, increasing by one per captured frame.
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    let rgb = gray[..expected].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: gray.len(),
    })
}

/// Decode a Motion-JPEG buffer.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)?.to_rgb8())
}

/// Resize by `factor` on both axes. Factors of 1.0 or more return a copy.
pub fn downscale(image: &RgbImage, factor: f64) -> RgbImage {
    if factor >= 1.0 {
        return image.clone();
    }
    let w = ((image.width() as f64 * factor).round() as u32).max(1);
    let h = ((image.height() as f64 * factor).round() as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

/// Copy out the part of `bbox` that lies inside the image.
pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let region = bbox.clamp(image.width(), image.height())?;
    Some(
        imageops::crop_imm(
            image,
            region.left as u32,
            region.top as u32,
            region.width() as u32,
            region.height() as u32,
        )
        .to_image(),
    )
}

/// Draw a rectangle outline of the given thickness, clipped to the image.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let Some(region) = bbox.clamp(image.width(), image.height()) else {
        return;
    };
    let (left, top) = (region.left as u32, region.top as u32);
    let (right, bottom) = (region.right as u32, region.bottom as u32);
    let t = thickness.max(1);

    for y in top..bottom {
        for x in left..right {
            let on_edge = y < top + t || y + t >= bottom || x < left + t || x + t >= right;
            if on_edge {
                image.put_pixel(x, y, color);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_greys() {
        // 2x1 image: black and white at neutral chroma
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_yuyv_to_rgb_dimensions() {
        let yuyv = vec![126u8; 4 * 2 * 2];
        let rgb = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(rgb.get_pixel(3, 1)[0], rgb.get_pixel(3, 1)[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(matches!(
            yuyv_to_rgb(&yuyv, 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([7, 7, 7]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([200, 200, 200]));
        assert!(grey_to_rgb(&[1], 2, 1).is_err());
    }

    #[test]
    fn test_downscale_quarter() {
        let img = RgbImage::new(640, 480);
        assert_eq!(downscale(&img, 0.25).dimensions(), (160, 120));
        assert_eq!(downscale(&img, 1.0).dimensions(), (640, 480));
        assert_eq!(downscale(&RgbImage::new(2, 2), 0.1).dimensions(), (1, 1));
    }

    #[test]
    fn test_crop_clips_to_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([9, 9, 9]));
        let face = crop(&img, &BoundingBox::new(-10, 120, 30, 80)).unwrap();
        assert_eq!(face.dimensions(), (20, 30));
        assert!(crop(&img, &BoundingBox::new(60, 200, 90, 150)).is_none());
    }

    #[test]
    fn test_draw_box_outline_only() {
        let mut img = RgbImage::new(20, 20);
        let red = Rgb([255, 0, 0]);
        draw_box(&mut img, &BoundingBox::new(5, 15, 15, 5), red, 2);
        assert_eq!(img.get_pixel(5, 5), &red);
        assert_eq!(img.get_pixel(14, 14), &red);
        assert_eq!(img.get_pixel(10, 10), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(2, 2), &Rgb([0, 0, 0]));
    }
}
