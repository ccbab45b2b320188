//! Frame type and pixel conversion — YUYV/GREY to RGB, dark-frame detection.

use image::RgbImage;

/// A captured camera frame in packed RGB8.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from RGB data, classifying it as dark or not.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, 0.95);
        Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        }
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.data.len() / 3;
        if pixels == 0 {
            return 0.0;
        }
        self.data
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]) as f32)
            .sum::<f32>()
            / pixels as f32
    }

    /// Convert into an `image` buffer. Fails if the data length does not match the dimensions.
    pub fn into_image(self) -> Result<RgbImage, FrameError> {
        let expected = (self.width * self.height * 3) as usize;
        let actual = self.data.len();
        RgbImage::from_raw(self.width, self.height, self.data)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// BT.601 luma of one RGB pixel.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 studio-swing coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let d = quad[1] as i32 - 128;
        let e = quad[3] as i32 - 128;
        for y in [quad[0], quad[2]] {
            let c = y as i32 - 16;
            rgb.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
        }
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB by replicating the channel.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    Ok(gray[..expected].iter().flat_map(|&p| [p, p, p]).collect())
}

/// Check if an RGB frame is dark.
///
/// Returns true if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(rgb: &[u8], threshold_pct: f32) -> bool {
    let pixels = rgb.len() / 3;
    if pixels == 0 {
        return true;
    }
    let dark_count = rgb
        .chunks_exact(3)
        .filter(|px| luma(px[0], px[1], px[2]) < 32)
        .count();
    (dark_count as f32 / pixels as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        // 2x1 image, U=V=128 so every pixel is a shade of grey
        let yuyv = vec![235, 128, 16, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_yuyv_to_rgb_midtone() {
        let yuyv = vec![126, 128, 126, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.len(), 6);
        assert!(rgb.iter().all(|&c| c == 128), "got {rgb:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[10, 200], 2, 1).unwrap();
        assert_eq!(rgb, vec![10, 10, 10, 200, 200, 200]);
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&vec![0u8; 3000], 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&vec![128u8; 3000], 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → should NOT be dark
        let mut rgb = vec![10u8; 940 * 3];
        rgb.extend(vec![128u8; 60 * 3]);
        assert!(!is_dark_frame(&rgb, 0.95));
    }

    #[test]
    fn test_into_image_checks_dimensions() {
        let frame = Frame::from_rgb(vec![0u8; 5], 2, 1, 0);
        assert!(frame.into_image().is_err());

        let frame = Frame::from_rgb(vec![200u8; 6], 2, 1, 7);
        assert!(!frame.is_dark);
        assert!((frame.avg_brightness() - 200.0).abs() < 1.0);
        let img = frame.into_image().unwrap();
        assert_eq!(img.dimensions(), (2, 1));
    }
}
