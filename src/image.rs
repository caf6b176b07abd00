//! Frame encoding: downscale + JPEG + base64

use crate::error::EncodeError;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    /// Longest edge after downscaling; 0 keeps the source size
    pub max_dimension: u32,
    pub quality: u8, // 1-100
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_dimension: 1024,
            quality: 85,
        }
    }
}

pub struct ImageEncoder {
    config: ImageConfig,
}

impl ImageEncoder {
    pub fn new(config: ImageConfig) -> Self {
        Self { config }
    }

    /// Target size preserving aspect ratio, never upscaling.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let max = self.config.max_dimension;
        let longest = width.max(height);
        if max == 0 || longest <= max {
            return (width, height);
        }
        let scale = max as f64 / longest as f64;
        let w = ((width as f64 * scale).round() as u32).max(1);
        let h = ((height as f64 * scale).round() as u32).max(1);
        (w, h)
    }

    /// Downscale with fast_image_resize when the frame exceeds `max_dimension`.
    pub fn resize(&self, img: &RgbImage) -> Result<RgbImage, EncodeError> {
        let (width, height) = img.dimensions();
        let (dst_w, dst_h) = self.target_size(width, height);
        if (dst_w, dst_h) == (width, height) {
            return Ok(img.clone());
        }

        use fast_image_resize as fr;
        use fr::images::Image as FrImage;

        let src_image = FrImage::from_vec_u8(
            width,
            height,
            img.as_raw().clone(),
            fr::PixelType::U8x3,
        ).map_err(|e| EncodeError::InvalidBuffer(format!("{:?}", e)))?;

        let mut dst_image = FrImage::new(dst_w, dst_h, src_image.pixel_type());

        let mut resizer = fr::Resizer::new();
        resizer.resize(&src_image, &mut dst_image, None)
            .map_err(|e| EncodeError::Resize(format!("{:?}", e)))?;

        RgbImage::from_raw(dst_w, dst_h, dst_image.buffer().to_vec())
            .ok_or_else(|| EncodeError::InvalidBuffer("resized buffer size mismatch".to_string()))
    }

    pub fn encode_jpeg(&self, img: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        let resized = self.resize(img)?;
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.config.quality.clamp(1, 100));
        encoder.encode(
            resized.as_raw(),
            resized.width(),
            resized.height(),
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }

    /// JPEG bytes as standard base64, safe for JSON text frames.
    pub fn encode_base64(&self, img: &RgbImage) -> Result<String, EncodeError> {
        let jpeg = self.encode_jpeg(img)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }

    /// `data:` URL for multimodal chat requests.
    pub fn encode_data_url(&self, img: &RgbImage) -> Result<String, EncodeError> {
        Ok(format!("data:image/jpeg;base64,{}", self.encode_base64(img)?))
    }
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(ImageConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    #[test]
    fn test_target_size_keeps_aspect() {
        let encoder = ImageEncoder::new(ImageConfig { max_dimension: 640, quality: 80 });
        assert_eq!(encoder.target_size(1920, 1080), (640, 360));
        assert_eq!(encoder.target_size(1080, 1920), (360, 640));
        assert_eq!(encoder.target_size(320, 240), (320, 240));
    }

    #[test]
    fn test_zero_max_dimension_disables_resize() {
        let encoder = ImageEncoder::new(ImageConfig { max_dimension: 0, quality: 80 });
        assert_eq!(encoder.target_size(4000, 3000), (4000, 3000));
    }

    #[test]
    fn test_resize_downscales() {
        let encoder = ImageEncoder::new(ImageConfig { max_dimension: 32, quality: 80 });
        let out = encoder.resize(&gradient(64, 48)).unwrap();
        assert_eq!(out.dimensions(), (32, 24));
    }

    #[test]
    fn test_jpeg_has_soi_marker() {
        let encoder = ImageEncoder::default();
        let jpeg = encoder.encode_jpeg(&gradient(16, 16)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_data_url_prefix() {
        let encoder = ImageEncoder::default();
        let url = encoder.encode_data_url(&gradient(8, 8)).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,/9j/"));
    }
}
