use anyhow::{Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, RgbaImage};

use crate::pipeline::EncodedFrame;

/// JPEG quality on a 0-100 scale (0.7 in browser terms)
pub const DEFAULT_QUALITY: u8 = 70;

/// Encodes captured frames to fixed-size JPEG images
pub struct FrameEncoder {
    width: u32,
    height: u32,
    quality: u8,
    sequence: u64,
}

impl FrameEncoder {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            quality: quality.clamp(1, 100),
            sequence: 0,
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Draw `frame` onto the output raster and compress it
    ///
    /// Frames of a different size are stretched to the output resolution.
    pub fn encode(&mut self, frame: &RgbaImage) -> Result<EncodedFrame> {
        let rgb = if frame.dimensions() == (self.width, self.height) {
            DynamicImage::ImageRgba8(frame.clone()).into_rgb8()
        } else {
            let scaled = imageops::resize(frame, self.width, self.height, FilterType::Triangle);
            DynamicImage::ImageRgba8(scaled).into_rgb8()
        };

        // Typical 640x480 frame at q70 is ~30-60KB
        let mut out = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(rgb.as_raw(), self.width, self.height, ExtendedColorType::Rgb8)
            .context("JPEG encoding failed")?;

        let sequence = self.sequence;
        self.sequence += 1;

        Ok(EncodedFrame::jpeg(
            Bytes::from(out),
            self.width,
            self.height,
            sequence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JPEG_MIME;
    use image::{GenericImageView, Rgba};

    #[test]
    fn test_encodes_jpeg_at_output_size() {
        let mut encoder = FrameEncoder::new(64, 48, DEFAULT_QUALITY);
        assert_eq!(encoder.resolution(), (64, 48));
        let frame = RgbaImage::from_pixel(100, 100, Rgba([10, 200, 30, 255]));

        let encoded = encoder.encode(&frame).unwrap();
        assert_eq!(encoded.mime, JPEG_MIME);
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);
        assert_eq!((encoded.width, encoded.height), (64, 48));

        let decoded = image::load_from_memory(&encoded.data).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut encoder = FrameEncoder::new(8, 8, DEFAULT_QUALITY);
        let frame = RgbaImage::new(8, 8);
        assert_eq!(encoder.encode(&frame).unwrap().sequence, 0);
        assert_eq!(encoder.encode(&frame).unwrap().sequence, 1);
    }
}
