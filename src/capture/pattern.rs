use anyhow::{Result, bail};
use image::{Rgba, RgbaImage};

use crate::capture::CaptureSource;

/// Number of synthetic camera devices exposed by [`crate::capture::available_sources`]
pub const PATTERN_DEVICES: u32 = 2;

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
];

/// Synthetic camera: colour bars with a sweeping line so consecutive frames differ
pub struct PatternSource {
    id: String,
    width: u32,
    height: u32,
    frame_i: u64,
    active: bool,
}

impl PatternSource {
    pub fn new(index: u32, width: u32, height: u32) -> Self {
        Self {
            id: pattern_id(index),
            width: width.max(1),
            height: height.max(1),
            frame_i: 0,
            active: true,
        }
    }
}

pub fn pattern_id(index: u32) -> String {
    format!("test-pattern:{}", index)
}

impl CaptureSource for PatternSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn current_frame(&mut self) -> Result<RgbaImage> {
        if !self.active {
            bail!("{} has been released", self.id);
        }
        let (w, h) = (self.width, self.height);
        let sweep = (self.frame_i * 8 % u64::from(w)) as u32;
        self.frame_i += 1;

        Ok(RgbaImage::from_fn(w, h, |x, y| {
            if x == sweep || y == h / 2 {
                return Rgba([255, 255, 255, 255]);
            }
            let [r, g, b] = BARS[(x as usize * BARS.len()) / w as usize];
            Rgba([r, g, b, 255])
        }))
    }

    fn release(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_have_requested_size_and_move() {
        let mut source = PatternSource::new(0, 64, 48);
        assert_eq!(source.id(), "test-pattern:0");
        let first = source.current_frame().unwrap();
        let second = source.current_frame().unwrap();
        assert_eq!(first.dimensions(), (64, 48));
        assert_ne!(first, second);
    }

    #[test]
    fn test_released_source_produces_nothing() {
        let mut source = PatternSource::new(1, 16, 16);
        source.release();
        assert!(!source.is_active());
        assert!(source.current_frame().is_err());
    }
}
