//! Video-file capture backed by a directory of decoded frames
//!
//! Frames are played back at a fixed rate from the moment the source is
//! opened, like a video element that starts playing on load. Once the last
//! frame has been shown the source becomes inactive unless it loops.

use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use std::io;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

use crate::capture::CaptureSource;
use crate::error::DeviceError;

const FRAME_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct SequenceSource {
    id: String,
    frames: Vec<PathBuf>,
    fps: f64,
    looping: bool,
    width: u32,
    height: u32,
    started: Instant,
    cached: Option<(usize, RgbaImage)>,
    released: bool,
}

impl SequenceSource {
    /// Open the frames found in `dir`, sorted by file name
    pub fn open(dir: &Path, fps: f64, looping: bool) -> Result<Self, DeviceError> {
        let id = dir.display().to_string();
        let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DeviceError::NotFound(id.clone()),
            io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(id.clone()),
            _ => DeviceError::Unusable {
                id: id.clone(),
                reason: e.to_string(),
            },
        })?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_frame_file(path))
            .collect();
        frames.sort();

        let Some(first) = frames.first() else {
            return Err(DeviceError::Unusable {
                id,
                reason: "no image frames found".into(),
            });
        };
        let (width, height) =
            image::image_dimensions(first).map_err(|e| DeviceError::Unusable {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        if !(fps.is_finite() && fps > 0.0) {
            return Err(DeviceError::Unusable {
                id,
                reason: format!("invalid playback rate {}", fps),
            });
        }

        log::info!(
            "SequenceSource: {} frames from {} ({}x{} @ {} fps)",
            frames.len(),
            id,
            width,
            height,
            fps
        );

        Ok(Self {
            id,
            frames,
            fps,
            looping,
            width,
            height,
            started: Instant::now(),
            cached: None,
            released: false,
        })
    }

    /// Index of the frame at the current playback position, `None` once ended
    fn position(&self) -> Option<usize> {
        if self.released {
            return None;
        }
        let index = (self.started.elapsed().as_secs_f64() * self.fps) as usize;
        if index < self.frames.len() {
            Some(index)
        } else if self.looping {
            Some(index % self.frames.len())
        } else {
            None
        }
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                FRAME_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
}

impl CaptureSource for SequenceSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_active(&self) -> bool {
        self.position().is_some()
    }

    fn current_frame(&mut self) -> Result<RgbaImage> {
        let index = self
            .position()
            .ok_or_else(|| anyhow!("{} has ended", self.id))?;

        if let Some((cached, frame)) = &self.cached
            && *cached == index
        {
            return Ok(frame.clone());
        }

        let path = &self.frames[index];
        let frame = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgba8();
        self.cached = Some((index, frame.clone()));
        Ok(frame)
    }

    fn release(&mut self) {
        self.released = true;
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::time::Duration;

    fn write_frames(dir: &Path, count: u8) {
        for i in 0..count {
            let img = RgbaImage::from_pixel(32, 24, Rgba([i * 40, 0, 0, 255]));
            img.save(dir.join(format!("frame_{:03}.png", i))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_frames_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 3);

        let mut source = SequenceSource::open(dir.path(), 10.0, false).unwrap();
        assert_eq!(source.resolution(), (32, 24));

        let first = source.current_frame().unwrap();
        assert_eq!(first.get_pixel(0, 0)[0], 0);

        tokio::time::advance(Duration::from_millis(150)).await;
        let second = source.current_frame().unwrap();
        assert_eq!(second.get_pixel(0, 0)[0], 40);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!source.is_active());
        assert!(source.current_frame().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_looping_wraps_around() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 2);

        let mut source = SequenceSource::open(dir.path(), 10.0, true).unwrap();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(source.is_active());
        assert_eq!(source.current_frame().unwrap().get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_missing_or_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SequenceSource::open(&dir.path().join("missing"), 10.0, false),
            Err(DeviceError::NotFound(_))
        ));
        assert!(matches!(
            SequenceSource::open(dir.path(), 10.0, false),
            Err(DeviceError::Unusable { .. })
        ));
    }
}
