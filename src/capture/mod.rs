//! Frame capture module
//!
//! Sources are opened through [`SourceSpec`], which takes an exclusive lease
//! on the device before the source starts producing frames. Two kinds of
//! source are available: synthetic test-pattern cameras and image-sequence
//! "video files" played back at a fixed rate.

pub mod device;
mod handle;
mod pattern;
mod sequence;
mod traits;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::DeviceError;
use device::DeviceLease;

pub use handle::CaptureHandle;
pub use pattern::{PATTERN_DEVICES, PatternSource};
pub use sequence::SequenceSource;
pub use traits::CaptureSource;

const PATTERN_PREFIX: &str = "test-pattern:";
const DEFAULT_FPS: f64 = 30.0;

/// Which source to capture from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    /// Synthetic camera device
    TestPattern { index: u32 },
    /// Directory of frames played back as a video
    Sequence {
        dir: PathBuf,
        fps: f64,
        looping: bool,
    },
}

impl SourceSpec {
    /// Device identifier used for exclusive acquisition
    pub fn id(&self) -> String {
        match self {
            SourceSpec::TestPattern { index } => pattern::pattern_id(*index),
            SourceSpec::Sequence { dir, .. } => dir.display().to_string(),
        }
    }

    /// Set playback options; no effect on camera sources
    pub fn with_playback(mut self, new_fps: f64, new_looping: bool) -> Self {
        if let SourceSpec::Sequence { fps, looping, .. } = &mut self {
            *fps = new_fps;
            *looping = new_looping;
        }
        self
    }

    /// Acquire the device and start the source
    ///
    /// `width`/`height` is the resolution requested from camera devices;
    /// video sources keep their native size.
    pub fn open(&self, width: u32, height: u32) -> Result<CaptureHandle, DeviceError> {
        if let SourceSpec::TestPattern { index } = self
            && *index >= PATTERN_DEVICES
        {
            return Err(DeviceError::NotFound(self.id()));
        }

        let lease = DeviceLease::acquire(&self.id())?;
        let source: Box<dyn CaptureSource> = match self {
            SourceSpec::TestPattern { index } => {
                Box::new(PatternSource::new(*index, width, height))
            }
            SourceSpec::Sequence { dir, fps, looping } => {
                Box::new(SequenceSource::open(dir, *fps, *looping)?)
            }
        };

        let handle = CaptureHandle::new(source, lease);
        log::info!(
            "Capture: started {} at {}x{}",
            handle.id(),
            handle.width(),
            handle.height()
        );
        Ok(handle)
    }
}

impl Default for SourceSpec {
    fn default() -> Self {
        SourceSpec::TestPattern { index: 0 }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl FromStr for SourceSpec {
    type Err = String;

    /// `test-pattern:<n>` selects a synthetic camera, anything else is a
    /// directory of frames
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty source".into());
        }
        if let Some(index) = s.strip_prefix(PATTERN_PREFIX) {
            let index = index
                .parse()
                .map_err(|_| format!("invalid device index in {:?}", s))?;
            return Ok(SourceSpec::TestPattern { index });
        }
        Ok(SourceSpec::Sequence {
            dir: PathBuf::from(s),
            fps: DEFAULT_FPS,
            looping: false,
        })
    }
}

/// An enumerable capture device
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub spec: SourceSpec,
    pub label: String,
    pub in_use: bool,
}

/// List camera-like devices; the first one is the default selection
pub fn available_sources() -> Vec<SourceInfo> {
    (0..PATTERN_DEVICES)
        .map(|index| {
            let spec = SourceSpec::TestPattern { index };
            SourceInfo {
                in_use: device::is_acquired(&spec.id()),
                label: format!("Test pattern camera {}", index + 1),
                spec,
            }
        })
        .collect()
}
