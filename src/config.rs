use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::encoder::DEFAULT_QUALITY;

pub const DEFAULT_API_BASE_URL: &str =
    "https://ai-pothole-detector-app-595422885057.us-central1.run.app";
pub const DEFAULT_STREAM_URL: &str =
    "wss://ai-pothole-detector-app-595422885057.us-central1.run.app/stream";

pub fn app_name() -> String {
    String::from(env!("CARGO_PKG_NAME"))
}

pub fn app_version() -> String {
    String::from(env!("CARGO_PKG_VERSION"))
}

/// What kind of footage is being streamed; picks the output raster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Webcam,
    Video,
}

impl CaptureMode {
    pub fn default_resolution(&self) -> (u32, u32) {
        match self {
            CaptureMode::Webcam => (640, 480),
            CaptureMode::Video => (640, 640),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::Webcam => f.write_str("webcam"),
            CaptureMode::Video => f.write_str("video"),
        }
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "webcam" => Ok(CaptureMode::Webcam),
            "video" => Ok(CaptureMode::Video),
            other => Err(format!("unknown capture mode {:?}", other)),
        }
    }
}

/// Streaming client settings
///
/// Built from defaults, then an optional JSON file, then command line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub api_base_url: String,
    pub stream_url: String,
    pub tick_interval_ms: u64,
    pub mode: CaptureMode,
    /// Overrides the mode's output width
    pub width: Option<u32>,
    /// Overrides the mode's output height
    pub height: Option<u32>,
    pub jpeg_quality: u8,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            tick_interval_ms: 200,
            mode: CaptureMode::default(),
            width: None,
            height: None,
            jpeg_quality: DEFAULT_QUALITY,
            connect_timeout_ms: 10_000,
        }
    }
}

impl StreamConfig {
    /// Read a JSON config file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.tick_interval_ms > 0, "tick interval must be non-zero");
        ensure!(
            (1..=100).contains(&self.jpeg_quality),
            "JPEG quality must be within 1..=100"
        );
        let (w, h) = self.resolution();
        ensure!(w > 0 && h > 0, "capture resolution must be non-zero");
        ensure!(
            self.stream_url.starts_with("ws://") || self.stream_url.starts_with("wss://"),
            "stream URL must use ws:// or wss://"
        );
        Ok(())
    }

    /// Output resolution of encoded frames
    pub fn resolution(&self) -> (u32, u32) {
        let (w, h) = self.mode.default_resolution();
        (self.width.unwrap_or(w), self.height.unwrap_or(h))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(200));
        assert_eq!(config.resolution(), (640, 480));
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());

        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        let host = DEFAULT_API_BASE_URL.trim_start_matches("https://");
        assert_eq!(config.stream_url, format!("wss://{}/stream", host));
    }

    #[test]
    fn test_video_mode_and_overrides() {
        let mut config = StreamConfig {
            mode: CaptureMode::Video,
            ..StreamConfig::default()
        };
        assert_eq!(config.resolution(), (640, 640));
        config.height = Some(360);
        assert_eq!(config.resolution(), (640, 360));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        std::fs::write(
            &path,
            r#"{ "stream_url": "ws://localhost:8080/stream", "mode": "video", "tick_interval_ms": 500 }"#,
        )
        .unwrap();

        let config = StreamConfig::load(&path).unwrap();
        assert_eq!(config.stream_url, "ws://localhost:8080/stream");
        assert_eq!(config.mode, CaptureMode::Video);
        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.jpeg_quality, 70);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "tick_interval_ms": 0 }"#).unwrap();
        assert!(StreamConfig::load(&path).is_err());

        let config = StreamConfig {
            stream_url: "http://example.com".into(),
            ..StreamConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!("VIDEO".parse::<CaptureMode>().unwrap(), CaptureMode::Video);
    }
}
