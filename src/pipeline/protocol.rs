//! Inbound wire format of the detection backend
//!
//! Each message is a UTF-8 JSON object whose fields are all optional:
//!
//! ```text
//! { "image": "<base64 jpeg>", "pothole_count": 3, "average_severity": 0.42 }
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::MalformedMessage;

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    pothole_count: Option<u32>,
    #[serde(default)]
    average_severity: Option<f64>,
}

/// Annotated frame returned by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct FramePreview {
    /// Decoded JPEG bytes
    pub jpeg: Bytes,
    pub received_at: DateTime<Local>,
}

/// Per-frame statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub pothole_count: u32,
    pub average_severity: f64,
}

/// One parsed inbound message. Absent parts mean "no update", not zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEvent {
    pub preview: Option<FramePreview>,
    pub stats: Option<Stats>,
}

impl ServerEvent {
    /// Parse a raw payload (text or binary frame)
    pub fn parse(payload: &[u8]) -> Result<Self, MalformedMessage> {
        // Only a JSON object is a message; the derived visitor would also take an array
        let object: Map<String, Value> = serde_json::from_slice(payload)?;
        let raw: RawMessage = serde_json::from_value(Value::Object(object))?;

        let preview = match raw.image {
            Some(encoded) if !encoded.is_empty() => Some(FramePreview {
                jpeg: Bytes::from(STANDARD.decode(encoded.as_bytes())?),
                received_at: Local::now(),
            }),
            _ => None,
        };

        // Stats count only when both halves are present
        let stats = match (raw.pothole_count, raw.average_severity) {
            (Some(pothole_count), Some(average_severity)) => Some(Stats {
                pothole_count,
                average_severity,
            }),
            (None, None) => None,
            _ => {
                log::debug!("ServerEvent: ignoring partial stats in message");
                None
            }
        };

        Ok(Self { preview, stats })
    }

    pub fn is_empty(&self) -> bool {
        self.preview.is_none() && self.stats.is_none()
    }
}
