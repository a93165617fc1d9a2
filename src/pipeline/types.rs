//! Core types for the pipeline system

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Mime tag of every outbound frame
pub const JPEG_MIME: &str = "image/jpeg";

/// Single-slot guard bounding the number of frames in flight to one
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct InFlightSlot {
    busy: Arc<AtomicBool>,
}

impl InFlightSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or `None` if a frame is already in flight
    pub fn try_acquire(&self) -> Option<InFlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held by a frame until the transport has accepted it; frees the slot on drop
#[derive(Debug)]
pub struct InFlightPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// A JPEG-encoded frame ready for transmission
///
/// Produced once per scheduler tick and consumed exactly once by the
/// connection. When the scheduler attached a permit, the frame counts as in
/// flight until it is dropped.
#[derive(Debug)]
pub struct EncodedFrame {
    /// Compressed image bytes
    pub data: Bytes,

    /// Always [`JPEG_MIME`]
    pub mime: &'static str,

    pub width: u32,
    pub height: u32,

    /// Per-encoder sequence number
    pub sequence: u64,

    permit: Option<InFlightPermit>,
}

impl EncodedFrame {
    /// Create a new JPEG frame
    pub fn jpeg(data: Bytes, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            mime: JPEG_MIME,
            width,
            height,
            sequence,
            permit: None,
        }
    }

    /// Mark this frame as the one in flight
    pub fn with_permit(mut self, permit: InFlightPermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Split into the payload and the permit to release once it is accepted
    pub fn into_parts(self) -> (Bytes, Option<InFlightPermit>) {
        (self.data, self.permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_admits_one_permit() {
        let slot = InFlightSlot::new();
        let permit = slot.try_acquire().expect("slot should be free");
        assert!(slot.is_busy());
        assert!(slot.try_acquire().is_none());
        assert!(slot.clone().try_acquire().is_none());

        drop(permit);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn test_dropping_frame_releases_slot() {
        let slot = InFlightSlot::new();
        let frame = EncodedFrame::jpeg(Bytes::from_static(&[0xFF, 0xD8]), 640, 480, 0)
            .with_permit(slot.try_acquire().unwrap());
        assert!(slot.is_busy());
        assert_eq!(frame.mime, JPEG_MIME);

        let (payload, permit) = frame.into_parts();
        assert_eq!(payload.len(), 2);
        assert!(slot.is_busy());
        drop(permit);
        assert!(!slot.is_busy());
    }
}
