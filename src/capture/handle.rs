use anyhow::{Result, bail};
use image::RgbaImage;

use crate::capture::CaptureSource;
use crate::capture::device::DeviceLease;

/// Live capture owned by the coordinator
///
/// Holds the device lease for as long as the source is in use; releasing the
/// handle stops the source and gives the device back to the registry.
pub struct CaptureHandle {
    source: Box<dyn CaptureSource>,
    lease: Option<DeviceLease>,
    width: u32,
    height: u32,
}

impl CaptureHandle {
    pub fn new(source: Box<dyn CaptureSource>, lease: DeviceLease) -> Self {
        let (width, height) = source.resolution();
        Self {
            source,
            lease: Some(lease),
            width,
            height,
        }
    }

    pub fn id(&self) -> &str {
        self.source.id()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_active(&self) -> bool {
        self.lease.is_some() && self.source.is_active()
    }

    pub fn current_frame(&mut self) -> Result<RgbaImage> {
        if self.lease.is_none() {
            bail!("capture {} has been released", self.source.id());
        }
        self.source.current_frame()
    }

    /// Stop the source and return the device lease; safe to call repeatedly
    pub fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.source.release();
            log::info!("CaptureHandle: released {}", lease.id());
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::is_acquired;
    use crate::capture::pattern::PatternSource;

    #[test]
    fn test_release_is_idempotent_and_frees_device() {
        let lease = DeviceLease::acquire("handle-test:0").unwrap();
        let mut handle = CaptureHandle::new(Box::new(PatternSource::new(0, 8, 8)), lease);
        assert!(handle.is_active());
        assert_eq!((handle.width(), handle.height()), (8, 8));
        assert!(handle.current_frame().is_ok());

        handle.release();
        handle.release();
        assert!(!handle.is_active());
        assert!(!is_acquired("handle-test:0"));
        assert!(handle.current_frame().is_err());
    }

    #[test]
    fn test_drop_frees_device() {
        let lease = DeviceLease::acquire("handle-test:1").unwrap();
        let handle = CaptureHandle::new(Box::new(PatternSource::new(1, 8, 8)), lease);
        drop(handle);
        assert!(!is_acquired("handle-test:1"));
    }
}
