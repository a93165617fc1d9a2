//! Traits for frame capture functionality

use image::RgbaImage;

/// A live producer of frames (camera-like device or decoded video)
pub trait CaptureSource: Send {
    /// Identifier of the underlying device, used for exclusive acquisition
    fn id(&self) -> &str;

    /// Get the native resolution of the source in (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Whether the source can still produce frames
    fn is_active(&self) -> bool;

    /// Grab the frame currently being shown by the source
    fn current_frame(&mut self) -> anyhow::Result<RgbaImage>;

    /// Release transient resources held by the source
    fn release(&mut self) {}
}
