//! Frame encoding
//!
//! Rasterizes captured frames to the negotiated streaming resolution and
//! compresses them for transmission.

mod jpeg;

pub use jpeg::{DEFAULT_QUALITY, FrameEncoder};
