//! Capture source boundary.
//!
//! The platform supplies still images on demand through [`CaptureSource`];
//! [`FrameEncoder`] turns them into the transportable payload.

mod encoder;
mod synthetic;

pub use encoder::{EncodedFrame, FrameEncoder};
pub use synthetic::SyntheticCamera;

use crate::errors::CaptureError;
use async_trait::async_trait;
use bytes::Bytes;
use common::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
    Png,
}

impl FrameFormat {
    pub fn mime(self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::Png => "image/png",
        }
    }
}

/// One still image as delivered by the platform, already compressed.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Requested capture parameters. The source may deliver something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub resolution: Resolution,
    pub fps: u32,
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Opens the device. Fails with `PermissionDenied` or `DeviceUnavailable`.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<(), CaptureError>;

    /// Samples one frame at the given quality hint in `[0, 1]`.
    async fn grab(&self, quality: f32) -> Result<RawFrame, CaptureError>;

    /// Closes the device. Releasing an idle source is a no-op.
    fn release(&self);
}
