// 合成摄像头（模拟版本）
//
// Produces JPEG-framed test patterns so the pipeline can run without a real
// camera; the bytes are not a decodable image.

use super::{CaptureConstraints, CaptureSource, FrameFormat, RawFrame};
use crate::errors::CaptureError;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use common::Resolution;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

struct Session {
    resolution: Resolution,
    acquired_at: Instant,
    frames: u64,
}

pub struct SyntheticCamera {
    warmup: Duration,
    session: Mutex<Option<Session>>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::with_warmup(Duration::ZERO)
    }

    /// A camera whose first frame only becomes available `warmup` after
    /// acquisition, like a video element still loading its metadata.
    pub fn with_warmup(warmup: Duration) -> Self {
        Self {
            warmup,
            session: Mutex::new(None),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for SyntheticCamera {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<(), CaptureError> {
        if constraints.resolution.width == 0 || constraints.resolution.height == 0 {
            return Err(CaptureError::DeviceUnavailable {
                reason: format!("unsupported resolution {}", constraints.resolution),
            });
        }

        info!(
            "🎥 Synthetic camera acquired: {} @ {} fps",
            constraints.resolution, constraints.fps
        );
        *self.lock() = Some(Session {
            resolution: constraints.resolution,
            acquired_at: Instant::now(),
            frames: 0,
        });
        Ok(())
    }

    async fn grab(&self, quality: f32) -> Result<RawFrame, CaptureError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(CaptureError::NotAcquired)?;

        if session.acquired_at.elapsed() < self.warmup {
            return Err(CaptureError::SourceNotReady);
        }

        let Resolution { width, height } = session.resolution;
        // 大致相当于该尺寸和质量下 JPEG 的体积
        let body_len = ((width as f32 * height as f32 / 20.0) * quality.clamp(0.1, 1.0)) as usize;

        let mut data = BytesMut::with_capacity(body_len + 12);
        data.put_slice(&JPEG_SOI);
        data.put_u64(session.frames);
        for i in 0..body_len {
            data.put_u8(((session.frames as usize + i) % 251) as u8);
        }
        data.put_slice(&JPEG_EOI);

        session.frames += 1;
        if session.frames % 50 == 0 {
            debug!("Synthetic camera produced {} frames", session.frames);
        }

        Ok(RawFrame {
            format: FrameFormat::Jpeg,
            width,
            height,
            data: data.freeze(),
        })
    }

    fn release(&self) {
        if self.lock().take().is_some() {
            info!("⏹️ Synthetic camera released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints(width: u32, height: u32) -> CaptureConstraints {
        CaptureConstraints {
            resolution: Resolution::new(width, height),
            fps: 5,
        }
    }

    #[test]
    fn test_frames_are_jpeg_framed_and_distinct() {
        let camera = SyntheticCamera::new();
        tokio_test::block_on(camera.acquire(&constraints(64, 48))).unwrap();

        let first = tokio_test::block_on(camera.grab(0.7)).unwrap();
        let second = tokio_test::block_on(camera.grab(0.7)).unwrap();
        assert_eq!(first.format, FrameFormat::Jpeg);
        assert_eq!((first.width, first.height), (64, 48));
        assert_eq!(&first.data[..2], &JPEG_SOI);
        assert_eq!(&first.data[first.data.len() - 2..], &JPEG_EOI);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_grab_requires_acquisition() {
        let camera = SyntheticCamera::new();
        assert!(matches!(
            tokio_test::block_on(camera.grab(0.5)),
            Err(CaptureError::NotAcquired)
        ));
        assert!(tokio_test::block_on(camera.acquire(&constraints(0, 480))).is_err());

        tokio_test::block_on(camera.acquire(&constraints(640, 480))).unwrap();
        assert!(camera.is_acquired());
        camera.release();
        assert!(!camera.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_delays_first_frame() {
        let camera = SyntheticCamera::with_warmup(Duration::from_millis(500));
        camera.acquire(&constraints(64, 48)).await.unwrap();
        assert!(matches!(camera.grab(0.5).await, Err(CaptureError::SourceNotReady)));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(camera.grab(0.5).await.is_ok());
    }
}
