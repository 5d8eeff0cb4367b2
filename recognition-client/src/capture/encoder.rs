use super::{CaptureSource, RawFrame};
use crate::errors::CaptureError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::utils::now_millis;
use std::sync::Arc;
use tokio::time::Instant;

/// A captured frame serialised for the wire.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// `data:<mime>;base64,<bytes>`
    pub image: String,
    pub mime: &'static str,
    /// Dimensions actually captured, not the ones requested.
    pub width: u32,
    pub height: u32,
    pub quality: f32,
    pub captured_at: Instant,
    pub timestamp_ms: u64,
}

/// Pulls one still from the capture source and encodes it.
#[derive(Clone)]
pub struct FrameEncoder {
    source: Arc<dyn CaptureSource>,
    accepted_formats: Vec<String>,
}

impl FrameEncoder {
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            source,
            accepted_formats: Vec::new(),
        }
    }

    /// Restricts output to the MIME types the backend advertised.
    /// An empty list accepts every format.
    pub fn set_accepted_formats(&mut self, formats: &[String]) {
        self.accepted_formats = formats.to_vec();
    }

    pub fn source(&self) -> &Arc<dyn CaptureSource> {
        &self.source
    }

    pub async fn capture(&self, quality: f32) -> Result<EncodedFrame, CaptureError> {
        let raw = self.source.grab(quality).await?;
        self.encode(raw, quality, Instant::now(), now_millis())
    }

    pub fn encode(
        &self,
        raw: RawFrame,
        quality: f32,
        captured_at: Instant,
        timestamp_ms: u64,
    ) -> Result<EncodedFrame, CaptureError> {
        if raw.width == 0 || raw.height == 0 {
            return Err(CaptureError::EncodeFailed {
                reason: format!("empty frame geometry {}x{}", raw.width, raw.height),
            });
        }
        if raw.data.is_empty() {
            return Err(CaptureError::EncodeFailed {
                reason: "source returned no image data".to_string(),
            });
        }

        let mime = raw.format.mime();
        if !self.accepts(mime) {
            return Err(CaptureError::EncodeFailed {
                reason: format!("format {} not accepted by the backend", mime),
            });
        }

        let image = format!("data:{};base64,{}", mime, STANDARD.encode(&raw.data));

        Ok(EncodedFrame {
            image,
            mime,
            width: raw.width,
            height: raw.height,
            quality,
            captured_at,
            timestamp_ms,
        })
    }

    fn accepts(&self, mime: &str) -> bool {
        self.accepted_formats.is_empty()
            || self
                .accepted_formats
                .iter()
                .any(|f| f.eq_ignore_ascii_case(mime))
    }
}
