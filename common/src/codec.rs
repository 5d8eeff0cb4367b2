// 事件帧编解码
//
// Every event travels as one length-prefixed JSON document
// (`{"event": ..., "data": ...}`) on a long-lived bidirectional stream.

use crate::error::{Result, StreamError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// ALPN identifier negotiated by both ends of the QUIC channel.
pub const ALPN_PROTOCOL: &[u8] = b"recognition-events/1";

/// Largest accepted frame. Encoded stills stay well below this.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Builds the framing codec shared by both ends of the channel.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_event<T: Serialize>(event: &T) -> Result<Bytes> {
    let data = serde_json::to_vec(event)?;
    if data.len() > MAX_FRAME_LENGTH {
        return Err(StreamError::FrameTooLarge {
            size: data.len(),
            limit: MAX_FRAME_LENGTH,
        });
    }
    Ok(Bytes::from(data))
}

pub fn decode_event<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientEvent, ServerEvent};
    use crate::types::{ErrorPayload, error_codes};

    #[test]
    fn test_decode_rejects_unknown_event() {
        let frame = br#"{"event":"teleport","data":{}}"#;
        let result = decode_event::<ServerEvent>(frame);
        assert!(matches!(result, Err(StreamError::SerdeError(_))));
    }

    #[test]
    fn test_encoded_error_event_is_json() {
        let event = ServerEvent::Error(ErrorPayload {
            message: "bad image".to_string(),
            code: error_codes::INVALID_DATA.to_string(),
            frame_id: Some(9),
        });
        let bytes = encode_event(&event).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""event":"error""#));
        assert!(text.contains(r#""code":"INVALID_DATA""#));
    }

    #[test]
    fn test_oversized_event_is_refused() {
        let event = ClientEvent::ChangeProvider(crate::protocol::ChangeProviderPayload {
            provider: "x".repeat(MAX_FRAME_LENGTH),
        });
        assert!(matches!(
            encode_event(&event),
            Err(StreamError::FrameTooLarge { .. })
        ));
    }
}
