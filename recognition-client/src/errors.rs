use crate::pipeline::state::{LinkState, PipelineState, StateEvent};
use common::StreamError;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Capture Errors
// ============================================================================

/// Failures while acquiring or sampling the capture source.
///
/// Recoverable: surfaced to the presentation layer, never halts streaming.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Permission to use the capture device was denied")]
    PermissionDenied,

    #[error("Capture device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("Capture source has not delivered a frame yet")]
    SourceNotReady,

    #[error("Failed to encode frame: {reason}")]
    EncodeFailed { reason: String },

    #[error("Capture source is not acquired")]
    NotAcquired,
}

// ============================================================================
// Connection Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Invalid server url: {url}")]
    InvalidUrl { url: String },

    #[error("Connection failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("No server config received within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("Channel closed: {reason}")]
    Closed { reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

impl From<StreamError> for ConnectionError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::QuicError(reason) | StreamError::NetworkError(reason) => {
                ConnectionError::ConnectFailed { reason }
            }
            other => ConnectionError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

// ============================================================================
// Precondition Errors
// ============================================================================

/// A command issued in a state that does not allow it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionError {
    #[error("Capture must be acquired first (pipeline is {pipeline:?})")]
    CaptureNotAcquired { pipeline: PipelineState },

    #[error("Streaming is already active")]
    AlreadyStreaming,

    #[error("Link must be connected (link is {link:?})")]
    LinkNotReady { link: LinkState },

    #[error("Link is busy (link is {link:?})")]
    LinkBusy { link: LinkState },

    #[error("Illegal transition {event:?} from ({pipeline:?}, {link:?})")]
    IllegalTransition {
        pipeline: PipelineState,
        link: LinkState,
        event: StateEvent,
    },
}

// ============================================================================
// Backend Errors
// ============================================================================

/// Informational conditions reported by the recognition backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Server error [{code}]: {message}")]
    Reported { message: String, code: String },

    #[error("Recognition failed for frame {frame_id:?}: {reason}")]
    RecognitionFailed { frame_id: Option<u64>, reason: String },
}

// ============================================================================
// Pipeline Error
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_errors_map_to_connection_errors() {
        let err: ConnectionError = StreamError::QuicError("refused".to_string()).into();
        assert_eq!(
            err,
            ConnectionError::ConnectFailed {
                reason: "refused".to_string()
            }
        );

        let err: ConnectionError = StreamError::ProtocolError("garbled".to_string()).into();
        assert!(matches!(err, ConnectionError::Transport { .. }));
    }

    #[test]
    fn test_pipeline_error_wraps_every_kind() {
        let err: PipelineError = CaptureError::SourceNotReady.into();
        assert!(matches!(err, PipelineError::Capture(CaptureError::SourceNotReady)));

        let err: PipelineError = PreconditionError::AlreadyStreaming.into();
        assert!(err.to_string().contains("already active"));
    }
}
