use crate::types::*;
use serde::{Deserialize, Serialize};

/// 会话开始请求
///
/// First frame written on a fresh stream; the backend answers with its
/// `config` followed by a `stats` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStartPayload {
    pub client_id: String,
    pub client_version: String,
}

/// 帧处理请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessFramePayload {
    /// `data:<mime>;base64,<bytes>`
    pub image: String,
    pub frame_id: u64,
    pub quality: f32,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeProviderPayload {
    pub provider: String,
}

/// Events written by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SessionStart(SessionStartPayload),
    ProcessFrame(ProcessFramePayload),
    GetStats,
    ResetStats,
    ChangeProvider(ChangeProviderPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionStart(_) => "session_start",
            ClientEvent::ProcessFrame(_) => "process_frame",
            ClientEvent::GetStats => "get_stats",
            ClientEvent::ResetStats => "reset_stats",
            ClientEvent::ChangeProvider(_) => "change_provider",
        }
    }
}

/// Events pushed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Config(ServerConfig),
    RecognitionResult(RecognitionResult),
    Stats(StatsPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Config(_) => "config",
            ServerEvent::RecognitionResult(_) => "recognition_result",
            ServerEvent::Stats(_) => "stats",
            ServerEvent::Error(_) => "error",
        }
    }
}
