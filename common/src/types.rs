use serde::{Deserialize, Serialize};
use std::fmt;

/// 分辨率
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Configuration negotiated once per connection.
///
/// The backend pushes it right after the session starts and again whenever
/// the active provider changes; a later arrival overwrites the earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub provider: String,
    pub max_fps: u32,
    #[serde(default)]
    pub supported_formats: Vec<String>,
    pub max_resolution: Resolution,
}

/// 识别出的人员信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectRecord {
    pub id: i64,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "vivienda", default, skip_serializing_if = "Option::is_none")]
    pub residence: Option<String>,
    #[serde(rename = "tipo_residente", default, skip_serializing_if = "Option::is_none")]
    pub resident_type: Option<String>,
    #[serde(rename = "documento", default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

/// Classification produced by the backend for one dispatched frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecognitionResult {
    #[serde(rename = "reconocido")]
    pub recognized: bool,
    #[serde(rename = "persona", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectRecord>,
    #[serde(rename = "confianza", default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(rename = "proveedor", default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "processing_time", default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "threshold_usado", default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(rename = "mensaje", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 服务端统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsPayload {
    pub connected_clients: u32,
    pub total_frames_processed: u64,
    pub successful_recognitions: u64,
    pub failed_recognitions: u64,
    /// Rolling average, in seconds.
    pub average_processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_providers: Option<Vec<String>>,
}

/// Structured error pushed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
}

/// 错误码
pub mod error_codes {
    pub const INVALID_DATA: &str = "INVALID_DATA";
    pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";
    pub const PROVIDER_NOT_AVAILABLE: &str = "PROVIDER_NOT_AVAILABLE";
}
