use chrono::Utc;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
