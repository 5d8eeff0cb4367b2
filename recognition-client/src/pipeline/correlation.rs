use crate::capture::EncodedFrame;
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub type FrameId = u64;

/// One frame handed to the link, waiting for its result.
#[derive(Debug, Clone)]
pub struct FrameDispatch {
    pub id: FrameId,
    pub image: String,
    pub quality: f32,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    /// 采集时间戳（毫秒，Unix 纪元）
    pub timestamp_ms: u64,
}

/// Matches asynchronous results back to the dispatch that produced them.
///
/// Ids start at 1, only ever grow and are never handed out twice for the
/// lifetime of the table. Entries leave on resolve, expiry or flush.
#[derive(Debug)]
pub struct CorrelationTable {
    next_id: FrameId,
    outstanding: BTreeMap<FrameId, FrameDispatch>,
    expired_total: u64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outstanding: BTreeMap::new(),
            expired_total: 0,
        }
    }

    pub fn register(&mut self, frame: EncodedFrame) -> &FrameDispatch {
        let id = self.next_id;
        self.next_id += 1;

        let dispatch = FrameDispatch {
            id,
            image: frame.image,
            quality: frame.quality,
            width: frame.width,
            height: frame.height,
            captured_at: frame.captured_at,
            timestamp_ms: frame.timestamp_ms,
        };
        self.outstanding.entry(id).or_insert(dispatch)
    }

    pub fn resolve(&mut self, frame_id: FrameId) -> Option<FrameDispatch> {
        self.outstanding.remove(&frame_id)
    }

    /// Drops entries captured more than `max_age` ago. No result callback is
    /// invoked for them.
    pub fn expire_older_than(&mut self, max_age: Duration) -> usize {
        self.expire_at(Instant::now(), max_age)
    }

    pub fn expire_at(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.outstanding.len();
        self.outstanding
            .retain(|_, dispatch| now.saturating_duration_since(dispatch.captured_at) <= max_age);
        let expired = before - self.outstanding.len();
        if expired > 0 {
            self.expired_total += expired as u64;
            debug!("Expired {} unanswered frame(s), {} still outstanding", expired, self.outstanding.len());
        }
        expired
    }

    /// 清空所有未完成的记录（链路断开时调用）
    pub fn flush(&mut self) -> usize {
        let flushed = self.outstanding.len();
        self.outstanding.clear();
        self.expired_total += flushed as u64;
        flushed
    }

    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.outstanding.contains_key(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn expired_total(&self) -> u64 {
        self.expired_total
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
